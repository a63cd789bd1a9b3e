use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a subscription gates playback of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Free,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Movie,
    Series,
}

/// One playable episode of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub video_url: Option<String>,
}

/// A catalog entry as seen by the streaming path. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: ContentKind,
    #[serde(default)]
    pub access: Visibility,
    /// Origin URL for movies. Empty for series.
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

impl ContentRecord {
    pub fn movie(id: impl Into<String>, access: Visibility, video_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            kind: ContentKind::Movie,
            access,
            video_url: Some(video_url.into()),
            episodes: Vec::new(),
        }
    }

    pub fn series(id: impl Into<String>, access: Visibility, episodes: Vec<Episode>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            kind: ContentKind::Series,
            access,
            video_url: None,
            episodes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Monthly,
    Yearly,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    #[default]
    Inactive,
}

/// Subscription state attached to a principal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Only the status flag counts; there is no grace period around `end_date`.
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// An authenticated caller, resolved fresh for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub subscription: Subscription,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_record_from_catalog_json() {
        let json = r#"{
            "id": "64f0c2",
            "title": "Night Train",
            "type": "movie",
            "access": "paid",
            "videoUrl": "https://cdn.example.com/night-train.mp4"
        }"#;
        let record: ContentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, ContentKind::Movie);
        assert_eq!(record.access, Visibility::Paid);
        assert_eq!(
            record.video_url.as_deref(),
            Some("https://cdn.example.com/night-train.mp4")
        );
        assert!(record.episodes.is_empty());
    }

    #[test]
    fn test_access_defaults_to_free() {
        let record: ContentRecord =
            serde_json::from_str(r#"{ "id": "a", "type": "series", "episodes": [{ "title": "Pilot", "videoUrl": "http://o/1.mp4" }] }"#)
                .unwrap();
        assert_eq!(record.access, Visibility::Free);
        assert_eq!(record.kind, ContentKind::Series);
        assert_eq!(record.episodes[0].video_url.as_deref(), Some("http://o/1.mp4"));
    }

    #[test]
    fn test_subscription_active_ignores_end_date() {
        let sub: Subscription = serde_json::from_str(
            r#"{ "plan": "monthly", "status": "active", "endDate": "2001-01-01T00:00:00Z" }"#,
        )
        .unwrap();
        assert_eq!(sub.plan, Plan::Monthly);
        assert!(sub.is_active());
        assert!(!Subscription::default().is_active());
    }
}
