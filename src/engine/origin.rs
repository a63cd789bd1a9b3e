// Maps catalog records to fetchable origin URLs. Pure lookup, no I/O.

use reqwest::Url;

use crate::catalog::model::ContentRecord;
use crate::error::StreamError;

/// Which asset of a record to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    /// The record's own video (movies).
    Main,
    /// Zero-based episode of a series.
    Episode(usize),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OriginResolver;

impl OriginResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the record's single stored video URL.
    pub fn resolve(&self, record: &ContentRecord) -> Result<Url, StreamError> {
        Self::parse(record.video_url.as_deref())
    }

    /// Resolve one episode's video URL.
    pub fn resolve_episode(&self, record: &ContentRecord, index: usize) -> Result<Url, StreamError> {
        let episode = record.episodes.get(index).ok_or(StreamError::NoVideo)?;
        Self::parse(episode.video_url.as_deref())
    }

    pub fn resolve_target(
        &self,
        record: &ContentRecord,
        target: StreamTarget,
    ) -> Result<Url, StreamError> {
        match target {
            StreamTarget::Main => self.resolve(record),
            StreamTarget::Episode(index) => self.resolve_episode(record, index),
        }
    }

    fn parse(raw: Option<&str>) -> Result<Url, StreamError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let Some(raw) = raw else {
            return Err(StreamError::NoVideo);
        };
        let url = Url::parse(raw).map_err(|e| StreamError::InvalidOrigin(format!("{}: {}", raw, e)))?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(StreamError::InvalidOrigin(raw.to_string())),
        }
    }
}
