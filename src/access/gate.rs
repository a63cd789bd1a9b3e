// Access decision for a single playback request.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use super::token::{Credential, CredentialVerifier};
use crate::catalog::model::Visibility;
use crate::catalog::traits::SubscriptionDirectory;

/// Why a request for paid content was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    NoCredential,
    InvalidCredential,
    SubscriptionRequired,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Denial::NoCredential => "no credential",
            Denial::InvalidCredential => "invalid credential",
            Denial::SubscriptionRequired => "subscription required",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Granted; carries the principal id when one was resolved.
    Granted(Option<String>),
    Denied(Denial),
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessDecision::Granted(_))
    }
}

/// Decides whether a caller may fetch an item. Holds no per-request state and caches
/// nothing, so a subscription change is honoured on the very next request.
pub struct AccessGate {
    verifier: Arc<dyn CredentialVerifier>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
}

impl AccessGate {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
    ) -> Self {
        Self {
            verifier,
            subscriptions,
        }
    }

    /// `Err` only when the subscription store itself fails.
    pub async fn check_access(
        &self,
        visibility: Visibility,
        credential: Option<&Credential>,
    ) -> Result<AccessDecision> {
        if visibility == Visibility::Free {
            return Ok(AccessDecision::Granted(None));
        }

        let Some(credential) = credential else {
            return Ok(AccessDecision::Denied(Denial::NoCredential));
        };

        let principal_id = match self.verifier.verify(credential) {
            Ok(id) => id,
            Err(e) => {
                debug!("credential rejected: {}", e);
                return Ok(AccessDecision::Denied(Denial::InvalidCredential));
            }
        };

        let subscription = self
            .subscriptions
            .get_principal_subscription(&principal_id)
            .await?;

        match subscription {
            Some(sub) if sub.is_active() => Ok(AccessDecision::Granted(Some(principal_id))),
            Some(sub) => {
                debug!(
                    "principal {} subscription {:?} is not active",
                    principal_id, sub.status
                );
                Ok(AccessDecision::Denied(Denial::SubscriptionRequired))
            }
            None => {
                debug!("principal {} has no subscription record", principal_id);
                Ok(AccessDecision::Denied(Denial::SubscriptionRequired))
            }
        }
    }
}
