// Proxy session state machine: one per inbound stream request.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::stats::StatsCollector;

/// Lifecycle of a single relay. Every state before `UpstreamHeadersReceived` may fail
/// with an error response; once `Streaming`, the only way out is `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AccessChecked,
    OriginResolved,
    UpstreamConnecting,
    UpstreamHeadersReceived,
    Streaming,
    Closed(CloseReason),
    /// Terminated with an error response carrying this status.
    Failed(u16),
}

impl SessionState {
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, AccessChecked)
                | (AccessChecked, OriginResolved)
                | (OriginResolved, UpstreamConnecting)
                | (UpstreamConnecting, UpstreamHeadersReceived)
                | (UpstreamHeadersReceived, Streaming)
                | (UpstreamHeadersReceived, Closed(_))
                | (Streaming, Closed(_))
                | (Idle | AccessChecked | OriginResolved | UpstreamConnecting, Failed(_))
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed(_) | SessionState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    CallerDisconnected,
    UpstreamError,
    Shutdown,
}

pub struct ProxySession {
    pub session_id: u64,
    content_id: String,
    state: SessionState,
    stats: Arc<StatsCollector>,
    started: Instant,
    relayed_bytes: u64,
}

impl ProxySession {
    pub fn new(content_id: &str, stats: Arc<StatsCollector>) -> Self {
        let session_id = stats.session_opened();
        debug!("session {} opened for content {}", session_id, content_id);
        Self {
            session_id,
            content_id: content_id.to_string(),
            state: SessionState::Idle,
            stats,
            started: Instant::now(),
            relayed_bytes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Illegal transitions are refused and leave the state untouched.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(
                "session {} refused transition {:?} -> {:?}",
                self.session_id, self.state, next
            );
            return false;
        }
        debug!(
            "session {} {:?} -> {:?}",
            self.session_id, self.state, next
        );
        self.state = next;
        true
    }

    pub fn fail(&mut self, status: u16) -> bool {
        self.advance(SessionState::Failed(status))
    }

    pub fn record_relayed(&mut self, bytes: u64) {
        self.relayed_bytes += bytes;
        self.stats.record_relayed(bytes);
    }

    pub fn relayed_bytes(&self) -> u64 {
        self.relayed_bytes
    }

    pub fn close(&mut self, reason: CloseReason) {
        if reason != CloseReason::Completed {
            self.stats.record_aborted();
        }
        self.advance(SessionState::Closed(reason));
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            // Handler future dropped mid-flight, typically the caller going away while
            // we were still waiting on the origin.
            debug!(
                "session {} dropped in state {:?}",
                self.session_id, self.state
            );
            self.stats.record_aborted();
        }
        self.stats.session_closed();
        info!(
            "session {} content={} state={:?} bytes={} elapsed_ms={}",
            self.session_id,
            self.content_id,
            self.state,
            self.relayed_bytes,
            self.started.elapsed().as_millis()
        );
    }
}
