// Upstream -> caller byte pump over a bounded channel.
//
// The pump reads the next upstream chunk only after the previous one has been accepted
// by the channel, so a slow caller stalls upstream reads instead of growing a queue.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::{CloseReason, ProxySession, SessionState};
use super::stats::StatsCollector;
use super::transport::UpstreamBody;

/// An upstream body whose connection is counted as open until dropped.
pub struct OpenUpstream {
    body: UpstreamBody,
    stats: Arc<StatsCollector>,
}

impl OpenUpstream {
    pub fn new(body: UpstreamBody, stats: Arc<StatsCollector>) -> Self {
        stats.upstream_opened();
        Self { body, stats }
    }
}

impl Drop for OpenUpstream {
    fn drop(&mut self) {
        self.stats.upstream_closed();
    }
}

/// Response body handed to the server. Ends cleanly only when the upstream body was
/// relayed to its end; any other termination yields an error so the server aborts the
/// connection instead of presenting a truncated body as complete.
pub struct RelayBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    completed: Arc<AtomicBool>,
    done: bool,
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(chunk)),
            Poll::Ready(None) => {
                self.done = true;
                if self.completed.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "upstream relay terminated early",
                    ))))
                }
            }
        }
    }
}

/// Spawn the pump task for a session whose upstream headers have been relayed.
pub fn start_relay(
    mut session: ProxySession,
    upstream: OpenUpstream,
    capacity: usize,
    shutdown: CancellationToken,
) -> RelayBody {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let completed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&completed);

    session.advance(SessionState::Streaming);
    tokio::spawn(async move {
        let reason = pump(&mut session, upstream, &tx, &shutdown).await;
        if reason == CloseReason::Completed {
            flag.store(true, Ordering::Release);
        }
        drop(tx);
        session.close(reason);
    });

    RelayBody {
        rx,
        completed,
        done: false,
    }
}

async fn pump(
    session: &mut ProxySession,
    mut upstream: OpenUpstream,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    shutdown: &CancellationToken,
) -> CloseReason {
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!("session {} caller disconnected while waiting on upstream", session.session_id);
                return CloseReason::CallerDisconnected;
            }
            _ = shutdown.cancelled() => return CloseReason::Shutdown,
            next = upstream.body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                tokio::select! {
                    biased;
                    sent = tx.send(Ok(chunk)) => {
                        if sent.is_err() {
                            debug!("session {} caller disconnected", session.session_id);
                            return CloseReason::CallerDisconnected;
                        }
                    }
                    _ = shutdown.cancelled() => return CloseReason::Shutdown,
                }
                session.record_relayed(len);
            }
            Some(Err(e)) => {
                warn!(
                    "session {} upstream failed mid-stream after {} bytes: {}",
                    session.session_id,
                    session.relayed_bytes(),
                    e
                );
                return CloseReason::UpstreamError;
            }
            None => return CloseReason::Completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::stream;

    use super::*;

    fn streaming_session(stats: &Arc<StatsCollector>) -> ProxySession {
        let mut session = ProxySession::new("c1", stats.clone());
        session.advance(SessionState::AccessChecked);
        session.advance(SessionState::OriginResolved);
        session.advance(SessionState::UpstreamConnecting);
        session.advance(SessionState::UpstreamHeadersReceived);
        session
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_relays_all_chunks_in_order() {
        let stats = Arc::new(StatsCollector::new());
        let chunks: Vec<io::Result<Bytes>> = (0..20u8)
            .map(|i| Ok(Bytes::from(vec![i; 1000])))
            .collect();
        let upstream = OpenUpstream::new(stream::iter(chunks).boxed(), stats.clone());

        let body = start_relay(streaming_session(&stats), upstream, 2, CancellationToken::new());
        let received: Vec<io::Result<Bytes>> = body.collect().await;

        let mut expected = Vec::new();
        for i in 0..20u8 {
            expected.extend(std::iter::repeat(i).take(1000));
        }
        let got: Vec<u8> = received
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(got, expected);
        assert!(wait_for(|| stats.open_upstreams() == 0).await);
        assert!(wait_for(|| stats.active_sessions() == 0).await);
        assert_eq!(stats.snapshot().relayed_bytes_total, 20_000);
    }

    #[tokio::test]
    async fn test_upstream_error_ends_body_with_error() {
        let stats = Arc::new(StatsCollector::new());
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "origin reset")),
        ];
        let upstream = OpenUpstream::new(stream::iter(items).boxed(), stats.clone());

        let mut body = start_relay(streaming_session(&stats), upstream, 4, CancellationToken::new());
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(body.next().await.unwrap().is_err());
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_caller_drop_releases_upstream() {
        let stats = Arc::new(StatsCollector::new());
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let upstream_body = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(b"head")) })
            .chain(stream::pending())
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed();
        let upstream = OpenUpstream::new(upstream_body, stats.clone());

        let mut body = start_relay(streaming_session(&stats), upstream, 4, CancellationToken::new());
        assert!(body.next().await.unwrap().is_ok());
        drop(body);

        assert!(wait_for(|| released.load(Ordering::SeqCst)).await);
        assert!(wait_for(|| stats.open_upstreams() == 0).await);
        assert!(wait_for(|| stats.snapshot().aborted_streams == 1).await);
    }

    #[tokio::test]
    async fn test_backpressure_bounds_upstream_reads() {
        let stats = Arc::new(StatsCollector::new());
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream_body = stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(Bytes::from_static(&[0u8; 64]))
        })
        .boxed();
        let upstream = OpenUpstream::new(upstream_body, stats.clone());

        let capacity = 2;
        let body = start_relay(streaming_session(&stats), upstream, capacity, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Channel slots plus the chunk parked in the pending send.
        assert!(pulled.load(Ordering::SeqCst) <= capacity + 1);
        drop(body);
        assert!(wait_for(|| stats.open_upstreams() == 0).await);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stream() {
        let stats = Arc::new(StatsCollector::new());
        let upstream_body = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(b"x")) })
            .chain(stream::pending())
            .boxed();
        let upstream = OpenUpstream::new(upstream_body, stats.clone());
        let shutdown = CancellationToken::new();

        let mut body = start_relay(streaming_session(&stats), upstream, 4, shutdown.clone());
        assert!(body.next().await.unwrap().is_ok());
        shutdown.cancel();
        let last = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap();
        assert!(matches!(last, Some(Err(_))));
        assert!(wait_for(|| stats.open_upstreams() == 0).await);
    }
}
