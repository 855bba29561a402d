//! Readiness polling for the debugger port.

use super::DEBUGGER_HOST;
use crate::error::LaunchError;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

/// Interval between connection attempts while the port refuses connections.
pub const PROBE_INTERVAL_MS: u64 = 1000;

/// Polls a local TCP port until it accepts a connection.
#[derive(Debug, Clone)]
pub struct PortWaiter {
    host: String,
    interval: Duration,
    timeout: Option<Duration>,
}

impl Default for PortWaiter {
    fn default() -> Self {
        Self {
            host: DEBUGGER_HOST.to_string(),
            interval: Duration::from_millis(PROBE_INTERVAL_MS),
            timeout: None,
        }
    }
}

impl PortWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bound the total wait. Unbounded by default.
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Resolve once `port` accepts a TCP connection.
    ///
    /// Refused connections are retried forever unless a timeout is set; any
    /// other socket error fails immediately.
    pub async fn wait_until_ready(&self, port: u16) -> Result<(), LaunchError> {
        let host = self.host.as_str();
        self.wait_with(port, |port| async move {
            // The probe socket is dropped as soon as it connects.
            TcpStream::connect((host, port)).await.map(drop)
        })
        .await
    }

    pub(crate) async fn wait_with<F, Fut>(&self, port: u16, mut probe: F) -> Result<(), LaunchError>
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let poll = async {
            let mut attempts: u64 = 0;
            loop {
                attempts += 1;
                match probe(port).await {
                    Ok(()) => {
                        debug!(port, attempts, "Debugger port is ready");
                        return Ok(());
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        trace!(port, attempts, "Debugger port refused connection");
                        sleep(self.interval).await;
                    }
                    Err(e) => return Err(LaunchError::PortProbe { port, source: e }),
                }
            }
        };

        match self.timeout {
            Some(limit) => timeout(limit, poll)
                .await
                .map_err(|_| LaunchError::ReadyTimeout {
                    port,
                    waited: limit,
                })?,
            None => poll.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// A probe that refuses `refusals` times, then succeeds.
    fn scripted_probe(
        refusals: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut(u16) -> std::future::Ready<io::Result<()>> {
        move |_port| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < refusals {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            } else {
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_once_per_refusal() {
        let waiter = PortWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        waiter
            .wait_with(6000, scripted_probe(3, calls.clone()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(3 * PROBE_INTERVAL_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_has_no_delay() {
        let waiter = PortWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        waiter
            .wait_with(6000, scripted_probe(0, calls.clone()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_error_aborts_without_retry() {
        let waiter = PortWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let err = waiter
            .wait_with(6000, move |_port| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(io::Error::from(io::ErrorKind::PermissionDenied)))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            LaunchError::PortProbe { port, source } => {
                assert_eq!(port, 6000);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_polling() {
        let waiter = PortWaiter::new().with_timeout(Some(Duration::from_millis(2500)));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = waiter
            .wait_with(6000, scripted_probe(usize::MAX, calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::ReadyTimeout { port: 6000, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_polls_debugger_host() {
        assert_eq!(PortWaiter::default().host, DEBUGGER_HOST);
    }

    #[tokio::test]
    async fn test_real_listener_is_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        PortWaiter::new().wait_until_ready(port).await.unwrap();
    }
}
