//! Initialization waiter
//!
//! Polls a started session until its handshake result is available, the
//! connection fails, or the attempt budget runs out.

use std::time::{Duration, Instant};
use tracing::{Level, debug, warn};

use crate::lsp::client::LspClient;
use crate::lsp::protocol::ConnectionStatus;
use crate::server::config::{DEFAULT_HANDSHAKE_ATTEMPTS, DEFAULT_HANDSHAKE_INTERVAL_MS};

/// What the waiter needs to observe on a starting connection
pub trait HandshakeProbe {
    fn connection_status(&self) -> ConnectionStatus;

    fn handshake_complete(&self) -> bool;
}

impl HandshakeProbe for LspClient {
    fn connection_status(&self) -> ConnectionStatus {
        self.status()
    }

    fn handshake_complete(&self) -> bool {
        self.is_initialized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    /// Budget exhausted; the server may simply be slow
    TimedOut,
    /// The connection failed or closed while waiting
    Failed(String),
}

/// Bounded attempt × interval poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializationWaiter {
    max_attempts: u32,
    interval: Duration,
}

impl Default for InitializationWaiter {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            interval: Duration::from_millis(DEFAULT_HANDSHAKE_INTERVAL_MS),
        }
    }
}

impl InitializationWaiter {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Total time the waiter may spend before giving up
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    pub async fn wait<P: HandshakeProbe + ?Sized>(&self, probe: &P) -> WaitOutcome {
        let started = Instant::now();

        for attempt in 0..self.max_attempts {
            match probe.connection_status() {
                ConnectionStatus::Failed(reason) => {
                    warn!("Connection failed during handshake: {}", reason);
                    return WaitOutcome::Failed(reason);
                }
                ConnectionStatus::Closed => {
                    warn!("Connection closed during handshake");
                    return WaitOutcome::Failed("connection closed".to_string());
                }
                ConnectionStatus::Connected if probe.handshake_complete() => {
                    debug!("Handshake completed after {} poll(s)", attempt + 1);
                    crate::log_timing!(Level::DEBUG, "handshake_wait", started.elapsed());
                    return WaitOutcome::Ready;
                }
                _ => tokio::time::sleep(self.interval).await,
            }
        }

        warn!(
            "Handshake not completed within {} attempts ({:?})",
            self.max_attempts,
            self.budget()
        );
        WaitOutcome::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted probe: becomes ready (or fails) after a number of polls
    struct ScriptedProbe {
        polls: AtomicU32,
        ready_after: Option<u32>,
        status: Mutex<ConnectionStatus>,
        fail_after: Option<u32>,
        complete: AtomicBool,
    }

    impl ScriptedProbe {
        fn new(ready_after: Option<u32>, fail_after: Option<u32>) -> Self {
            Self {
                polls: AtomicU32::new(0),
                ready_after,
                status: Mutex::new(ConnectionStatus::Connecting),
                fail_after,
                complete: AtomicBool::new(false),
            }
        }
    }

    impl HandshakeProbe for ScriptedProbe {
        fn connection_status(&self) -> ConnectionStatus {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut status = self.status.lock().unwrap();
            if self.fail_after.is_some_and(|n| polls >= n) {
                *status = ConnectionStatus::Failed("server crashed".to_string());
            } else if polls >= 2 && *status == ConnectionStatus::Connecting {
                *status = ConnectionStatus::Connected;
            }
            if self.ready_after.is_some_and(|n| polls >= n) {
                self.complete.store(true, Ordering::SeqCst);
            }
            status.clone()
        }

        fn handshake_complete(&self) -> bool {
            self.complete.load(Ordering::SeqCst)
        }
    }

    fn fast() -> InitializationWaiter {
        InitializationWaiter::new(20, Duration::from_millis(1))
    }

    #[test]
    fn test_default_budget_is_ten_seconds() {
        let waiter = InitializationWaiter::default();
        assert_eq!(waiter.max_attempts(), 1000);
        assert_eq!(waiter.interval(), Duration::from_millis(10));
        assert_eq!(waiter.budget(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_ready_once_handshake_completes() {
        let probe = ScriptedProbe::new(Some(5), None);
        assert_eq!(fast().wait(&probe).await, WaitOutcome::Ready);
        assert_eq!(probe.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_handshake_alone_is_not_ready_while_connecting() {
        // Handshake slot filled on the first poll but the loop only reports
        // Connected from the second one.
        let probe = ScriptedProbe::new(Some(1), None);
        assert_eq!(fast().wait(&probe).await, WaitOutcome::Ready);
        assert_eq!(probe.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_times_out_after_budget() {
        let probe = ScriptedProbe::new(None, None);
        assert_eq!(fast().wait(&probe).await, WaitOutcome::TimedOut);
        assert_eq!(probe.polls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let probe = ScriptedProbe::new(None, Some(3));
        let outcome = fast().wait(&probe).await;

        assert_eq!(outcome, WaitOutcome::Failed("server crashed".to_string()));
        assert_eq!(probe.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_times_out_immediately() {
        let probe = ScriptedProbe::new(Some(1), None);
        let waiter = InitializationWaiter::new(0, Duration::from_millis(1));

        assert_eq!(waiter.wait(&probe).await, WaitOutcome::TimedOut);
        assert_eq!(probe.polls.load(Ordering::SeqCst), 0);
    }
}
