//! Stop condition and the shared stop flag.
//!
//! The interrupt handler and the row assembler only touch [`StopSignal`]:
//! they set an atomic and wake the controller. The controller evaluates the
//! [`StopCondition`] on every wake and on every idle tick.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    DurationElapsed,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::TargetReached => "target sample count reached",
            StopReason::DurationElapsed => "collection duration elapsed",
            StopReason::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

/// Target sample count and/or wall-clock limit; whichever fires first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopCondition {
    pub target_samples: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl StopCondition {
    pub fn evaluate(
        &self,
        samples: u64,
        elapsed: Duration,
        interrupted: bool,
    ) -> Option<StopReason> {
        if interrupted {
            return Some(StopReason::Interrupted);
        }
        if self.target_samples.is_some_and(|target| samples >= target) {
            return Some(StopReason::TargetReached);
        }
        if self.max_duration.is_some_and(|limit| elapsed >= limit) {
            return Some(StopReason::DurationElapsed);
        }
        None
    }
}

#[derive(Debug, Default)]
struct Inner {
    interrupted: AtomicBool,
    wake: Notify,
}

/// Cloneable handle shared by the signal task, callbacks and the controller.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop flag. Safe to call from any thread, any number of times.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Ask the controller to re-check the stop predicate.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.inner.wake.notified().await;
    }
}

/// Forward SIGINT / SIGTERM to the stop flag. Nothing else happens in the
/// handler; the controller notices the flag on its next wake.
pub fn spawn_signal_listener(stop: StopSignal) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
            _ = terminate => tracing::info!("Received terminate signal"),
        }
        stop.interrupt();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_reached() {
        let cond = StopCondition {
            target_samples: Some(3),
            max_duration: None,
        };
        assert_eq!(cond.evaluate(2, Duration::from_secs(100), false), None);
        assert_eq!(
            cond.evaluate(3, Duration::ZERO, false),
            Some(StopReason::TargetReached)
        );
    }

    #[test]
    fn test_duration_and_target_whichever_first() {
        let cond = StopCondition {
            target_samples: Some(1000),
            max_duration: Some(Duration::from_secs(60)),
        };
        assert_eq!(cond.evaluate(10, Duration::from_secs(59), false), None);
        assert_eq!(
            cond.evaluate(10, Duration::from_secs(60), false),
            Some(StopReason::DurationElapsed)
        );
        assert_eq!(
            cond.evaluate(1000, Duration::from_secs(1), false),
            Some(StopReason::TargetReached)
        );
    }

    #[test]
    fn test_interrupt_wins() {
        let cond = StopCondition {
            target_samples: Some(1),
            max_duration: None,
        };
        assert_eq!(
            cond.evaluate(5, Duration::ZERO, true),
            Some(StopReason::Interrupted)
        );
        assert_eq!(StopCondition::default().evaluate(u64::MAX, Duration::MAX, false), None);
    }

    #[tokio::test]
    async fn test_interrupt_wakes_waiter() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.woken().await })
        };
        stop.interrupt();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
        assert!(stop.is_interrupted());
    }
}
