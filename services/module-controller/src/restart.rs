//! Restart coordination.
//!
//! Module loaders only pick up tree changes on restart. Changes tend to
//! arrive in bursts, so [`RestartCoordinator`] waits until no change has been
//! reported for a full debounce window and then asks for a single restart,
//! reporting only the most recent reason.
//!
//! The coordinator owns its timer and reason; the rest of the controller only
//! holds cloneable [`RestartHandle`]s.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Restart errors.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },
}

/// Delivers a restart request.
pub trait RestartSignal: Send + Sync {
    fn signal(&self, reason: &str) -> Result<(), RestartError>;
}

/// Sends `SIGUSR2` to a process, asking it to restart gracefully.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSignal {
    pid: i32,
}

impl ProcessSignal {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }
}

impl RestartSignal for ProcessSignal {
    fn signal(&self, _reason: &str) -> Result<(), RestartError> {
        // SAFETY: kill has no memory-safety preconditions
        let result = unsafe { libc::kill(self.pid, libc::SIGUSR2) };
        if result != 0 {
            return Err(RestartError::Signal {
                pid: self.pid,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Reports module tree changes to the coordinator.
#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl RestartHandle {
    /// Arm the restart timer with `reason`.
    pub fn modules_changed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(reason = %reason, "Module tree changed");
        let _ = self.tx.send(reason);
    }
}

/// Debounces module tree changes into restart signals.
pub struct RestartCoordinator {
    rx: mpsc::UnboundedReceiver<String>,
    delay: Duration,
    signal: Arc<dyn RestartSignal>,
}

/// Create a coordinator and the handle feeding it.
pub fn restart_channel(
    delay: Duration,
    signal: Arc<dyn RestartSignal>,
) -> (RestartHandle, RestartCoordinator) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RestartHandle { tx },
        RestartCoordinator { rx, delay, signal },
    )
}

impl RestartCoordinator {
    /// Run until shutdown. A failed signal ends the coordinator.
    #[instrument(skip(self, shutdown), fields(delay_ms = self.delay.as_millis() as u64))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RestartError> {
        let timer = tokio::time::sleep(self.delay);
        tokio::pin!(timer);
        let mut reason = String::new();

        loop {
            tokio::select! {
                Some(next) = self.rx.recv() => {
                    reason = next;
                    timer.as_mut().reset(Instant::now() + self.delay);
                }
                () = &mut timer => {
                    if !reason.is_empty() {
                        info!(reason = %reason, "Requesting restart");
                        self.signal.signal(&reason)?;
                        reason.clear();
                    }
                    timer.as_mut().reset(Instant::now() + self.delay);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Restart coordinator shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        reasons: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RestartSignal for Recorder {
        fn signal(&self, reason: &str) -> Result<(), RestartError> {
            if self.fail {
                return Err(RestartError::Signal {
                    pid: 1,
                    source: io::Error::from_raw_os_error(libc::EPERM),
                });
            }
            self.reasons.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    fn start(
        recorder: Arc<Recorder>,
    ) -> (
        RestartHandle,
        watch::Sender<bool>,
        tokio::task::JoinHandle<Result<(), RestartError>>,
    ) {
        let (handle, coordinator) = restart_channel(Duration::from_secs(3), recorder);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(shutdown_rx));
        (handle, shutdown_tx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_signal() {
        let recorder = Arc::new(Recorder::default());
        let (handle, shutdown, task) = start(Arc::clone(&recorder));

        for i in 0..5 {
            handle.modules_changed(format!("change {}", i));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(recorder.reasons.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*recorder.reasons.lock().unwrap(), vec!["change 4"]);

        handle.modules_changed("a new module release found");
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            *recorder.reasons.lock().unwrap(),
            vec!["change 4", "a new module release found"]
        );

        shutdown.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_does_not_signal() {
        let recorder = Arc::new(Recorder::default());
        let (_handle, shutdown, task) = start(Arc::clone(&recorder));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.reasons.lock().unwrap().is_empty());

        shutdown.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_stops_coordinator() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (handle, _shutdown, task) = start(recorder);

        handle.modules_changed("one of modules is not enabled");
        let result = task.await.unwrap();
        assert!(matches!(result, Err(RestartError::Signal { .. })));
    }
}
