//! Top-level task supervision
//!
//! Every long-running piece of the worker (registration, metrics endpoint, pipeline
//! tasks) is spawned through the [`Supervisor`]. A failing critical task halts the
//! whole process; a failing ordinary task is logged and the rest keep running.

use frameflow_common::{FrameflowError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// How a task's failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Failure stops the process
    Critical,
    /// Failure is logged
    Ordinary,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Finished {
    name: String,
    class: TaskClass,
    result: Result<()>,
}

/// Owns and monitors the worker's top-level tasks
pub struct Supervisor {
    tasks: JoinSet<Finished>,
    shutdown: watch::Sender<bool>,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: JoinSet::new(),
            shutdown,
            grace_period,
        }
    }

    /// Receiver that flips to `true` when the supervisor begins shutting down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a supervised task
    pub fn spawn<F>(&mut self, name: impl Into<String>, class: TaskClass, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        info!(task = %name, ?class, "Starting task");

        // The inner spawn turns a panic into an ordinary task error
        let inner = AbortOnDrop(tokio::spawn(task));
        self.tasks.spawn(async move {
            let mut inner = inner;
            let result = match (&mut inner.0).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(FrameflowError::internal(format!(
                    "task {} panicked",
                    name
                ))),
                Err(_) => Err(FrameflowError::internal(format!("task {} was cancelled", name))),
            };
            Finished {
                name,
                class,
                result,
            }
        });
    }

    /// Monitor tasks until a critical one fails, all finish, or `stop` resolves.
    ///
    /// Returns the critical task's error in the first case.
    pub async fn run<S>(mut self, stop: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("Shutdown requested");
                    self.stop_all().await;
                    return Ok(());
                }
                joined = self.tasks.join_next() => {
                    let Some(joined) = joined else {
                        info!("All tasks finished");
                        return Ok(());
                    };
                    let finished = match joined {
                        Ok(finished) => finished,
                        Err(e) => {
                            error!(error = %e, "Supervisor lost track of a task");
                            continue;
                        }
                    };
                    match (finished.class, finished.result) {
                        (_, Ok(())) => info!(task = %finished.name, "Task finished"),
                        (TaskClass::Ordinary, Err(e)) => {
                            error!(task = %finished.name, error = %e, "Task failed");
                        }
                        (TaskClass::Critical, Err(e)) => {
                            error!(
                                task = %finished.name,
                                error = %e,
                                "Critical task failed, halting"
                            );
                            self.shutdown.send_replace(true);
                            self.tasks.shutdown().await;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Signal every task, wait out the grace period, then abort the rest
    async fn stop_all(&mut self) {
        self.shutdown.send_replace(true);

        let drained = tokio::time::timeout(self.grace_period, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Ok(Finished {
                    name,
                    result: Err(e),
                    ..
                }) = joined
                {
                    warn!(task = %name, error = %e, "Task failed during shutdown");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Tasks did not stop within the grace period, aborting"
            );
            self.tasks.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const GRACE: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_critical_failure_halts() {
        let mut supervisor = Supervisor::new(GRACE);
        supervisor.spawn("forever", TaskClass::Ordinary, async {
            std::future::pending::<()>().await;
            Ok(())
        });
        supervisor.spawn("registration", TaskClass::Critical, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(FrameflowError::registration("no orchestrator"))
        });

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, FrameflowError::Registration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordinary_failure_is_isolated() {
        let mut supervisor = Supervisor::new(GRACE);
        let survivor_done = Arc::new(AtomicBool::new(false));

        supervisor.spawn("flaky", TaskClass::Ordinary, async {
            Err(FrameflowError::store("NOGROUP"))
        });
        let done = survivor_done.clone();
        supervisor.spawn("steady", TaskClass::Ordinary, async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            done.store(true, Ordering::SeqCst);
            Ok(())
        });

        supervisor.run(std::future::pending()).await.unwrap();
        assert!(survivor_done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_critical_task_is_an_error() {
        let mut supervisor = Supervisor::new(GRACE);
        supervisor.spawn("explodes", TaskClass::Critical, async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            Ok(())
        });

        let err = supervisor.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, FrameflowError::Internal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signals_tasks() {
        let mut supervisor = Supervisor::new(GRACE);
        let mut signal = supervisor.shutdown_signal();
        let observed = Arc::new(AtomicBool::new(false));

        let seen = observed.clone();
        supervisor.spawn("loop", TaskClass::Ordinary, async move {
            while !*signal.borrow() {
                if signal.changed().await.is_err() {
                    break;
                }
            }
            seen.store(true, Ordering::SeqCst);
            Ok(())
        });

        supervisor
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_aborted_after_grace_period() {
        let mut supervisor = Supervisor::new(GRACE);
        supervisor.spawn("stuck", TaskClass::Ordinary, async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let started = tokio::time::Instant::now();
        supervisor
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(started.elapsed() >= GRACE);
    }
}
