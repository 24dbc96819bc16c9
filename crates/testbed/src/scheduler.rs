//! Ordered, wave-barriered setup execution
//!
//! Setup jobs are grouped into waves by their order, lowest first. All jobs
//! of a wave run concurrently on an executor owned by the scheduler, and the
//! next wave starts only once every job of the current one has finished. If
//! any job of a wave fails, the wave is still drained, no later wave starts,
//! and the first failure to complete is returned.
//!
//! The executor lives as long as the scheduler; dropping the scheduler
//! cancels anything still queued on it.

use crate::environment::Environment;
use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use smol::Executor;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

type JobFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// One setup function bound to its arguments
pub struct SetupJob {
    order: i32,
    label: String,
    start: JobFn,
}

impl SetupJob {
    /// A job in wave `order`; `start` is called when the wave begins
    pub fn new<F, Fut>(order: i32, label: impl Into<String>, start: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            order,
            label: label.into(),
            start: Box::new(move || Box::pin(start())),
        }
    }

    /// Wave the job belongs to
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Human readable description used in logs
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for SetupJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupJob")
            .field("order", &self.order)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Every (node, stage) pair of `env`, as jobs
pub fn setup_jobs(env: &Arc<Environment>) -> Vec<SetupJob> {
    let mut jobs = Vec::new();
    for node in env.nodes() {
        for stage in node.template().setup() {
            let env = env.clone();
            let node = node.clone();
            let stage = stage.clone();
            let label = format!("setup stage {} on {}", stage.order(), node.name());
            jobs.push(SetupJob::new(stage.order(), label, move || {
                stage.invoke(env, node)
            }));
        }
    }
    jobs
}

/// Runs setup jobs wave by wave
#[derive(Debug)]
pub struct SetupScheduler {
    executor: Executor<'static>,
}

impl Default for SetupScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupScheduler {
    /// A scheduler with its own, empty executor
    pub fn new() -> Self {
        Self {
            executor: Executor::new(),
        }
    }

    /// Run `jobs`, lowest order first
    pub async fn run(&self, jobs: Vec<SetupJob>) -> Result<()> {
        let mut waves: BTreeMap<i32, Vec<SetupJob>> = BTreeMap::new();
        for job in jobs {
            waves.entry(job.order).or_default().push(job);
        }

        let count = waves.len();
        for (index, (order, wave)) in waves.into_iter().enumerate() {
            info!(
                "Running setup wave {}/{} (order {}, {} jobs)",
                index + 1,
                count,
                order,
                wave.len()
            );
            self.run_wave(wave).await?;
        }
        Ok(())
    }

    /// Run every job of one wave concurrently and wait for all of them
    async fn run_wave(&self, wave: Vec<SetupJob>) -> Result<()> {
        let mut pending: FuturesUnordered<_> = wave
            .into_iter()
            .map(|job| {
                let SetupJob { label, start, .. } = job;
                self.executor.spawn(async move {
                    // Setup functions may panic before handing back a future
                    let result = match std::panic::catch_unwind(AssertUnwindSafe(start)) {
                        Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                            Ok(result) => result,
                            Err(payload) => Err(Error::SetupPanicked(panic_message(payload))),
                        },
                        Err(payload) => Err(Error::SetupPanicked(panic_message(payload))),
                    };
                    (label, result)
                })
            })
            .collect();

        let mut first_error = None;
        self.executor
            .run(async {
                while let Some((label, result)) = pending.next().await {
                    match result {
                        Ok(()) => debug!("Finished {}", label),
                        Err(e) => {
                            warn!("{} failed: {}", label, e);
                            first_error.get_or_insert(e);
                        }
                    }
                }
            })
            .await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
