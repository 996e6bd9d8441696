//! Sink fan-out coordinator
//!
//! Runs every registered pipeline as its own task over the shared store.
//! Pipelines never wait on each other: a slow sink delays only its own
//! cycles, and a halted pipeline is reported while the rest keep running.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::pipeline::{Pipeline, PipelineError, PipelineStatus};

#[derive(Default)]
pub struct FanOut {
    pipelines: Vec<Pipeline>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        self.pipelines.push(pipeline);
    }

    pub fn statuses(&self) -> Vec<Arc<PipelineStatus>> {
        self.pipelines.iter().map(|p| p.status()).collect()
    }

    /// Start every pipeline on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> FanOutHandle {
        let mut tasks = JoinSet::new();
        let total = self.pipelines.len();
        for pipeline in self.pipelines {
            let name = pipeline.name().to_string();
            let rx = shutdown.clone();
            tasks.spawn(async move {
                let result = pipeline.run(rx).await;
                (name, result)
            });
        }
        info!(pipelines = total, "Fan-out started");
        FanOutHandle { tasks, total }
    }
}

/// How each pipeline ended.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub stopped: Vec<String>,
    pub halted: Vec<(String, String)>,
}

impl FanOutReport {
    /// True when there were pipelines and none of them survived.
    pub fn all_halted(&self) -> bool {
        !self.halted.is_empty() && self.stopped.is_empty()
    }
}

pub struct FanOutHandle {
    tasks: JoinSet<(String, Result<(), PipelineError>)>,
    total: usize,
}

impl FanOutHandle {
    /// Wait for every pipeline to finish, logging halts as they happen.
    pub async fn join(mut self) -> FanOutReport {
        let mut report = FanOutReport::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => report.stopped.push(name),
                Ok((name, Err(e))) => {
                    let finished = report.halted.len() + report.stopped.len() + 1;
                    let still_running = self.total.saturating_sub(finished);
                    error!(
                        pipeline = %name,
                        error = %e,
                        still_running,
                        "Pipeline halted; remaining pipelines continue"
                    );
                    report.halted.push((name, e.to_string()));
                }
                Err(e) => {
                    error!(error = %e, "Pipeline task aborted");
                    report.halted.push(("<unknown>".to_string(), e.to_string()));
                }
            }
        }
        report
    }
}
