//! Service assembly
//!
//! Recovers state, starts the ingestion thread, the two delivery pipelines
//! and the HTTP surface, all sharing one shutdown signal.

use std::collections::BTreeMap;
use std::sync::Arc;

use persistence::checkpoint::{CheckpointStore, FileCheckpointStore};
use persistence::recovery::{RecoveryEngine, RecoveryError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::fanout::{FanOut, FanOutReport};
use crate::http::{self, AppState};
use crate::ingestion::{run_ingestion, Ingester, IngesterConfig, IngestionError, IngestionStatus};
use crate::metrics::ServiceMetrics;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineStatus, RetryPolicy};
use crate::sink::{DiagnosticLogSink, LogTopic, PubSubSink, Sink, TopicError};
use crate::state::AggregationStore;

pub const PUBSUB_PIPELINE: &str = "pubsub";
pub const LOG_PIPELINE: &str = "log";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("pipeline setup failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("topic unavailable: {0}")]
    Topic(#[from] TopicError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<&ServiceConfig> for PipelineConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            trigger_interval: config.trigger_interval(),
            retry: RetryPolicy {
                max_attempts: config.max_delivery_attempts,
                base_delay: std::time::Duration::from_millis(config.retry_base_ms),
                max_delay: std::time::Duration::from_millis(config.retry_max_ms),
            },
        }
    }
}

impl From<&ServiceConfig> for IngesterConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            snapshot_dir: config.snapshot_dir.clone(),
            snapshot_every_records: config.snapshot_every_records,
            snapshots_retained: config.snapshots_retained,
            compress_snapshots: config.compress_snapshots,
        }
    }
}

/// How the service ended.
#[derive(Debug)]
pub struct ServiceReport {
    pub pipelines: FanOutReport,
    /// Last record log offset consumed, if ingestion stopped cleanly.
    pub last_offset: Option<u64>,
    pub ingestion_error: Option<String>,
    pub metrics: BTreeMap<String, u64>,
}

/// Component that stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unexpected {
    Ingestion,
    Pipelines,
}

pub struct RunningService {
    shutdown: watch::Sender<bool>,
    ingestion: Option<JoinHandle<Result<u64, IngestionError>>>,
    ingestion_result: Option<Result<u64, IngestionError>>,
    fanout: Option<JoinHandle<FanOutReport>>,
    report: Option<FanOutReport>,
    http: Option<JoinHandle<std::io::Result<()>>>,
    state: AppState,
}

/// Recover and start every component.
pub async fn start(config: ServiceConfig) -> Result<RunningService, ServiceError> {
    for dir in [
        &config.log_dir,
        &config.checkpoint_dir,
        &config.snapshot_dir,
        &config.topic_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let metrics = Arc::new(ServiceMetrics::new());
    let store = Arc::new(AggregationStore::new());

    let engine = RecoveryEngine::new(&config.snapshot_dir, &config.log_dir);
    let mut ingester = Ingester::new(store.clone(), metrics.clone());
    let (ingester, tailer, recovery) = tokio::task::spawn_blocking(move || {
        engine
            .recover(&mut ingester)
            .map(|(tailer, recovery)| (ingester, tailer, recovery))
    })
    .await
    .map_err(|e| ServiceError::Task(e.to_string()))??;
    metrics.record_recovery(recovery.replayed, recovery.total_recovery_time_ms);
    info!(
        assets = store.len(),
        watermark = store.watermark(),
        replayed = recovery.replayed,
        "Aggregation state recovered"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingestion_status = ingester.status();
    let ingester_config = IngesterConfig::from(&config);
    let rx = shutdown_rx.clone();
    let ingestion =
        tokio::task::spawn_blocking(move || run_ingestion(ingester, tailer, ingester_config, rx));

    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    let topic = LogTopic::open(&config.topic_dir, &config.topic)?;
    let sinks: [(&str, Arc<dyn Sink>); 2] = [
        (PUBSUB_PIPELINE, Arc::new(PubSubSink::new(Arc::new(topic)))),
        (LOG_PIPELINE, Arc::new(DiagnosticLogSink::new())),
    ];

    let mut fanout = FanOut::new();
    for (name, sink) in sinks {
        fanout.register(Pipeline::new(
            name,
            store.clone(),
            sink,
            checkpoints.clone(),
            PipelineConfig::from(&config),
        )?);
    }

    let state = AppState {
        metrics: metrics.clone(),
        ingestion: ingestion_status,
        pipelines: fanout.statuses(),
    };
    let handle = fanout.spawn(shutdown_rx.clone());
    let fanout = tokio::spawn(handle.join());

    let http = if config.http_bind.is_empty() {
        None
    } else {
        let bind = config.http_bind.clone();
        let app = state.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { http::serve(&bind, app, rx).await }))
    };

    info!(
        topic = %config.topic,
        trigger_interval_secs = config.trigger_interval_secs,
        http_bind = %config.http_bind,
        "Aggregator running"
    );

    Ok(RunningService {
        shutdown: shutdown_tx,
        ingestion: Some(ingestion),
        ingestion_result: None,
        fanout: Some(fanout),
        report: None,
        http,
        state,
    })
}

impl RunningService {
    pub fn statuses(&self) -> &[Arc<PipelineStatus>] {
        &self.state.pipelines
    }

    pub fn metrics(&self) -> BTreeMap<String, u64> {
        self.state.export_metrics()
    }

    pub fn ingestion(&self) -> &Arc<IngestionStatus> {
        &self.state.ingestion
    }

    /// Resolves once a component ends without a shutdown request: the
    /// record log became unreadable or every pipeline halted. Cancel safe.
    pub async fn stopped_unexpectedly(&mut self) -> Unexpected {
        tokio::select! {
            _ = await_ingestion(&mut self.ingestion, &mut self.ingestion_result) => {
                Unexpected::Ingestion
            }
            _ = await_fanout(&mut self.fanout, &mut self.report) => Unexpected::Pipelines,
        }
    }

    /// Signal shutdown and wait for every component to stop.
    pub async fn shutdown(mut self) -> ServiceReport {
        info!("Shutdown requested");
        let _ = self.shutdown.send(true);

        let pipelines = match (self.report.take(), self.fanout.take()) {
            (Some(report), _) => report,
            (None, Some(handle)) => handle.await.unwrap_or_else(|e| {
                error!(error = %e, "Fan-out task failed");
                FanOutReport::default()
            }),
            (None, None) => FanOutReport::default(),
        };

        let ingestion = match (self.ingestion_result.take(), self.ingestion.take()) {
            (Some(result), _) => result,
            (None, Some(handle)) => handle
                .await
                .unwrap_or_else(|e| Err(IngestionError::Task(e.to_string()))),
            (None, None) => Ok(self.state.ingestion.last_offset()),
        };
        let (last_offset, ingestion_error) = match ingestion {
            Ok(offset) => (Some(offset), None),
            Err(e) => {
                error!(error = %e, "Ingestion ended with an error");
                (None, Some(e.to_string()))
            }
        };

        if let Some(http) = self.http {
            match http.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "HTTP server ended with an error"),
                Err(e) => warn!(error = %e, "HTTP task failed"),
            }
        }

        ServiceReport {
            pipelines,
            last_offset,
            ingestion_error,
            metrics: self.state.export_metrics(),
        }
    }
}

async fn await_ingestion(
    handle: &mut Option<JoinHandle<Result<u64, IngestionError>>>,
    result: &mut Option<Result<u64, IngestionError>>,
) {
    match handle.as_mut() {
        Some(h) => {
            let outcome = h
                .await
                .unwrap_or_else(|e| Err(IngestionError::Task(e.to_string())));
            *handle = None;
            *result = Some(outcome);
        }
        None => std::future::pending::<()>().await,
    }
}

async fn await_fanout(
    handle: &mut Option<JoinHandle<FanOutReport>>,
    report: &mut Option<FanOutReport>,
) {
    match handle.as_mut() {
        Some(h) => {
            let outcome = h.await.unwrap_or_else(|e| {
                error!(error = %e, "Fan-out task failed");
                FanOutReport::default()
            });
            *handle = None;
            *report = Some(outcome);
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::WireRecord;
    use persistence::log::{LogConfig, LogWriter};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> ServiceConfig {
        ServiceConfig {
            log_dir: tmp.path().join("records"),
            checkpoint_dir: tmp.path().join("checkpoints"),
            snapshot_dir: tmp.path().join("snapshots"),
            topic_dir: tmp.path().join("topics"),
            trigger_interval_secs: 1,
            poll_interval_ms: 5,
            http_bind: String::new(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_pipeline_config_from_service_config() {
        let tmp = TempDir::new().unwrap();
        let c = ServiceConfig {
            max_delivery_attempts: 3,
            retry_base_ms: 100,
            retry_max_ms: 800,
            ..config(&tmp)
        };
        let p = PipelineConfig::from(&c);
        assert_eq!(p.trigger_interval, Duration::from_secs(1));
        assert_eq!(p.retry.max_attempts, 3);
        assert_eq!(p.retry.delay_for(5), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_delivers_to_both_sinks() {
        let tmp = TempDir::new().unwrap();
        let c = config(&tmp);
        let mut writer = LogWriter::open(LogConfig::new(&c.log_dir)).unwrap();
        let payload = WireRecord {
            cryptocurrency_id: Some(7),
            price: Some("10.0".to_string()),
            market_cap: Some(100),
            market_cap_rank: Some(3),
            total_volume: Some(50),
            high_24h: Some("11.0".to_string()),
            low_24h: Some("9.0".to_string()),
            timestamp: Some("t".to_string()),
            ..WireRecord::default()
        }
        .to_payload()
        .unwrap();
        writer.append(&payload).unwrap();
        writer.sync().unwrap();

        let running = start(c.clone()).await.unwrap();
        assert_eq!(running.statuses().len(), 2);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while running.statuses().iter().any(|s| s.committed_offset() < 1)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let report = running.shutdown().await;
        assert_eq!(report.last_offset, Some(1));
        assert_eq!(report.pipelines.stopped.len(), 2);
        assert!(report.pipelines.halted.is_empty());
        assert_eq!(report.metrics["records_ingested"], 1);
        assert_eq!(report.metrics["pipeline.pubsub.rows_delivered"], 1);
        assert_eq!(report.metrics["pipeline.log.rows_delivered"], 1);

        let published = LogTopic::read_all(&c.topic_dir.join(&c.topic)).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "7");
    }

    #[tokio::test]
    async fn test_unreadable_log_stops_service_and_reports_ingestion() {
        let tmp = TempDir::new().unwrap();
        let c = config(&tmp);
        let mut running = start(c.clone()).await.unwrap();
        assert!(!running.ingestion().is_failed());

        // Swap the record log directory for a plain file.
        std::fs::remove_dir_all(&c.log_dir).unwrap();
        std::fs::write(&c.log_dir, b"not a directory").unwrap();

        let stopped =
            tokio::time::timeout(Duration::from_secs(10), running.stopped_unexpectedly())
                .await
                .unwrap();
        assert_eq!(stopped, Unexpected::Ingestion);
        assert!(running.ingestion().is_failed());

        let report = running.shutdown().await;
        assert_eq!(report.last_offset, None);
        assert!(report.ingestion_error.is_some());
        assert_eq!(report.pipelines.stopped.len(), 2);
    }
}
