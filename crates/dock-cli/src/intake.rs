//! Snapshot intake: NDJSON lines from stdin and, optionally, `POST /snapshots`.
//!
//! Both feed the same [`Pipeline`] under one in-flight limit. Shutdown is a
//! [`CancellationToken`]: intake stops accepting, then in-flight snapshots
//! drain before [`serve`] returns.

use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use dock_core::time;

use crate::pipeline::{Pipeline, PipelineError, PipelineResult, SnapshotOutcome};

/// Lines buffered between the stdin reader thread and the intake loop.
const LINE_BUFFER: usize = 256;

#[derive(Debug, Default)]
pub struct IntakeCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    movements: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeStats {
    pub accepted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub failed: u64,
    pub movements: u64,
}

impl IntakeCounters {
    /// Count one processed snapshot and log any failure at its severity.
    pub fn record(&self, result: &PipelineResult<SnapshotOutcome>) {
        match result {
            Ok(outcome) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                self.movements
                    .fetch_add(outcome.movements.len() as u64, Ordering::Relaxed);
            }
            Err(e @ PipelineError::Rejected(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "snapshot rejected");
            }
            Err(e @ PipelineError::KeysFailed { outcome, .. }) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.movements
                    .fetch_add(outcome.movements.len() as u64, Ordering::Relaxed);
                error!(error = %e, "snapshot partially applied");
            }
            Err(e @ PipelineError::UnresolvedGateway(_)) => {
                // already warned at resolution time
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "snapshot dropped");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "snapshot failed");
            }
        }
    }

    pub fn snapshot(&self) -> IntakeStats {
        IntakeStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            movements: self.movements.load(Ordering::Relaxed),
        }
    }
}

/// Read lines on a plain OS thread.
///
/// A blocking stdin read cannot be cancelled; keeping it off the runtime
/// lets the process exit on a signal without waiting for the next line.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<std::io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    std::thread::spawn(move || {
        for line in reader.lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Process lines until the channel closes (EOF) or `token` is cancelled,
/// then wait for every spawned snapshot to finish.
pub async fn run_lines(
    pipeline: Arc<Pipeline>,
    mut lines: mpsc::Receiver<std::io::Result<String>>,
    permits: Arc<Semaphore>,
    counters: Arc<IntakeCounters>,
    token: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();

    let result = loop {
        let next = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            next = lines.recv() => next,
        };
        let line = match next {
            None => {
                debug!("snapshot stream reached EOF");
                break Ok(());
            }
            Some(Err(e)) => {
                break Err(anyhow::Error::new(e).context("failed to read snapshot stream"));
            }
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => line,
        };
        let permit = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => break Err(e.into()),
            },
        };

        let pipeline = pipeline.clone();
        let counters = counters.clone();
        tracker.spawn(async move {
            let result = pipeline.handle_line(&line, time::now()).await;
            counters.record(&result);
            drop(permit);
        });
    };

    tracker.close();
    if !tracker.is_empty() {
        info!(in_flight = tracker.len(), "draining in-flight snapshots");
    }
    tracker.wait().await;
    result
}

#[derive(Clone)]
struct IntakeState {
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    counters: Arc<IntakeCounters>,
}

pub fn router(
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    counters: Arc<IntakeCounters>,
) -> Router {
    Router::new()
        .route("/snapshots", post(post_snapshot))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(IntakeState {
            pipeline,
            permits,
            counters,
        })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn post_snapshot(State(state): State<IntakeState>, body: String) -> Response {
    let Ok(_permit) = state.permits.acquire().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let result = state.pipeline.handle_line(&body, time::now()).await;
    state.counters.record(&result);
    match result {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::Rejected(_) => StatusCode::BAD_REQUEST,
            PipelineError::UnresolvedGateway(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::LockTimeout(_)
            | PipelineError::Store(_)
            | PipelineError::KeysFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Serve the HTTP intake until `token` is cancelled; in-flight requests
/// complete first.
pub async fn serve_http(listener: TcpListener, app: Router, token: CancellationToken) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("http intake failed")
}

/// Cancel `token` on SIGINT or SIGTERM.
///
/// SIGTERM is registered before returning so a signal sent right after
/// startup is not lost to the default handler.
pub fn spawn_signal_handler(token: CancellationToken) {
    #[cfg(unix)]
    let sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            error!(error = %e, "failed to listen for SIGTERM");
            None
        }
    };

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        info!("shutdown signal received");
        token.cancel();
    });
}

/// Run the daemon intake until it is told to stop.
///
/// Without `listen`, stdin EOF ends intake. With it, stdin EOF only ends the
/// line source and the HTTP intake keeps running until `token` is cancelled.
pub async fn serve<R>(
    pipeline: Arc<Pipeline>,
    input: R,
    listen: Option<SocketAddr>,
    max_in_flight: usize,
    token: CancellationToken,
) -> Result<IntakeStats>
where
    R: BufRead + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let counters = Arc::new(IntakeCounters::default());

    let http = match listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(addr = %listener.local_addr()?, "http intake listening");
            let app = router(pipeline.clone(), permits.clone(), counters.clone());
            Some(tokio::spawn(serve_http(listener, app, token.clone())))
        }
        None => None,
    };

    let lines = spawn_line_reader(input);
    let stdin_result = run_lines(
        pipeline,
        lines,
        permits,
        counters.clone(),
        token.clone(),
    )
    .await;

    if let Some(http) = http {
        if stdin_result.is_ok() {
            token.cancelled().await;
        }
        token.cancel();
        http.await.context("http intake task panicked")??;
    }
    stdin_result?;

    let stats = counters.snapshot();
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        dropped = stats.dropped,
        failed = stats.failed,
        movements = stats.movements,
        "intake stopped"
    );
    Ok(stats)
}

/// Process NDJSON text sequentially, in line order.
pub async fn replay(pipeline: &Pipeline, text: &str, counters: &IntakeCounters) {
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let result = pipeline.handle_line(line, time::now()).await;
        counters.record(&result);
    }
}
