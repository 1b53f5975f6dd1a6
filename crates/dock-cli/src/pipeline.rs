//! Snapshot processing: debounce engine → ledger → shipment propagation.
//!
//! Each buffer update holds that key's lock and runs as one store
//! transaction that also appends any confirmed movement. Movements are then
//! handed to the shipment propagator one at a time, in the order they were
//! confirmed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use dock_core::{
    BufferKey, BufferStatus, CoreError, DebounceConfig, GatewayMessage, GatewayPlacement,
    MovementAction, MovementRecord, ScanSnapshot,
};
use dock_store::{BufferUpdate, Store, StoreError};

use crate::config::{Config, PipelineConfig};
use crate::locks::KeyLocks;
use crate::retry::RetryPolicy;

/// Idle lock entries are pruned once the map grows past this.
const LOCK_PRUNE_THRESHOLD: usize = 4_096;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("rejected: {0}")]
    Rejected(#[from] CoreError),

    #[error("gateway {0} is not registered")]
    UnresolvedGateway(String),

    #[error("timed out waiting for buffer {0}")]
    LockTimeout(BufferKey),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Some keys could not be updated; every other key of the snapshot was.
    #[error("snapshot partially applied; failed buffers: {}", join_keys(.failed))]
    KeysFailed {
        failed: Vec<BufferKey>,
        outcome: Box<SnapshotOutcome>,
    },
}

fn join_keys(keys: &[BufferKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    fn is_retryable(&self) -> bool {
        match self {
            PipelineError::LockTimeout(_) => true,
            PipelineError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// What one snapshot did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOutcome {
    pub sightings: usize,
    pub misses: usize,
    pub movements: Vec<MovementRecord>,
    pub shipments_updated: usize,
}

pub struct Pipeline {
    store: Arc<Store>,
    debounce: DebounceConfig,
    config: PipelineConfig,
    locks: KeyLocks<BufferKey>,
}

impl Pipeline {
    pub fn new(store: Arc<Store>, config: &Config) -> Self {
        Self {
            store,
            debounce: config.debounce.clone(),
            config: config.pipeline.clone(),
            locks: KeyLocks::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Parse, validate, resolve and process one NDJSON line.
    pub async fn handle_line(
        &self,
        line: &str,
        received_at: DateTime<Utc>,
    ) -> PipelineResult<SnapshotOutcome> {
        let message = GatewayMessage::parse(line)?;
        self.handle_message(message, received_at).await
    }

    pub async fn handle_message(
        &self,
        message: GatewayMessage,
        received_at: DateTime<Utc>,
    ) -> PipelineResult<SnapshotOutcome> {
        let report = message.validate(received_at)?;
        let placement = self.resolve_gateway(&report.gateway_id).await?;
        let snapshot = report.into_snapshot(&placement);
        self.process_snapshot(&snapshot).await
    }

    /// Resolve a gateway to its location, retrying a bounded number of times
    /// so a registration racing its first snapshot is not lost.
    async fn resolve_gateway(&self, gateway_id: &str) -> PipelineResult<GatewayPlacement> {
        let policy = RetryPolicy::for_resolution(&self.config);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.resolve_gateway(gateway_id) {
                Ok(Some(placement)) => return Ok(placement),
                Ok(None) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e.into()),
            }
            if !policy.allows(attempt) {
                warn!(
                    gateway = gateway_id,
                    attempts = attempt,
                    "dropping snapshot from unregistered gateway"
                );
                return Err(PipelineError::UnresolvedGateway(gateway_id.to_string()));
            }
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    /// Run the seen pass and the missed pass for one resolved snapshot.
    #[instrument(
        skip_all,
        fields(
            gateway = %snapshot.origin.source_id,
            location = %snapshot.origin.location_id,
            readings = snapshot.readings.len()
        )
    )]
    pub async fn process_snapshot(&self, snapshot: &ScanSnapshot) -> PipelineResult<SnapshotOutcome> {
        let origin = &snapshot.origin;
        let mut outcome = SnapshotOutcome::default();
        let mut failed = Vec::new();

        for reading in &snapshot.readings {
            let key = BufferKey::new(&origin.organization_id, &reading.tag_id, &origin.location_id);
            let result = self
                .update_locked(&key, || {
                    self.store.update_buffer(&key, Some(origin), |buffer| {
                        buffer.observe_sighting(reading, origin, &self.debounce)
                    })
                })
                .await;
            match result {
                Ok(update) => {
                    outcome.sightings += 1;
                    self.after_update(update, &mut outcome).await;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "sighting not applied");
                    failed.push(key);
                }
            }
        }

        let active = self.store.list_buffers_by_location(
            &origin.organization_id,
            &origin.location_id,
            &BufferStatus::ACTIVE,
        )?;
        for buffer in active
            .into_iter()
            .filter(|b| !snapshot.contains_tag(&b.key.tag_id))
        {
            let key = buffer.key;
            let result = self
                .update_locked(&key, || {
                    // Status is re-read under the lock; observe_miss ignores
                    // buffers that reached CONFIRMED_OUT in the meantime.
                    self.store.update_buffer(&key, None, |buffer| {
                        buffer.observe_miss(origin.captured_at, &self.debounce)
                    })
                })
                .await;
            match result {
                Ok(update) => {
                    outcome.misses += 1;
                    self.after_update(update, &mut outcome).await;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "miss not applied");
                    failed.push(key);
                }
            }
        }

        if self.locks.len() > LOCK_PRUNE_THRESHOLD {
            self.locks.prune();
        }
        debug!(
            sightings = outcome.sightings,
            misses = outcome.misses,
            movements = outcome.movements.len(),
            failed = failed.len(),
            "snapshot processed"
        );
        if failed.is_empty() {
            Ok(outcome)
        } else {
            Err(PipelineError::KeysFailed {
                failed,
                outcome: Box::new(outcome),
            })
        }
    }

    /// Run `op` while holding `key`, retrying lock timeouts and busy-database
    /// errors with backoff.
    async fn update_locked<T>(
        &self,
        key: &BufferKey,
        op: impl Fn() -> Result<T, StoreError>,
    ) -> PipelineResult<T> {
        let policy = RetryPolicy::for_updates(&self.config);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.locks.acquire(key, self.config.lock_timeout()).await {
                Some(_guard) => op().map_err(PipelineError::from),
                None => Err(PipelineError::LockTimeout(key.clone())),
            };
            match result {
                Err(e) if e.is_retryable() && policy.allows(attempt) => {
                    warn!(key = %key, attempt, error = %e, "retrying buffer update");
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn after_update(&self, update: Option<BufferUpdate>, outcome: &mut SnapshotOutcome) {
        let Some(movement) = update.and_then(|u| u.movement) else {
            return;
        };
        if movement.action == MovementAction::In {
            self.flag_multi_location(&movement);
        }
        outcome.shipments_updated += self.propagate(&movement).await;
        outcome.movements.push(movement);
    }

    /// Overlapping coverage can leave a tag present at two locations. That
    /// is reported, never resolved.
    fn flag_multi_location(&self, movement: &MovementRecord) {
        match self
            .store
            .list_buffers_by_tag(&movement.organization_id, &movement.tag_id)
        {
            Ok(buffers) => {
                let present: Vec<&str> = buffers
                    .iter()
                    .filter(|b| b.is_present())
                    .map(|b| b.key.location_id.as_str())
                    .collect();
                if present.len() > 1 {
                    warn!(
                        tag = %movement.tag_id,
                        locations = ?present,
                        "tag present at multiple locations"
                    );
                }
            }
            Err(e) => debug!(error = %e, "multi-location check skipped"),
        }
    }

    /// Hand a confirmed movement to the shipment propagator. The movement is
    /// already durable, so a failure here is logged and contained.
    async fn propagate(&self, movement: &MovementRecord) -> usize {
        let event = movement.event();
        let policy = RetryPolicy::for_updates(&self.config);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.propagate_movement(&event) {
                Ok(changed) => {
                    for shipment in &changed {
                        info!(code = %shipment.code, status = %shipment.status, "shipment advanced");
                    }
                    return changed.len();
                }
                Err(e) if e.is_transient() && policy.allows(attempt) => {
                    warn!(attempt, error = %e, "retrying shipment propagation");
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(e) => {
                    error!(
                        movement = %movement.id,
                        tag = %movement.tag_id,
                        error = %e,
                        "shipment propagation failed"
                    );
                    return 0;
                }
            }
        }
    }
}
