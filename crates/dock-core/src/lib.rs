//! Dock presence engine.
//!
//! Turns noisy RFID scan snapshots into debounced IN/OUT movements per
//! `(organization, tag, location)` and advances shipment items from those
//! movements. Hysteresis thresholds live in [`DebounceConfig`].
//!
//! Zero I/O: pure state transitions with no opinions about transport or persistence.

pub mod buffer;
pub mod config;
pub mod constants;
pub mod error;
pub mod movement;
pub mod shipment;
pub mod snapshot;
pub mod time;

pub use buffer::{
    BufferKey, BufferStatus, BufferSummary, PresenceBuffer, PresenceConflict, Transition,
};
pub use config::DebounceConfig;
pub use constants::{
    DEFAULT_QUERY_LIMIT, IN_COUNT_THRESHOLD, IN_TIME_WINDOW_SECS, OUT_MISS_THRESHOLD,
    OUT_TIMEOUT_SECS, PENDING_OUT_MISS_THRESHOLD, SIGNAL_HISTORY_LEN, SIGNAL_THRESHOLD_DBM,
};
pub use error::{CoreError, CoreResult};
pub use movement::{
    LocationSummary, MovementAction, MovementEvent, MovementRecord, NewMovement,
    OrganizationSummary, TagSummary,
};
pub use shipment::{
    ItemStatus, NewShipment, Shipment, ShipmentItem, ShipmentStats, ShipmentStatus,
    aggregate_status, code_sequence, shipment_code, shipment_code_prefix,
};
pub use snapshot::{
    GatewayMessage, GatewayPlacement, GatewayReport, InboundReading, Reading, ScanOrigin,
    ScanSnapshot, SourceKind, normalize_tag_id,
};
