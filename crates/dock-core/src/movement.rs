use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::PresenceBuffer;
use crate::error::{CoreError, CoreResult};
use crate::snapshot::SourceKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementAction {
    In,
    Out,
}

impl MovementAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementAction::In => "IN",
            MovementAction::Out => "OUT",
        }
    }
}

impl fmt::Display for MovementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MovementAction {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "IN" => Ok(MovementAction::In),
            "OUT" => Ok(MovementAction::Out),
            other => Err(CoreError::UnknownVariant {
                kind: "movement action",
                value: other.to_string(),
            }),
        }
    }
}

/// A confirmed transition, ready to be appended to the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub organization_id: String,
    pub tag_id: String,
    pub action: MovementAction,
    pub occurred_at: DateTime<Utc>,
    pub location_id: String,
    pub location_name: String,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub shipment_id: Option<Uuid>,
    pub note: Option<String>,
}

impl NewMovement {
    /// Build the ledger entry for a transition the buffer just took.
    pub fn from_buffer(
        buffer: &PresenceBuffer,
        action: MovementAction,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            organization_id: buffer.key.organization_id.clone(),
            tag_id: buffer.key.tag_id.clone(),
            action,
            occurred_at,
            location_id: buffer.key.location_id.clone(),
            location_name: buffer.location_name.clone(),
            source_id: buffer.source_id.clone(),
            source_kind: buffer.source_kind,
            shipment_id: None,
            note: None,
        }
    }

    pub fn into_record(self, id: Uuid) -> MovementRecord {
        MovementRecord {
            id,
            organization_id: self.organization_id,
            tag_id: self.tag_id,
            action: self.action,
            occurred_at: self.occurred_at,
            location_id: self.location_id,
            location_name: self.location_name,
            source_id: self.source_id,
            source_kind: self.source_kind,
            shipment_id: self.shipment_id,
            note: self.note,
        }
    }
}

/// An immutable ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementRecord {
    pub id: Uuid,
    pub organization_id: String,
    pub tag_id: String,
    pub action: MovementAction,
    pub occurred_at: DateTime<Utc>,
    pub location_id: String,
    pub location_name: String,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub shipment_id: Option<Uuid>,
    pub note: Option<String>,
}

impl MovementRecord {
    /// The business event handed to downstream consumers after the append.
    pub fn event(&self) -> MovementEvent {
        MovementEvent {
            organization_id: self.organization_id.clone(),
            tag_id: self.tag_id.clone(),
            action: self.action,
            location_id: self.location_id.clone(),
            occurred_at: self.occurred_at,
        }
    }
}

/// `(tagId, action, locationId, organizationId)` plus the time it happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementEvent {
    pub organization_id: String,
    pub tag_id: String,
    pub action: MovementAction,
    pub location_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSummary {
    pub total_in: u64,
    pub total_out: u64,
    pub currently_in: bool,
    pub last_movement: Option<MovementRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSummary {
    pub total_in: u64,
    pub total_out: u64,
    pub current_count: u64,
    pub today_in: u64,
    pub today_out: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSummary {
    pub total_movements: u64,
    pub total_in: u64,
    pub total_out: u64,
    pub today_count: u64,
}
