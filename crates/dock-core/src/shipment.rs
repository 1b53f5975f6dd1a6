//! Shipment lifecycle driven by confirmed movements.
//!
//! Items only move forward (`PENDING → IN_TRANSIT → DELIVERED`). The
//! aggregate status is a pure function of the item statuses, except for
//! `CANCELLED`, which is set administratively and freezes recomputation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::movement::{MovementAction, MovementEvent};
use crate::snapshot::normalize_tag_id;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    InTransit,
    Delivered,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 3] = [ItemStatus::Pending, ItemStatus::InTransit, ItemStatus::Delivered];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::InTransit => "IN_TRANSIT",
            ItemStatus::Delivered => "DELIVERED",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "item status",
                value: s.to_string(),
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipmentStatus {
    Pending,
    InTransit,
    Partial,
    Delivered,
    Cancelled,
}

impl ShipmentStatus {
    pub const ALL: [ShipmentStatus; 5] = [
        ShipmentStatus::Pending,
        ShipmentStatus::InTransit,
        ShipmentStatus::Partial,
        ShipmentStatus::Delivered,
        ShipmentStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "PENDING",
            ShipmentStatus::InTransit => "IN_TRANSIT",
            ShipmentStatus::Partial => "PARTIAL",
            ShipmentStatus::Delivered => "DELIVERED",
            ShipmentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Movements still affect shipments in this status.
    pub fn accepts_movements(self) -> bool {
        !matches!(self, ShipmentStatus::Delivered | ShipmentStatus::Cancelled)
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        ShipmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "shipment status",
                value: s.to_string(),
            })
    }
}

/// Aggregate status derived from item statuses. `None` for an empty shipment.
pub fn aggregate_status<I>(items: I) -> Option<ShipmentStatus>
where
    I: IntoIterator<Item = ItemStatus>,
{
    let (mut total, mut pending, mut delivered) = (0usize, 0usize, 0usize);
    for status in items {
        total += 1;
        match status {
            ItemStatus::Pending => pending += 1,
            ItemStatus::Delivered => delivered += 1,
            ItemStatus::InTransit => {}
        }
    }

    if total == 0 {
        None
    } else if pending == total {
        Some(ShipmentStatus::Pending)
    } else if delivered == total {
        Some(ShipmentStatus::Delivered)
    } else if delivered > 0 {
        Some(ShipmentStatus::Partial)
    } else {
        Some(ShipmentStatus::InTransit)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentItem {
    pub id: Uuid,
    pub shipment_id: Uuid,
    pub tag_id: String,
    pub status: ItemStatus,
    pub exited_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
}

impl ShipmentItem {
    pub fn new(shipment_id: Uuid, tag_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shipment_id,
            tag_id: tag_id.into(),
            status: ItemStatus::Pending,
            exited_at: None,
            arrived_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipment {
    pub id: Uuid,
    pub code: String,
    pub organization_id: String,
    pub origin_location_id: String,
    pub destination_location_id: String,
    pub status: ShipmentStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ShipmentItem>,
}

impl Shipment {
    /// Apply a confirmed movement to every matching item.
    ///
    /// Only `OUT` at the origin (from `PENDING`) and `IN` at the destination
    /// (from anything but `DELIVERED`) change an item; every other
    /// combination is a no-op. Returns the ids of the items that changed;
    /// the aggregate is recomputed when any did.
    pub fn apply_movement(&mut self, event: &MovementEvent) -> Vec<Uuid> {
        if !self.status.accepts_movements() || event.organization_id != self.organization_id {
            return Vec::new();
        }

        let mut changed = Vec::new();
        for item in self.items.iter_mut().filter(|i| i.tag_id == event.tag_id) {
            match event.action {
                MovementAction::Out
                    if event.location_id == self.origin_location_id
                        && item.status == ItemStatus::Pending =>
                {
                    item.status = ItemStatus::InTransit;
                    item.exited_at = Some(event.occurred_at);
                    changed.push(item.id);
                }
                MovementAction::In
                    if event.location_id == self.destination_location_id
                        && item.status != ItemStatus::Delivered =>
                {
                    item.status = ItemStatus::Delivered;
                    item.arrived_at = Some(event.occurred_at);
                    changed.push(item.id);
                }
                _ => {}
            }
        }

        if !changed.is_empty() {
            self.recompute_status();
        }
        changed
    }

    /// Recompute the aggregate from the items. Returns whether it changed.
    pub fn recompute_status(&mut self) -> bool {
        if self.status == ShipmentStatus::Cancelled {
            return false;
        }
        match aggregate_status(self.items.iter().map(|i| i.status)) {
            Some(next) if next != self.status => {
                self.status = next;
                true
            }
            _ => false,
        }
    }

    pub fn item_for_tag(&self, tag_id: &str) -> Option<&ShipmentItem> {
        self.items.iter().find(|i| i.tag_id == tag_id)
    }
}

/// A shipment definition before it is stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewShipment {
    pub organization_id: String,
    pub origin_location_id: String,
    pub destination_location_id: String,
    pub tag_ids: Vec<String>,
    pub notes: Option<String>,
}

impl NewShipment {
    /// Validate and normalize: distinct endpoints, at least one tag,
    /// tag ids normalized and de-duplicated (first occurrence wins).
    pub fn validate(mut self) -> CoreResult<Self> {
        if self.origin_location_id.trim().is_empty()
            || self.destination_location_id.trim().is_empty()
        {
            return Err(CoreError::InvalidShipment(
                "origin and destination are required".to_string(),
            ));
        }
        if self.origin_location_id == self.destination_location_id {
            return Err(CoreError::InvalidShipment(
                "origin and destination must differ".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        self.tag_ids = self
            .tag_ids
            .iter()
            .map(|t| normalize_tag_id(t))
            .filter(|t| !t.is_empty() && seen.insert(t.clone()))
            .collect();
        if self.tag_ids.is_empty() {
            return Err(CoreError::InvalidShipment(
                "a shipment needs at least one tag".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn into_shipment(self, code: String, created_at: DateTime<Utc>) -> Shipment {
        let id = Uuid::new_v4();
        let items = self
            .tag_ids
            .into_iter()
            .map(|tag| ShipmentItem::new(id, tag))
            .collect();
        Shipment {
            id,
            code,
            organization_id: self.organization_id,
            origin_location_id: self.origin_location_id,
            destination_location_id: self.destination_location_id,
            status: ShipmentStatus::Pending,
            notes: self.notes,
            created_at,
            items,
        }
    }
}

/// Code prefix shared by every shipment created on `date`.
pub fn shipment_code_prefix(date: NaiveDate) -> String {
    format!("SHP-{}-", date.format("%Y%m%d"))
}

/// `SHP-YYYYMMDD-NNNN`
pub fn shipment_code(date: NaiveDate, sequence: u32) -> String {
    format!("{}{sequence:04}", shipment_code_prefix(date))
}

/// The per-day sequence number of a shipment code.
pub fn code_sequence(code: &str) -> Option<u32> {
    code.rsplit('-').next()?.parse().ok()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentStats {
    pub total: u64,
    pub pending: u64,
    pub in_transit: u64,
    pub partial: u64,
    pub delivered: u64,
    pub cancelled: u64,
}

impl ShipmentStats {
    pub fn add(&mut self, status: ShipmentStatus, count: u64) {
        self.total += count;
        match status {
            ShipmentStatus::Pending => self.pending += count,
            ShipmentStatus::InTransit => self.in_transit += count,
            ShipmentStatus::Partial => self.partial += count,
            ShipmentStatus::Delivered => self.delivered += count,
            ShipmentStatus::Cancelled => self.cancelled += count,
        }
    }
}
