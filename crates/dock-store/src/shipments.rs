//! Shipment repository and the status propagation transaction.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use dock_core::{
    MovementEvent, NewShipment, Shipment, ShipmentItem, ShipmentStats, ShipmentStatus,
    code_sequence, shipment_code, shipment_code_prefix,
};

use crate::error::{Result, StoreError};
use crate::store::{Store, opt_time_col, parse_col, time_col, to_millis};

const SHIPMENT_COLUMNS: &str = "id, code, organization_id, origin_location_id, \
     destination_location_id, status, notes, created_at";

fn read_shipment(row: &Row<'_>) -> rusqlite::Result<Shipment> {
    Ok(Shipment {
        id: parse_col(row, 0)?,
        code: row.get(1)?,
        organization_id: row.get(2)?,
        origin_location_id: row.get(3)?,
        destination_location_id: row.get(4)?,
        status: parse_col(row, 5)?,
        notes: row.get(6)?,
        created_at: time_col(row, 7)?,
        items: Vec::new(),
    })
}

fn read_item(row: &Row<'_>) -> rusqlite::Result<ShipmentItem> {
    Ok(ShipmentItem {
        id: parse_col(row, 0)?,
        shipment_id: parse_col(row, 1)?,
        tag_id: row.get(2)?,
        status: parse_col(row, 3)?,
        exited_at: opt_time_col(row, 4)?,
        arrived_at: opt_time_col(row, 5)?,
    })
}

fn load_items(conn: &Connection, shipment_id: Uuid) -> Result<Vec<ShipmentItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, shipment_id, tag_id, status, exited_at, arrived_at
         FROM shipment_items WHERE shipment_id = ?1 ORDER BY rowid",
    )?;
    let items = stmt
        .query_map([shipment_id.to_string()], read_item)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

fn load_where(conn: &Connection, clause: &str, args: impl rusqlite::Params) -> Result<Vec<Shipment>> {
    let sql = format!("SELECT {SHIPMENT_COLUMNS} FROM shipments {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let mut shipments = stmt
        .query_map(args, read_shipment)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for shipment in &mut shipments {
        shipment.items = load_items(conn, shipment.id)?;
    }
    Ok(shipments)
}

fn load_one(conn: &Connection, id: Uuid) -> Result<Option<Shipment>> {
    Ok(load_where(conn, "WHERE id = ?1", [id.to_string()])?.into_iter().next())
}

fn next_code(conn: &Connection, now: DateTime<Utc>) -> Result<String> {
    let date = now.date_naive();
    let prefix = shipment_code_prefix(date);
    let last: Option<String> = conn
        .query_row(
            "SELECT code FROM shipments WHERE code LIKE ?1 ORDER BY code DESC LIMIT 1",
            [format!("{prefix}%")],
            |row| row.get(0),
        )
        .optional()?;
    let sequence = last.as_deref().and_then(code_sequence).unwrap_or(0) + 1;
    Ok(shipment_code(date, sequence))
}

fn save_status(conn: &Connection, shipment: &Shipment, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE shipments SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![shipment.status.as_str(), to_millis(now), shipment.id.to_string()],
    )?;
    Ok(())
}

impl Store {
    /// Validate and store a new shipment with every item `PENDING`.
    pub fn create_shipment(&self, new: NewShipment, now: DateTime<Utc>) -> Result<Shipment> {
        let new = new.validate()?;
        let shipment = self.write(|tx| {
            let shipment = new.into_shipment(next_code(tx, now)?, now);
            tx.execute(
                &format!(
                    "INSERT INTO shipments ({SHIPMENT_COLUMNS}, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)"
                ),
                params![
                    shipment.id.to_string(),
                    shipment.code,
                    shipment.organization_id,
                    shipment.origin_location_id,
                    shipment.destination_location_id,
                    shipment.status.as_str(),
                    shipment.notes,
                    to_millis(shipment.created_at),
                ],
            )?;
            for item in &shipment.items {
                tx.execute(
                    "INSERT INTO shipment_items (id, shipment_id, tag_id, status)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        item.id.to_string(),
                        item.shipment_id.to_string(),
                        item.tag_id,
                        item.status.as_str(),
                    ],
                )?;
            }
            Ok(shipment)
        })?;
        info!(code = %shipment.code, items = shipment.items.len(), "shipment created");
        Ok(shipment)
    }

    pub fn get_shipment(&self, id: Uuid) -> Result<Option<Shipment>> {
        self.with_conn(|conn| load_one(conn, id))
    }

    pub fn get_shipment_by_code(&self, code: &str) -> Result<Option<Shipment>> {
        self.with_conn(|conn| Ok(load_where(conn, "WHERE code = ?1", [code])?.into_iter().next()))
    }

    /// Newest first, optionally restricted to one aggregate status.
    pub fn list_shipments(
        &self,
        organization_id: &str,
        status: Option<ShipmentStatus>,
    ) -> Result<Vec<Shipment>> {
        self.with_conn(|conn| {
            load_where(
                conn,
                "WHERE organization_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, code DESC",
                params![organization_id, status.map(|s| s.as_str())],
            )
        })
    }

    /// Shipments carrying a tag, in any status.
    pub fn shipments_for_tag(&self, organization_id: &str, tag_id: &str) -> Result<Vec<Shipment>> {
        self.with_conn(|conn| {
            load_where(
                conn,
                "WHERE organization_id = ?1
                   AND id IN (SELECT shipment_id FROM shipment_items WHERE tag_id = ?2)
                 ORDER BY created_at DESC, code DESC",
                params![organization_id, tag_id],
            )
        })
    }

    /// Administrative cancel. A delivered shipment cannot be cancelled;
    /// cancelling twice is a no-op.
    pub fn cancel_shipment(&self, id: Uuid, now: DateTime<Utc>) -> Result<Shipment> {
        self.write(|tx| {
            let mut shipment =
                load_one(tx, id)?.ok_or_else(|| StoreError::NotFound(format!("shipment {id}")))?;
            match shipment.status {
                ShipmentStatus::Cancelled => return Ok(shipment),
                ShipmentStatus::Delivered => {
                    return Err(StoreError::Conflict(format!(
                        "shipment {} is already delivered",
                        shipment.code
                    )));
                }
                _ => {}
            }
            shipment.status = ShipmentStatus::Cancelled;
            save_status(tx, &shipment, now)?;
            info!(code = %shipment.code, "shipment cancelled");
            Ok(shipment)
        })
    }

    pub fn shipment_stats(&self, organization_id: &str) -> Result<ShipmentStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM shipments WHERE organization_id = ?1 GROUP BY status",
            )?;
            let rows = stmt.query_map([organization_id], |row| {
                Ok((parse_col::<ShipmentStatus>(row, 0)?, row.get::<_, i64>(1)?))
            })?;
            let mut stats = ShipmentStats::default();
            for row in rows {
                let (status, count) = row?;
                stats.add(status, count as u64);
            }
            Ok(stats)
        })
    }

    /// Shipment Status Propagator.
    ///
    /// Applies one confirmed movement to every active shipment in the
    /// event's organization that carries the tag in a non-delivered item.
    /// Runs as a single write transaction, so events touching the same
    /// shipment apply one after another. Returns the shipments that changed.
    pub fn propagate_movement(&self, event: &MovementEvent) -> Result<Vec<Shipment>> {
        let now = event.occurred_at;
        self.write(|tx| {
            let candidates = load_where(
                tx,
                "WHERE organization_id = ?1
                   AND status NOT IN ('DELIVERED', 'CANCELLED')
                   AND id IN (SELECT shipment_id FROM shipment_items
                              WHERE tag_id = ?2 AND status != 'DELIVERED')",
                params![event.organization_id, event.tag_id],
            )?;

            let mut changed = Vec::new();
            for mut shipment in candidates {
                let touched = shipment.apply_movement(event);
                if touched.is_empty() {
                    continue;
                }
                for item in shipment.items.iter().filter(|i| touched.contains(&i.id)) {
                    tx.execute(
                        "UPDATE shipment_items SET status = ?1, exited_at = ?2, arrived_at = ?3
                         WHERE id = ?4",
                        params![
                            item.status.as_str(),
                            item.exited_at.map(to_millis),
                            item.arrived_at.map(to_millis),
                            item.id.to_string(),
                        ],
                    )?;
                }
                save_status(tx, &shipment, now)?;
                info!(
                    code = %shipment.code,
                    tag = %event.tag_id,
                    action = %event.action,
                    status = %shipment.status,
                    "shipment updated"
                );
                changed.push(shipment);
            }
            if changed.is_empty() {
                debug!(tag = %event.tag_id, action = %event.action, "no shipment affected");
            }
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::time::from_epoch_secs;
    use dock_core::{ItemStatus, MovementAction};

    const DAY: i64 = 1_771_632_000;

    fn at(secs: i64) -> DateTime<Utc> {
        from_epoch_secs(DAY + secs).unwrap()
    }

    fn new_shipment(tags: &[&str]) -> NewShipment {
        NewShipment {
            organization_id: "org-1".into(),
            origin_location_id: "L1".into(),
            destination_location_id: "L2".into(),
            tag_ids: tags.iter().map(|t| t.to_string()).collect(),
            notes: Some("fragile".into()),
        }
    }

    fn event(tag: &str, action: MovementAction, location: &str, secs: i64) -> MovementEvent {
        MovementEvent {
            organization_id: "org-1".into(),
            tag_id: tag.into(),
            action,
            location_id: location.into(),
            occurred_at: at(secs),
        }
    }

    #[test]
    fn test_create_assigns_daily_codes() {
        let store = Store::open_in_memory().unwrap();
        let first = store.create_shipment(new_shipment(&["A1"]), at(10)).unwrap();
        let second = store.create_shipment(new_shipment(&["B2"]), at(20)).unwrap();
        let next_day = store
            .create_shipment(new_shipment(&["C3"]), at(86_400 + 5))
            .unwrap();
        assert_eq!(first.code, "SHP-20260221-0001");
        assert_eq!(second.code, "SHP-20260221-0002");
        assert_eq!(next_day.code, "SHP-20260222-0001");
    }

    #[test]
    fn test_create_rejects_invalid() {
        let store = Store::open_in_memory().unwrap();
        let mut same = new_shipment(&["A1"]);
        same.destination_location_id = "L1".into();
        assert!(matches!(
            store.create_shipment(same, at(0)),
            Err(StoreError::Domain(_))
        ));
        assert!(store.create_shipment(new_shipment(&[]), at(0)).is_err());
        assert!(store.list_shipments("org-1", None).unwrap().is_empty());
    }

    #[test]
    fn test_get_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let created = store
            .create_shipment(new_shipment(&["a1", "B2", "A1"]), at(0))
            .unwrap();
        assert_eq!(created.items.len(), 2);
        let loaded = store.get_shipment(created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
        let by_code = store.get_shipment_by_code(&created.code).unwrap().unwrap();
        assert_eq!(by_code.id, created.id);
        assert!(store.get_shipment(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_propagation_end_to_end() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_shipment(new_shipment(&["A1", "B2"]), at(0)).unwrap();

        let changed = store
            .propagate_movement(&event("A1", MovementAction::Out, "L1", 100))
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, ShipmentStatus::InTransit);

        // Replay is a no-op.
        assert!(
            store
                .propagate_movement(&event("A1", MovementAction::Out, "L1", 150))
                .unwrap()
                .is_empty()
        );

        store
            .propagate_movement(&event("A1", MovementAction::In, "L2", 200))
            .unwrap();
        let loaded = store.get_shipment(s.id).unwrap().unwrap();
        let a1 = loaded.item_for_tag("A1").unwrap();
        assert_eq!(a1.status, ItemStatus::Delivered);
        assert_eq!(a1.exited_at, Some(at(100)));
        assert_eq!(a1.arrived_at, Some(at(200)));
        assert_eq!(loaded.status, ShipmentStatus::Partial);

        store
            .propagate_movement(&event("B2", MovementAction::In, "L2", 300))
            .unwrap();
        let done = store.get_shipment(s.id).unwrap().unwrap();
        assert_eq!(done.status, ShipmentStatus::Delivered);
    }

    #[test]
    fn test_propagation_ignores_other_org_and_hubs() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_shipment(new_shipment(&["A1"]), at(0)).unwrap();
        let mut foreign = event("A1", MovementAction::Out, "L1", 10);
        foreign.organization_id = "org-2".into();
        assert!(store.propagate_movement(&foreign).unwrap().is_empty());
        assert!(
            store
                .propagate_movement(&event("A1", MovementAction::In, "HUB", 20))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store.get_shipment(s.id).unwrap().unwrap().status,
            ShipmentStatus::Pending
        );
    }

    #[test]
    fn test_cancel() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_shipment(new_shipment(&["A1"]), at(0)).unwrap();
        let cancelled = store.cancel_shipment(s.id, at(5)).unwrap();
        assert_eq!(cancelled.status, ShipmentStatus::Cancelled);
        assert_eq!(store.cancel_shipment(s.id, at(6)).unwrap().status, ShipmentStatus::Cancelled);

        // Cancelled shipments no longer follow movements.
        assert!(
            store
                .propagate_movement(&event("A1", MovementAction::Out, "L1", 10))
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            store.cancel_shipment(Uuid::new_v4(), at(7)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_cannot_cancel_delivered() {
        let store = Store::open_in_memory().unwrap();
        let s = store.create_shipment(new_shipment(&["A1"]), at(0)).unwrap();
        store
            .propagate_movement(&event("A1", MovementAction::In, "L2", 10))
            .unwrap();
        assert!(matches!(
            store.cancel_shipment(s.id, at(20)),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_list_for_tag_and_stats() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_shipment(new_shipment(&["A1"]), at(0)).unwrap();
        store.create_shipment(new_shipment(&["A1", "B2"]), at(1)).unwrap();
        store.create_shipment(new_shipment(&["C3"]), at(2)).unwrap();
        store.cancel_shipment(a.id, at(3)).unwrap();

        assert_eq!(store.shipments_for_tag("org-1", "A1").unwrap().len(), 2);
        let pending = store
            .list_shipments("org-1", Some(ShipmentStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].code, "SHP-20260221-0003");

        let stats = store.shipment_stats("org-1").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.cancelled, 1);
    }
}
