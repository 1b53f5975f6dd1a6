//! Movement Ledger: append-only confirmed transitions and the reads derived
//! from them. Nothing here is authoritative beyond the rows themselves;
//! "where is this tag now" is recomputed from the latest movement.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

use dock_core::time::start_of_day;
use dock_core::{
    LocationSummary, MovementAction, MovementRecord, NewMovement, OrganizationSummary, TagSummary,
};

use crate::error::Result;
use crate::store::{Store, opt_parse_col, parse_col, time_col, to_millis};

const MOVEMENT_COLUMNS: &str = "id, organization_id, tag_id, action, occurred_at, location_id, \
     location_name, source_id, source_kind, shipment_id, note";

/// Newest first; ties broken by append order.
const NEWEST_FIRST: &str = "ORDER BY occurred_at DESC, seq DESC";

fn read_movement(row: &Row<'_>) -> rusqlite::Result<MovementRecord> {
    Ok(MovementRecord {
        id: parse_col(row, 0)?,
        organization_id: row.get(1)?,
        tag_id: row.get(2)?,
        action: parse_col(row, 3)?,
        occurred_at: time_col(row, 4)?,
        location_id: row.get(5)?,
        location_name: row.get(6)?,
        source_id: row.get(7)?,
        source_kind: parse_col(row, 8)?,
        shipment_id: opt_parse_col(row, 9)?,
        note: row.get(10)?,
    })
}

/// Append one movement on an open connection or transaction.
pub(crate) fn insert_movement(conn: &Connection, movement: NewMovement) -> Result<MovementRecord> {
    let record = movement.into_record(Uuid::new_v4());
    conn.execute(
        &format!(
            "INSERT INTO movements ({MOVEMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            record.id.to_string(),
            record.organization_id,
            record.tag_id,
            record.action.as_str(),
            to_millis(record.occurred_at),
            record.location_id,
            record.location_name,
            record.source_id,
            record.source_kind.as_str(),
            record.shipment_id.map(|id| id.to_string()),
            record.note,
        ],
    )?;
    info!(
        org = %record.organization_id,
        tag = %record.tag_id,
        action = %record.action,
        location = %record.location_id,
        "movement recorded"
    );
    Ok(record)
}

fn query_movements(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<MovementRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, read_movement)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn count(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<u64> {
    let n: i64 = conn.query_row(sql, args, |row| row.get(0))?;
    Ok(n as u64)
}

impl Store {
    /// Append a movement outside the debounce path (imports, corrections).
    pub fn append_movement(&self, movement: NewMovement) -> Result<MovementRecord> {
        self.write(|tx| insert_movement(tx, movement))
    }

    pub fn recent_movements(&self, organization_id: &str, limit: usize) -> Result<Vec<MovementRecord>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements
             WHERE organization_id = ?1 {NEWEST_FIRST} LIMIT ?2"
        );
        self.with_conn(|conn| query_movements(conn, &sql, params![organization_id, limit as i64]))
    }

    pub fn movements_by_tag(
        &self,
        organization_id: &str,
        tag_id: &str,
        limit: usize,
    ) -> Result<Vec<MovementRecord>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements
             WHERE organization_id = ?1 AND tag_id = ?2 {NEWEST_FIRST} LIMIT ?3"
        );
        self.with_conn(|conn| {
            query_movements(conn, &sql, params![organization_id, tag_id, limit as i64])
        })
    }

    pub fn movements_by_location(
        &self,
        organization_id: &str,
        location_id: &str,
        limit: usize,
    ) -> Result<Vec<MovementRecord>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements
             WHERE organization_id = ?1 AND location_id = ?2 {NEWEST_FIRST} LIMIT ?3"
        );
        self.with_conn(|conn| {
            query_movements(conn, &sql, params![organization_id, location_id, limit as i64])
        })
    }

    /// The latest movement for a tag. When it is an `IN`, its location is
    /// the tag's current known location.
    pub fn last_movement_for_tag(
        &self,
        organization_id: &str,
        tag_id: &str,
    ) -> Result<Option<MovementRecord>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements
             WHERE organization_id = ?1 AND tag_id = ?2 {NEWEST_FIRST} LIMIT 1"
        );
        self.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, params![organization_id, tag_id], read_movement)
                .optional()?)
        })
    }

    /// Tags whose latest movement anywhere is an `IN` at this location,
    /// as that `IN` record, ordered by tag.
    pub fn tags_currently_at(
        &self,
        organization_id: &str,
        location_id: &str,
    ) -> Result<Vec<MovementRecord>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM (
                 SELECT *, ROW_NUMBER() OVER (
                     PARTITION BY tag_id ORDER BY occurred_at DESC, seq DESC
                 ) AS rn
                 FROM movements WHERE organization_id = ?1
             )
             WHERE rn = 1 AND action = 'IN' AND location_id = ?2
             ORDER BY tag_id"
        );
        self.with_conn(|conn| query_movements(conn, &sql, params![organization_id, location_id]))
    }

    /// Movements with `start <= occurred_at <= end`, optionally at one location.
    pub fn movements_in_range(
        &self,
        organization_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        location_id: Option<&str>,
    ) -> Result<Vec<MovementRecord>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements
             WHERE organization_id = ?1 AND occurred_at >= ?2 AND occurred_at <= ?3
               AND (?4 IS NULL OR location_id = ?4)
             {NEWEST_FIRST}"
        );
        self.with_conn(|conn| {
            query_movements(
                conn,
                &sql,
                params![organization_id, to_millis(start), to_millis(end), location_id],
            )
        })
    }

    pub fn tag_summary(&self, organization_id: &str, tag_id: &str) -> Result<TagSummary> {
        let (total_in, total_out) = self.with_conn(|conn| {
            let sql = "SELECT COUNT(*) FROM movements
                       WHERE organization_id = ?1 AND tag_id = ?2 AND action = ?3";
            Ok((
                count(conn, sql, params![organization_id, tag_id, MovementAction::In.as_str()])?,
                count(conn, sql, params![organization_id, tag_id, MovementAction::Out.as_str()])?,
            ))
        })?;
        let last_movement = self.last_movement_for_tag(organization_id, tag_id)?;
        Ok(TagSummary {
            total_in,
            total_out,
            currently_in: last_movement
                .as_ref()
                .is_some_and(|m| m.action == MovementAction::In),
            last_movement,
        })
    }

    /// Counts at a location; "today" is the UTC day containing `now`.
    pub fn location_summary(
        &self,
        organization_id: &str,
        location_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LocationSummary> {
        let today = to_millis(start_of_day(now));
        let (total_in, total_out, today_in, today_out) = self.with_conn(|conn| {
            let sql = "SELECT COUNT(*) FROM movements
                       WHERE organization_id = ?1 AND location_id = ?2 AND action = ?3
                         AND occurred_at >= ?4";
            let tally = |action: MovementAction, since: i64| {
                count(conn, sql, params![organization_id, location_id, action.as_str(), since])
            };
            Ok((
                tally(MovementAction::In, i64::MIN)?,
                tally(MovementAction::Out, i64::MIN)?,
                tally(MovementAction::In, today)?,
                tally(MovementAction::Out, today)?,
            ))
        })?;
        let current_count = self.tags_currently_at(organization_id, location_id)?.len() as u64;
        Ok(LocationSummary {
            total_in,
            total_out,
            current_count,
            today_in,
            today_out,
        })
    }

    pub fn organization_summary(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OrganizationSummary> {
        let today = to_millis(start_of_day(now));
        self.with_conn(|conn| {
            let by_action = "SELECT COUNT(*) FROM movements WHERE organization_id = ?1 AND action = ?2";
            Ok(OrganizationSummary {
                total_movements: count(
                    conn,
                    "SELECT COUNT(*) FROM movements WHERE organization_id = ?1",
                    [organization_id],
                )?,
                total_in: count(conn, by_action, params![organization_id, "IN"])?,
                total_out: count(conn, by_action, params![organization_id, "OUT"])?,
                today_count: count(
                    conn,
                    "SELECT COUNT(*) FROM movements WHERE organization_id = ?1 AND occurred_at >= ?2",
                    params![organization_id, today],
                )?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::SourceKind;
    use dock_core::time::from_epoch_secs;

    const DAY: i64 = 1_771_632_000; // 2026-02-21T00:00:00Z

    fn movement(tag: &str, action: MovementAction, location: &str, secs: i64) -> NewMovement {
        NewMovement {
            organization_id: "org-1".into(),
            tag_id: tag.into(),
            action,
            occurred_at: from_epoch_secs(DAY + secs).unwrap(),
            location_id: location.into(),
            location_name: format!("Dock {location}"),
            source_id: "GW1".into(),
            source_kind: SourceKind::Tracker,
            shipment_id: None,
            note: None,
        }
    }

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        use MovementAction::*;
        for m in [
            movement("A1", In, "L1", -3_600),
            movement("A1", Out, "L1", 100),
            movement("A1", In, "L2", 200),
            movement("B2", In, "L1", 300),
            movement("C3", In, "L1", 400),
            movement("C3", Out, "L1", 500),
        ] {
            store.append_movement(m).unwrap();
        }
        store
    }

    #[test]
    fn test_append_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let mut m = movement("A1", MovementAction::In, "L1", 0);
        m.note = Some("manual".into());
        m.shipment_id = Some(Uuid::new_v4());
        let stored = store.append_movement(m.clone()).unwrap();
        let loaded = store.recent_movements("org-1", 10).unwrap();
        assert_eq!(loaded, vec![stored.clone()]);
        assert_eq!(stored.note.as_deref(), Some("manual"));
        assert_eq!(stored.shipment_id, m.shipment_id);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let store = seeded();
        let recent = store.recent_movements("org-1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tag_id, "C3");
        assert_eq!(recent[0].action, MovementAction::Out);
        assert_eq!(recent[1].action, MovementAction::In);
        assert!(store.recent_movements("org-2", 10).unwrap().is_empty());
    }

    #[test]
    fn test_same_instant_orders_by_append() {
        let store = Store::open_in_memory().unwrap();
        store.append_movement(movement("A1", MovementAction::In, "L1", 0)).unwrap();
        store.append_movement(movement("A1", MovementAction::Out, "L1", 0)).unwrap();
        let last = store.last_movement_for_tag("org-1", "A1").unwrap().unwrap();
        assert_eq!(last.action, MovementAction::Out);
    }

    #[test]
    fn test_by_tag_and_location() {
        let store = seeded();
        assert_eq!(store.movements_by_tag("org-1", "A1", 50).unwrap().len(), 3);
        assert_eq!(store.movements_by_location("org-1", "L1", 50).unwrap().len(), 5);
        assert_eq!(store.movements_by_location("org-1", "L2", 50).unwrap().len(), 1);
    }

    #[test]
    fn test_last_movement_is_current_location() {
        let store = seeded();
        let last = store.last_movement_for_tag("org-1", "A1").unwrap().unwrap();
        assert_eq!(last.location_id, "L2");
        assert_eq!(last.action, MovementAction::In);
        assert!(store.last_movement_for_tag("org-1", "ZZ").unwrap().is_none());
    }

    #[test]
    fn test_tags_currently_at() {
        let store = seeded();
        let at_l1: Vec<String> = store
            .tags_currently_at("org-1", "L1")
            .unwrap()
            .into_iter()
            .map(|m| m.tag_id)
            .collect();
        assert_eq!(at_l1, vec!["B2"]);
        let at_l2 = store.tags_currently_at("org-1", "L2").unwrap();
        assert_eq!(at_l2.len(), 1);
        assert_eq!(at_l2[0].tag_id, "A1");
    }

    #[test]
    fn test_range_is_inclusive_and_filters_location() {
        let store = seeded();
        let start = from_epoch_secs(DAY + 100).unwrap();
        let end = from_epoch_secs(DAY + 400).unwrap();
        let all = store.movements_in_range("org-1", start, end, None).unwrap();
        assert_eq!(all.len(), 4);
        let l1 = store.movements_in_range("org-1", start, end, Some("L1")).unwrap();
        assert_eq!(l1.len(), 3);
    }

    #[test]
    fn test_tag_summary() {
        let store = seeded();
        let summary = store.tag_summary("org-1", "A1").unwrap();
        assert_eq!(summary.total_in, 2);
        assert_eq!(summary.total_out, 1);
        assert!(summary.currently_in);
        let gone = store.tag_summary("org-1", "C3").unwrap();
        assert!(!gone.currently_in);
        let unknown = store.tag_summary("org-1", "ZZ").unwrap();
        assert_eq!(unknown, TagSummary::default());
    }

    #[test]
    fn test_location_summary_counts_today() {
        let store = seeded();
        let now = from_epoch_secs(DAY + 43_200).unwrap();
        let summary = store.location_summary("org-1", "L1", now).unwrap();
        assert_eq!(summary.total_in, 3);
        assert_eq!(summary.total_out, 2);
        // The first A1 IN happened the previous day.
        assert_eq!(summary.today_in, 2);
        assert_eq!(summary.today_out, 2);
        assert_eq!(summary.current_count, 1);
    }

    #[test]
    fn test_organization_summary() {
        let store = seeded();
        let now = from_epoch_secs(DAY + 43_200).unwrap();
        let summary = store.organization_summary("org-1", now).unwrap();
        assert_eq!(summary.total_movements, 6);
        assert_eq!(summary.total_in, 4);
        assert_eq!(summary.total_out, 2);
        assert_eq!(summary.today_count, 5);
    }
}
