//! Presence Buffer Store: one row per `(organization, tag, location)`.

use std::collections::{BTreeMap, VecDeque};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use dock_core::{
    BufferKey, BufferStatus, BufferSummary, MovementRecord, NewMovement, PresenceBuffer,
    PresenceConflict, ScanOrigin, Transition,
};

use crate::error::Result;
use crate::ledger::insert_movement;
use crate::store::{Store, opt_time_col, parse_col, time_col, to_millis};

const BUFFER_COLUMNS: &str = "organization_id, tag_id, location_id, location_name, \
     seen_count, missed_count, total_scans, last_signal_dbm, signal_history, average_signal, \
     first_seen_at, last_seen_at, last_scan_at, status, confirmed_in_at, confirmed_out_at, \
     source_id, source_kind";

/// Result of an atomic buffer mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferUpdate {
    pub buffer: PresenceBuffer,
    /// Ledger entry appended in the same transaction, if the mutation
    /// confirmed a transition.
    pub movement: Option<MovementRecord>,
}

fn encode_history(history: &VecDeque<i32>) -> String {
    history
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_history(raw: &str, idx: usize) -> rusqlite::Result<VecDeque<i32>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        })
        .collect()
}

fn read_buffer(row: &Row<'_>) -> rusqlite::Result<PresenceBuffer> {
    let history: String = row.get(8)?;
    Ok(PresenceBuffer {
        key: BufferKey {
            organization_id: row.get(0)?,
            tag_id: row.get(1)?,
            location_id: row.get(2)?,
        },
        location_name: row.get(3)?,
        seen_count: row.get(4)?,
        missed_count: row.get(5)?,
        total_scans: row.get::<_, i64>(6)? as u64,
        last_signal_dbm: row.get(7)?,
        signal_history: decode_history(&history, 8)?,
        average_signal: row.get(9)?,
        first_seen_at: time_col(row, 10)?,
        last_seen_at: time_col(row, 11)?,
        last_scan_at: time_col(row, 12)?,
        status: parse_col(row, 13)?,
        confirmed_in_at: opt_time_col(row, 14)?,
        confirmed_out_at: opt_time_col(row, 15)?,
        source_id: row.get(16)?,
        source_kind: parse_col(row, 17)?,
    })
}

fn load_buffer(conn: &Connection, key: &BufferKey) -> Result<Option<PresenceBuffer>> {
    let sql = format!(
        "SELECT {BUFFER_COLUMNS} FROM presence_buffers
         WHERE organization_id = ?1 AND tag_id = ?2 AND location_id = ?3"
    );
    let buffer = conn
        .query_row(
            &sql,
            params![key.organization_id, key.tag_id, key.location_id],
            read_buffer,
        )
        .optional()?;
    Ok(buffer)
}

fn save_buffer(conn: &Connection, buffer: &PresenceBuffer) -> Result<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO presence_buffers ({BUFFER_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
    );
    conn.execute(
        &sql,
        params![
            buffer.key.organization_id,
            buffer.key.tag_id,
            buffer.key.location_id,
            buffer.location_name,
            buffer.seen_count,
            buffer.missed_count,
            buffer.total_scans as i64,
            buffer.last_signal_dbm,
            encode_history(&buffer.signal_history),
            buffer.average_signal,
            to_millis(buffer.first_seen_at),
            to_millis(buffer.last_seen_at),
            to_millis(buffer.last_scan_at),
            buffer.status.as_str(),
            buffer.confirmed_in_at.map(to_millis),
            buffer.confirmed_out_at.map(to_millis),
            buffer.source_id,
            buffer.source_kind.as_str(),
        ],
    )?;
    Ok(())
}

fn collect_buffers(conn: &Connection, sql: &str, args: &[&str]) -> Result<Vec<PresenceBuffer>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), read_buffer)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Store {
    pub fn get_buffer(&self, key: &BufferKey) -> Result<Option<PresenceBuffer>> {
        self.with_conn(|conn| load_buffer(conn, key))
    }

    /// Atomic read-modify-write of one buffer.
    ///
    /// Loads the buffer for `key` (creating it from `create_from` when absent
    /// and an origin is given), applies `mutate`, persists the result, and
    /// appends the ledger entry for any transition `mutate` reports, all in
    /// one transaction. Returns `None` when the buffer does not exist and
    /// nothing was created.
    pub fn update_buffer<F>(
        &self,
        key: &BufferKey,
        create_from: Option<&ScanOrigin>,
        mutate: F,
    ) -> Result<Option<BufferUpdate>>
    where
        F: FnOnce(&mut PresenceBuffer) -> Option<Transition>,
    {
        self.write(|tx| {
            let mut buffer = match (load_buffer(tx, key)?, create_from) {
                (Some(buffer), _) => buffer,
                (None, Some(origin)) => PresenceBuffer::new(key.clone(), origin),
                (None, None) => return Ok(None),
            };

            let transition = mutate(&mut buffer);
            save_buffer(tx, &buffer)?;

            let movement = match transition {
                Some(t) => Some(insert_movement(
                    tx,
                    NewMovement::from_buffer(&buffer, t.action, t.at),
                )?),
                None => None,
            };
            debug!(
                key = %key,
                status = %buffer.status,
                seen = buffer.seen_count,
                missed = buffer.missed_count,
                "buffer updated"
            );
            Ok(Some(BufferUpdate { buffer, movement }))
        })
    }

    /// Buffers at a location, optionally restricted to `statuses`
    /// (empty slice means every status).
    pub fn list_buffers_by_location(
        &self,
        organization_id: &str,
        location_id: &str,
        statuses: &[BufferStatus],
    ) -> Result<Vec<PresenceBuffer>> {
        let sql = format!(
            "SELECT {BUFFER_COLUMNS} FROM presence_buffers
             WHERE organization_id = ?1 AND location_id = ?2
             ORDER BY tag_id"
        );
        let buffers = self.with_conn(|conn| {
            collect_buffers(conn, &sql, &[organization_id, location_id])
        })?;
        Ok(buffers
            .into_iter()
            .filter(|b| statuses.is_empty() || statuses.contains(&b.status))
            .collect())
    }

    pub fn list_buffers_by_tag(
        &self,
        organization_id: &str,
        tag_id: &str,
    ) -> Result<Vec<PresenceBuffer>> {
        let sql = format!(
            "SELECT {BUFFER_COLUMNS} FROM presence_buffers
             WHERE organization_id = ?1 AND tag_id = ?2
             ORDER BY location_id"
        );
        self.with_conn(|conn| collect_buffers(conn, &sql, &[organization_id, tag_id]))
    }

    pub fn confirmed_in(&self, organization_id: &str, location_id: &str) -> Result<Vec<PresenceBuffer>> {
        self.list_buffers_by_location(organization_id, location_id, &[BufferStatus::ConfirmedIn])
    }

    pub fn pending_out(&self, organization_id: &str, location_id: &str) -> Result<Vec<PresenceBuffer>> {
        self.list_buffers_by_location(organization_id, location_id, &[BufferStatus::PendingOut])
    }

    pub fn buffer_summary(&self, organization_id: &str, location_id: &str) -> Result<BufferSummary> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM presence_buffers
                 WHERE organization_id = ?1 AND location_id = ?2
                 GROUP BY status",
            )?;
            let mut summary = BufferSummary::default();
            let rows = stmt.query_map(params![organization_id, location_id], |row| {
                Ok((parse_col::<BufferStatus>(row, 0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                summary.add(status, count as u64);
            }
            Ok(summary)
        })
    }

    /// Tags currently present at more than one location.
    pub fn presence_conflicts(&self, organization_id: &str) -> Result<Vec<PresenceConflict>> {
        let rows: Vec<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tag_id, location_id FROM presence_buffers
                 WHERE organization_id = ?1 AND status IN ('CONFIRMED_IN', 'PENDING_OUT')
                 ORDER BY tag_id, location_id",
            )?;
            let rows = stmt
                .query_map([organization_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut by_tag: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tag_id, location_id) in rows {
            by_tag.entry(tag_id).or_default().push(location_id);
        }
        Ok(by_tag
            .into_iter()
            .filter(|(_, locations)| locations.len() > 1)
            .map(|(tag_id, location_ids)| PresenceConflict {
                organization_id: organization_id.to_string(),
                tag_id,
                location_ids,
            })
            .collect())
    }

    /// Manual reset: forget a tag at a location. Returns whether a row existed.
    pub fn delete_buffer(&self, key: &BufferKey) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM presence_buffers
                 WHERE organization_id = ?1 AND tag_id = ?2 AND location_id = ?3",
                params![key.organization_id, key.tag_id, key.location_id],
            )?;
            Ok(n > 0)
        })
    }
}
