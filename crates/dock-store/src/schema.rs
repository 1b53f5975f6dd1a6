use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Fold stale WAL data into the main file on startup.
    // In-memory and fresh databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    // Timestamps are epoch milliseconds (UTC).
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS gateways (
            gateway_id      TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            location_id     TEXT NOT NULL,
            location_name   TEXT NOT NULL DEFAULT '',
            source_kind     TEXT NOT NULL,
            registered_at   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS presence_buffers (
            organization_id  TEXT NOT NULL,
            tag_id           TEXT NOT NULL,
            location_id      TEXT NOT NULL,
            location_name    TEXT NOT NULL DEFAULT '',
            seen_count       INTEGER NOT NULL DEFAULT 0,
            missed_count     INTEGER NOT NULL DEFAULT 0,
            total_scans      INTEGER NOT NULL DEFAULT 0,
            last_signal_dbm  INTEGER,
            signal_history   TEXT NOT NULL DEFAULT '',
            average_signal   REAL NOT NULL DEFAULT 0,
            first_seen_at    INTEGER NOT NULL,
            last_seen_at     INTEGER NOT NULL,
            last_scan_at     INTEGER NOT NULL,
            status           TEXT NOT NULL,
            confirmed_in_at  INTEGER,
            confirmed_out_at INTEGER,
            source_id        TEXT NOT NULL DEFAULT '',
            source_kind      TEXT NOT NULL DEFAULT 'TRACKER',
            PRIMARY KEY (organization_id, tag_id, location_id)
        );

        CREATE TABLE IF NOT EXISTS movements (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            organization_id TEXT NOT NULL,
            tag_id          TEXT NOT NULL,
            action          TEXT NOT NULL,
            occurred_at     INTEGER NOT NULL,
            location_id     TEXT NOT NULL,
            location_name   TEXT NOT NULL DEFAULT '',
            source_id       TEXT NOT NULL DEFAULT '',
            source_kind     TEXT NOT NULL DEFAULT 'TRACKER',
            shipment_id     TEXT,
            note            TEXT
        );

        CREATE TABLE IF NOT EXISTS shipments (
            id                      TEXT PRIMARY KEY,
            code                    TEXT NOT NULL UNIQUE,
            organization_id         TEXT NOT NULL,
            origin_location_id      TEXT NOT NULL,
            destination_location_id TEXT NOT NULL,
            status                  TEXT NOT NULL,
            notes                   TEXT,
            created_at              INTEGER NOT NULL,
            updated_at              INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS shipment_items (
            id          TEXT PRIMARY KEY,
            shipment_id TEXT NOT NULL REFERENCES shipments(id) ON DELETE CASCADE,
            tag_id      TEXT NOT NULL,
            status      TEXT NOT NULL,
            exited_at   INTEGER,
            arrived_at  INTEGER,
            UNIQUE (shipment_id, tag_id)
        );

        CREATE INDEX IF NOT EXISTS idx_buffers_location
            ON presence_buffers(organization_id, location_id, status);
        CREATE INDEX IF NOT EXISTS idx_movements_org_time
            ON movements(organization_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_movements_tag
            ON movements(organization_id, tag_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_movements_location
            ON movements(organization_id, location_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_items_tag ON shipment_items(tag_id);
        CREATE INDEX IF NOT EXISTS idx_shipments_org ON shipments(organization_id, status);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
