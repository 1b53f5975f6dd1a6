//! Gateway registry: which organization and location a scanner reports for.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

use dock_core::GatewayPlacement;

use crate::error::Result;
use crate::store::{Store, parse_col, to_millis};

fn read_placement(row: &Row<'_>) -> rusqlite::Result<GatewayPlacement> {
    Ok(GatewayPlacement {
        gateway_id: row.get(0)?,
        organization_id: row.get(1)?,
        location_id: row.get(2)?,
        location_name: row.get(3)?,
        source_kind: parse_col(row, 4)?,
    })
}

impl Store {
    /// Register or move a gateway. Re-registering replaces the placement.
    pub fn register_gateway(&self, placement: &GatewayPlacement, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO gateways
                 (gateway_id, organization_id, location_id, location_name, source_kind, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    placement.gateway_id,
                    placement.organization_id,
                    placement.location_id,
                    placement.location_name,
                    placement.source_kind.as_str(),
                    to_millis(now),
                ],
            )?;
            Ok(())
        })?;
        info!(
            gateway = %placement.gateway_id,
            org = %placement.organization_id,
            location = %placement.location_id,
            kind = %placement.source_kind,
            "gateway registered"
        );
        Ok(())
    }

    pub fn resolve_gateway(&self, gateway_id: &str) -> Result<Option<GatewayPlacement>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT gateway_id, organization_id, location_id, location_name, source_kind
                     FROM gateways WHERE gateway_id = ?1",
                    [gateway_id],
                    read_placement,
                )
                .optional()?)
        })
    }

    /// All gateways, optionally for one organization.
    pub fn list_gateways(&self, organization_id: Option<&str>) -> Result<Vec<GatewayPlacement>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT gateway_id, organization_id, location_id, location_name, source_kind
                 FROM gateways WHERE ?1 IS NULL OR organization_id = ?1
                 ORDER BY organization_id, location_id, gateway_id",
            )?;
            let rows = stmt
                .query_map([organization_id], read_placement)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn remove_gateway(&self, gateway_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM gateways WHERE gateway_id = ?1", [gateway_id])?;
            Ok(n > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::SourceKind;
    use dock_core::time::from_epoch_secs;

    #[test]
    fn test_register_resolve_remove() {
        let store = Store::open_in_memory().unwrap();
        let now = from_epoch_secs(0).unwrap();
        let gw = GatewayPlacement::new("356938035643809", "org-1", "L1", "Bay 1");
        store.register_gateway(&gw, now).unwrap();

        let resolved = store.resolve_gateway("356938035643809").unwrap().unwrap();
        assert_eq!(resolved, gw);
        assert_eq!(resolved.source_kind, SourceKind::Gateway);
        assert!(store.resolve_gateway("unknown").unwrap().is_none());

        assert!(store.remove_gateway("356938035643809").unwrap());
        assert!(!store.remove_gateway("356938035643809").unwrap());
    }

    #[test]
    fn test_reregister_moves_gateway() {
        let store = Store::open_in_memory().unwrap();
        let now = from_epoch_secs(0).unwrap();
        store
            .register_gateway(&GatewayPlacement::new("MOBILE-7", "org-1", "L1", "A"), now)
            .unwrap();
        store
            .register_gateway(&GatewayPlacement::new("MOBILE-7", "org-1", "L2", "B"), now)
            .unwrap();
        let resolved = store.resolve_gateway("MOBILE-7").unwrap().unwrap();
        assert_eq!(resolved.location_id, "L2");
        assert_eq!(resolved.source_kind, SourceKind::Mobile);
        assert_eq!(store.list_gateways(None).unwrap().len(), 1);
    }

    #[test]
    fn test_list_filters_by_org() {
        let store = Store::open_in_memory().unwrap();
        let now = from_epoch_secs(0).unwrap();
        store
            .register_gateway(&GatewayPlacement::new("GW-A", "org-1", "L1", "A"), now)
            .unwrap();
        store
            .register_gateway(&GatewayPlacement::new("GW-B", "org-2", "L1", "B"), now)
            .unwrap();
        assert_eq!(store.list_gateways(Some("org-1")).unwrap().len(), 1);
        assert_eq!(store.list_gateways(None).unwrap().len(), 2);
    }
}
