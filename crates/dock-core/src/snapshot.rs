//! Inbound gateway messages and the resolved scan snapshots the engine consumes.
//!
//! A gateway publishes the set of tags it currently hears. Parsing is strict
//! about structure (a message without a gateway id or a readings array is
//! rejected whole) and lenient about shape: the legacy device payload
//! `{gw_id, tags: [{mac, rssi}]}` is accepted alongside the canonical one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::time::from_epoch_secs;

static IMEI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{14,16}$").expect("static regex"));

static MOBILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(MOBILE-|ANDROID-|IOS-)").expect("static regex"));

/// What kind of device produced a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    /// Fixed scanner identified by an IMEI.
    Gateway,
    /// Handheld phone app.
    Mobile,
    Tracker,
}

impl SourceKind {
    /// Classify a device by its identifier.
    pub fn detect(source_id: &str) -> Self {
        if IMEI_PATTERN.is_match(source_id) {
            SourceKind::Gateway
        } else if MOBILE_PATTERN.is_match(source_id) {
            SourceKind::Mobile
        } else {
            SourceKind::Tracker
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Gateway => "GATEWAY",
            SourceKind::Mobile => "MOBILE",
            SourceKind::Tracker => "TRACKER",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "GATEWAY" => Ok(SourceKind::Gateway),
            "MOBILE" => Ok(SourceKind::Mobile),
            "TRACKER" => Ok(SourceKind::Tracker),
            other => Err(CoreError::UnknownVariant {
                kind: "source kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Normalize a tag identifier: strip MAC separators and upper-case.
/// `7c:d9:f4:02:e8:0d` → `7CD9F402E80D`
pub fn normalize_tag_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_uppercase()
}

/// Wire format of one reading inside a gateway message.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundReading {
    #[serde(alias = "mac")]
    pub tag_id: String,
    #[serde(alias = "rssi")]
    pub signal_strength_dbm: i32,
}

/// Wire format of a gateway message, before validation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayMessage {
    #[serde(default, alias = "gw_id")]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub captured_at_epoch_seconds: Option<i64>,
    #[serde(default, alias = "tags")]
    pub readings: Option<Vec<InboundReading>>,
}

impl GatewayMessage {
    pub fn parse(text: &str) -> CoreResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| CoreError::MalformedSnapshot(format!("invalid JSON: {e}")))
    }

    /// Validate structure and normalize readings.
    ///
    /// `received_at` stands in for the capture time when the gateway did not
    /// supply one. Duplicate tags within the message collapse into a single
    /// reading carrying the strongest signal.
    pub fn validate(self, received_at: DateTime<Utc>) -> CoreResult<GatewayReport> {
        let gateway_id = self
            .gateway_id
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .ok_or_else(|| CoreError::MalformedSnapshot("missing gateway id".to_string()))?;

        let inbound = self.readings.ok_or_else(|| {
            CoreError::MalformedSnapshot(format!("gateway {gateway_id}: missing readings array"))
        })?;

        let captured_at = match self.captured_at_epoch_seconds {
            Some(secs) => from_epoch_secs(secs).ok_or_else(|| {
                CoreError::MalformedSnapshot(format!(
                    "gateway {gateway_id}: capture time {secs} out of range"
                ))
            })?,
            None => received_at,
        };

        let mut strongest: HashMap<String, i32> = HashMap::with_capacity(inbound.len());
        let mut order: Vec<String> = Vec::with_capacity(inbound.len());
        for reading in inbound {
            let tag_id = normalize_tag_id(&reading.tag_id);
            if tag_id.is_empty() {
                return Err(CoreError::MalformedSnapshot(format!(
                    "gateway {gateway_id}: reading with empty tag id"
                )));
            }
            match strongest.get_mut(&tag_id) {
                Some(signal) => *signal = (*signal).max(reading.signal_strength_dbm),
                None => {
                    strongest.insert(tag_id.clone(), reading.signal_strength_dbm);
                    order.push(tag_id);
                }
            }
        }

        let readings = order
            .into_iter()
            .map(|tag_id| {
                let signal_dbm = strongest[&tag_id];
                Reading { tag_id, signal_dbm }
            })
            .collect();

        Ok(GatewayReport {
            gateway_id,
            captured_at,
            readings,
        })
    }
}

/// One normalized tag sighting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub tag_id: String,
    pub signal_dbm: i32,
}

impl Reading {
    pub fn new(tag_id: impl Into<String>, signal_dbm: i32) -> Self {
        Self {
            tag_id: tag_id.into(),
            signal_dbm,
        }
    }
}

/// A validated message whose gateway has not yet been resolved to a location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayReport {
    pub gateway_id: String,
    pub captured_at: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

impl GatewayReport {
    pub fn into_snapshot(self, placement: &GatewayPlacement) -> ScanSnapshot {
        ScanSnapshot {
            origin: ScanOrigin {
                organization_id: placement.organization_id.clone(),
                location_id: placement.location_id.clone(),
                location_name: placement.location_name.clone(),
                source_id: self.gateway_id,
                source_kind: placement.source_kind,
                captured_at: self.captured_at,
            },
            readings: self.readings,
        }
    }
}

/// Where a registered gateway is installed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPlacement {
    pub gateway_id: String,
    pub organization_id: String,
    pub location_id: String,
    pub location_name: String,
    pub source_kind: SourceKind,
}

impl GatewayPlacement {
    pub fn new(
        gateway_id: impl Into<String>,
        organization_id: impl Into<String>,
        location_id: impl Into<String>,
        location_name: impl Into<String>,
    ) -> Self {
        let gateway_id = gateway_id.into();
        let source_kind = SourceKind::detect(&gateway_id);
        Self {
            gateway_id,
            organization_id: organization_id.into(),
            location_id: location_id.into(),
            location_name: location_name.into(),
            source_kind,
        }
    }
}

/// Context shared by every reading of one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOrigin {
    pub organization_id: String,
    pub location_id: String,
    pub location_name: String,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub captured_at: DateTime<Utc>,
}

/// One gateway's report, resolved to an organization and location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub origin: ScanOrigin,
    pub readings: Vec<Reading>,
}

impl ScanSnapshot {
    pub fn contains_tag(&self, tag_id: &str) -> bool {
        self.readings.iter().any(|r| r.tag_id == tag_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received() -> DateTime<Utc> {
        from_epoch_secs(1_771_632_000).unwrap()
    }

    #[test]
    fn test_detect_source_kind() {
        assert_eq!(SourceKind::detect("356938035643809"), SourceKind::Gateway);
        assert_eq!(SourceKind::detect("MOBILE-abc"), SourceKind::Mobile);
        assert_eq!(SourceKind::detect("android-42"), SourceKind::Mobile);
        assert_eq!(SourceKind::detect("GW_A01"), SourceKind::Tracker);
        assert_eq!(SourceKind::detect("1234"), SourceKind::Tracker);
    }

    #[test]
    fn test_normalize_tag_id() {
        assert_eq!(normalize_tag_id("7c:d9:f4:02:e8:0d"), "7CD9F402E80D");
        assert_eq!(normalize_tag_id("  a1 "), "A1");
    }

    #[test]
    fn test_parse_canonical_message() {
        let msg = GatewayMessage::parse(
            r#"{"gatewayId":"GW1","capturedAtEpochSeconds":1771632010,
                "readings":[{"tagId":"a1","signalStrengthDbm":-70}]}"#,
        )
        .unwrap();
        let report = msg.validate(received()).unwrap();
        assert_eq!(report.gateway_id, "GW1");
        assert_eq!(report.captured_at.timestamp(), 1_771_632_010);
        assert_eq!(report.readings, vec![Reading::new("A1", -70)]);
    }

    #[test]
    fn test_parse_legacy_device_message() {
        let msg = GatewayMessage::parse(
            r#"{"gw_id":"GW2","tags":[{"mac":"7c:d9:f4:02:e8:0d","rssi":-65}]}"#,
        )
        .unwrap();
        let report = msg.validate(received()).unwrap();
        assert_eq!(report.gateway_id, "GW2");
        assert_eq!(report.captured_at, received());
        assert_eq!(report.readings[0].tag_id, "7CD9F402E80D");
    }

    #[test]
    fn test_missing_gateway_rejected() {
        let msg = GatewayMessage::parse(r#"{"readings":[]}"#).unwrap();
        assert!(matches!(
            msg.validate(received()),
            Err(CoreError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn test_missing_readings_rejected() {
        let msg = GatewayMessage::parse(r#"{"gatewayId":"GW1"}"#).unwrap();
        let err = msg.validate(received()).unwrap_err();
        assert!(err.to_string().contains("missing readings"));
    }

    #[test]
    fn test_empty_readings_accepted() {
        let msg = GatewayMessage::parse(r#"{"gatewayId":"GW1","readings":[]}"#).unwrap();
        let report = msg.validate(received()).unwrap();
        assert!(report.readings.is_empty());
    }

    #[test]
    fn test_empty_tag_rejected() {
        let msg = GatewayMessage::parse(
            r#"{"gatewayId":"GW1","readings":[{"tagId":" : ","signalStrengthDbm":-60}]}"#,
        )
        .unwrap();
        assert!(msg.validate(received()).is_err());
    }

    #[test]
    fn test_duplicate_tags_keep_strongest() {
        let msg = GatewayMessage::parse(
            r#"{"gatewayId":"GW1","readings":[
                {"tagId":"A1","signalStrengthDbm":-90},
                {"tagId":"B2","signalStrengthDbm":-60},
                {"tagId":"a1","signalStrengthDbm":-75}]}"#,
        )
        .unwrap();
        let report = msg.validate(received()).unwrap();
        assert_eq!(
            report.readings,
            vec![Reading::new("A1", -75), Reading::new("B2", -60)]
        );
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(GatewayMessage::parse("{not json").is_err());
        assert!(GatewayMessage::parse(r#"{"gatewayId":"GW1","readings":"nope"}"#).is_err());
    }

    #[test]
    fn test_into_snapshot_carries_placement() {
        let placement = GatewayPlacement::new("GW1", "org-1", "L1", "Dock One");
        let report = GatewayMessage::parse(
            r#"{"gatewayId":"GW1","readings":[{"tagId":"A1","signalStrengthDbm":-70}]}"#,
        )
        .unwrap()
        .validate(received())
        .unwrap();
        let snapshot = report.into_snapshot(&placement);
        assert_eq!(snapshot.origin.organization_id, "org-1");
        assert_eq!(snapshot.origin.location_name, "Dock One");
        assert_eq!(snapshot.origin.source_kind, SourceKind::Tracker);
        assert!(snapshot.contains_tag("A1"));
        assert!(!snapshot.contains_tag("B2"));
    }
}
