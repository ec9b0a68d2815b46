use chrono::{DateTime, SecondsFormat, Utc};
use serde_derive::Serialize;

use crate::beacon::BeaconRecord;

/// Name reported for devices that advertise no local name.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// One device seen during a discovery batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    /// `(company id, raw payload)` entries in advertisement order.
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
}

/// A decoded beacon together with the sighting metadata, as handed to sinks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub host_id: String,
    pub timestamp: String,
    pub rssi: i16,
    pub address: String,
    pub name: String,
    #[serde(flatten)]
    pub beacon: BeaconRecord,
}

impl OutboundEvent {
    pub fn beacon_type(&self) -> &'static str {
        self.beacon.beacon_type()
    }
}

/// Merge a decoded record with the discovery metadata it came from.
///
/// The timestamp is taken from `now` at normalisation time, not radio
/// reception time.
pub fn normalize<F>(
    discovery: &DiscoveryEvent,
    beacon: BeaconRecord,
    host_id: &str,
    now: F,
) -> OutboundEvent
where
    F: FnOnce() -> DateTime<Utc>,
{
    OutboundEvent {
        host_id: host_id.to_string(),
        timestamp: now().to_rfc3339_opts(SecondsFormat::Micros, true),
        rssi: discovery.rssi,
        address: discovery.address.clone(),
        name: discovery
            .name
            .clone()
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
        beacon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 6, 13, 23, 39).unwrap()
    }

    fn discovery(name: Option<&str>) -> DiscoveryEvent {
        DiscoveryEvent {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: name.map(str::to_string),
            rssi: -67,
            manufacturer_data: Vec::new(),
        }
    }

    #[test]
    fn test_normalize() {
        let beacon = BeaconRecord::EddystoneUrl {
            url: "https://example.com".to_string(),
        };
        let event = normalize(&discovery(Some("Tag")), beacon.clone(), "host-1", fixed_clock);

        assert_eq!(event.host_id, "host-1");
        assert_eq!(event.timestamp, "2025-04-06T13:23:39.000000Z");
        assert_eq!(event.rssi, -67);
        assert_eq!(event.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(event.name, "Tag");
        assert_eq!(event.beacon, beacon);
        assert_eq!(event.beacon_type(), "Eddystone-URL");
    }

    #[test]
    fn test_normalize_missing_name() {
        let beacon = BeaconRecord::AltBeacon {
            beacon_id: [0; 20],
        };
        let event = normalize(&discovery(None), beacon, "host-1", fixed_clock);
        assert_eq!(event.name, UNKNOWN_DEVICE_NAME);
    }

    #[test]
    fn test_outbound_event_json() {
        let beacon = BeaconRecord::EddystoneUrl {
            url: "http://example.com".to_string(),
        };
        let event = normalize(&discovery(Some("Tag")), beacon, "host-1", fixed_clock);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "beacon_type": "Eddystone-URL",
                "host_id": "host-1",
                "timestamp": "2025-04-06T13:23:39.000000Z",
                "rssi": -67,
                "address": "AA:BB:CC:DD:EE:FF",
                "name": "Tag",
                "url": "http://example.com",
            })
        );
    }
}
