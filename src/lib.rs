//! Decode BLE proximity-beacon advertisements and fan them out to sinks.
//!
//! [`manager::Manager`] drives the scan loop; the binary wires it to a real
//! Bluetooth adapter, an MQTT publisher and a stdout observer.

pub mod beacon;
pub mod config;
pub mod host;
pub mod manager;
pub mod messages;
pub mod mqtt;
pub mod scanner;
pub mod sink;

#[cfg(test)]
pub(crate) mod test_utils;

pub use beacon::{BeaconRecord, DecodeError, decode};
pub use config::{ConfigCell, ConfigError, ConfigSnapshot, ConfigSource, FileConfigSource};
pub use manager::{Manager, RunSummary, ScanError, ScanHandle, ScanSettings, ScanState};
pub use messages::{DiscoveryEvent, OutboundEvent, normalize};
pub use sink::{ObserverSink, Sink, SinkError, deliver};
