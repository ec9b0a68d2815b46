use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::beacon::BeaconRecord;
use crate::config::{ConfigError, ConfigSnapshot, ConfigSource};
use crate::manager::ScanHandle;
use crate::messages::{DiscoveryEvent, OutboundEvent};
use crate::scanner::{BleSource, SourceError};
use crate::sink::{Sink, SinkError};

/// An iBeacon manufacturer payload with a fixed UUID.
pub fn ibeacon_payload(major: u16, minor: u16, tx_power: u8) -> Vec<u8> {
    let mut payload = vec![0x02, 0x15];
    payload.extend_from_slice(&[0x5A; 16]);
    payload.extend_from_slice(&major.to_be_bytes());
    payload.extend_from_slice(&minor.to_be_bytes());
    payload.push(tx_power);
    payload
}

/// An Eddystone-URL manufacturer payload.
pub fn url_payload(scheme: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![0xAA, 0xFE, 0x10, scheme];
    payload.extend_from_slice(body);
    payload
}

pub fn device(address: &str, entries: &[(u16, Vec<u8>)]) -> DiscoveryEvent {
    DiscoveryEvent {
        address: address.to_string(),
        name: Some("Test Beacon".to_string()),
        rssi: -60,
        manufacturer_data: entries.to_vec(),
    }
}

pub fn sample_event() -> OutboundEvent {
    OutboundEvent {
        host_id: "host-1".to_string(),
        timestamp: "2025-04-06T13:23:39.000000Z".to_string(),
        rssi: -60,
        address: "AA:BB:CC:DD:EE:FF".to_string(),
        name: "Test Beacon".to_string(),
        beacon: BeaconRecord::IBeacon {
            uuid: uuid::Uuid::from_bytes([0x5A; 16]),
            major: 1,
            minor: 2,
            tx_power: -59,
        },
    }
}

/// One scripted discovery call.
#[derive(Debug, Clone)]
pub enum Step {
    Batch(Vec<DiscoveryEvent>),
    /// Return the batch, but request a stop while "discovering" it.
    StopDuring(Vec<DiscoveryEvent>),
    /// Wait for the notification, then return the batch.
    Pause(Arc<Notify>, Vec<DiscoveryEvent>),
    Fail,
    /// Never complete.
    Hang,
}

/// Scripted BLE source. Once the script runs out it requests a stop.
#[derive(Debug, Default)]
pub struct FakeSource {
    steps: Mutex<VecDeque<Step>>,
    timeouts: Mutex<Vec<Duration>>,
    handle: OnceLock<Arc<ScanHandle>>,
}

impl FakeSource {
    pub fn new(steps: Vec<Step>) -> Self {
        FakeSource {
            steps: Mutex::new(steps.into()),
            timeouts: Mutex::new(Vec::new()),
            handle: OnceLock::new(),
        }
    }

    pub fn attach(&self, handle: Arc<ScanHandle>) {
        let _ = self.handle.set(handle);
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// The timeout passed to every `discover` call so far.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }

    fn request_stop(&self) {
        if let Some(handle) = self.handle.get() {
            handle.request_stop();
        }
    }
}

impl BleSource for FakeSource {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveryEvent>, SourceError> {
        self.timeouts.lock().unwrap().push(timeout);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Batch(batch)) => Ok(batch),
            Some(Step::StopDuring(batch)) => {
                self.request_stop();
                Ok(batch)
            }
            Some(Step::Pause(resume, batch)) => {
                resume.notified().await;
                Ok(batch)
            }
            Some(Step::Fail) => Err(SourceError::Transport("adapter powered off".to_string())),
            Some(Step::Hang) => std::future::pending().await,
            None => {
                self.request_stop();
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Debug)]
pub struct StaticConfigSource {
    result: Result<ConfigSnapshot, String>,
}

impl StaticConfigSource {
    pub fn new(result: Result<ConfigSnapshot, String>) -> Self {
        StaticConfigSource { result }
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        self.result.clone().map_err(ConfigError::Invalid)
    }
}

#[derive(Debug, Default, Clone)]
pub struct SinkCounters {
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl SinkCounters {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Names of sinks in the order they handled events.
pub type DeliveryLog = Arc<Mutex<Vec<&'static str>>>;

/// Records every event it receives and counts acquire/release calls.
#[derive(Debug, Default)]
pub struct RecordingSink {
    name: Option<&'static str>,
    events: Arc<Mutex<Vec<OutboundEvent>>>,
    acquired_with: Arc<Mutex<Vec<ConfigSnapshot>>>,
    counters: SinkCounters,
    log: Option<DeliveryLog>,
    refusals: usize,
}

impl RecordingSink {
    /// A sink that appends `name` to `log` for every event it handles.
    pub fn logging(name: &'static str, log: &DeliveryLog) -> Self {
        RecordingSink {
            name: Some(name),
            log: Some(log.clone()),
            ..RecordingSink::default()
        }
    }

    pub fn refuse_acquire(self) -> Self {
        self.refuse_acquires(usize::MAX)
    }

    /// Fail the next `count` acquisitions.
    pub fn refuse_acquires(mut self, count: usize) -> Self {
        self.refusals = count;
        self
    }

    pub fn events(&self) -> Arc<Mutex<Vec<OutboundEvent>>> {
        self.events.clone()
    }

    pub fn acquired_with(&self) -> Arc<Mutex<Vec<ConfigSnapshot>>> {
        self.acquired_with.clone()
    }

    pub fn counters(&self) -> SinkCounters {
        self.counters.clone()
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        self.name.unwrap_or("recording")
    }

    fn acquire(&mut self, config: &ConfigSnapshot) -> Result<(), SinkError> {
        if self.refusals > 0 {
            self.refusals -= 1;
            return Err(SinkError::Connect("refused".to_string()));
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        self.acquired_with.lock().unwrap().push(config.clone());
        Ok(())
    }

    fn handle(&mut self, event: &OutboundEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        if let (Some(log), Some(name)) = (&self.log, self.name) {
            log.lock().unwrap().push(name);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A sink whose every delivery fails.
#[derive(Debug)]
pub struct FailingSink;

impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn handle(&mut self, _event: &OutboundEvent) -> Result<(), SinkError> {
        Err(SinkError::Publish("broker unreachable".to_string()))
    }
}
