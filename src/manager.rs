//! The scan control loop and its start/stop/reload lifecycle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use thiserror::Error;

use crate::beacon;
use crate::config::{ConfigCell, ConfigError, ConfigSnapshot, ConfigSource, ScanConfig};
use crate::host::HostIdProvider;
use crate::messages::{DiscoveryEvent, normalize};
use crate::scanner::{BleSource, SourceError};
use crate::sink::{ActiveSinks, Sink};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan loop is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanState {
    Idle = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl ScanState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ScanState::Idle,
            1 => ScanState::Running,
            2 => ScanState::StopRequested,
            _ => ScanState::Stopped,
        }
    }
}

/// Shared scan state, safe to poke from any thread.
#[derive(Debug)]
pub struct ScanHandle {
    state: AtomicU8,
}

impl Default for ScanHandle {
    fn default() -> Self {
        ScanHandle {
            state: AtomicU8::new(ScanState::Idle as u8),
        }
    }
}

impl ScanHandle {
    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ScanState::Running
    }

    /// Ask a running loop to stop. Returns false if it was not running.
    pub fn request_stop(&self) -> bool {
        self.transition(ScanState::Running, ScanState::StopRequested)
    }

    fn begin(&self) -> bool {
        self.transition(ScanState::Idle, ScanState::Running)
            || self.transition(ScanState::Stopped, ScanState::Running)
    }

    fn finish(&self) {
        self.state.store(ScanState::Stopped as u8, Ordering::Release);
    }

    fn transition(&self, from: ScanState, to: ScanState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Timing of the discovery cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanSettings {
    /// Bound on each discovery batch.
    pub timeout: Duration,
    /// Pause between cycles; zero only yields to the scheduler.
    pub interscan_delay: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for ScanSettings {
    fn from(config: &ScanConfig) -> Self {
        ScanSettings {
            timeout: config.timeout(),
            interscan_delay: config.interscan_delay(),
        }
    }
}

/// Counters for one run of the loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub beacons: u64,
    pub decode_errors: u64,
    pub sink_errors: u64,
}

type SinkRegistry = Mutex<Vec<Box<dyn Sink>>>;

pub struct Manager<S> {
    source: S,
    host: Box<dyn HostIdProvider>,
    config_source: Box<dyn ConfigSource>,
    config: ConfigCell,
    state: Arc<ScanHandle>,
    sinks: SinkRegistry,
    settings: ScanSettings,
}

impl<S: BleSource> Manager<S> {
    pub fn new(
        source: S,
        host: Box<dyn HostIdProvider>,
        config_source: Box<dyn ConfigSource>,
        initial: ConfigSnapshot,
        settings: ScanSettings,
    ) -> Self {
        Manager {
            source,
            host,
            config_source,
            config: ConfigCell::new(initial),
            state: Arc::new(ScanHandle::default()),
            sinks: Mutex::new(Vec::new()),
            settings,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn handle(&self) -> Arc<ScanHandle> {
        self.state.clone()
    }

    pub fn state(&self) -> ScanState {
        self.state.state()
    }

    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.current()
    }

    /// Add a sink. Sinks registered while a run is active join the next run.
    pub fn register_sink(&self, sink: Box<dyn Sink>) {
        debug!("Registering sink {}", sink.name());
        lock(&self.sinks).push(sink);
    }

    /// Request the running loop to stop at its next checkpoint. Idempotent.
    pub fn stop(&self) {
        if self.state.request_stop() {
            info!("Stopping scanning");
        }
    }

    /// Reload the configuration. A running loop picks the new snapshot up at
    /// the start of its next cycle; the cycle in progress is unaffected.
    pub fn reload_config(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        self.config.reload(self.config_source.as_ref())
    }

    /// Run the scan loop until stopped or the source fails.
    ///
    /// Sinks are acquired on entry and released exactly once on exit,
    /// including when this future is dropped mid-run. When the configuration
    /// changes between cycles the sinks are released and acquired again
    /// against the new snapshot.
    ///
    /// Must be polled, and dropped, inside a Tokio runtime.
    pub async fn start(&self) -> Result<RunSummary, ScanError> {
        if !self.state.begin() {
            return Err(ScanError::AlreadyRunning);
        }

        let host_id = self.host.host_id();
        let mut config = self.config.current();
        let registered = std::mem::take(&mut *lock(&self.sinks));

        let mut run = RunGuard {
            state: &self.state,
            registry: &self.sinks,
            sinks: ActiveSinks::acquire(registered, &config),
        };

        info!(
            "Starting BLE scan (host {}, topic {}, {} sinks)",
            host_id,
            config.topic,
            run.sinks.len()
        );

        let mut summary = RunSummary::default();
        loop {
            if !self.state.is_running() {
                break;
            }

            let latest = self.config.current();
            if !Arc::ptr_eq(&latest, &config) {
                info!(
                    "Applying reloaded configuration (broker {}, topic {})",
                    latest.broker, latest.topic
                );
                run.sinks.reacquire(&latest);
                config = latest;
            }

            summary.cycles += 1;
            debug!("Starting scan #{}", summary.cycles);

            let batch = match self.source.discover(self.settings.timeout).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!("Error in BLE scan: {}", err);
                    return Err(err.into());
                }
            };
            debug!("Found {} devices in scan #{}", batch.len(), summary.cycles);

            if !self.state.is_running() {
                info!("Scanning stopped, discarding batch #{}", summary.cycles);
                break;
            }

            let found = process_batch(&batch, &host_id, &mut run.sinks, &mut summary);
            debug!("Scan #{} found {} beacons", summary.cycles, found);

            if self.settings.interscan_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.settings.interscan_delay).await;
            }
        }

        info!(
            "BLE scan ended after {} cycles ({} beacons)",
            summary.cycles, summary.beacons
        );
        Ok(summary)
    }
}

/// Decode, normalise and deliver every entry of a batch, in batch order.
fn process_batch(
    batch: &[DiscoveryEvent],
    host_id: &str,
    sinks: &mut ActiveSinks,
    summary: &mut RunSummary,
) -> u64 {
    let mut found = 0;
    for device in batch {
        debug!(
            "Processing device: {} ({}), RSSI: {}",
            device.address,
            device.name.as_deref().unwrap_or("?"),
            device.rssi
        );

        for &(company_id, ref payload) in &device.manufacturer_data {
            let record = match beacon::decode(company_id, payload) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    error!(
                        "Error decoding company {:#06x} data from {}: {}",
                        company_id, device.address, err
                    );
                    summary.decode_errors += 1;
                    continue;
                }
            };

            debug!("Found {} from {}", record.beacon_type(), device.address);
            let event = normalize(device, record, host_id, Utc::now);
            summary.sink_errors += sinks.deliver(&event) as u64;
            found += 1;
        }
    }
    summary.beacons += found;
    found
}

/// Ends a run: releases sinks, returns them to the registry and marks the
/// loop stopped. Runs on every exit path, including cancellation.
struct RunGuard<'a> {
    state: &'a ScanHandle,
    registry: &'a SinkRegistry,
    sinks: ActiveSinks,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let released = self.sinks.release_all();
        let mut registry = lock(self.registry);
        let late = std::mem::replace(&mut *registry, released);
        registry.extend(late);
        drop(registry);

        self.state.finish();
    }
}

fn lock(registry: &SinkRegistry) -> MutexGuard<'_, Vec<Box<dyn Sink>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
