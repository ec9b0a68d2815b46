use std::future::Future;
use std::time::Duration;

use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info};
use thiserror::Error;

use crate::messages::DiscoveryEvent;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("No Bluetooth adapter found")]
    NoAdapter,
    #[error("Discovery failed: {0}")]
    Transport(String),
}

/// Source of discovery batches.
pub trait BleSource: Send + Sync {
    /// Listen for advertisements for `timeout` and return every device seen.
    fn discover(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<DiscoveryEvent>, SourceError>> + Send;
}

/// Discovery through the host's first Bluetooth adapter.
pub struct BtleplugSource {
    adapter: Adapter,
}

impl BtleplugSource {
    pub async fn first_adapter() -> Result<Self, SourceError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SourceError::NoAdapter)?;

        info!("Using Bluetooth adapter {}", adapter.adapter_info().await?);
        Ok(BtleplugSource { adapter })
    }

    async fn collect_ids(&self, timeout: Duration) -> Result<Vec<PeripheralId>, SourceError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let mut seen: Vec<PeripheralId> = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id))
                    | Some(CentralEvent::ManufacturerDataAdvertisement { id, .. }) => {
                        if !seen.contains(&id) {
                            seen.push(id);
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!("Adapter event stream closed");
                        break;
                    }
                }
            }
        }

        self.adapter.stop_scan().await?;
        Ok(seen)
    }

    async fn describe(&self, id: &PeripheralId) -> Result<Option<DiscoveryEvent>, SourceError> {
        let peripheral = self.adapter.peripheral(id).await?;
        let Some(properties) = peripheral.properties().await? else {
            return Ok(None);
        };

        // CoreBluetooth hides the hardware address; fall back to the peripheral id.
        let address = if properties.address.into_inner() == [0; 6] {
            format!("{id:?}")
        } else {
            properties.address.to_string()
        };

        Ok(Some(DiscoveryEvent {
            address,
            name: properties.local_name,
            rssi: properties.rssi.unwrap_or(0),
            manufacturer_data: properties.manufacturer_data.into_iter().collect(),
        }))
    }
}

impl BleSource for BtleplugSource {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveryEvent>, SourceError> {
        let ids = self.collect_ids(timeout).await?;

        let mut devices = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.describe(id).await {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                // Peripherals can disappear between the event and the lookup.
                Err(SourceError::Bluetooth(btleplug::Error::DeviceNotFound)) => {
                    debug!("Peripheral {:?} vanished before lookup", id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(devices)
    }
}
