//! Fan-out of outbound events to independent sinks.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use log::{debug, error, warn};
use thiserror::Error;

use crate::config::ConfigSnapshot;
use crate::messages::OutboundEvent;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Observer failed: {0}")]
    Observer(String),
    #[error("Error serializing event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Error publishing event: {0}")]
    Publish(String),
    #[error("Sink is not connected")]
    NotConnected,
    #[error("Error connecting sink: {0}")]
    Connect(String),
}

/// A consumer of decoded beacon events.
///
/// `acquire` runs once when a scan run starts and `release` once when it
/// ends, however it ends. `handle` must not block on I/O.
pub trait Sink: Send {
    fn name(&self) -> &str;

    fn acquire(&mut self, _config: &ConfigSnapshot) -> Result<(), SinkError> {
        Ok(())
    }

    fn handle(&mut self, event: &OutboundEvent) -> Result<(), SinkError>;

    fn release(&mut self) {}
}

/// Deliver `event` to every sink in order, returning how many failed.
pub fn deliver<'a, I>(event: &OutboundEvent, sinks: I) -> usize
where
    I: IntoIterator<Item = &'a mut Box<dyn Sink>>,
{
    let mut failures = 0;
    for sink in sinks {
        if let Err(err) = sink.handle(event) {
            error!("Error delivering {} to {}: {}", event.beacon_type(), sink.name(), err);
            failures += 1;
        }
    }
    failures
}

type ObserverFn = dyn Fn(&str, &OutboundEvent) + Send;

/// Local, best-effort callback sink. Panics in the callback are caught.
pub struct ObserverSink {
    name: String,
    callback: Box<ObserverFn>,
}

impl ObserverSink {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&str, &OutboundEvent) + Send + 'static,
    {
        ObserverSink {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for ObserverSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSink").field("name", &self.name).finish()
    }
}

impl Sink for ObserverSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, event: &OutboundEvent) -> Result<(), SinkError> {
        catch_unwind(AssertUnwindSafe(|| (self.callback)(event.beacon_type(), event)))
            .map_err(|panic| SinkError::Observer(panic_message(panic.as_ref())))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "callback panicked".to_string()
    }
}

/// Sinks held for the duration of one scan run, in registration order.
///
/// Sinks that failed to acquire stay in place but are skipped. Every
/// acquisition is matched by exactly one release, on
/// [`ActiveSinks::reacquire`], [`ActiveSinks::release_all`] or drop.
pub struct ActiveSinks {
    slots: Vec<Slot>,
    released: bool,
}

struct Slot {
    sink: Box<dyn Sink>,
    acquired: bool,
}

impl Slot {
    fn acquire(&mut self, config: &ConfigSnapshot) {
        match self.sink.acquire(config) {
            Ok(()) => {
                debug!("Acquired sink {}", self.sink.name());
                self.acquired = true;
            }
            Err(err) => {
                warn!("Sink {} unavailable: {}", self.sink.name(), err);
                self.acquired = false;
            }
        }
    }

    fn release(&mut self) {
        if self.acquired {
            debug!("Releasing sink {}", self.sink.name());
            self.sink.release();
            self.acquired = false;
        }
    }
}

impl ActiveSinks {
    pub fn acquire(sinks: Vec<Box<dyn Sink>>, config: &ConfigSnapshot) -> Self {
        let mut slots: Vec<Slot> = sinks
            .into_iter()
            .map(|sink| Slot {
                sink,
                acquired: false,
            })
            .collect();
        for slot in slots.iter_mut() {
            slot.acquire(config);
        }

        ActiveSinks {
            slots,
            released: false,
        }
    }

    /// Release every sink and acquire it again against `config`.
    pub fn reacquire(&mut self, config: &ConfigSnapshot) {
        if self.released {
            return;
        }
        for slot in self.slots.iter_mut() {
            slot.release();
            slot.acquire(config);
        }
    }

    /// Number of acquired sinks.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.acquired).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deliver(&mut self, event: &OutboundEvent) -> usize {
        let acquired = self
            .slots
            .iter_mut()
            .filter(|slot| slot.acquired)
            .map(|slot| &mut slot.sink);
        deliver(event, acquired)
    }

    /// Release every acquired sink and hand back all sinks in registration
    /// order. Later calls return nothing.
    pub fn release_all(&mut self) -> Vec<Box<dyn Sink>> {
        if self.released {
            return Vec::new();
        }
        self.released = true;

        for slot in self.slots.iter_mut() {
            slot.release();
        }
        std::mem::take(&mut self.slots)
            .into_iter()
            .map(|slot| slot.sink)
            .collect()
    }
}

impl Drop for ActiveSinks {
    fn drop(&mut self) {
        self.release_all();
    }
}
