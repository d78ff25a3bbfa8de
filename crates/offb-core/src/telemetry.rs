use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::types::VehicleState;

/// Latest vehicle-state snapshot, shared between the delivery path and the
/// control loop.
///
/// The whole snapshot is copied under one lock so a reader never sees fields
/// from two different deliveries. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct TelemetryCache {
    inner: Arc<Mutex<VehicleState>>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached snapshot. No validation: a disconnected snapshot
    /// is stored as-is. The stamp never moves backwards.
    pub fn update(&self, mut snapshot: VehicleState) {
        let mut cur = self.lock();
        if let (Some(old), Some(new)) = (cur.stamp, snapshot.stamp) {
            if new < old {
                snapshot.stamp = Some(old);
            }
        } else if snapshot.stamp.is_none() {
            snapshot.stamp = cur.stamp;
        }
        *cur = snapshot;
    }

    pub fn read(&self) -> VehicleState {
        *self.lock()
    }

    // A panicking writer cannot leave a half-written Copy value behind.
    fn lock(&self) -> MutexGuard<'_, VehicleState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Something that delivers vehicle-state snapshots.
pub trait TelemetrySource {
    /// Apply every pending delivery to `cache` without blocking.
    /// Returns how many snapshots were applied.
    fn drain_into(&mut self, cache: &TelemetryCache) -> usize;
}

/// Telemetry source backed by an mpsc channel; the sending half lives on
/// whatever thread decodes the vehicle's messages.
pub struct ChannelTelemetry {
    rx: Receiver<VehicleState>,
    closed: bool,
}

impl ChannelTelemetry {
    pub fn new(rx: Receiver<VehicleState>) -> Self {
        Self { rx, closed: false }
    }

    /// True once every sender has been dropped.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl TelemetrySource for ChannelTelemetry {
    fn drain_into(&mut self, cache: &TelemetryCache) -> usize {
        let mut n = 0;
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => {
                    cache.update(snapshot);
                    n += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        debug!("telemetry: delivery channel closed");
                        self.closed = true;
                    }
                    break;
                }
            }
        }
        n
    }
}
