// The record buffer shall:
// - hold the latest snapshot of every layer, with a validity flag per layer
// - guard all layers with one lock, held only while fields are copied
// - update(): overwrite one layer and mark it valid
// - consume_primary(): read every layer, clear only the primary layer's flag
// Secondary layers are read on a last-known-value basis whatever their flag;
// a layer that never reported reads as all zeroes.

use crate::measurement::{
    KpmMetric, KpmThroughput, Layer, MacUeStats, MeasValue, PdcpBearerStats, RlcBearerStats,
};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot<T> {
    fields: T,
    valid: bool,
}

impl<T> Snapshot<T> {
    fn set(&mut self, fields: T) {
        self.fields = fields;
        self.valid = true;
    }
}

#[derive(Debug, Default)]
struct Snapshots {
    mac: Snapshot<MacUeStats>,
    rlc: Snapshot<RlcBearerStats>,
    pdcp: Snapshot<PdcpBearerStats>,
    kpm: Snapshot<KpmThroughput>,
}

impl Snapshots {
    fn valid_flag(&mut self, layer: Layer) -> &mut bool {
        match layer {
            Layer::Mac => &mut self.mac.valid,
            Layer::Rlc => &mut self.rlc.valid,
            Layer::Pdcp => &mut self.pdcp.valid,
            Layer::Kpm => &mut self.kpm.valid,
        }
    }
}

/// Fields from one report, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerUpdate {
    Mac(MacUeStats),
    Rlc(RlcBearerStats),
    Pdcp(PdcpBearerStats),
    /// Only the listed metrics change; the others keep their last value.
    Kpm(Vec<(KpmMetric, MeasValue)>),
}

/// Every layer's fields at the moment the primary layer was consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RowFields {
    pub mac: MacUeStats,
    pub rlc: RlcBearerStats,
    pub pdcp: PdcpBearerStats,
    pub kpm: KpmThroughput,
}

#[derive(Debug, Default)]
pub struct RecordBuffer {
    snapshots: Mutex<Snapshots>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshots> {
        // A panicking callback must not stop every other layer from reporting.
        match self.snapshots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn update(&self, update: LayerUpdate) {
        let mut snapshots = self.lock();
        match update {
            LayerUpdate::Mac(stats) => snapshots.mac.set(stats),
            LayerUpdate::Rlc(stats) => snapshots.rlc.set(stats),
            LayerUpdate::Pdcp(stats) => snapshots.pdcp.set(stats),
            LayerUpdate::Kpm(values) => {
                for (metric, value) in values {
                    snapshots.kpm.fields.apply(metric, value);
                }
                snapshots.kpm.valid = true;
            }
        }
    }

    /// Returns `None` without touching anything when the primary layer has
    /// not reported since the last consumption.
    pub fn consume_primary(&self, primary: Layer) -> Option<RowFields> {
        let mut snapshots = self.lock();
        let valid = snapshots.valid_flag(primary);
        if !*valid {
            return None;
        }
        *valid = false;

        Some(RowFields {
            mac: snapshots.mac.fields,
            rlc: snapshots.rlc.fields,
            pdcp: snapshots.pdcp.fields,
            kpm: snapshots.kpm.fields,
        })
    }

    #[cfg(test)]
    pub fn is_valid(&self, layer: Layer) -> bool {
        *self.lock().valid_flag(layer)
    }
}

/*
-------------------------------------------------
Tests
-------------------------------------------------
*/
