// The stream subscriber shall:
// - subscribe one (node, model) pair per call and record the outcome in a
//   SubscriptionHandle, logging failures without retrying
// - build one report handler per subscription: translate the first UE entry
//   of each report into a LayerUpdate, ignore empty reports, and run the row
//   assembler when the report belongs to the primary layer
// - count received and empty reports per service model
// - unsubscribe every successful handle at shutdown, each bounded by a timeout

use crate::assembler::RowAssembler;
use crate::control_plane::{
    ControlPlane, IndicationCallback, IndicationMessage, KpmIndication, NodeDescriptor, NodeId,
    RawHandle, SubscriptionDefinition,
};
use crate::measurement::{KpmMetric, ServiceModel};
use crate::record_buffer::{LayerUpdate, RecordBuffer};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    Failed(String),
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionStatus::Subscribed => f.write_str("subscribed"),
            SubscriptionStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub node: NodeId,
    pub model: ServiceModel,
    pub status: SubscriptionStatus,
    pub raw: Option<RawHandle>,
}

impl SubscriptionHandle {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Subscribed && self.raw.is_some()
    }
}

const MODEL_SLOTS: usize = 5;

fn slot(model: ServiceModel) -> usize {
    match model {
        ServiceModel::Mac => 0,
        ServiceModel::Rlc => 1,
        ServiceModel::Pdcp => 2,
        ServiceModel::Gtp => 3,
        ServiceModel::Kpm => 4,
    }
}

/// Reports seen per service model, across every node.
#[derive(Debug, Default)]
pub struct ReportCounters {
    received: [AtomicU64; MODEL_SLOTS],
    empty: [AtomicU64; MODEL_SLOTS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCounts {
    pub model: ServiceModel,
    pub received: u64,
    pub empty: u64,
}

impl ReportCounters {
    fn record(&self, model: ServiceModel, empty: bool) {
        self.received[slot(model)].fetch_add(1, Ordering::Relaxed);
        if empty {
            self.empty[slot(model)].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, model: ServiceModel) -> ModelCounts {
        ModelCounts {
            model,
            received: self.received[slot(model)].load(Ordering::Relaxed),
            empty: self.empty[slot(model)].load(Ordering::Relaxed),
        }
    }

    /// Counts for every model that delivered at least one report.
    pub fn snapshot(&self) -> Vec<ModelCounts> {
        ServiceModel::LAYER_STATS
            .into_iter()
            .chain([ServiceModel::Kpm])
            .map(|model| self.get(model))
            .filter(|counts| counts.received > 0)
            .collect()
    }
}

/// Requested measurement names resolved once to typed metrics. Names the
/// collector has no column for are left out and ignored in reports.
#[derive(Debug, Clone, Default)]
struct KpmNameTable {
    metrics: HashMap<String, KpmMetric>,
}

impl KpmNameTable {
    fn from_definition(definition: &SubscriptionDefinition) -> Self {
        let mut metrics = HashMap::new();
        if let SubscriptionDefinition::Kpm(sub) = definition {
            for name in sub.measurement_names() {
                match KpmMetric::from_name(name) {
                    Some(metric) => {
                        metrics.insert(name.to_string(), metric);
                    }
                    None => tracing::warn!(name, "Requested measurement has no dataset column"),
                }
            }
        }
        KpmNameTable { metrics }
    }

    fn resolve(&self, name: &str) -> Option<KpmMetric> {
        self.metrics.get(name).copied()
    }
}

/// Per-subscription callback state.
struct ReportHandler {
    model: ServiceModel,
    buffer: Arc<RecordBuffer>,
    assembler: Option<Arc<RowAssembler>>,
    counters: Arc<ReportCounters>,
    kpm_names: KpmNameTable,
}

impl ReportHandler {
    fn handle(&self, msg: IndicationMessage) {
        if msg.model() != self.model {
            tracing::warn!(
                expected = %self.model,
                got = %msg.model(),
                "Report delivered to the wrong subscription, ignored"
            );
            return;
        }

        let empty = msg.is_empty();
        self.counters.record(self.model, empty);
        if empty {
            tracing::trace!(model = %self.model, "Empty report ignored");
            return;
        }

        let update = match self.to_update(msg) {
            Some(update) => update,
            None => return,
        };
        self.buffer.update(update);

        if let Some(assembler) = &self.assembler {
            assembler.on_primary_report();
        }
    }

    /// Only the first UE / bearer entry of a report is used.
    fn to_update(&self, msg: IndicationMessage) -> Option<LayerUpdate> {
        match msg {
            IndicationMessage::Mac(m) => m.ue_stats.first().copied().map(LayerUpdate::Mac),
            IndicationMessage::Rlc(m) => m.rb_stats.first().copied().map(LayerUpdate::Rlc),
            IndicationMessage::Pdcp(m) => m.rb_stats.first().copied().map(LayerUpdate::Pdcp),
            IndicationMessage::Gtp(_) => None,
            IndicationMessage::Kpm(m) => self.kpm_update(&m),
        }
    }

    fn kpm_update(&self, msg: &KpmIndication) -> Option<LayerUpdate> {
        let report = msg.ue_reports.first()?;
        let mut values = Vec::new();
        // Later measurement periods overwrite earlier ones.
        for data in &report.data {
            for (name, value) in report.measurements.iter().zip(&data.records) {
                if let Some(metric) = self.kpm_names.resolve(name) {
                    values.push((metric, *value));
                }
            }
        }
        if values.is_empty() {
            // The UE still reported; its metrics keep their last values.
            tracing::debug!(ue_id = report.ue_id, "KPM report carried no known measurement");
        }
        Some(LayerUpdate::Kpm(values))
    }
}

pub struct StreamSubscriber {
    control_plane: Arc<dyn ControlPlane>,
    buffer: Arc<RecordBuffer>,
    assembler: Arc<RowAssembler>,
    counters: Arc<ReportCounters>,
}

impl StreamSubscriber {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        buffer: Arc<RecordBuffer>,
        assembler: Arc<RowAssembler>,
    ) -> Self {
        StreamSubscriber {
            control_plane,
            buffer,
            assembler,
            counters: Arc::new(ReportCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<ReportCounters> {
        Arc::clone(&self.counters)
    }

    fn callback_for(
        &self,
        model: ServiceModel,
        definition: &SubscriptionDefinition,
    ) -> IndicationCallback {
        let is_primary = model.layer() == Some(self.assembler.primary());
        let handler = ReportHandler {
            model,
            buffer: Arc::clone(&self.buffer),
            assembler: is_primary.then(|| Arc::clone(&self.assembler)),
            counters: Arc::clone(&self.counters),
            kpm_names: KpmNameTable::from_definition(definition),
        };
        Arc::new(move |msg: IndicationMessage| handler.handle(msg))
    }

    /// The definition is consumed; it is released as soon as the transport
    /// has the request, whatever the outcome.
    pub async fn subscribe(
        &self,
        node: &NodeDescriptor,
        model: ServiceModel,
        definition: SubscriptionDefinition,
    ) -> SubscriptionHandle {
        if !node.supports(model) {
            tracing::warn!(node = %node.id, model = %model, "Node does not advertise this service model");
        }

        let callback = self.callback_for(model, &definition);
        let result = self
            .control_plane
            .subscribe(&node.id, model, &definition, callback)
            .await;
        drop(definition);

        match result {
            Ok(raw) => {
                tracing::info!(node = %node.id, model = %model, handle = %raw, "Subscribed");
                SubscriptionHandle {
                    node: node.id,
                    model,
                    status: SubscriptionStatus::Subscribed,
                    raw: Some(raw),
                }
            }
            Err(e) => {
                tracing::error!(node = %node.id, model = %model, error = %e, "Subscription failed");
                SubscriptionHandle {
                    node: node.id,
                    model,
                    status: SubscriptionStatus::Failed(e.to_string()),
                    raw: None,
                }
            }
        }
    }

    /// Cancel every active handle. Returns how many were cancelled cleanly.
    pub async fn unsubscribe_all(
        &self,
        handles: &[SubscriptionHandle],
        timeout: Duration,
    ) -> usize {
        let mut cancelled = 0;
        for handle in handles {
            let raw = match (handle.is_active(), handle.raw) {
                (true, Some(raw)) => raw,
                _ => continue,
            };
            match tokio::time::timeout(timeout, self.control_plane.unsubscribe(raw)).await {
                Ok(Ok(())) => {
                    tracing::debug!(node = %handle.node, model = %handle.model, "Unsubscribed");
                    cancelled += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(node = %handle.node, model = %handle.model, error = %e, "Unsubscribe failed");
                }
                Err(_) => {
                    tracing::warn!(node = %handle.node, model = %handle.model, "Unsubscribe timed out");
                }
            }
        }
        cancelled
    }
}
