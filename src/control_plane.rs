// The control plane shall:
// - list the measurement-producing nodes currently connected
// - subscribe one (node, service model, definition) tuple and invoke the
//   supplied callback for every report, on the transport's own threads
// - cancel a subscription given the handle it returned
// Implementations: RelayControlPlane (bus_client.rs) talks to a relay over
// TCP, SimulatedControlPlane (simulator.rs) produces reports in-process.

use crate::error::ControlPlaneError;
use crate::measurement::{
    GtpTunnelStats, KpmMetric, MacUeStats, MeasValue, PdcpBearerStats, ReportInterval,
    RlcBearerStats, ServiceModel,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "gnb")]
    Gnb,
    #[serde(rename = "enb")]
    Enb,
    #[serde(rename = "gnb-cu")]
    GnbCu,
    #[serde(rename = "gnb-du")]
    GnbDu,
    #[serde(rename = "other")]
    Other,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Gnb => "gNB",
            NodeType::Enb => "eNB",
            NodeType::GnbCu => "gNB-CU",
            NodeType::GnbDu => "gNB-DU",
            NodeType::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plmn {
    pub mcc: u16,
    pub mnc: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub plmn: Plmn,
    pub nb_id: u64,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}-{:02}/{}", self.plmn.mcc, self.plmn.mnc, self.nb_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_type: NodeType,
    pub id: NodeId,
    /// RAN function ids advertised by the node.
    pub ran_functions: Vec<u16>,
}

impl NodeDescriptor {
    pub fn supports(&self, model: ServiceModel) -> bool {
        self.ran_functions.contains(&model.ran_function_id())
    }
}

/// Test condition applied by the node before reporting a UE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cond", rename_all = "snake_case")]
pub enum MatchingCondition {
    SliceSstEquals { sst: i64 },
}

/// UE-level action definition for the throughput service model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpmActionDefinition {
    pub granularity_period_ms: u32,
    pub measurements: Vec<String>,
    pub matching: Vec<MatchingCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpmSubscription {
    pub report_period_ms: u32,
    pub actions: Vec<KpmActionDefinition>,
}

impl KpmSubscription {
    /// Throughput subscription: every `KpmMetric` for UEs on slice `sst`.
    pub fn throughput(report_period_ms: u32, granularity_period_ms: u32, sst: i64) -> Self {
        KpmSubscription {
            report_period_ms,
            actions: vec![KpmActionDefinition {
                granularity_period_ms,
                measurements: KpmMetric::ALL.iter().map(|m| m.name().to_string()).collect(),
                matching: vec![MatchingCondition::SliceSstEquals { sst }],
            }],
        }
    }

    /// Every measurement name requested by any action.
    pub fn measurement_names(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| a.measurements.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum SubscriptionDefinition {
    Interval(ReportInterval),
    Kpm(KpmSubscription),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacIndication {
    #[serde(default)]
    pub tstamp_us: i64,
    pub ue_stats: Vec<MacUeStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlcIndication {
    pub rb_stats: Vec<RlcBearerStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdcpIndication {
    pub rb_stats: Vec<PdcpBearerStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtpIndication {
    pub tunnels: Vec<GtpTunnelStats>,
}

/// Measurements for one UE: `records[i]` belongs to `measurements[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpmMeasData {
    pub records: Vec<MeasValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpmUeReport {
    pub ue_id: u64,
    pub measurements: Vec<String>,
    pub data: Vec<KpmMeasData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpmIndication {
    pub ue_reports: Vec<KpmUeReport>,
}

/// One report pushed by a node, tagged by the service model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", content = "payload", rename_all = "lowercase")]
pub enum IndicationMessage {
    Mac(MacIndication),
    Rlc(RlcIndication),
    Pdcp(PdcpIndication),
    Gtp(GtpIndication),
    Kpm(KpmIndication),
}

impl IndicationMessage {
    pub fn model(&self) -> ServiceModel {
        match self {
            IndicationMessage::Mac(_) => ServiceModel::Mac,
            IndicationMessage::Rlc(_) => ServiceModel::Rlc,
            IndicationMessage::Pdcp(_) => ServiceModel::Pdcp,
            IndicationMessage::Gtp(_) => ServiceModel::Gtp,
            IndicationMessage::Kpm(_) => ServiceModel::Kpm,
        }
    }

    /// Number of UE / bearer / tunnel entries carried by the report.
    pub fn len(&self) -> usize {
        match self {
            IndicationMessage::Mac(m) => m.ue_stats.len(),
            IndicationMessage::Rlc(m) => m.rb_stats.len(),
            IndicationMessage::Pdcp(m) => m.rb_stats.len(),
            IndicationMessage::Gtp(m) => m.tunnels.len(),
            IndicationMessage::Kpm(m) => m.ue_reports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque id the transport uses to cancel a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type IndicationCallback = Arc<dyn Fn(IndicationMessage) + Send + Sync>;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_connected_nodes(&self) -> Result<Vec<NodeDescriptor>, ControlPlaneError>;

    async fn subscribe(
        &self,
        node: &NodeId,
        model: ServiceModel,
        definition: &SubscriptionDefinition,
        callback: IndicationCallback,
    ) -> Result<RawHandle, ControlPlaneError>;

    async fn unsubscribe(&self, handle: RawHandle) -> Result<(), ControlPlaneError>;
}
