// The simulated control plane shall:
// - advertise a fixed list of nodes
// - accept subscriptions, failing the ones for models it was told to fail
// - when generating, run one periodic task per subscription that timestamps
//   a synthetic report and hands it to the subscription's callback
// - otherwise leave delivery to the caller through deliver()
// - stop a subscription's task when it is cancelled

use crate::control_plane::{
    ControlPlane, GtpIndication, IndicationCallback, IndicationMessage, KpmIndication,
    KpmMeasData, KpmUeReport, MacIndication, NodeDescriptor, NodeId, NodeType, PdcpIndication,
    Plmn, RawHandle, RlcIndication, SubscriptionDefinition,
};
use crate::error::ControlPlaneError;
use crate::measurement::{
    GtpTunnelStats, KpmMetric, MacUeStats, MeasValue, PdcpBearerStats, RlcBearerStats,
    ServiceModel,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

const SIM_RNTI: u32 = 0x4601;

struct SimSubscription {
    node: NodeId,
    model: ServiceModel,
    /// Target of `deliver`.
    #[cfg(test)]
    callback: IndicationCallback,
    generator: Option<JoinHandle<()>>,
}

pub struct SimulatedControlPlane {
    nodes: Vec<NodeDescriptor>,
    failing: Mutex<HashSet<ServiceModel>>,
    subscriptions: Mutex<HashMap<u64, SimSubscription>>,
    next_handle: AtomicU64,
    generate: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SimulatedControlPlane {
    /// Reports are only produced by [`SimulatedControlPlane::deliver`].
    pub fn new(nodes: Vec<NodeDescriptor>) -> Self {
        SimulatedControlPlane {
            nodes,
            failing: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            generate: false,
        }
    }

    /// Every subscription gets a task producing reports at its period.
    pub fn generating(nodes: Vec<NodeDescriptor>) -> Self {
        let mut sim = Self::new(nodes);
        sim.generate = true;
        sim
    }

    /// One gNB advertising every service model the collector uses.
    pub fn default_nodes() -> Vec<NodeDescriptor> {
        vec![NodeDescriptor {
            node_type: NodeType::Gnb,
            id: NodeId {
                plmn: Plmn { mcc: 1, mnc: 1 },
                nb_id: 3584,
            },
            ran_functions: ServiceModel::LAYER_STATS
                .iter()
                .chain([ServiceModel::Kpm].iter())
                .map(|m| m.ran_function_id())
                .collect(),
        }]
    }

    #[cfg(test)]
    pub fn fail_model(&self, model: ServiceModel) {
        lock(&self.failing).insert(model);
    }

    #[cfg(test)]
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Hand `msg` to every callback subscribed to `model`, on the calling
    /// thread. Returns the number of callbacks run.
    #[cfg(test)]
    pub fn deliver(&self, model: ServiceModel, msg: IndicationMessage) -> usize {
        let callbacks: Vec<IndicationCallback> = lock(&self.subscriptions)
            .values()
            .filter(|sub| sub.model == model)
            .map(|sub| sub.callback.clone())
            .collect();
        for callback in &callbacks {
            callback(msg.clone());
        }
        callbacks.len()
    }

    fn spawn_generator(
        model: ServiceModel,
        period: Duration,
        callback: IndicationCallback,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                let tstamp_us = chrono::Utc::now().timestamp_micros();
                callback(synthetic_report(model, tick, tstamp_us));
                tick = tick.wrapping_add(1);
            }
        })
    }
}

fn report_period(definition: &SubscriptionDefinition) -> Duration {
    match definition {
        SubscriptionDefinition::Interval(interval) => interval.period(),
        SubscriptionDefinition::Kpm(sub) => {
            Duration::from_millis(sub.report_period_ms.max(1) as u64)
        }
    }
}

/// Deterministic report for one tick of a generator.
pub fn synthetic_report(model: ServiceModel, tick: u64, tstamp_us: i64) -> IndicationMessage {
    let t = tick as u32;
    match model {
        ServiceModel::Mac => IndicationMessage::Mac(MacIndication {
            tstamp_us,
            ue_stats: vec![MacUeStats {
                rnti: SIM_RNTI,
                wb_cqi: 9 + (t % 7) as u8,
                pusch_snr: 18.0 + (t % 10) as f32 * 0.5,
                pucch_snr: 15.0 + (t % 4) as f32,
                dl_bler: (t % 5) as f32 * 0.01,
                ul_bler: (t % 3) as f32 * 0.02,
                dl_mcs1: 20 + (t % 8) as u8,
                dl_mcs2: 0,
                ul_mcs1: 9 + (t % 4) as u8,
                ul_mcs2: 0,
                dl_curr_tbs: 3_000 + (t % 50) as u64 * 10,
                ul_curr_tbs: 600 + (t % 20) as u64 * 5,
                dl_aggr_tbs: tick.wrapping_mul(3_200),
                ul_aggr_tbs: tick.wrapping_mul(640),
                dl_aggr_prb: t.wrapping_mul(48),
                ul_aggr_prb: t.wrapping_mul(6),
                dl_sched_rb: 48,
                ul_sched_rb: 6,
                bsr: t % 16,
                phr: 20 - (t % 30) as i8,
                frame: (t % 1024) as u16,
                slot: (t % 20) as u16,
            }],
        }),
        ServiceModel::Rlc => IndicationMessage::Rlc(RlcIndication {
            rb_stats: vec![RlcBearerStats {
                rnti: SIM_RNTI,
                txpdu_pkts: t.wrapping_mul(4),
                txpdu_bytes: t.wrapping_mul(4_800),
                rxpdu_pkts: t,
                rxpdu_bytes: t.wrapping_mul(120),
                txbuf_occ_bytes: (t % 8) * 1_500,
                rxbuf_occ_bytes: 0,
                txpdu_retx_pkts: t / 50,
            }],
        }),
        ServiceModel::Pdcp => IndicationMessage::Pdcp(PdcpIndication {
            rb_stats: vec![PdcpBearerStats {
                rnti: SIM_RNTI,
                txpdu_pkts: t.wrapping_mul(4),
                txpdu_bytes: t.wrapping_mul(4_900),
                rxpdu_pkts: t,
                rxpdu_bytes: t.wrapping_mul(130),
            }],
        }),
        ServiceModel::Gtp => IndicationMessage::Gtp(GtpIndication {
            tunnels: vec![GtpTunnelStats {
                rnti: SIM_RNTI,
                teid_gnb: 1,
                teid_upf: 1,
                qfi: 1,
            }],
        }),
        ServiceModel::Kpm => {
            let records = KpmMetric::ALL
                .iter()
                .map(|metric| match metric {
                    KpmMetric::UeThpDl => MeasValue::Real(20_000.0 + (t % 100) as f64 * 12.5),
                    KpmMetric::UeThpUl => MeasValue::Real(2_000.0 + (t % 40) as f64 * 3.0),
                    KpmMetric::RlcSduDelayDl => MeasValue::Real(150.0 + (t % 9) as f64),
                    KpmMetric::PdcpSduVolumeDl => MeasValue::Integer(250 + (t % 25) as i64),
                    KpmMetric::PdcpSduVolumeUl => MeasValue::Integer(25 + (t % 5) as i64),
                    KpmMetric::PrbTotDl => MeasValue::Integer(40 + (t % 12) as i64),
                    KpmMetric::PrbTotUl => MeasValue::Integer(4 + (t % 3) as i64),
                })
                .collect();
            IndicationMessage::Kpm(KpmIndication {
                ue_reports: vec![KpmUeReport {
                    ue_id: SIM_RNTI as u64,
                    measurements: KpmMetric::ALL.iter().map(|m| m.name().to_string()).collect(),
                    data: vec![KpmMeasData { records }],
                }],
            })
        }
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn list_connected_nodes(&self) -> Result<Vec<NodeDescriptor>, ControlPlaneError> {
        Ok(self.nodes.clone())
    }

    async fn subscribe(
        &self,
        node: &NodeId,
        model: ServiceModel,
        definition: &SubscriptionDefinition,
        callback: IndicationCallback,
    ) -> Result<RawHandle, ControlPlaneError> {
        if !self.nodes.iter().any(|n| n.id == *node) {
            return Err(ControlPlaneError::Rejected(format!("unknown node {}", node)));
        }
        if lock(&self.failing).contains(&model) {
            return Err(ControlPlaneError::Rejected(format!(
                "{} subscription refused by node {}",
                model, node
            )));
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let generator = self
            .generate
            .then(|| Self::spawn_generator(model, report_period(definition), callback.clone()));
        lock(&self.subscriptions).insert(
            id,
            SimSubscription {
                node: *node,
                model,
                #[cfg(test)]
                callback,
                generator,
            },
        );
        Ok(RawHandle(id))
    }

    async fn unsubscribe(&self, handle: RawHandle) -> Result<(), ControlPlaneError> {
        let sub = lock(&self.subscriptions)
            .remove(&handle.0)
            .ok_or(ControlPlaneError::UnknownHandle(handle.0))?;
        if let Some(generator) = sub.generator {
            generator.abort();
        }
        tracing::debug!(node = %sub.node, model = %sub.model, "Simulated subscription cancelled");
        Ok(())
    }
}

impl Drop for SimulatedControlPlane {
    fn drop(&mut self) {
        for sub in lock(&self.subscriptions).values() {
            if let Some(generator) = &sub.generator {
                generator.abort();
            }
        }
    }
}
