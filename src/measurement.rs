// Measurement types shared by the control plane, the record buffer and the
// dataset writer.
// - ServiceModel: the streams a node can report, with their RAN function ids
// - Layer: the snapshots that contribute columns to a row
// - per-layer statistics as delivered in indication messages
// - KpmMetric: typed measurement names for the throughput service model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceModel {
    Mac,
    Rlc,
    Pdcp,
    Gtp,
    Kpm,
}

impl ServiceModel {
    /// Subscription order used by the controller for every node.
    pub const LAYER_STATS: [ServiceModel; 4] = [
        ServiceModel::Mac,
        ServiceModel::Rlc,
        ServiceModel::Pdcp,
        ServiceModel::Gtp,
    ];

    pub fn ran_function_id(self) -> u16 {
        match self {
            ServiceModel::Mac => 142,
            ServiceModel::Rlc => 143,
            ServiceModel::Pdcp => 144,
            ServiceModel::Gtp => 148,
            ServiceModel::Kpm => 2,
        }
    }

    pub fn from_ran_function_id(id: u16) -> Option<Self> {
        match id {
            142 => Some(ServiceModel::Mac),
            143 => Some(ServiceModel::Rlc),
            144 => Some(ServiceModel::Pdcp),
            148 => Some(ServiceModel::Gtp),
            2 => Some(ServiceModel::Kpm),
            _ => None,
        }
    }

    /// The snapshot this model feeds. GTP reports are counted but carry no
    /// dataset columns.
    pub fn layer(self) -> Option<Layer> {
        match self {
            ServiceModel::Mac => Some(Layer::Mac),
            ServiceModel::Rlc => Some(Layer::Rlc),
            ServiceModel::Pdcp => Some(Layer::Pdcp),
            ServiceModel::Gtp => None,
            ServiceModel::Kpm => Some(Layer::Kpm),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceModel::Mac => "MAC",
            ServiceModel::Rlc => "RLC",
            ServiceModel::Pdcp => "PDCP",
            ServiceModel::Gtp => "GTP",
            ServiceModel::Kpm => "KPM",
        }
    }
}

impl fmt::Display for ServiceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.ran_function_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Mac,
    Rlc,
    Pdcp,
    Kpm,
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mac" => Ok(Layer::Mac),
            "rlc" => Ok(Layer::Rlc),
            "pdcp" => Ok(Layer::Pdcp),
            "kpm" => Ok(Layer::Kpm),
            other => Err(format!("unknown layer '{}'", other)),
        }
    }
}

/// Reporting period for the layer statistics models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportInterval {
    #[serde(rename = "1_ms")]
    Ms1,
    #[serde(rename = "2_ms")]
    Ms2,
    #[serde(rename = "5_ms")]
    Ms5,
    #[default]
    #[serde(rename = "10_ms")]
    Ms10,
    #[serde(rename = "100_ms")]
    Ms100,
    #[serde(rename = "1000_ms")]
    Ms1000,
}

impl ReportInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportInterval::Ms1 => "1_ms",
            ReportInterval::Ms2 => "2_ms",
            ReportInterval::Ms5 => "5_ms",
            ReportInterval::Ms10 => "10_ms",
            ReportInterval::Ms100 => "100_ms",
            ReportInterval::Ms1000 => "1000_ms",
        }
    }

    pub fn period(self) -> Duration {
        let ms = match self {
            ReportInterval::Ms1 => 1,
            ReportInterval::Ms2 => 2,
            ReportInterval::Ms5 => 5,
            ReportInterval::Ms10 => 10,
            ReportInterval::Ms100 => 100,
            ReportInterval::Ms1000 => 1000,
        };
        Duration::from_millis(ms)
    }
}

impl FromStr for ReportInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end_matches("ms").trim_end_matches('_') {
            "1" => Ok(ReportInterval::Ms1),
            "2" => Ok(ReportInterval::Ms2),
            "5" => Ok(ReportInterval::Ms5),
            "10" => Ok(ReportInterval::Ms10),
            "100" => Ok(ReportInterval::Ms100),
            "1000" => Ok(ReportInterval::Ms1000),
            _ => Err(format!(
                "unsupported report interval '{}' (expected 1_ms, 2_ms, 5_ms, 10_ms, 100_ms or 1000_ms)",
                s
            )),
        }
    }
}

impl fmt::Display for ReportInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-UE MAC statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacUeStats {
    pub rnti: u32,
    pub wb_cqi: u8,
    pub pusch_snr: f32,
    pub pucch_snr: f32,
    pub dl_bler: f32,
    pub ul_bler: f32,
    pub dl_mcs1: u8,
    pub dl_mcs2: u8,
    pub ul_mcs1: u8,
    pub ul_mcs2: u8,
    pub dl_curr_tbs: u64,
    pub ul_curr_tbs: u64,
    pub dl_aggr_tbs: u64,
    pub ul_aggr_tbs: u64,
    pub dl_aggr_prb: u32,
    pub ul_aggr_prb: u32,
    pub dl_sched_rb: u32,
    pub ul_sched_rb: u32,
    pub bsr: u32,
    pub phr: i8,
    pub frame: u16,
    pub slot: u16,
}

/// Per-radio-bearer RLC statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcBearerStats {
    pub rnti: u32,
    pub txpdu_pkts: u32,
    pub txpdu_bytes: u32,
    pub rxpdu_pkts: u32,
    pub rxpdu_bytes: u32,
    pub txbuf_occ_bytes: u32,
    pub rxbuf_occ_bytes: u32,
    pub txpdu_retx_pkts: u32,
}

/// Per-radio-bearer PDCP statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdcpBearerStats {
    pub rnti: u32,
    pub txpdu_pkts: u32,
    pub txpdu_bytes: u32,
    pub rxpdu_pkts: u32,
    pub rxpdu_bytes: u32,
}

/// Per-tunnel GTP statistics. Only counted, never written to the dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GtpTunnelStats {
    pub rnti: u32,
    pub teid_gnb: u32,
    pub teid_upf: u32,
    pub qfi: u8,
}

/// Measurements requested from the throughput service model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KpmMetric {
    UeThpDl,
    UeThpUl,
    RlcSduDelayDl,
    PdcpSduVolumeDl,
    PdcpSduVolumeUl,
    PrbTotDl,
    PrbTotUl,
}

impl KpmMetric {
    pub const ALL: [KpmMetric; 7] = [
        KpmMetric::UeThpDl,
        KpmMetric::UeThpUl,
        KpmMetric::RlcSduDelayDl,
        KpmMetric::PdcpSduVolumeDl,
        KpmMetric::PdcpSduVolumeUl,
        KpmMetric::PrbTotDl,
        KpmMetric::PrbTotUl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KpmMetric::UeThpDl => "DRB.UEThpDl",
            KpmMetric::UeThpUl => "DRB.UEThpUl",
            KpmMetric::RlcSduDelayDl => "DRB.RlcSduDelayDl",
            KpmMetric::PdcpSduVolumeDl => "DRB.PdcpSduVolumeDL",
            KpmMetric::PdcpSduVolumeUl => "DRB.PdcpSduVolumeUL",
            KpmMetric::PrbTotDl => "RRU.PrbTotDl",
            KpmMetric::PrbTotUl => "RRU.PrbTotUl",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        KpmMetric::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// One measurement record value; the node tags each value as real or integer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MeasValue {
    Real(f64),
    Integer(i64),
}

/// Latest throughput-model values. Real-valued metrics take `Real` records
/// and counters take `Integer` records; a mismatched kind is ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KpmThroughput {
    pub dl_thp_kbps: f64,
    pub ul_thp_kbps: f64,
    pub rlc_sdu_delay_us: f64,
    pub pdcp_sdu_vol_dl_kb: i32,
    pub pdcp_sdu_vol_ul_kb: i32,
    pub prb_tot_dl: i32,
    pub prb_tot_ul: i32,
}

impl KpmThroughput {
    /// Returns false when the value kind does not match the metric.
    pub fn apply(&mut self, metric: KpmMetric, value: MeasValue) -> bool {
        match (metric, value) {
            (KpmMetric::UeThpDl, MeasValue::Real(v)) => self.dl_thp_kbps = v,
            (KpmMetric::UeThpUl, MeasValue::Real(v)) => self.ul_thp_kbps = v,
            (KpmMetric::RlcSduDelayDl, MeasValue::Real(v)) => self.rlc_sdu_delay_us = v,
            (KpmMetric::PdcpSduVolumeDl, MeasValue::Integer(v)) => {
                self.pdcp_sdu_vol_dl_kb = saturate_i32(v)
            }
            (KpmMetric::PdcpSduVolumeUl, MeasValue::Integer(v)) => {
                self.pdcp_sdu_vol_ul_kb = saturate_i32(v)
            }
            (KpmMetric::PrbTotDl, MeasValue::Integer(v)) => self.prb_tot_dl = saturate_i32(v),
            (KpmMetric::PrbTotUl, MeasValue::Integer(v)) => self.prb_tot_ul = saturate_i32(v),
            _ => return false,
        }
        true
    }
}

fn saturate_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ran_function_ids_round_trip() {
        for model in [
            ServiceModel::Mac,
            ServiceModel::Rlc,
            ServiceModel::Pdcp,
            ServiceModel::Gtp,
            ServiceModel::Kpm,
        ] {
            assert_eq!(
                ServiceModel::from_ran_function_id(model.ran_function_id()),
                Some(model)
            );
        }
        assert_eq!(ServiceModel::from_ran_function_id(999), None);
        assert_eq!(ServiceModel::Gtp.layer(), None);
    }

    #[test]
    fn test_report_interval_parsing() {
        assert_eq!("10_ms".parse::<ReportInterval>(), Ok(ReportInterval::Ms10));
        assert_eq!("100ms".parse::<ReportInterval>(), Ok(ReportInterval::Ms100));
        assert_eq!("1000".parse::<ReportInterval>(), Ok(ReportInterval::Ms1000));
        assert!("7_ms".parse::<ReportInterval>().is_err());
        assert_eq!(ReportInterval::Ms5.period(), Duration::from_millis(5));
    }

    #[test]
    fn test_kpm_metric_names() {
        assert_eq!(KpmMetric::from_name("DRB.UEThpDl"), Some(KpmMetric::UeThpDl));
        assert_eq!(KpmMetric::from_name("RRU.PrbTotUl"), Some(KpmMetric::PrbTotUl));
        // Names are matched exactly, no prefix matching.
        assert_eq!(KpmMetric::from_name("DRB.UEThp"), None);
        assert_eq!(KpmMetric::from_name("drb.uethpdl"), None);
    }

    #[test]
    fn test_kpm_apply_checks_value_kind() {
        let mut thp = KpmThroughput::default();
        assert!(thp.apply(KpmMetric::UeThpDl, MeasValue::Real(1234.5)));
        assert!(thp.apply(KpmMetric::PrbTotDl, MeasValue::Integer(52)));
        assert!(!thp.apply(KpmMetric::PrbTotUl, MeasValue::Real(3.0)));
        assert!(!thp.apply(KpmMetric::UeThpUl, MeasValue::Integer(7)));

        assert_eq!(thp.dl_thp_kbps, 1234.5);
        assert_eq!(thp.prb_tot_dl, 52);
        assert_eq!(thp.prb_tot_ul, 0);
        assert_eq!(thp.ul_thp_kbps, 0.0);
    }

    #[test]
    fn test_kpm_integer_saturates() {
        let mut thp = KpmThroughput::default();
        thp.apply(KpmMetric::PdcpSduVolumeDl, MeasValue::Integer(i64::MAX));
        assert_eq!(thp.pdcp_sdu_vol_dl_kb, i32::MAX);
    }
}
