use crate::dataset_writer::{AppendOutcome, DatasetSchema, DatasetWriter, Row};
use crate::measurement::Layer;
use crate::record_buffer::RecordBuffer;
use crate::stop::StopSignal;
use std::sync::Arc;

/// Default number of rows between progress lines.
pub const DEFAULT_PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// Row appended; carries the sample count.
    Written(u64),
    /// Primary snapshot already consumed, nothing to do.
    NotReady,
    /// Row built but dropped (stop requested or row limit reached).
    Discarded,
    /// The writer returned an error; logged and absorbed.
    Failed,
}

/// Turns a primary-layer report into a dataset row.
pub struct RowAssembler {
    buffer: Arc<RecordBuffer>,
    writer: Arc<DatasetWriter>,
    primary: Layer,
    stop: StopSignal,
    progress_every: u64,
}

impl RowAssembler {
    pub fn new(
        buffer: Arc<RecordBuffer>,
        writer: Arc<DatasetWriter>,
        primary: Layer,
        stop: StopSignal,
        progress_every: u64,
    ) -> Self {
        RowAssembler {
            buffer,
            writer,
            primary,
            stop,
            progress_every: progress_every.max(1),
        }
    }

    pub fn primary(&self) -> Layer {
        self.primary
    }

    /// Runs on the primary stream's delivery thread, right after the buffer
    /// has been updated with that report.
    pub fn on_primary_report(&self) -> AssembleOutcome {
        let fields = match self.buffer.consume_primary(self.primary) {
            Some(fields) => fields,
            None => return AssembleOutcome::NotReady,
        };
        let row = Row {
            timestamp_us: chrono::Utc::now().timestamp_micros(),
            fields,
        };

        if self.stop.is_interrupted() {
            self.writer.record_discard();
            tracing::debug!("Row discarded, stop requested");
            return AssembleOutcome::Discarded;
        }

        let outcome = match self.writer.append(&row) {
            Ok(AppendOutcome::Written(samples)) => {
                if samples % self.progress_every == 0 {
                    self.log_progress(samples, &row);
                }
                AssembleOutcome::Written(samples)
            }
            Ok(AppendOutcome::Discarded) => {
                tracing::debug!("Row discarded, row limit reached");
                AssembleOutcome::Discarded
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to append row");
                AssembleOutcome::Failed
            }
        };
        self.stop.wake();
        outcome
    }

    fn log_progress(&self, samples: u64, row: &Row) {
        let mac = &row.fields.mac;
        match self.writer.schema() {
            DatasetSchema::LayerStats => tracing::info!(
                samples,
                cqi = mac.wb_cqi,
                snr = %format!("{:.1}", mac.pusch_snr),
                bler = %format!("{:.4}", mac.dl_bler),
                dl_tbs = mac.dl_curr_tbs,
                dl_prb = mac.dl_aggr_prb,
                "Collecting"
            ),
            DatasetSchema::Throughput => {
                let kpm = &row.fields.kpm;
                tracing::info!(
                    samples,
                    cqi = mac.wb_cqi,
                    snr = %format!("{:.1}", mac.pusch_snr),
                    bler = %format!("{:.4}", mac.dl_bler),
                    dl_thp_kbps = %format!("{:.1}", kpm.dl_thp_kbps),
                    ul_thp_kbps = %format!("{:.1}", kpm.ul_thp_kbps),
                    dl_prb = kpm.prb_tot_dl,
                    "Collecting"
                )
            }
        }
    }
}
