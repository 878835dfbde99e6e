//! Append-only CSV dataset.
//!
//! The header is written once when the file is opened. Every [`Row`] is
//! serialized in header order with fixed precision: two decimals for dB and
//! throughput/delay reals, four decimals for ratios, integers elsewhere.
//!
//! One mutex guards the file and the sample counter; the counter itself is an
//! atomic so the controller can read it without taking the lock.

use crate::error::DatasetError;
use crate::record_buffer::RowFields;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Default number of rows between forced flushes.
pub const DEFAULT_FLUSH_EVERY: u64 = 100;

const LAYER_STATS_COLUMNS: [&str; 34] = [
    "timestamp",
    "rnti",
    "cqi",
    "pusch_snr",
    "pucch_snr",
    "dl_bler",
    "ul_bler",
    "dl_mcs1",
    "dl_mcs2",
    "ul_mcs1",
    "ul_mcs2",
    "dl_tbs",
    "ul_tbs",
    "dl_aggr_tbs",
    "ul_aggr_tbs",
    "dl_prb",
    "ul_prb",
    "dl_sched_rb",
    "ul_sched_rb",
    "bsr",
    "phr",
    "frame",
    "slot",
    "rlc_tx_pkts",
    "rlc_tx_bytes",
    "rlc_rx_pkts",
    "rlc_rx_bytes",
    "rlc_txbuf",
    "rlc_rxbuf",
    "rlc_retx",
    "pdcp_tx_pkts",
    "pdcp_tx_bytes",
    "pdcp_rx_pkts",
    "pdcp_rx_bytes",
];

const THROUGHPUT_COLUMNS: [&str; 7] = [
    "dl_thp_kbps",
    "ul_thp_kbps",
    "rlc_sdu_delay_us",
    "pdcp_vol_dl_kb",
    "pdcp_vol_ul_kb",
    "prb_tot_dl",
    "prb_tot_ul",
];

/// Column layout of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSchema {
    /// MAC + RLC + PDCP columns.
    #[default]
    LayerStats,
    /// Layer statistics followed by the throughput service model columns.
    Throughput,
}

impl DatasetSchema {
    pub fn columns(self) -> Vec<&'static str> {
        let mut columns = LAYER_STATS_COLUMNS.to_vec();
        if self == DatasetSchema::Throughput {
            columns.extend_from_slice(&THROUGHPUT_COLUMNS);
        }
        columns
    }

    #[cfg(test)]
    pub fn header_line(self) -> String {
        self.columns().join(",")
    }
}

/// One assembled sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Row {
    /// Capture time, UTC microseconds.
    pub timestamp_us: i64,
    pub fields: RowFields,
}

impl Row {
    pub fn to_record(&self, schema: DatasetSchema) -> Vec<String> {
        let RowFields { mac, rlc, pdcp, kpm } = &self.fields;
        let mut record = vec![
            self.timestamp_us.to_string(),
            mac.rnti.to_string(),
            mac.wb_cqi.to_string(),
            format!("{:.2}", mac.pusch_snr),
            format!("{:.2}", mac.pucch_snr),
            format!("{:.4}", mac.dl_bler),
            format!("{:.4}", mac.ul_bler),
            mac.dl_mcs1.to_string(),
            mac.dl_mcs2.to_string(),
            mac.ul_mcs1.to_string(),
            mac.ul_mcs2.to_string(),
            mac.dl_curr_tbs.to_string(),
            mac.ul_curr_tbs.to_string(),
            mac.dl_aggr_tbs.to_string(),
            mac.ul_aggr_tbs.to_string(),
            mac.dl_aggr_prb.to_string(),
            mac.ul_aggr_prb.to_string(),
            mac.dl_sched_rb.to_string(),
            mac.ul_sched_rb.to_string(),
            mac.bsr.to_string(),
            mac.phr.to_string(),
            mac.frame.to_string(),
            mac.slot.to_string(),
            rlc.txpdu_pkts.to_string(),
            rlc.txpdu_bytes.to_string(),
            rlc.rxpdu_pkts.to_string(),
            rlc.rxpdu_bytes.to_string(),
            rlc.txbuf_occ_bytes.to_string(),
            rlc.rxbuf_occ_bytes.to_string(),
            rlc.txpdu_retx_pkts.to_string(),
            pdcp.txpdu_pkts.to_string(),
            pdcp.txpdu_bytes.to_string(),
            pdcp.rxpdu_pkts.to_string(),
            pdcp.rxpdu_bytes.to_string(),
        ];
        if schema == DatasetSchema::Throughput {
            record.extend([
                format!("{:.2}", kpm.dl_thp_kbps),
                format!("{:.2}", kpm.ul_thp_kbps),
                format!("{:.2}", kpm.rlc_sdu_delay_us),
                kpm.pdcp_sdu_vol_dl_kb.to_string(),
                kpm.pdcp_sdu_vol_ul_kb.to_string(),
                kpm.prb_tot_dl.to_string(),
                kpm.prb_tot_ul.to_string(),
            ]);
        }
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Row written; carries the sample count including this row.
    Written(u64),
    /// Row limit already reached, nothing written.
    Discarded,
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub flush_every: u64,
    /// Rows beyond this count are discarded and counted.
    pub row_limit: Option<u64>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            flush_every: DEFAULT_FLUSH_EVERY,
            row_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub discarded: u64,
}

struct OpenFile {
    csv: csv::Writer<File>,
    since_flush: u64,
}

impl OpenFile {
    fn flush(&mut self) -> Result<(), DatasetError> {
        self.csv.flush()?;
        self.csv.get_ref().sync_data()?;
        self.since_flush = 0;
        Ok(())
    }
}

pub struct DatasetWriter {
    path: PathBuf,
    schema: DatasetSchema,
    options: WriterOptions,
    file: Mutex<Option<OpenFile>>,
    samples: AtomicU64,
    discarded: AtomicU64,
}

impl DatasetWriter {
    /// Create (or truncate) `path` and write the header line.
    pub fn open(
        path: impl AsRef<Path>,
        schema: DatasetSchema,
        options: WriterOptions,
    ) -> Result<Self, DatasetError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| DatasetError::Create {
            path: path.clone(),
            source,
        })?;

        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        csv.write_record(schema.columns())?;
        csv.flush()?;

        tracing::debug!(path = %path.display(), ?schema, "Dataset header written");
        Ok(DatasetWriter {
            path,
            schema,
            options: WriterOptions {
                flush_every: options.flush_every.max(1),
                ..options
            },
            file: Mutex::new(Some(OpenFile {
                csv,
                since_flush: 0,
            })),
            samples: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenFile>> {
        match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn append(&self, row: &Row) -> Result<AppendOutcome, DatasetError> {
        let mut guard = self.lock();
        let file = guard.as_mut().ok_or(DatasetError::Closed)?;

        let written = self.samples.load(Ordering::Acquire);
        if self.options.row_limit.is_some_and(|limit| written >= limit) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return Ok(AppendOutcome::Discarded);
        }

        file.csv.write_record(row.to_record(self.schema))?;
        let count = written + 1;
        self.samples.store(count, Ordering::Release);

        file.since_flush += 1;
        if file.since_flush >= self.options.flush_every {
            // The row is already counted; the next flush or close retries.
            if let Err(e) = file.flush() {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Periodic dataset flush failed"
                );
            }
        }
        Ok(AppendOutcome::Written(count))
    }

    /// Count a row that was dropped before reaching the file.
    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows written so far. Lock-free; may lag an in-flight append.
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn schema(&self) -> DatasetSchema {
        self.schema
    }

    /// Final flush, then release the file. Later appends fail with `Closed`.
    pub fn close(&self) -> Result<DatasetSummary, DatasetError> {
        let mut guard = self.lock();
        let mut file = guard.take().ok_or(DatasetError::Closed)?;
        file.csv.flush()?;
        file.csv.get_ref().sync_all()?;
        drop(file);

        Ok(DatasetSummary {
            path: self.path.clone(),
            rows: self.sample_count(),
            discarded: self.discarded_count(),
        })
    }
}

impl std::fmt::Debug for DatasetWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetWriter")
            .field("path", &self.path)
            .field("schema", &self.schema)
            .field("samples", &self.sample_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{KpmThroughput, MacUeStats, PdcpBearerStats, RlcBearerStats};
    use std::sync::Arc;

    const LAYER_STATS_HEADER: &str = "timestamp,rnti,cqi,pusch_snr,pucch_snr,dl_bler,ul_bler,dl_mcs1,dl_mcs2,ul_mcs1,ul_mcs2,dl_tbs,ul_tbs,dl_aggr_tbs,ul_aggr_tbs,dl_prb,ul_prb,dl_sched_rb,ul_sched_rb,bsr,phr,frame,slot,rlc_tx_pkts,rlc_tx_bytes,rlc_rx_pkts,rlc_rx_bytes,rlc_txbuf,rlc_rxbuf,rlc_retx,pdcp_tx_pkts,pdcp_tx_bytes,pdcp_rx_pkts,pdcp_rx_bytes";

    fn sample_row() -> Row {
        Row {
            timestamp_us: 1_700_000_000_123_456,
            fields: RowFields {
                mac: MacUeStats {
                    rnti: 17921,
                    wb_cqi: 15,
                    pusch_snr: 24.567,
                    pucch_snr: 19.0,
                    dl_bler: 0.012345,
                    ul_bler: 0.5,
                    dl_mcs1: 27,
                    dl_mcs2: 0,
                    ul_mcs1: 9,
                    ul_mcs2: 0,
                    dl_curr_tbs: 3240,
                    ul_curr_tbs: 1200,
                    dl_aggr_tbs: 987_654_321,
                    ul_aggr_tbs: 12_345,
                    dl_aggr_prb: 106,
                    ul_aggr_prb: 5,
                    dl_sched_rb: 50,
                    ul_sched_rb: 2,
                    bsr: 3,
                    phr: -4,
                    frame: 512,
                    slot: 19,
                },
                rlc: RlcBearerStats {
                    rnti: 17921,
                    txpdu_pkts: 10,
                    txpdu_bytes: 11,
                    rxpdu_pkts: 12,
                    rxpdu_bytes: 13,
                    txbuf_occ_bytes: 14,
                    rxbuf_occ_bytes: 15,
                    txpdu_retx_pkts: 16,
                },
                pdcp: PdcpBearerStats {
                    rnti: 17921,
                    txpdu_pkts: 20,
                    txpdu_bytes: 21,
                    rxpdu_pkts: 22,
                    rxpdu_bytes: 23,
                },
                kpm: KpmThroughput {
                    dl_thp_kbps: 1523.456,
                    ul_thp_kbps: 88.0,
                    rlc_sdu_delay_us: 12.5,
                    pdcp_sdu_vol_dl_kb: 400,
                    pdcp_sdu_vol_ul_kb: 30,
                    prb_tot_dl: 52,
                    prb_tot_ul: 7,
                },
            },
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_layer_stats_header_is_fixed() {
        assert_eq!(DatasetSchema::LayerStats.header_line(), LAYER_STATS_HEADER);
        assert_eq!(DatasetSchema::LayerStats.columns().len(), 34);

        let throughput = DatasetSchema::Throughput.header_line();
        assert!(throughput.starts_with(LAYER_STATS_HEADER));
        assert!(throughput.ends_with(
            "dl_thp_kbps,ul_thp_kbps,rlc_sdu_delay_us,pdcp_vol_dl_kb,pdcp_vol_ul_kb,prb_tot_dl,prb_tot_ul"
        ));
        assert_eq!(DatasetSchema::Throughput.columns().len(), 41);
    }

    #[test]
    fn test_record_formatting() {
        let row = sample_row();
        let record = row.to_record(DatasetSchema::LayerStats);
        assert_eq!(record.len(), 34);
        assert_eq!(
            record.join(","),
            "1700000000123456,17921,15,24.57,19.00,0.0123,0.5000,27,0,9,0,3240,1200,987654321,12345,106,5,50,2,3,-4,512,19,10,11,12,13,14,15,16,20,21,22,23"
        );

        let record = row.to_record(DatasetSchema::Throughput);
        assert_eq!(record.len(), 41);
        assert_eq!(record[34..].join(","), "1523.46,88.00,12.50,400,30,52,7");
    }

    #[test]
    fn test_open_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");

        let writer =
            DatasetWriter::open(&path, DatasetSchema::LayerStats, WriterOptions::default())
                .unwrap();
        assert_eq!(read_lines(&path), vec![LAYER_STATS_HEADER.to_string()]);

        assert_eq!(writer.append(&sample_row()).unwrap(), AppendOutcome::Written(1));
        assert_eq!(writer.append(&sample_row()).unwrap(), AppendOutcome::Written(2));
        let summary = writer.close().unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.discarded, 0);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], LAYER_STATS_HEADER);
        assert!(lines[1].starts_with("1700000000123456,17921,15,"));
    }

    #[test]
    fn test_open_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        std::fs::write(&path, "stale,data\n1,2\n").unwrap();

        let writer =
            DatasetWriter::open(&path, DatasetSchema::LayerStats, WriterOptions::default())
                .unwrap();
        writer.close().unwrap();
        assert_eq!(read_lines(&path), vec![LAYER_STATS_HEADER.to_string()]);
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("dataset.csv");
        let err = DatasetWriter::open(&path, DatasetSchema::LayerStats, WriterOptions::default())
            .unwrap_err();
        assert!(matches!(err, DatasetError::Create { .. }));
    }

    #[test]
    fn test_periodic_flush_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        let writer = DatasetWriter::open(
            &path,
            DatasetSchema::LayerStats,
            WriterOptions {
                flush_every: 3,
                row_limit: None,
            },
        )
        .unwrap();

        for _ in 0..3 {
            writer.append(&sample_row()).unwrap();
        }
        // Flushed after the third row without closing.
        assert_eq!(read_lines(&path).len(), 4);
        writer.close().unwrap();
    }

    #[test]
    fn test_row_limit_discards_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        let writer = DatasetWriter::open(
            &path,
            DatasetSchema::LayerStats,
            WriterOptions {
                flush_every: 100,
                row_limit: Some(3),
            },
        )
        .unwrap();

        let outcomes: Vec<AppendOutcome> =
            (0..5).map(|_| writer.append(&sample_row()).unwrap()).collect();
        assert_eq!(
            outcomes,
            vec![
                AppendOutcome::Written(1),
                AppendOutcome::Written(2),
                AppendOutcome::Written(3),
                AppendOutcome::Discarded,
                AppendOutcome::Discarded,
            ]
        );
        let summary = writer.close().unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.discarded, 2);
        assert_eq!(read_lines(&path).len(), 4);
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::open(
            dir.path().join("dataset.csv"),
            DatasetSchema::LayerStats,
            WriterOptions::default(),
        )
        .unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.append(&sample_row()), Err(DatasetError::Closed)));
        assert!(matches!(writer.close(), Err(DatasetError::Closed)));
    }

    #[test]
    fn test_concurrent_appends_keep_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.csv");
        let writer = Arc::new(
            DatasetWriter::open(&path, DatasetSchema::Throughput, WriterOptions::default())
                .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        writer.append(&sample_row()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.close().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1001);
        let expected = sample_row().to_record(DatasetSchema::Throughput).join(",");
        assert!(lines[1..].iter().all(|line| *line == expected));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_flush_still_counts_row() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DatasetWriter::open(
            dir.path().join("dataset.csv"),
            DatasetSchema::LayerStats,
            WriterOptions {
                flush_every: 1,
                row_limit: None,
            },
        )
        .unwrap();

        // Every write to /dev/full fails with ENOSPC.
        let full = File::options().write(true).open("/dev/full").unwrap();
        writer.lock().as_mut().unwrap().csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(full);

        assert_eq!(writer.append(&sample_row()).unwrap(), AppendOutcome::Written(1));
        assert_eq!(writer.append(&sample_row()).unwrap(), AppendOutcome::Written(2));
        assert_eq!(writer.sample_count(), 2);
    }
}
