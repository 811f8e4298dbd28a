//! Query interface over intervention logs: load from disk (plain or gzip)
//! and filter by time range, state set, or trace.

#![allow(missing_docs)]

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::core::contracts::MitigationState;
use crate::core::errors::{PsnError, Result};
use crate::logger::intervention::InterventionRecord;
use crate::logger::sink::open_log_reader;

/// An immutable set of loaded records with chainable filters. Each filter
/// returns a new query over the matching subset.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    records: Vec<InterventionRecord>,
}

impl LogQuery {
    #[must_use]
    pub fn from_records(records: Vec<InterventionRecord>) -> Self {
        Self { records }
    }

    /// Load records from a JSONL log file; `.gz` paths are gunzipped.
    /// Blank lines are skipped; a malformed line is a hard error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(open_log_reader(path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| PsnError::io(path, source))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: InterventionRecord =
                serde_json::from_str(&line).map_err(|e| PsnError::Serialization {
                    context: "log_query",
                    details: format!("line {}: {e}", index + 1),
                })?;
            records.push(record);
        }
        Ok(Self { records })
    }

    /// Keep records with `start <= timestamp <= end` (either bound may be
    /// open).
    #[must_use]
    pub fn filter_by_time(&self, start: Option<f64>, end: Option<f64>) -> Self {
        Self {
            records: self
                .records
                .iter()
                .filter(|r| {
                    start.is_none_or(|s| r.timestamp >= s)
                        && end.is_none_or(|e| r.timestamp <= e)
                })
                .cloned()
                .collect(),
        }
    }

    /// Keep records whose state is in the given set.
    #[must_use]
    pub fn filter_by_state(&self, states: &[MitigationState]) -> Self {
        Self {
            records: self
                .records
                .iter()
                .filter(|r| states.contains(&r.state))
                .cloned()
                .collect(),
        }
    }

    /// Keep records of a single trace.
    #[must_use]
    pub fn filter_by_trace(&self, trace_id: &str) -> Self {
        Self {
            records: self
                .records
                .iter()
                .filter(|r| r.trace_id == trace_id)
                .cloned()
                .collect(),
        }
    }

    /// Unique trace ids in order of first appearance.
    #[must_use]
    pub fn traces(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        let mut traces = Vec::new();
        for record in &self.records {
            if seen.insert(record.trace_id.clone()) {
                traces.push(record.trace_id.clone());
            }
        }
        traces
    }

    #[must_use]
    pub fn records(&self) -> &[InterventionRecord] {
        &self.records
    }

    #[must_use]
    pub fn into_records(self) -> Vec<InterventionRecord> {
        self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for LogQuery {
    type Item = InterventionRecord;
    type IntoIter = std::vec::IntoIter<InterventionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contracts::{Observation, UncertaintyEstimate};
    use crate::logger::intervention::LOG_FORMAT_VERSION;

    fn record(trace: &str, step: u64, ts: f64, state: MitigationState) -> InterventionRecord {
        InterventionRecord {
            id: format!("{trace}-{step}"),
            timestamp: ts,
            trace_id: trace.to_string(),
            step_number: step,
            session_id: "sess".to_string(),
            observation: Observation::new(),
            state,
            previous_state: MitigationState::Nominal,
            uncertainty: UncertaintyEstimate::fallback(),
            ood_score: 0.0,
            ood_component_scores: None,
            action: vec![0.0],
            monitor_outputs: Vec::new(),
            version: LOG_FORMAT_VERSION.to_string(),
        }
    }

    fn sample_query() -> LogQuery {
        LogQuery::from_records(vec![
            record("t1", 0, 10.0, MitigationState::Nominal),
            record("t1", 1, 11.0, MitigationState::Fallback),
            record("t2", 0, 12.0, MitigationState::SafeStop),
            record("t2", 1, 13.0, MitigationState::Nominal),
        ])
    }

    #[test]
    fn time_filter_respects_open_bounds() {
        let q = sample_query();
        assert_eq!(q.filter_by_time(Some(11.0), None).len(), 3);
        assert_eq!(q.filter_by_time(None, Some(11.0)).len(), 2);
        assert_eq!(q.filter_by_time(Some(11.0), Some(12.0)).len(), 2);
        assert_eq!(q.filter_by_time(None, None).len(), 4);
    }

    #[test]
    fn state_filter_matches_set() {
        let q = sample_query();
        let filtered =
            q.filter_by_state(&[MitigationState::Fallback, MitigationState::SafeStop]);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn trace_filter_isolates_episode() {
        let q = sample_query();
        let t2 = q.filter_by_trace("t2");
        assert_eq!(t2.len(), 2);
        assert!(t2.records().iter().all(|r| r.trace_id == "t2"));
    }

    #[test]
    fn filters_chain() {
        let q = sample_query();
        let chained = q
            .filter_by_trace("t1")
            .filter_by_state(&[MitigationState::Fallback]);
        assert_eq!(chained.len(), 1);
        assert_eq!(chained.records()[0].step_number, 1);
    }

    #[test]
    fn traces_in_first_appearance_order() {
        let q = sample_query();
        assert_eq!(q.traces(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let records = sample_query().into_records();
        let mut content = String::new();
        for r in &records {
            content.push_str(&serde_json::to_string(r).unwrap());
            content.push('\n');
        }
        std::fs::write(&path, content).unwrap();

        let q = LogQuery::from_file(&path).unwrap();
        assert_eq!(q.records(), records.as_slice());
    }

    #[test]
    fn from_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let r = record("t1", 0, 1.0, MitigationState::Nominal);
        let content = format!("\n{}\n\n", serde_json::to_string(&r).unwrap());
        std::fs::write(&path, content).unwrap();
        assert_eq!(LogQuery::from_file(&path).unwrap().len(), 1);
    }

    #[test]
    fn from_file_reports_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let err = LogQuery::from_file(&path).unwrap_err();
        assert_eq!(err.code(), "PSN-2101");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = LogQuery::from_file("/nonexistent/psn/log.jsonl").unwrap_err();
        assert_eq!(err.code(), "PSN-3001");
    }
}
