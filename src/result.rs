use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ScanError;
use crate::interface::{DeviceWarning, Histogram};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Scan,
    /// EIT baseline taken once per signal width
    Reference,
}

/// One completed measurement. Immutable once created.
///
/// `write_width` and `offset` are `None` for reference measurements. `bins` and `data`
/// always have the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub kind: MeasurementKind,
    pub write_width: Option<f64>,
    pub signal_width: f64,
    pub offset: Option<f64>,
    /// Bin start times in ps
    pub bins: Vec<f64>,
    /// Counts per bin
    pub data: Vec<u32>,
    pub acquired_at: DateTime<Utc>,
    /// Soft errors the AWG reported while this point was programmed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DeviceWarning>,
}

impl ScanResult {
    pub fn scan(
        write_width: f64,
        signal_width: f64,
        offset: f64,
        histogram: Histogram,
        warnings: Vec<DeviceWarning>,
    ) -> Self {
        Self {
            kind: MeasurementKind::Scan,
            write_width: Some(write_width),
            signal_width,
            offset: Some(offset),
            bins: histogram.bins,
            data: histogram.counts,
            acquired_at: Utc::now(),
            warnings,
        }
    }

    pub fn reference(signal_width: f64, histogram: Histogram, warnings: Vec<DeviceWarning>) -> Self {
        Self {
            kind: MeasurementKind::Reference,
            write_width: None,
            signal_width,
            offset: None,
            bins: histogram.bins,
            data: histogram.counts,
            acquired_at: Utc::now(),
            warnings,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.kind == MeasurementKind::Reference
    }

    pub fn total_counts(&self) -> u64 {
        self.data.iter().map(|&c| u64::from(c)).sum()
    }

    /// Label used in result lists: `"<write> <signal> <offset>"` or `"ref <signal>"`
    pub fn display_name(&self) -> String {
        match (self.kind, self.write_width, self.offset) {
            (MeasurementKind::Scan, Some(w), Some(o)) => {
                format!("{:.2} {:.2} {:.2}", w, self.signal_width, o)
            }
            _ => format!("ref {:.2}", self.signal_width),
        }
    }
}

/// Insertion-ordered collection of results keyed by display name.
///
/// Names are unique: a result whose display name is already taken is stored as
/// `"<name> (2)"`, `"<name> (3)"` and so on.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: IndexMap<String, ScanResult>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a result and return the name it is stored under
    pub fn insert(&mut self, result: ScanResult) -> String {
        let base = result.display_name();
        let mut name = base.clone();
        let mut n = 2;
        while self.results.contains_key(&name) {
            name = format!("{base} ({n})");
            n += 1;
        }
        self.results.insert(name.clone(), result);
        name
    }

    pub fn get(&self, name: &str) -> Option<&ScanResult> {
        self.results.get(name)
    }

    /// Remove a result, keeping the order of the rest
    pub fn remove(&mut self, name: &str) -> Option<ScanResult> {
        self.results.shift_remove(name)
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScanResult)> {
        self.results.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Write every result as one JSON array, in insertion order
    pub fn save(&self, path: &Path) -> Result<(), ScanError> {
        let records: Vec<&ScanResult> = self.results.values().collect();
        let json = serde_json::to_string_pretty(&records)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        info!("Saved {} results to {}", records.len(), path.display());
        Ok(())
    }

    /// Append the results stored in `path` (JSON array or JSONL) and return their names
    pub fn load(&mut self, path: &Path) -> Result<Vec<String>, ScanError> {
        let content = std::fs::read_to_string(path)?;
        let records: Vec<ScanResult> = if content.trim_start().starts_with('[') {
            serde_json::from_str(&content)?
        } else {
            content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<Result<_, _>>()?
        };

        let mut names = Vec::with_capacity(records.len());
        for record in records {
            if record.bins.len() != record.data.len() {
                warn!(
                    "Skipping {}: {} bins but {} counts",
                    record.display_name(),
                    record.bins.len(),
                    record.data.len()
                );
                continue;
            }
            names.push(self.insert(record));
        }
        info!("Loaded {} results from {}", names.len(), path.display());
        Ok(names)
    }
}
