//! # Result Reports
//!
//! Experiments append one labelled entry per run to a plain-text report,
//! and optionally mirror all entries into a JSON summary.
//!
//! ## Text Format:
//! ```text
//! <label>
//! WER(%): <wer>
//! RTF: <rtf>          (omitted for accuracy-only runs)
//!
//! ```
//! Bit-width sweep entries use `Module: <module>\nBits: <bits>\nWER:<wer>`.
//!
//! The first entry of a run truncates the file; later entries append.

use crate::error::HarnessResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// One measured configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub label: String,
    /// Word error rate in percent
    pub wer: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtf: Option<f64>,
    /// Set for bit-width sweep entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ReportEntry {
    pub fn new(label: impl Into<String>, wer: f64, rtf: Option<f64>) -> Self {
        Self {
            label: label.into(),
            wer,
            rtf,
            bits: None,
            timestamp: Utc::now(),
        }
    }

    pub fn sweep(module: impl Into<String>, bits: u8, wer: f64) -> Self {
        Self {
            bits: Some(bits),
            ..Self::new(module, wer, None)
        }
    }

    /// Text block for this entry, blank line included.
    pub fn render(&self) -> String {
        if let Some(bits) = self.bits {
            return format!("Module: {}\nBits: {}\nWER:{}\n\n", self.label, bits, self.wer);
        }
        match self.rtf {
            Some(rtf) => format!("{}\nWER(%): {}\nRTF: {}\n\n", self.label, self.wer, rtf),
            None => format!("{}\nWER(%): {}\n\n", self.label, self.wer),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonSummary<'a> {
    experiment: &'a str,
    started_at: DateTime<Utc>,
    entries: &'a [ReportEntry],
}

/// Writes entries as they are produced, so partial results survive a crash.
#[derive(Debug)]
pub struct ReportWriter {
    experiment: String,
    path: PathBuf,
    json_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    entries: Vec<ReportEntry>,
}

impl ReportWriter {
    pub fn new(experiment: impl Into<String>, path: impl Into<PathBuf>, json_path: Option<PathBuf>) -> Self {
        Self {
            experiment: experiment.into(),
            path: path.into(),
            json_path,
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Write one entry to the text report (and JSON summary if enabled).
    pub fn record(&mut self, entry: ReportEntry) -> HarnessResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!self.entries.is_empty())
            .truncate(self.entries.is_empty())
            .open(&self.path)?;
        file.write_all(entry.render().as_bytes())?;

        info!("{} → {}", entry.label.replace('\n', " "), self.path.display());
        self.entries.push(entry);
        self.write_json()
    }

    fn write_json(&self) -> HarnessResult<()> {
        let Some(json_path) = &self.json_path else {
            return Ok(());
        };
        if let Some(parent) = json_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let summary = JsonSummary {
            experiment: &self.experiment,
            started_at: self.started_at,
            entries: &self.entries,
        };
        fs::write(json_path, serde_json::to_string_pretty(&summary)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_formats() {
        assert_eq!(
            ReportEntry::new("Original Model", 12.5, Some(0.25)).render(),
            "Original Model\nWER(%): 12.5\nRTF: 0.25\n\n"
        );
        assert_eq!(ReportEntry::new("Original model", 3.0, None).render(), "Original model\nWER(%): 3\n\n");
        assert_eq!(
            ReportEntry::sweep("encoder.enc", 4, 7.5).render(),
            "Module: encoder.enc\nBits: 4\nWER:7.5\n\n"
        );
    }

    #[test]
    fn test_first_entry_truncates_then_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("report.txt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "stale results from an older run\n").unwrap();

        let mut writer = ReportWriter::new("overall", &path, None);
        writer.record(ReportEntry::new("a", 1.0, Some(0.5))).unwrap();
        writer.record(ReportEntry::new("b", 2.0, None)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a\nWER(%): 1\nRTF: 0.5\n\nb\nWER(%): 2\n\n");
        assert_eq!(writer.entries().len(), 2);
    }

    #[test]
    fn test_json_summary_mirrors_entries() {
        let dir = TempDir::new().unwrap();
        let json = dir.path().join("summary.json");
        let mut writer = ReportWriter::new("low-bit sweep", dir.path().join("r.txt"), Some(json.clone()));
        writer.record(ReportEntry::sweep("encoder.enc", 8, 10.0)).unwrap();
        writer.record(ReportEntry::sweep("encoder.enc", 7, 11.0)).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(value["experiment"], "low-bit sweep");
        let entries = value["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["bits"], 7);
        assert!(entries[0].get("rtf").is_none());
        assert!(entries[0]["timestamp"].is_string());
    }
}
