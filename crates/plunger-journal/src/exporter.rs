//! Export traces to various formats

use crate::recording::Recording;
use crate::trace::Trace;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// RON format (Rust Object Notation)
    Ron,
    /// JSON format (requires serde_json feature)
    Json,
    /// CSV format (one row per output change)
    Csv,
    /// Human-readable text format
    Text,
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ron" => Ok(ExportFormat::Ron),
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(Error::Export(format!("unknown format `{}`", other))),
        }
    }
}

/// Exporter for an output trace, optionally with the recording that produced it
pub struct TraceExporter<'a> {
    trace: &'a Trace,
    recording: Option<&'a Recording>,
    exported_at: DateTime<Utc>,
}

impl<'a> TraceExporter<'a> {
    /// Create a new exporter stamped with the current time
    pub fn new(trace: &'a Trace) -> Self {
        Self {
            trace,
            recording: None,
            exported_at: Utc::now(),
        }
    }

    /// Include the source recording's transitions
    pub fn with_recording(mut self, recording: &'a Recording) -> Self {
        self.recording = Some(recording);
        self
    }

    /// Override the export timestamp
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.exported_at = at;
        self
    }

    /// Export to a string in the specified format
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Ron => self.to_ron(),
            ExportFormat::Json => self.to_json(),
            ExportFormat::Csv => Ok(self.to_csv()),
            ExportFormat::Text => Ok(self.to_text()),
        }
    }

    /// Export to a writer
    pub fn export_to<W: Write>(&self, writer: &mut W, format: ExportFormat) -> Result<()> {
        let content = self.export(format)?;
        writer
            .write_all(content.as_bytes())
            .map_err(|e| Error::Export(e.to_string()))?;
        Ok(())
    }

    /// Export to RON format
    pub fn to_ron(&self) -> Result<String> {
        let export = ExportData::new(self);
        ron::ser::to_string_pretty(&export, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Export to JSON format
    #[cfg(feature = "serde_json")]
    pub fn to_json(&self) -> Result<String> {
        let export = ExportData::new(self);
        serde_json::to_string_pretty(&export).map_err(|e| Error::Serialization(e.to_string()))
    }

    #[cfg(not(feature = "serde_json"))]
    pub fn to_json(&self) -> Result<String> {
        Err(Error::Export(
            "JSON export requires the 'serde_json' feature".to_string(),
        ))
    }

    /// Export to CSV format
    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        output.push_str("at,key,value\n");

        for entry in &self.trace.entries {
            let value = entry
                .value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            // Escape CSV fields
            let value_escaped = value.replace('"', "\"\"");
            output.push_str(&format!("{},{},\"{}\"\n", entry.at, entry.key, value_escaped));
        }

        output
    }

    /// Export to human-readable text format
    pub fn to_text(&self) -> String {
        let mut output = String::new();

        output.push_str("=== Output Trace ===\n\n");
        output.push_str(&format!("Exported: {}\n", self.exported_at.to_rfc3339()));
        output.push_str(&format!("Changes: {}\n", self.trace.len()));
        output.push_str(&format!("Keys: {}\n", self.trace.keys().len()));
        if let Some(recording) = self.recording {
            output.push_str(&format!(
                "Recording: {} transitions, ends at {} ms\n",
                recording.len(),
                recording.end_time()
            ));
        }

        output.push_str("\n=== Changes ===\n\n");
        for entry in &self.trace.entries {
            output.push_str(&format!("{}\n", entry));
        }

        output.push_str("\n=== Final Values ===\n\n");
        for (key, value) in self.final_values() {
            output.push_str(&format!("  {} = {}\n", key, value));
        }

        output
    }

    /// Last resolved value of every key that changed
    fn final_values(&self) -> BTreeMap<String, String> {
        self.trace
            .entries
            .iter()
            .map(|e| {
                let value = e.value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                (e.key.to_string(), value)
            })
            .collect()
    }
}

/// Data structure for full trace export
#[derive(Debug, Clone, Serialize)]
struct ExportData<'a> {
    version: u32,
    exported_at: String,
    change_count: usize,
    transitions: Option<&'a Recording>,
    trace: &'a Trace,
}

impl<'a> ExportData<'a> {
    fn new(exporter: &TraceExporter<'a>) -> Self {
        Self {
            version: 1,
            exported_at: exporter.exported_at.to_rfc3339(),
            change_count: exporter.trace.len(),
            transitions: exporter.recording,
            trace: exporter.trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceEntry;
    use chrono::TimeZone;
    use plunger_core::{OutputKey, Value};

    fn create_test_trace() -> Trace {
        Trace {
            entries: vec![
                TraceEntry {
                    at: 0,
                    key: OutputKey::new("music"),
                    value: Some(Value::from("game")),
                },
                TraceEntry {
                    at: 120,
                    key: OutputKey::new("rampUp"),
                    value: Some(Value::Bool(false)),
                },
                TraceEntry {
                    at: 300,
                    key: OutputKey::new("music"),
                    value: None,
                },
            ],
        }
    }

    #[test]
    fn test_export_ron() {
        let trace = create_test_trace();
        let ron = TraceExporter::new(&trace).to_ron().unwrap();

        assert!(ron.contains("version"));
        assert!(ron.contains("exported_at"));
        assert!(ron.contains("rampUp"));
    }

    #[test]
    fn test_export_csv() {
        let trace = create_test_trace();
        let csv = TraceExporter::new(&trace).to_csv();

        assert!(csv.starts_with("at,key,value\n"));
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.contains("0,music,\"\"\"game\"\"\""));
    }

    #[test]
    fn test_export_text() {
        let trace = create_test_trace();
        let recording = Recording::parse("5 start 1\n").unwrap();
        let stamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let text = TraceExporter::new(&trace)
            .with_recording(&recording)
            .stamped(stamp)
            .to_text();

        assert!(text.contains("Output Trace"));
        assert!(text.contains("Exported: 2024-05-01T12:00:00+00:00"));
        assert!(text.contains("Recording: 1 transitions"));
        assert!(text.contains("  music = -"));
        assert!(text.contains("  rampUp = false"));
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("yaml".parse::<ExportFormat>().is_err());
    }
}
