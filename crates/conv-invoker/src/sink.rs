use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use conv_core::RESULTS_FILE;

/// One named output unit of an invocation. Every artifact this system
/// emits is complete in a single write; the flag is carried so sinks with
/// partial-streaming consumers can tell the difference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub name: String,
    pub payload: Value,
    pub complete: bool,
    pub emitted_at: String,
}

impl ResultArtifact {
    pub fn complete(name: &str, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
            complete: true,
            emitted_at: Utc::now().to_rfc3339(),
        }
    }
}

pub trait ResultSink {
    fn emit(&mut self, artifact: &ResultArtifact) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Appends one JSON row per artifact to `out/results.jsonl`.
pub struct JsonlResultSink {
    writer: BufWriter<File>,
}

impl JsonlResultSink {
    pub fn new(out_dir: &Path) -> Result<Self> {
        fs::create_dir_all(out_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(out_dir.join(RESULTS_FILE))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl ResultSink for JsonlResultSink {
    fn emit(&mut self, artifact: &ResultArtifact) -> Result<()> {
        serde_json::to_writer(&mut self.writer, artifact)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemorySink {
    pub artifacts: Vec<ResultArtifact>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(&self, name: &str) -> Option<&ResultArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

impl ResultSink for MemorySink {
    fn emit(&mut self, artifact: &ResultArtifact) -> Result<()> {
        self.artifacts.push(artifact.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "converge_sink_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn jsonl_sink_appends_one_row_per_artifact() {
        let out_dir = temp_root("jsonl");
        let mut sink = JsonlResultSink::new(&out_dir).expect("sink should initialize");
        sink.emit(&ResultArtifact::complete("num_of_runs", json!(2)))
            .expect("emit count");
        sink.emit(&ResultArtifact::complete("ps", json!("PID TTY ...")))
            .expect("emit ps");
        sink.flush().expect("flush");

        let raw = fs::read_to_string(out_dir.join(RESULTS_FILE)).expect("results file");
        let rows: Vec<ResultArtifact> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("row parses"))
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "num_of_runs");
        assert_eq!(rows[0].payload, json!(2));
        assert!(rows.iter().all(|r| r.complete));
        let _ = fs::remove_dir_all(out_dir);
    }

    #[test]
    fn memory_sink_records_in_order() {
        let mut sink = MemorySink::new();
        sink.emit(&ResultArtifact::complete("ps", json!("out")))
            .expect("emit");
        sink.emit(&ResultArtifact::complete("run_list", json!({"run_list": []})))
            .expect("emit");
        assert_eq!(sink.artifacts.len(), 2);
        assert!(sink.named("run_list").is_some());
        assert!(sink.named("missing").is_none());
    }
}
