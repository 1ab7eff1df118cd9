//! Append-only audit trace log.
//!
//! One trace file per process under `.wave/traces/`, shared by every run in
//! that process. Every line is credential-scrubbed before it reaches disk.
//! The logger is the only process-wide global; it owns its file handle.

use crate::emitter::EventSink;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use wave_core::{scrub, ProgressEvent};

static GLOBAL: OnceLock<AuditLogger> = OnceLock::new();

/// Append-only trace writer.
#[derive(Debug)]
pub struct AuditLogger {
    file: Mutex<File>,
    path: PathBuf,
}

impl AuditLogger {
    /// Open a trace file named `trace-<timestamp>.log` under `dir`.
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let name = format!("trace-{}.log", Utc::now().format("%Y%m%dT%H%M%S%3f"));
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Initialize the process-wide logger. Later calls return the existing
    /// instance and ignore `dir`.
    pub fn init(dir: &Path) -> std::io::Result<&'static AuditLogger> {
        if let Some(existing) = GLOBAL.get() {
            return Ok(existing);
        }
        let logger = Self::create(dir)?;
        Ok(GLOBAL.get_or_init(|| logger))
    }

    /// The process-wide logger, if initialized.
    pub fn global() -> Option<&'static AuditLogger> {
        GLOBAL.get()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one scrubbed line tagged with a run id.
    pub fn log(&self, run_id: &str, message: &str) {
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            run_id,
            scrub(message)
        );
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(error = %e, "audit trace write failed");
            }
        }
    }
}

impl EventSink for AuditLogger {
    fn on_event(&self, event: &ProgressEvent) {
        let mut line = format!("step={} state={}", event.step_id, event.kind.as_str());
        if let Some(tool) = &event.tool_name {
            line.push_str(&format!(" tool={tool}"));
        }
        if let Some(target) = &event.tool_target {
            line.push_str(&format!(" target={target}"));
        }
        if let Some(message) = &event.message {
            line.push_str(&format!(" message={message}"));
        }
        self.log(&event.run_id, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wave_core::StepEventKind;

    #[test]
    fn log_appends_scrubbed_lines() {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::create(dir.path()).unwrap();

        logger.log("run-1", "export ANTHROPIC_API_KEY=sk-ant-secret");
        logger.log("run-1", "plain progress line");

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(!content.contains("sk-ant-secret"));
        assert!(content.contains("ANTHROPIC_API_KEY=[REDACTED]"));
        assert!(content.contains("plain progress line"));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn trace_file_lives_under_dir() {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::create(dir.path()).unwrap();
        assert!(logger.path().starts_with(dir.path()));
        assert!(logger
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("trace-"));
    }

    #[test]
    fn event_sink_formats_event_fields() {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::create(dir.path()).unwrap();

        let event = ProgressEvent::new(
            "run-9",
            "build",
            StepEventKind::StreamActivity,
            "builder",
            "cli",
        )
        .with_tool("Bash", Some("cargo build".to_string()));
        logger.on_event(&event);

        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("[run-9]"));
        assert!(content.contains("step=build"));
        assert!(content.contains("tool=Bash"));
        assert!(content.contains("target=cargo build"));
    }
}
