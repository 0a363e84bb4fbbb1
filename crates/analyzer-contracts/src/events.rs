use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::segmentation::SegmentationMode;

/// How the reply ended up on the submitted images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMapping {
    Empty,
    Unsegmented,
    Delimited,
    /// Result count differed from image count; the raw reply went to the first image.
    Mismatch,
}

impl ResultMapping {
    pub fn new(mode: SegmentationMode, degraded: bool) -> Self {
        if degraded {
            return Self::Mismatch;
        }
        match mode {
            SegmentationMode::Empty => Self::Empty,
            SegmentationMode::Unsegmented => Self::Unsegmented,
            SegmentationMode::Delimited => Self::Delimited,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisEventKind {
    Submitted,
    Completed,
    Failed,
}

impl AnalysisEventKind {
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Submitted => "analysis_submitted",
            Self::Completed => "analysis_completed",
            Self::Failed => "analysis_failed",
        }
    }
}

/// One analysis lifecycle step. Serialized with its `type` tag inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnalysisEvent {
    #[serde(rename = "analysis_submitted")]
    Submitted {
        provider: String,
        model: String,
        image_count: usize,
        query_chars: usize,
    },
    #[serde(rename = "analysis_completed")]
    Completed {
        provider: String,
        model: String,
        image_count: usize,
        mode: ResultMapping,
        /// 1-based indices whose `imageK:` delimiter was found.
        matched: Vec<usize>,
        reply_chars: usize,
        latency_ms: u64,
        #[serde(default)]
        provider_request: Map<String, Value>,
        #[serde(default)]
        provider_response: Map<String, Value>,
    },
    #[serde(rename = "analysis_failed")]
    Failed {
        provider: String,
        model: String,
        /// `AnalysisError::kind()` tag.
        kind: String,
        message: String,
        latency_ms: u64,
    },
}

impl AnalysisEvent {
    pub fn kind(&self) -> AnalysisEventKind {
        match self {
            Self::Submitted { .. } => AnalysisEventKind::Submitted,
            Self::Completed { .. } => AnalysisEventKind::Completed,
            Self::Failed { .. } => AnalysisEventKind::Failed,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }
}

/// A line of `events.jsonl`: session envelope plus the flattened event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub session_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub event: AnalysisEvent,
}

/// Append-only analysis log shared by every service clone in a session.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: AnalysisEvent) -> Result<LoggedEvent> {
        let logged = LoggedEvent {
            session_id: self.inner.session_id.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            event,
        };
        let mut line = serde_json::to_string(&logged)?;
        line.push('\n');

        let path = &self.inner.path;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| {
                format!(
                    "failed to append {} to {}",
                    logged.event.event_type(),
                    path.display()
                )
            })?;
        Ok(logged)
    }
}

/// Reads back a session log; blank lines are skipped.
pub fn read_event_log(path: &Path) -> Result<Vec<LoggedEvent>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{} line {}: invalid event", path.display(), index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn submitted(image_count: usize) -> AnalysisEvent {
        AnalysisEvent::Submitted {
            provider: "dryrun".to_string(),
            model: "dryrun-vision".to_string(),
            image_count,
            query_chars: 8,
        }
    }

    fn completed() -> AnalysisEvent {
        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), json!("dryrun-native"));
        AnalysisEvent::Completed {
            provider: "dryrun".to_string(),
            model: "dryrun-vision".to_string(),
            image_count: 2,
            mode: ResultMapping::Delimited,
            matched: vec![1, 2],
            reply_chars: 40,
            latency_ms: 12,
            provider_request,
            provider_response: Map::new(),
        }
    }

    fn failed() -> AnalysisEvent {
        AnalysisEvent::Failed {
            provider: "gemini".to_string(),
            model: "gemini-2.0-flash-001".to_string(),
            kind: "api".to_string(),
            message: "No text content in API response.".to_string(),
            latency_ms: 300,
        }
    }

    #[test]
    fn record_writes_envelope_and_flattened_event() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-1");

        let logged = writer.record(completed())?;

        let content = fs::read_to_string(&path)?;
        assert_eq!(content.lines().count(), 1);
        let raw: Value = serde_json::from_str(content.trim_end())?;
        assert_eq!(raw["type"], json!("analysis_completed"));
        assert_eq!(raw["session_id"], json!("session-1"));
        assert_eq!(raw["mode"], json!("delimited"));
        assert_eq!(raw["matched"], json!([1, 2]));
        assert_eq!(raw["provider_request"]["endpoint"], json!("dryrun-native"));
        DateTime::parse_from_rfc3339(&logged.ts)?;

        assert_eq!(read_event_log(&path)?, vec![logged]);
        Ok(())
    }

    #[test]
    fn serialized_tag_matches_event_type() -> anyhow::Result<()> {
        for event in [submitted(1), completed(), failed()] {
            let raw = serde_json::to_value(&event)?;
            assert_eq!(raw["type"], json!(event.event_type()));
        }
        assert_eq!(failed().kind(), AnalysisEventKind::Failed);
        Ok(())
    }

    #[test]
    fn clones_append_in_order_to_one_log() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-2");
        let shared = writer.clone();

        writer.record(submitted(2))?;
        shared.record(failed())?;

        let logged = read_event_log(&path)?;
        assert_eq!(
            logged.iter().map(|row| row.event.kind()).collect::<Vec<_>>(),
            vec![AnalysisEventKind::Submitted, AnalysisEventKind::Failed]
        );
        assert!(logged.iter().all(|row| row.session_id == "session-2"));
        assert_eq!(shared.session_id(), "session-2");
        Ok(())
    }

    #[test]
    fn completed_without_provider_maps_still_reads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        fs::write(
            &path,
            concat!(
                "{\"session_id\":\"s\",\"ts\":\"2026-01-01T00:00:00Z\",\"type\":\"analysis_completed\",",
                "\"provider\":\"gemini\",\"model\":\"m\",\"image_count\":1,\"mode\":\"mismatch\",",
                "\"matched\":[],\"reply_chars\":3,\"latency_ms\":5}\n\n"
            ),
        )?;
        let logged = read_event_log(&path)?;
        assert_eq!(logged.len(), 1);
        let AnalysisEvent::Completed { mode, provider_request, .. } = &logged[0].event else {
            anyhow::bail!("expected completed event");
        };
        assert_eq!(*mode, ResultMapping::Mismatch);
        assert!(provider_request.is_empty());
        Ok(())
    }

    #[test]
    fn read_event_log_names_the_bad_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "s");
        writer.record(submitted(1))?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b"{\"type\":\"analysis_exploded\"}\n")?;

        let err = read_event_log(&path).err().map(|err| err.to_string());
        assert!(err.is_some_and(|message| message.ends_with("line 2: invalid event")));
        Ok(())
    }

    #[test]
    fn result_mapping_prefers_mismatch() {
        assert_eq!(
            ResultMapping::new(SegmentationMode::Delimited, true),
            ResultMapping::Mismatch
        );
        assert_eq!(
            ResultMapping::new(SegmentationMode::Unsegmented, false),
            ResultMapping::Unsegmented
        );
        assert_eq!(
            ResultMapping::new(SegmentationMode::Empty, false),
            ResultMapping::Empty
        );
    }
}
