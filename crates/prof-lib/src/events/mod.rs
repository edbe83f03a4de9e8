//! Worker event protocol
//!
//! The worker writes one JSON object per line on its stdout:
//! `{"type": "<kind>", "data": {...}}`. Anything that does not parse is
//! ignored, since the worker's tooling may print unrelated lines too.

mod handler;

pub use handler::{Completion, EventHandler};

use crate::models::ResultFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Started,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,
}

/// Diagnostic line the worker wants surfaced in the client's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    pub level: String,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Event {
    Progress(Progress),
    Notice(Notice),
    Error(Failure),
    Result(ResultFile),
    Log(WorkerLog),
}

impl Event {
    pub fn started() -> Self {
        Self::Progress(Progress {
            time: None,
            stage: Stage::Started,
        })
    }

    pub fn ended() -> Self {
        Self::Progress(Progress {
            time: None,
            stage: Stage::Ended,
        })
    }

    /// Encode as one protocol line, without the trailing newline
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse a single protocol line
pub fn parse_line(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(line = %line, error = %e, "ignoring unparseable worker line");
            None
        }
    }
}
