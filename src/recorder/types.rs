use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::serial::ChannelError;
use crate::telemetry::TelemetryWindow;

/// Lifecycle of the process-wide recording slot.
///
/// `Errored` is terminal like `Finished`, but carries the failure cause in
/// the status snapshot so a channel fault is distinguishable from a clean,
/// user-requested stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordingState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "RECORDING")]
    Recording,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "ERROR")]
    Errored,
}

/// Identity of one capture run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptor {
    pub subject: String,
    pub session: String,
    pub record: String,
    pub started_at: DateTime<Utc>,
}

/// Parameters for starting a capture run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub subject: String,
    pub session: String,
    pub record: String,
    pub port: String,
    pub baud: u32,
}

/// Point-in-time view of the recording slot, as returned by `status()`.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: RecordingState,
    pub session: Option<SessionDescriptor>,
    pub bytes_written: u64,
    pub error: Option<String>,
    pub telemetry: Option<TelemetryWindow>,
}

/// Errors surfaced synchronously from `start()`. Everything after a
/// successful startup is observed asynchronously through `status()`.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to create log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ingest worker did not confirm startup within {0:?}")]
    StartupTimeout(Duration),
    #[error("ingest worker exited before confirming startup")]
    WorkerDied,
}

/// Worker phase as published to concurrent status readers.
#[derive(Debug, Clone)]
pub(crate) enum WorkerPhase {
    Recording,
    Finished,
    Errored(String),
}

/// State shared between the ingest worker and the controller. The byte
/// counter is atomic because status queries read it without any further
/// synchronization against the writer.
pub(crate) struct WorkerShared {
    pub(crate) phase: RwLock<WorkerPhase>,
    pub(crate) bytes_written: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn new() -> Self {
        Self {
            phase: RwLock::new(WorkerPhase::Recording),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Clean-stop transition; a phase already terminal stays as it is.
    pub(crate) fn finish(&self) {
        let mut phase = self.phase.write();
        if matches!(*phase, WorkerPhase::Recording) {
            *phase = WorkerPhase::Finished;
        }
    }

    /// Fault transition; the first recorded reason wins.
    pub(crate) fn fail(&self, reason: String) {
        let mut phase = self.phase.write();
        if matches!(*phase, WorkerPhase::Recording) {
            *phase = WorkerPhase::Errored(reason);
        }
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Derive the log path for a capture run.
///
/// Identifiers are caller-supplied strings; sanitizing them to a filename
/// alphabet (and prefixing) keeps them from escaping the recordings root.
pub(crate) fn session_log_path(
    root: &Path,
    subject: &str,
    session: &str,
    record: &str,
) -> PathBuf {
    root.join(format!("sub_{}", sanitize_component(subject)))
        .join(format!("sess_{}", sanitize_component(session)))
        .join(format!("rec_{}.csv", sanitize_component(record)))
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(100)
        .collect();

    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_follows_layout() {
        let path = session_log_path(Path::new("/data/EXPDATA"), "P1", "S1", "R1");
        assert_eq!(
            path,
            PathBuf::from("/data/EXPDATA/sub_P1/sess_S1/rec_R1.csv")
        );
    }

    #[test]
    fn identifiers_cannot_escape_the_root() {
        let path = session_log_path(Path::new("/data/EXPDATA"), "../../etc", "a/b", "");
        // Separators are stripped and every component keeps its prefix, so
        // the result stays under the root.
        assert!(path.starts_with("/data/EXPDATA"));
        assert_eq!(
            path,
            PathBuf::from("/data/EXPDATA/sub_....etc/sess_ab/rec_unnamed.csv")
        );
    }
}
