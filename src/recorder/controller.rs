use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::serial::ChannelOpener;
use crate::telemetry;

use super::types::{
    session_log_path, RecorderError, RecordingState, SessionDescriptor, StartRequest,
    StatusSnapshot, WorkerPhase, WorkerShared,
};
use super::worker::{ingest_loop, IngestSetup};

/// Tunables for the recording slot.
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    /// How often the ingest worker drains the channel.
    pub poll_interval: Duration,
    /// How long `start` waits for the worker to confirm the channel opened.
    pub startup_grace: Duration,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            startup_grace: Duration::from_millis(500),
        }
    }
}

/// Owner of the process-wide recording slot.
///
/// At most one ingest worker exists at a time; the controller is the only
/// code allowed to spawn one. The slot is guarded by an async mutex held
/// across the whole check-and-spawn sequence, so concurrent `start` calls
/// serialize instead of racing.
pub struct Recorder {
    root: PathBuf,
    opener: Arc<dyn ChannelOpener>,
    options: RecorderOptions,
    active: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    descriptor: SessionDescriptor,
    log_path: PathBuf,
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
}

impl Recorder {
    pub fn new(root: PathBuf, opener: Arc<dyn ChannelOpener>, options: RecorderOptions) -> Self {
        Self {
            root,
            opener,
            options,
            active: Mutex::new(None),
        }
    }

    /// Start a capture run.
    ///
    /// If a run is already recording, its descriptor is returned unchanged.
    /// Otherwise a worker is spawned and `start` waits up to the startup
    /// grace period for it to confirm the channel opened; on failure the
    /// error is returned here and the errored run stays observable through
    /// `status()`.
    pub async fn start(&self, request: StartRequest) -> Result<SessionDescriptor, RecorderError> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if matches!(*current.shared.phase.read(), WorkerPhase::Recording) {
                info!(
                    subject = %current.descriptor.subject,
                    record = %current.descriptor.record,
                    "start requested while already recording"
                );
                return Ok(current.descriptor.clone());
            }
        }

        let log_path = session_log_path(
            &self.root,
            &request.subject,
            &request.session,
            &request.record,
        );
        let shared = Arc::new(WorkerShared::new());
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        // The worker detaches; the cancellation token and the shared phase
        // are the only links back to it.
        let _ = tokio::spawn(ingest_loop(
            IngestSetup {
                opener: self.opener.clone(),
                port: request.port.clone(),
                baud: request.baud,
                log_path: log_path.clone(),
                poll_interval: self.options.poll_interval,
            },
            shared.clone(),
            cancel.clone(),
            ready_tx,
        ));

        let descriptor = SessionDescriptor {
            subject: request.subject,
            session: request.session,
            record: request.record,
            started_at: Utc::now(),
        };

        // Install before confirmation so a failed startup is still
        // observable through status().
        *active = Some(ActiveSession {
            descriptor: descriptor.clone(),
            log_path,
            shared: shared.clone(),
            cancel: cancel.clone(),
        });

        match tokio::time::timeout(self.options.startup_grace, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(descriptor),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => {
                shared.fail("ingest worker exited before confirming startup".to_string());
                Err(RecorderError::WorkerDied)
            }
            Err(_) => {
                warn!(port = %request.port, "channel open did not complete within grace period");
                cancel.cancel();
                shared.fail(format!(
                    "channel open did not complete within {:?}",
                    self.options.startup_grace
                ));
                Err(RecorderError::StartupTimeout(self.options.startup_grace))
            }
        }
    }

    /// Signal the current worker to stop. Asynchronous and best-effort: the
    /// call never waits for worker exit, and is a no-op when nothing is
    /// recording.
    pub async fn stop(&self) {
        let active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if matches!(*current.shared.phase.read(), WorkerPhase::Recording) {
                info!(record = %current.descriptor.record, "stop signal posted");
                current.cancel.cancel();
            }
        }
    }

    /// Snapshot the recording slot. Total over all states; the telemetry
    /// projection is recomputed against the current log file on every call.
    pub async fn status(&self) -> StatusSnapshot {
        let guard = self.active.lock().await;

        let Some(current) = guard.as_ref() else {
            return StatusSnapshot {
                state: RecordingState::Idle,
                session: None,
                bytes_written: 0,
                error: None,
                telemetry: None,
            };
        };

        let (state, error) = match &*current.shared.phase.read() {
            WorkerPhase::Recording => (RecordingState::Recording, None),
            WorkerPhase::Finished => (RecordingState::Finished, None),
            WorkerPhase::Errored(reason) => (RecordingState::Errored, Some(reason.clone())),
        };
        let bytes_written = current.shared.bytes();
        let session = current.descriptor.clone();
        let log_path = current.log_path.clone();
        drop(guard);

        StatusSnapshot {
            state,
            session: Some(session),
            bytes_written,
            error,
            telemetry: telemetry::project(&log_path),
        }
    }
}
