use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::error;

use crate::config::DeviceSettings;
use crate::recorder::{RecordingState, StartRequest, StatusSnapshot};
use crate::state::ServerState;

/// Request to start a capture run
#[derive(Debug, Deserialize)]
pub struct StartRecordingRequest {
    pub subject: String,
    pub session: String,
    pub record: String,
}

/// Status of the recording slot, including the live telemetry window while
/// a log file with enough rows exists.
#[derive(Debug, Serialize)]
pub struct RecordingStatusResponse {
    pub status: RecordingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub bytes_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryPayload>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryPayload {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

fn status_response(snapshot: StatusSnapshot) -> RecordingStatusResponse {
    let telemetry = snapshot.telemetry.map(|window| TelemetryPayload {
        rows: window.to_records(),
        columns: window.columns,
    });

    let (subject, session, record, started_at) = match snapshot.session {
        Some(s) => (
            Some(s.subject),
            Some(s.session),
            Some(s.record),
            Some(s.started_at),
        ),
        None => (None, None, None, None),
    };

    RecordingStatusResponse {
        status: snapshot.state,
        subject,
        session,
        record,
        started_at,
        bytes_written: snapshot.bytes_written,
        error: snapshot.error,
        telemetry,
    }
}

/// Start a capture run using the serial settings on disk.
///
/// Idempotent while a run is recording. Connection failures surface here;
/// everything after a successful startup is observed via the status endpoint.
pub async fn start_recording(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StartRecordingRequest>,
) -> Result<Json<RecordingStatusResponse>, (StatusCode, String)> {
    let settings = DeviceSettings::load_or_create(&state.config.settings_path()).map_err(|e| {
        error!("failed to load device settings: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to load settings: {}", e),
        )
    })?;

    state
        .recorder
        .start(StartRequest {
            subject: request.subject,
            session: request.session,
            record: request.record,
            port: settings.serial.port,
            baud: settings.serial.baud,
        })
        .await
        .map_err(|e| {
            error!("failed to start recording: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Failed to start recording: {}", e),
            )
        })?;

    Ok(Json(status_response(state.recorder.status().await)))
}

/// Signal the current run to stop. Total: a no-op when nothing is recording.
pub async fn stop_recording(
    State(state): State<Arc<ServerState>>,
) -> Json<RecordingStatusResponse> {
    state.recorder.stop().await;
    Json(status_response(state.recorder.status().await))
}

/// Snapshot the recording slot. Never fails; before any start it reports
/// the idle state with no telemetry.
pub async fn recording_status(
    State(state): State<Arc<ServerState>>,
) -> Json<RecordingStatusResponse> {
    Json(status_response(state.recorder.status().await))
}
