use anyhow::Context;
use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::state::ServerState;

/// Run an external programmer tool and capture its combined output.
async fn run_programmer(tool: &Path, args: &[&OsStr]) -> anyhow::Result<(bool, String)> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {:?}", tool))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&combined).to_string(),
    ))
}

/// Response for a firmware upload
#[derive(Debug, Serialize)]
pub struct FirmwareUploadResponse {
    pub filename: String,
    pub size: u64,
}

/// Upload a firmware image for the microcontroller.
///
/// Accepts one multipart `file` field; only `.bin` images are allowed. The
/// image is stored at a fixed path, replacing any previous upload, and is
/// written to the board by a separate reflash request.
pub async fn upload_firmware(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> Result<Json<FirmwareUploadResponse>, (StatusCode, String)> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Invalid multipart data: {}", e),
        )
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "firmware.bin".to_string());

        if !filename.to_ascii_lowercase().ends_with(".bin") {
            warn!("rejected firmware upload with filename '{}'", filename);
            return Err((
                StatusCode::BAD_REQUEST,
                "Only .bin firmware images are accepted".to_string(),
            ));
        }

        let data = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("Failed to read upload: {}", e),
            )
        })?;

        if data.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "Uploaded file is empty".to_string()));
        }
        if data.len() as u64 > state.config.max_firmware_size {
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "Firmware too large. Maximum size: {} bytes",
                    state.config.max_firmware_size
                ),
            ));
        }

        let dest = state.config.firmware_path();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                error!("failed to create firmware directory: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to store firmware".to_string(),
                )
            })?;
        }

        let size = data.len() as u64;
        tokio::fs::write(&dest, &data).await.map_err(|e| {
            error!("failed to write firmware image: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store firmware".to_string(),
            )
        })?;

        info!(
            "stored firmware image '{}' ({} bytes) at {:?}",
            filename, size, dest
        );
        return Ok(Json(FirmwareUploadResponse { filename, size }));
    }

    Err((
        StatusCode::BAD_REQUEST,
        "No file field in upload".to_string(),
    ))
}

/// Microcontroller probe response
#[derive(Debug, Serialize)]
pub struct McuInfoResponse {
    pub info: HashMap<String, String>,
}

/// Query the attached programmer for microcontroller details.
pub async fn microcontroller_info(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<McuInfoResponse>, (StatusCode, String)> {
    let (_, text) = run_programmer(&state.config.probe_tool, &[OsStr::new("--probe")])
        .await
        .map_err(|e| {
            error!("programmer probe failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to run programmer tool: {}", e),
            )
        })?;

    if text.contains("Found 0 stlink programmers") {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Programmer disconnected".to_string(),
        ));
    }

    Ok(Json(McuInfoResponse {
        info: parse_probe_output(&text),
    }))
}

// st-info prints one "key: value" line per property.
fn parse_probe_output(text: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    for line in text.lines() {
        if let Some(idx) = line.find(':') {
            let key = line[..idx].trim();
            let value = line[idx + 1..].trim();
            if !key.is_empty() {
                info.insert(key.to_string(), value.to_string());
            }
        }
    }
    info
}

/// Reflash response with the programmer's combined output
#[derive(Debug, Serialize)]
pub struct ReflashResponse {
    pub success: bool,
    pub output: String,
}

/// Write the uploaded firmware image to the microcontroller.
pub async fn reflash_firmware(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ReflashResponse>, (StatusCode, String)> {
    let firmware = state.config.firmware_path();
    if !firmware.is_file() {
        return Err((
            StatusCode::NOT_FOUND,
            "No firmware image uploaded".to_string(),
        ));
    }

    info!("reflashing microcontroller from {:?}", firmware);

    let (success, output) = run_programmer(
        &state.config.flash_tool,
        &[
            OsStr::new("--connect-under-reset"),
            OsStr::new("write"),
            firmware.as_os_str(),
            OsStr::new("0x8000000"),
        ],
    )
    .await
    .map_err(|e| {
        error!("reflash failed: {:#}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to run programmer tool: {}", e),
        )
    })?;

    if !success {
        warn!("reflash programmer exited with failure");
    }

    Ok(Json(ReflashResponse { success, output }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_parses_key_value_lines() {
        let text = "Found 1 stlink programmers\n version:    V2J37S7\n serial:     066CFF3\n flash:      524288 (pagesize: 2048)\n dev-type:   STM32F4x5_F4x7\n";
        let info = parse_probe_output(text);
        assert_eq!(info.get("version"), Some(&"V2J37S7".to_string()));
        assert_eq!(info.get("dev-type"), Some(&"STM32F4x5_F4x7".to_string()));
        assert_eq!(
            info.get("flash"),
            Some(&"524288 (pagesize: 2048)".to_string())
        );
        assert!(!info.contains_key("Found 1 stlink programmers"));
    }
}
