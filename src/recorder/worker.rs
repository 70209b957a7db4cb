// The ingest worker: one spawned task per capture run.
//
// The worker has exclusive ownership of the serial channel for its whole
// life. Cancellation is cooperative - the loop observes the token once per
// poll interval - and the channel is closed on every exit path before the
// terminal phase is published.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::serial::{ChannelOpener, SerialChannel};

use super::types::{RecorderError, WorkerShared};

pub(crate) struct IngestSetup {
    pub opener: Arc<dyn ChannelOpener>,
    pub port: String,
    pub baud: u32,
    pub log_path: std::path::PathBuf,
    pub poll_interval: Duration,
}

/// Run one capture: open the channel, confirm startup to the controller,
/// then drain-and-append until cancelled or the channel faults.
pub(crate) async fn ingest_loop(
    setup: IngestSetup,
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), RecorderError>>,
) {
    // Opening a port can block inside the OS driver, so it runs off the
    // async runtime.
    let opener = setup.opener.clone();
    let (port_name, baud) = (setup.port.clone(), setup.baud);
    let opened = tokio::task::spawn_blocking(move || opener.open(&port_name, baud)).await;

    let mut channel: Box<dyn SerialChannel> = match opened {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            shared.fail(e.to_string());
            let _ = ready.send(Err(RecorderError::Channel(e)));
            return;
        }
        Err(join_err) => {
            shared.fail(format!("channel open task failed: {join_err}"));
            let _ = ready.send(Err(RecorderError::WorkerDied));
            return;
        }
    };

    if let Some(parent) = setup.log_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            channel.close();
            shared.fail(format!("failed to create {}: {e}", parent.display()));
            let _ = ready.send(Err(RecorderError::LogFile {
                path: setup.log_path.clone(),
                source: e,
            }));
            return;
        }
    }

    let mut log = match tokio::fs::File::create(&setup.log_path).await {
        Ok(file) => file,
        Err(e) => {
            channel.close();
            shared.fail(format!(
                "failed to create {}: {e}",
                setup.log_path.display()
            ));
            let _ = ready.send(Err(RecorderError::LogFile {
                path: setup.log_path.clone(),
                source: e,
            }));
            return;
        }
    };

    let _ = ready.send(Ok(()));
    info!(
        port = %setup.port,
        baud = setup.baud,
        log = %setup.log_path.display(),
        "ingest worker started"
    );

    // First tick lands one full poll interval from now, so the loop always
    // sleeps before its first drain.
    let mut ticker = interval_at(Instant::now() + setup.poll_interval, setup.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome: Result<(), String> = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = ticker.tick() => {
                if let Err(reason) = drain_once(channel.as_mut(), &mut log, &shared).await {
                    break Err(reason);
                }
            }
        }
    };

    // Exit path, taken no matter how the loop ended.
    channel.close();
    match outcome {
        Ok(()) => {
            shared.finish();
            info!(
                bytes = shared.bytes_written.load(Ordering::Relaxed),
                log = %setup.log_path.display(),
                "ingest worker stopped"
            );
        }
        Err(reason) => {
            error!(%reason, "ingest worker failed");
            shared.fail(reason);
        }
    }
}

/// One loop iteration: drain whatever the driver has buffered and append it
/// to the log, flushing immediately so concurrent status reads see rows
/// promptly.
async fn drain_once(
    channel: &mut dyn SerialChannel,
    log: &mut tokio::fs::File,
    shared: &WorkerShared,
) -> Result<(), String> {
    let available = channel.bytes_available().map_err(|e| e.to_string())?;
    if available == 0 {
        return Ok(());
    }

    let bytes = channel.read_available().map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Ok(());
    }

    log.write_all(&bytes)
        .await
        .map_err(|e| format!("log write failed: {e}"))?;
    log.flush()
        .await
        .map_err(|e| format!("log flush failed: {e}"))?;

    shared
        .bytes_written
        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
    Ok(())
}
