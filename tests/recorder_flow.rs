// End-to-end recorder tests driven through scripted serial channels.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exo_server::recorder::{
    Recorder, RecorderError, RecorderOptions, RecordingState, StartRequest,
};
use exo_server::serial::{ChannelError, ChannelOpener, SerialChannel};
use tempfile::TempDir;

const POLL: Duration = Duration::from_millis(10);

fn test_options() -> RecorderOptions {
    RecorderOptions {
        poll_interval: POLL,
        startup_grace: Duration::from_millis(500),
    }
}

fn request(record: &str) -> StartRequest {
    StartRequest {
        subject: "P1".to_string(),
        session: "S1".to_string(),
        record: record.to_string(),
        port: "/dev/ttyTEST".to_string(),
        baud: 115200,
    }
}

/// Channel that serves one scripted chunk per drain, optionally failing
/// after a fixed number of successful drains.
struct ScriptedChannel {
    chunks: Vec<Vec<u8>>,
    fail_after_reads: Option<usize>,
    reads: usize,
    closed: Arc<AtomicBool>,
}

impl SerialChannel for ScriptedChannel {
    fn bytes_available(&mut self) -> Result<usize, ChannelError> {
        if let Some(limit) = self.fail_after_reads {
            if self.reads >= limit {
                return Err(ChannelError::Read("device went away".to_string()));
            }
        }
        Ok(self.chunks.first().map(|c| c.len()).unwrap_or(0))
    }

    fn read_available(&mut self) -> Result<Vec<u8>, ChannelError> {
        self.reads += 1;
        if self.chunks.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(self.chunks.remove(0))
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedOpener {
    chunks: Vec<Vec<u8>>,
    fail_open: bool,
    fail_after_reads: Option<usize>,
    opens: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl ScriptedOpener {
    fn with_chunks(chunks: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.into_iter().map(|c| c.as_bytes().to_vec()).collect(),
            fail_open: false,
            fail_after_reads: None,
            opens: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn failing_open() -> Arc<Self> {
        Arc::new(Self {
            chunks: Vec::new(),
            fail_open: true,
            fail_after_reads: None,
            opens: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn failing_after(chunks: Vec<&str>, reads: usize) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.into_iter().map(|c| c.as_bytes().to_vec()).collect(),
            fail_open: false,
            fail_after_reads: Some(reads),
            opens: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn channel_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ChannelOpener for ScriptedOpener {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialChannel>, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(ChannelError::Open {
                port: port.to_string(),
                reason: "device busy".to_string(),
            });
        }
        Ok(Box::new(ScriptedChannel {
            chunks: self.chunks.clone(),
            fail_after_reads: self.fail_after_reads,
            reads: 0,
            closed: self.closed.clone(),
        }))
    }
}

fn recorder_with(dir: &TempDir, opener: Arc<ScriptedOpener>) -> Recorder {
    Recorder::new(dir.path().to_path_buf(), opener, test_options())
}

#[tokio::test]
async fn capture_reports_recording_state_and_bytes() {
    let rows: String = (0..10).map(|_| "1,2,3\n").collect();
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(vec![rows.as_str(), rows.as_str(), rows.as_str()]);
    let recorder = recorder_with(&dir, opener.clone());

    recorder.start(request("R1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let status = recorder.status().await;
    assert_eq!(status.state, RecordingState::Recording);
    assert!(status.bytes_written > 0);
    let session = status.session.unwrap();
    assert_eq!(session.subject, "P1");
    assert_eq!(session.record, "R1");

    // The log holds the scripted bytes verbatim once all chunks drained.
    let log = dir.path().join("sub_P1").join("sess_S1").join("rec_R1.csv");
    let contents = std::fs::read_to_string(&log).unwrap();
    assert_eq!(contents, rows.repeat(3));
    assert_eq!(status.bytes_written, contents.len() as u64);

    // 30 parsed rows -> a window of 10: the trailing 20 are the torn-read
    // margin, and the count stays far below the 1000-row cap.
    let telemetry = status.telemetry.unwrap();
    assert_eq!(telemetry.columns, vec!["V0", "V1", "V2"]);
    assert_eq!(telemetry.rows.len(), 10);

    recorder.stop().await;
}

#[tokio::test]
async fn stop_finishes_and_closes_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(vec!["1,2,3\n"]);
    let recorder = recorder_with(&dir, opener.clone());

    recorder.start(request("R1")).await.unwrap();
    recorder.stop().await;

    // Stop latency is bounded by the poll interval; give it two intervals
    // plus scheduling slack.
    tokio::time::sleep(POLL * 2 + Duration::from_millis(30)).await;

    let status = recorder.status().await;
    assert_eq!(status.state, RecordingState::Finished);
    assert!(status.error.is_none());
    assert!(opener.channel_closed());
}

#[tokio::test]
async fn concurrent_starts_spawn_exactly_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(vec!["1,2,3\n"]);
    let recorder = recorder_with(&dir, opener.clone());

    let (first, second) = tokio::join!(
        recorder.start(request("R1")),
        recorder.start(request("R1"))
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(opener.opens(), 1);

    recorder.stop().await;
}

#[tokio::test]
async fn start_is_idempotent_while_recording() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(vec!["1,2,3\n"]);
    let recorder = recorder_with(&dir, opener.clone());

    let first = recorder.start(request("R1")).await.unwrap();
    let second = recorder.start(request("R2")).await.unwrap();

    // The existing run is returned unchanged; no second channel is opened.
    assert_eq!(second.record, first.record);
    assert_eq!(opener.opens(), 1);

    recorder.stop().await;
}

#[tokio::test]
async fn stop_before_any_start_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(vec![]);
    let recorder = recorder_with(&dir, opener);

    recorder.stop().await;

    let status = recorder.status().await;
    assert_eq!(status.state, RecordingState::Idle);
    assert_eq!(status.bytes_written, 0);
    assert!(status.session.is_none());
    assert!(status.error.is_none());
    assert!(status.telemetry.is_none());
}

#[tokio::test]
async fn startup_failure_surfaces_and_stays_observable() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::failing_open();
    let recorder = recorder_with(&dir, opener);

    let err = recorder.start(request("R1")).await.unwrap_err();
    assert!(matches!(err, RecorderError::Channel(_)));

    let status = recorder.status().await;
    assert_eq!(status.state, RecordingState::Errored);
    assert!(status.error.unwrap().contains("device busy"));
}

#[tokio::test]
async fn channel_fault_is_distinct_from_a_clean_stop() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::failing_after(vec!["1,2,3\n", "4,5,6\n"], 2);
    let recorder = recorder_with(&dir, opener.clone());

    recorder.start(request("R1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = recorder.status().await;
    assert_eq!(status.state, RecordingState::Errored);
    assert!(status.error.unwrap().contains("device went away"));
    assert!(opener.channel_closed());
}

#[tokio::test]
async fn byte_counter_never_decreases() {
    let rows: String = (0..5).map(|_| "9,8,7\n").collect();
    let chunks: Vec<&str> = (0..8).map(|_| rows.as_str()).collect();
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(chunks);
    let recorder = recorder_with(&dir, opener);

    recorder.start(request("R1")).await.unwrap();

    let mut last = 0u64;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(15)).await;
        let bytes = recorder.status().await.bytes_written;
        assert!(bytes >= last, "byte counter went backwards: {bytes} < {last}");
        last = bytes;
    }
    assert!(last > 0);

    recorder.stop().await;
}

#[tokio::test]
async fn finished_session_is_superseded_by_a_new_start() {
    let dir = tempfile::tempdir().unwrap();
    let opener = ScriptedOpener::with_chunks(vec!["1,2,3\n"]);
    let recorder = recorder_with(&dir, opener.clone());

    recorder.start(request("R1")).await.unwrap();
    recorder.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.status().await.state, RecordingState::Finished);

    let descriptor = recorder.start(request("R2")).await.unwrap();
    assert_eq!(descriptor.record, "R2");
    assert_eq!(opener.opens(), 2);

    let status = recorder.status().await;
    assert_eq!(status.state, RecordingState::Recording);
    assert_eq!(status.session.unwrap().record, "R2");

    recorder.stop().await;
}
