mod controller;
mod types;
mod worker;

pub use controller::{Recorder, RecorderOptions};
pub use types::{
    RecorderError, RecordingState, SessionDescriptor, StartRequest, StatusSnapshot,
};
