pub mod cli;
pub mod config;
pub mod handlers;
pub mod recorder;
pub mod serial;
pub mod state;
pub mod telemetry;

pub use config::{DeviceSettings, ServerConfig};
pub use recorder::{Recorder, RecorderOptions};
pub use state::ServerState;
