use clap::{Parser, Subcommand};

/// Exoskeleton companion server - serial capture and live telemetry
#[derive(Parser)]
#[command(name = "exo-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server (default)
    Serve,

    /// List serial devices that look like capture hardware
    Ports,
}
