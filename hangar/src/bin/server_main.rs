//! Hangar Arrow Flight gRPC Server
//!
//! Usage:
//!   hangar-server --host 127.0.0.1 --port 5005
//!
//! Python client:
//!   import pyarrow.flight as flight
//!   c = flight.connect("grpc://127.0.0.1:5005")
//!   print([i.descriptor for i in c.list_flights()])

use clap::Parser;
use std::time::Duration;

use hangar::flight::{self, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "hangar-server")]
#[command(about = "Hangar in-memory table exchange server over Arrow Flight")]
#[command(version)]
struct Args {
    /// Host to bind to and advertise
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 5005)]
    port: u16,

    /// Milliseconds between acknowledging a shutdown action and stopping
    #[arg(long, default_value_t = 2000)]
    shutdown_grace_ms: u64,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
    };

    if let Err(e) = flight::run_server(config).await {
        eprintln!("Hangar server error: {}", e);
        std::process::exit(1);
    }
}
