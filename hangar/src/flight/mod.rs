//! Arrow Flight gRPC server for Hangar
//!
//! Stores named in-memory Arrow tables and serves them back over Flight.
//!
//! Usage:
//!   hangar-server --host 127.0.0.1 --port 5005
//!
//! Python client example:
//!   import pyarrow.flight as flight
//!   client = flight.connect("grpc://127.0.0.1:5005")
//!   for info in client.list_flights():
//!       table = client.do_get(info.endpoints[0].ticket).read_all()
//!   list(client.do_action(flight.Action("drop_table", b"chars")))

mod lifecycle;
mod service;

pub use lifecycle::Lifecycle;
pub use service::{
    ClearAck, HangarFlightService, PutCommit, ACTIONS, HEALTHCHECK_ACK, SHUTDOWN_ACK,
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arrow_flight::flight_service_server::FlightServiceServer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::catalog::Catalog;
use crate::{HangarError, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to and advertise in endpoint locations
    pub host: String,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
    /// Delay between acknowledging `shutdown` and closing the listener
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5005,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// A running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    location: String,
    catalog: Arc<Catalog>,
    lifecycle: Arc<Lifecycle>,
    task: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Wait for the server to stop on its own (shutdown action or signal)
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| HangarError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }

    /// Stop immediately; in-flight flows are aborted
    pub async fn shutdown(self) -> Result<()> {
        self.lifecycle.shutdown_now();
        self.wait().await
    }
}

/// Bind the listener and serve in the background.
pub async fn start_server(config: ServerConfig) -> Result<ServerHandle> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    let location = format!("grpc+tcp://{}:{}", config.host, local_addr.port());

    let catalog = Arc::new(Catalog::new());
    let lifecycle = Arc::new(Lifecycle::new());
    let service = HangarFlightService::new(
        Arc::clone(&catalog),
        Arc::clone(&lifecycle),
        location.clone(),
        config.shutdown_grace,
    );

    let token = lifecycle.token();
    let stopped_catalog = Arc::clone(&catalog);
    let task = tokio::spawn(async move {
        let result = Server::builder()
            .add_service(FlightServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                token.cancelled().await
            })
            .await;
        let released = stopped_catalog.clear();
        log::info!("Hangar server stopped, released {} tables", released);
        result
    });

    log::info!("Hangar Flight server listening on {} ({})", location, local_addr);

    Ok(ServerHandle {
        local_addr,
        location,
        catalog,
        lifecycle,
        task,
    })
}

/// Run until a `shutdown` action or Ctrl-C.
pub async fn run_server(config: ServerConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let handle = start_server(config).await?;

    println!("Hangar Arrow Flight Server");
    println!("  Listening on: {}", handle.location());
    println!("  Bound to:     {}", handle.local_addr());
    println!("  Python:       pyarrow.flight.connect(\"grpc://{}\")", handle.local_addr());

    let lifecycle = Arc::clone(handle.lifecycle());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down Hangar server...");
            lifecycle.shutdown_now();
        }
    });

    handle.wait().await?;
    Ok(())
}
