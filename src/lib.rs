//! Event-based pub/sub over WebSockets.
//!
//! [`SocketClient`] keeps one connection alive across drops and correlates
//! requests with answers. [`Broker`] accepts connections, tracks clients and
//! rooms, and routes events between them.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod room;
pub mod server;

pub use client::{ConnectionState, Connector, SocketClient, WebSocketConnector};
pub use config::{ClientConfig, ServerConfig};
pub use dispatcher::HandlerId;
pub use error::{Result, SocketError, TransportError};
pub use protocol::Envelope;
pub use server::{Broker, ClientTransport, Room, ServerClient};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber, filtered by `RUST_LOG` when it is set.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
  let _ = tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
          "{}=debug,tower_http=debug,axum::rejection=trace",
          env!("CARGO_CRATE_NAME")
        )
        .into()
      }),
    )
    .with(tracing_subscriber::fmt::layer())
    .try_init();
}

/// Run a bare broker configured from the environment (and `.env`) until it is closed.
pub async fn run() -> anyhow::Result<()> {
  init_tracing();

  let broker = Broker::new(ServerConfig::from_env());
  broker.listen_on_port().await?;
  Ok(())
}
