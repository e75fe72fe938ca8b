//! [`Connector`] backed by `tokio-tungstenite`.

use super::{Connector, Inbound, Link, Outbound};
use crate::error::{Result, SocketError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
  connect_async,
  tungstenite::{
    client::IntoClientRequest,
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
    Message,
  },
};

/// Opens real WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
  async fn open(&self, url: &str, protocols: &[String]) -> Result<Link> {
    let mut request = url.into_client_request()?;
    if !protocols.is_empty() {
      let offered = HeaderValue::from_str(&protocols.join(", "))
        .map_err(|e| SocketError::Connect(format!("invalid subprotocol list: {}", e)))?;
      request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
    }

    let (stream, _response) = connect_async(request).await?;
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

    // Pump frames from the client to the socket
    tokio::spawn(async move {
      while let Some(frame) = outbound_rx.recv().await {
        match frame {
          Outbound::Text(text) => {
            if let Err(e) = sink.send(Message::text(text)).await {
              tracing::warn!("Failed to send frame: {}", e);
              break;
            }
          }
          Outbound::Close => {
            let _ = sink.close().await;
            break;
          }
        }
      }
    });

    // Pump frames from the socket to the client
    tokio::spawn(async move {
      while let Some(frame) = source.next().await {
        match frame {
          Ok(Message::Text(text)) => {
            if inbound_tx.send(Inbound::Text(text.as_str().to_owned())).is_err() {
              return;
            }
          }
          Ok(Message::Close(_)) => break,
          Ok(_) => {}
          Err(e) => {
            let _ = inbound_tx.send(Inbound::Error(e.to_string()));
            break;
          }
        }
      }
      let _ = inbound_tx.send(Inbound::Closed);
    });

    Ok(Link {
      outbound: outbound_tx,
      inbound: inbound_rx,
    })
  }
}
