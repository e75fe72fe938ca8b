//! axum accept layer: upgrade decision, per-connection session, and the
//! [`ClientTransport`] seam the broker sends through.

use super::Broker;
use crate::error::TransportError;
use axum::{
  extract::{
    ws::{CloseFrame, Message, WebSocket},
    FromRequestParts, Request, State, WebSocketUpgrade,
  },
  http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap, StatusCode},
  response::{IntoResponse, Response},
  Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

/// Sending half of one client connection, as seen by the broker.
///
/// Sends are fire-and-forget: the broker checks [`is_open`](Self::is_open)
/// first and never waits on a slow peer.
pub trait ClientTransport: Send + Sync {
  fn is_open(&self) -> bool;

  fn send(&self, text: String);

  fn close(&self, code: Option<u16>, reason: Option<String>);
}

/// WebSocket transport; frames are queued to a writer task.
pub(crate) struct WsTransport {
  tx: mpsc::UnboundedSender<Message>,
  open: AtomicBool,
}

impl WsTransport {
  fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
    Self {
      tx,
      open: AtomicBool::new(true),
    }
  }

  fn mark_closed(&self) {
    self.open.store(false, Ordering::SeqCst);
  }
}

impl ClientTransport for WsTransport {
  fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
  }

  fn send(&self, text: String) {
    if self.is_open() {
      let _ = self.tx.send(Message::Text(text.into()));
    }
  }

  fn close(&self, code: Option<u16>, reason: Option<String>) {
    if self.open.swap(false, Ordering::SeqCst) {
      let frame = CloseFrame {
        code: code.unwrap_or(1000),
        reason: reason.unwrap_or_default().into(),
      };
      let _ = self.tx.send(Message::Close(Some(frame)));
    }
  }
}

#[derive(Clone)]
struct AcceptState {
  broker: Broker,
  next: Router,
}

/// Router that upgrades every WebSocket request and hands anything else to `next`.
pub(crate) fn router(broker: Broker, next: Router) -> Router {
  let cors = CorsLayer::new()
    .allow_methods(Any)
    .allow_origin(Any)
    .allow_headers(Any);

  Router::new()
    .fallback(accept)
    .with_state(AcceptState { broker, next })
    .layer(TraceLayer::new_for_http())
    .layer(cors)
}

/// Default handler for requests that are not WebSocket upgrades.
pub(crate) async fn not_implemented() -> StatusCode {
  StatusCode::NOT_IMPLEMENTED
}

async fn accept(State(state): State<AcceptState>, request: Request) -> Response {
  let (mut parts, body) = request.into_parts();
  let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
    Ok(upgrade) => upgrade,
    Err(_) => {
      let request = Request::from_parts(parts, body);
      return match state.next.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
      };
    }
  };

  let protocols = offered_protocols(&parts.headers);
  let Some(client_id) = state.broker.admit(&protocols).await else {
    return StatusCode::FORBIDDEN.into_response();
  };

  let upgrade = match protocols.first() {
    Some(protocol) => upgrade.protocols([protocol.clone()]),
    None => upgrade,
  };
  let broker = state.broker;
  upgrade
    .on_upgrade(move |socket| session(broker, client_id, socket))
    .into_response()
}

/// Subprotocols listed in `Sec-WebSocket-Protocol`, in offer order.
pub(crate) fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
  headers
    .get_all(SEC_WEBSOCKET_PROTOCOL)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| value.split(','))
    .map(str::trim)
    .filter(|protocol| !protocol.is_empty())
    .map(String::from)
    .collect()
}

/// Drive one upgraded connection until either side goes away.
async fn session(broker: Broker, client_id: String, socket: WebSocket) {
  let (mut sink, mut stream) = socket.split();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let transport = Arc::new(WsTransport::new(tx));

  if let Err(e) = broker.register(client_id.clone(), transport.clone()) {
    tracing::warn!("Dropping connection {}: {}", client_id, e);
    let _ = sink.close().await;
    return;
  }

  // Pump queued frames to the socket
  let writer = {
    let transport = transport.clone();
    let client_id = client_id.clone();
    tokio::spawn(async move {
      while let Some(frame) = rx.recv().await {
        if sink.send(frame).await.is_err() {
          tracing::warn!("Failed to send message to {}", client_id);
          transport.mark_closed();
          break;
        }
      }
    })
  };

  while let Some(frame) = stream.next().await {
    match frame {
      Ok(Message::Text(text)) => {
        if let Err(e) = broker.handle_message(&client_id, text.as_str()) {
          tracing::warn!("Failed to handle message from {}: {}", client_id, e);
        }
      }
      Ok(Message::Close(_)) => {
        tracing::info!("Client {} closed connection", client_id);
        break;
      }
      Ok(_) => {}
      Err(e) => {
        broker.handle_error(&client_id, TransportError::new(e.to_string()));
        // Read errors leave the socket unusable.
        break;
      }
    }
  }

  transport.mark_closed();
  writer.abort();
  broker.handle_close(&client_id);
}
