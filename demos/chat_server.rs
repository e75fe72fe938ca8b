//! Chat server demonstrating rooms, broadcasts and answered requests.
//!
//! Clients offer the `chat` subprotocol and then send:
//! - `join` `{ "room": "general" }` to enter a room (answered with the member list)
//! - `say` `{ "room": "general", "text": "hi" }` to talk to a room
//! - `sum` `[1, 2, 3]` to get the total back

use roomcast::*;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct Join {
  room: String,
}

#[derive(Debug, Deserialize)]
struct Say {
  room: String,
  text: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();

  let broker = Broker::new(ServerConfig {
    port: 8081,
    close_clients_on_shutdown: true,
    ..ServerConfig::default()
  });

  // Only admit clients speaking our protocol
  broker.on_guest(|id, protocols| async move {
    let allowed = protocols.iter().any(|p| p == "chat");
    if !allowed {
      tracing::info!("Turning away {} (offered {:?})", id, protocols);
    }
    allowed
  });

  broker.get_room("general");

  let hub = broker.clone();
  broker.on_connected(move |client| {
    let id = client.id().to_string();
    let _ = client.add_room("general");
    let _ = hub.get_room("general").emit("joined", json!({ "id": id }));

    let rooms = hub.clone();
    let joiner = id.clone();
    client.on("join", move |message| {
      let Join { room } = serde_json::from_value(message).ok()?;
      let room = rooms.get_room(&room);
      room.add_client(&joiner).ok()?;
      Some(json!(room.clients()))
    });

    let rooms = hub.clone();
    let speaker = id.clone();
    client.on("say", move |message| {
      let Say { room, text } = serde_json::from_value(message).ok()?;
      let _ = rooms
        .get_room(&room)
        .emit("said", json!({ "from": speaker, "room": room, "text": text }));
      None
    });

    client.on("sum", |message| {
      let numbers: Vec<f64> = serde_json::from_value(message).ok()?;
      Some(Value::from(numbers.iter().sum::<f64>()))
    });
  });

  let hub = broker.clone();
  broker.on_disconnected(move |client| {
    for room in client.get_rooms() {
      let _ = room.emit("left", json!({ "id": client.id() }));
    }
    tracing::info!("{} clients remain", hub.client_count().saturating_sub(1));
  });

  broker.on_error(|client, error| {
    tracing::warn!("Client {} hit a transport error: {}", client.id(), error);
  });

  let stopper = broker.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      stopper.close();
    }
  });

  broker.listen_on_port().await?;
  Ok(())
}
