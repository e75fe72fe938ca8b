//! Chat client talking to the `chat_server` demo.

use roomcast::*;
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing();

  let config = ClientConfig::new("localhost:8081")
    .with_protocols(["chat"])
    .with_reconnect(5, Duration::from_secs(2))
    .with_response_timeout(Duration::from_secs(5));
  let client = SocketClient::new(config)?;

  client.on("connected", |_| println!("* connected"));
  client.on("disconnected", |_| println!("* disconnected"));
  client.on("joined", |message| println!("* joined: {}", message["id"]));
  client.on("left", |message| println!("* left: {}", message["id"]));
  client.on("said", |message| {
    println!("[{}] {}: {}", message["room"], message["from"], message["text"]);
  });

  if client.connect().await? != ConnectionState::Open {
    anyhow::bail!("could not reach {}", client.url());
  }

  let members = client.request("join", json!({ "room": "rust" })).await?;
  println!("* rust room members: {}", members);

  client.emit("say", json!({ "room": "rust", "text": "hello from roomcast" }))?;

  let total = client.request("sum", json!([1, 2, 3.5])).await?;
  println!("* 1 + 2 + 3.5 = {}", total);

  tokio::time::sleep(Duration::from_secs(1)).await;
  client.close();
  Ok(())
}
