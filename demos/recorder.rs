//! Records the traffic of a browser using the proxy
//!
//! To run:
//! ```bash
//! RUST_LOG=slinger_recorder=debug cargo run --example recorder -- 8080
//! ```
//! then point the browser's HTTP and HTTPS proxy at `127.0.0.1:8080`.
//! Type a line and press enter to insert it as a tag.

use slinger_recorder::{ChannelListener, ProxyConfig, ProxyServer, RecorderEvent, UpstreamProxy};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let port = std::env::args()
    .nth(1)
    .map(|port| port.parse())
    .transpose()?
    .unwrap_or(slinger_recorder::DEFAULT_PORT);
  let mut config = ProxyConfig::new(port);
  if let Ok(upstream) = std::env::var("UPSTREAM_PROXY") {
    config = config.upstream_proxy(UpstreamProxy::parse(upstream)?);
  }

  let server = ProxyServer::builder().config(config).build().await?;
  let (listener, mut events) = ChannelListener::new();
  server.subscribe(listener);
  let addr = server.start().await?;
  println!("recording on {}", addr);

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      event = events.recv() => match event {
        Some(RecorderEvent::RequestCaptured(request)) => {
          println!("#{} {} {}", request.id, request.method, request.url);
          if let Some((user, _)) = request.basic_auth() {
            println!("#{}   basic auth as {}", request.id, user);
          }
          for (name, value) in request.form_params() {
            println!("#{}   {}={}", request.id, name, value);
          }
        }
        Some(RecorderEvent::ResponseCaptured(response)) => {
          println!(
            "#{} <- {} ({} bytes)",
            response.request_id,
            response.status,
            response.body.as_ref().map(|body| body.len()).unwrap_or(0)
          );
        }
        Some(RecorderEvent::TagInserted(marker)) => println!("---- {} ----", marker.label),
        None => break,
      },
      line = lines.next_line() => match line? {
        Some(label) if !label.trim().is_empty() => {
          server.insert_tag(label.trim());
        }
        Some(_) => {}
        None => break,
      },
    }
  }
  server.shutdown().await;
  Ok(())
}
