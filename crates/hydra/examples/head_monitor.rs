//! Example: connect to a hydra node, print every event and each head status transition.
//!
//! Usage: cargo run -p hydra --example head_monitor -- --http-url URL [--ws-url WS_URL] [--history] [--address ADDR]

use hydra::{ClientConfig, EventKind, HeadClient};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let mut http_url = String::new();
    let mut ws_url = None;
    let mut address = None;
    let mut history = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--ws-url" => {
                i += 1;
                ws_url = args.get(i).cloned();
            }
            "--address" => {
                i += 1;
                address = args.get(i).cloned();
            }
            "--history" => history = true,
            _ => {}
        }
        i += 1;
    }
    if http_url.is_empty() {
        eprintln!("Usage: head_monitor --http-url URL [--ws-url WS_URL] [--history] [--address ADDR]");
        std::process::exit(1);
    }

    let mut config = ClientConfig::new(http_url);
    config.ws_url = ws_url;
    config.address = address;
    config.history = history;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let client = HeadClient::new(config)?;
        let _printer = client.on_event(|ev| match &ev.kind {
            EventKind::Unrecognized(u) => println!("{} (unrecognized) {}", ev.tag(), u.payload),
            EventKind::Disconnected(d) => println!("Disconnected: {}", d.reason),
            _ => println!("{}", ev.tag()),
        });
        let mut status = client.status_changes();
        client.connect().await?;
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *status.borrow_and_update();
                    println!(
                        "status={} connection={:?} head_id={}",
                        current,
                        client.connection_state(),
                        client.head_id().unwrap_or_default()
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    client.disconnect().await;
                    break;
                }
            }
        }
        if let Some(utxo) = client.snapshot_utxo() {
            println!("last snapshot: {} utxo", utxo.len());
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}
