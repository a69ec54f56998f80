//! Demo feed subscriber: connects to a public market-data stream and prints
//! every message until Ctrl-C.

use std::time::Duration;

use clap::Parser;
use tickws::{CancellationToken, CloseCode, Options, Received, WsClient};
use url::Url;

/// Subscribe to a WebSocket market-data feed and print received messages.
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// The WebSocket URI to subscribe to (ws:// or wss://)
    #[arg(
        env = "TICKWS_URL",
        default_value = "wss://stream.binance.com:9443/ws/btcusdt@trade"
    )]
    url: Url,

    /// Offer permessage-deflate compression to the server
    #[arg(short, long)]
    compress: bool,

    /// Send a keep-alive ping at this interval, e.g. "15s"
    #[arg(long, value_parser = humantime::parse_duration)]
    ping_interval: Option<Duration>,

    /// Log protocol-level details
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level).expect("log");

    let mut options = Options::default();
    if cli.compress {
        options = options.with_compression();
    }
    if let Some(interval) = cli.ping_interval {
        options = options.with_keep_alive(interval, b"tickws".to_vec());
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("interrupt received, shutting down");
            cancel.cancel();
        });
    }

    let mut ws = WsClient::connect(cli.url.clone(), options, &cancel).await?;
    log::info!(
        "connected to {} (tls={}, compression={})",
        cli.url,
        ws.is_tls(),
        ws.compression().is_some()
    );

    loop {
        match ws.receive(&cancel).await {
            Ok(Received::Message { opcode, payload }) => match opcode {
                tickws::OpCode::Text => println!("{}", String::from_utf8_lossy(payload)),
                _ => println!("<{} binary bytes>", payload.len()),
            },
            Ok(Received::Close { code, reason }) => {
                log::info!("server closed: code={:?} reason={:?}", code, reason);
                break;
            }
            Err(tickws::WsError::Cancelled) => {
                // Best-effort goodbye on our way out; don't wait on a
                // server that has stopped talking.
                let goodbye = CancellationToken::new();
                let _ = tokio::time::timeout(
                    Duration::from_secs(2),
                    ws.close(CloseCode::Normal, "", &goodbye),
                )
                .await;
                break;
            }
            Err(err) => {
                log::error!("receive failed: {err}");
                return Err(err.into());
            }
        }
    }

    Ok(())
}
