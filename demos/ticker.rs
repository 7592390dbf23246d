//! Ticker stream - public market data without credentials.
//!
//! This example demonstrates:
//! - Selecting the endpoint from the command line
//! - Registering a push event handler
//! - Subscribing to book, trades and ticker channels of one instrument
//!
//! # Running
//!
//! ```text
//! RUST_LOG=deribit_wire=debug cargo run --example ticker -- test BTC-PERPETUAL
//! ```

use deribit_wire::api::channels;
use deribit_wire::{ChannelKind, Endpoint, Session};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let endpoint: Endpoint = args.next().as_deref().unwrap_or("test").parse()?;
    let instrument = args.next().unwrap_or_else(|| "BTC-PERPETUAL".to_string());

    let session = Session::builder()
        .endpoint(endpoint)
        .on_push_event(|event| match ChannelKind::classify(&event.channel) {
            ChannelKind::Ticker => println!(
                "[ticker] {} last={} mark={}",
                event.channel, event.data["last_price"], event.data["mark_price"]
            ),
            ChannelKind::Trades => {
                let count = event.data.as_array().map_or(0, Vec::len);
                println!("[trades] {} {} trade(s)", event.channel, count);
            }
            ChannelKind::OrderBook => println!(
                "[book] {} change_id={}",
                event.channel, event.data["change_id"]
            ),
            _ => println!("[{}] {}", event.channel, event.data),
        })
        .connect()
        .await?;

    println!("Server time: {}", session.get_time().await?);

    for channel in [
        channels::ticker(&instrument),
        channels::trades(&instrument),
        channels::book(&instrument),
    ] {
        session.subscribe(&channel).await?;
    }
    println!("Active: {:?}", session.list_active_subscriptions());

    tokio::signal::ctrl_c().await?;
    session.close("ticker demo finished").await;
    Ok(())
}
