//! Trader - credential handshake and account queries.
//!
//! This example demonstrates:
//! - Reading API keys from `DERIBIT_CLIENT_ID` / `DERIBIT_CLIENT_SECRET`
//! - Authenticating and issuing privileged calls
//! - Placing and cancelling a far-from-market limit order
//!
//! # Running
//!
//! ```text
//! DERIBIT_CLIENT_ID=... DERIBIT_CLIENT_SECRET=... cargo run --example trader -- BTC-PERPETUAL
//! ```
//!
//! Always runs against the test endpoint.

use deribit_wire::{Credentials, Endpoint, OrderType, Session};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let instrument = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "BTC-PERPETUAL".to_string());
    let credentials = Credentials::from_env()?;

    let session = Session::connect(Endpoint::Test).await?;
    session.authenticate_with(&credentials).await?;
    if let Some(token) = session.access_token() {
        println!("Authenticated, scope: {:?}", token.scope());
    }

    let summary = session.get_account_summary("BTC").await?;
    println!("Equity: {} BTC", summary["equity"]);

    let positions = session.get_positions("BTC").await?;
    println!("Positions: {}", positions);

    let book = session.get_order_book(&instrument, 5).await?;
    let best_bid = book["best_bid_price"].as_f64().unwrap_or(1.0);
    let price = (best_bid * 0.5).round().max(1.0);

    let placed = session
        .buy(&instrument, 10.0, OrderType::Limit { price })
        .await?;
    let order_id = placed["order"]["order_id"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    println!("Placed {} at {}", order_id, price);

    println!("Open: {}", session.get_open_orders(Some(&instrument)).await?);

    session.cancel(&order_id).await?;
    println!("Cancelled {}", order_id);

    println!("History: {}", session.get_order_history(Some(&instrument)).await?);

    session.close("trader demo finished").await;
    Ok(())
}
