//! Per-method wrappers and channel helpers.
//!
//! Each wrapper is a single [`Session::call`] with the parameters the server
//! expects; results are returned as raw JSON.

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::session::Session;

/// Channel name builders.
pub mod channels {
    /// Update interval used by the market channels.
    pub const DEFAULT_INTERVAL: &str = "100ms";

    /// Order book channel, e.g. `book.BTC-PERPETUAL.100ms`.
    pub fn book(instrument: &str) -> String {
        format!("book.{instrument}.{DEFAULT_INTERVAL}")
    }

    /// Trades channel, e.g. `trades.BTC-PERPETUAL.100ms`.
    pub fn trades(instrument: &str) -> String {
        format!("trades.{instrument}.{DEFAULT_INTERVAL}")
    }

    /// Ticker channel, e.g. `ticker.BTC-PERPETUAL.100ms`.
    pub fn ticker(instrument: &str) -> String {
        format!("ticker.{instrument}.{DEFAULT_INTERVAL}")
    }
}

/// Kind of data a channel carries, by name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    OrderBook,
    Trades,
    Ticker,
    UserOrders,
    UserTrades,
    Other,
}

impl ChannelKind {
    /// Classify a channel name.
    pub fn classify(channel: &str) -> Self {
        let mut parts = channel.split('.');
        match (parts.next(), parts.next()) {
            (Some("book"), _) => ChannelKind::OrderBook,
            (Some("trades"), _) => ChannelKind::Trades,
            (Some("ticker"), _) => ChannelKind::Ticker,
            (Some("user"), Some("orders")) => ChannelKind::UserOrders,
            (Some("user"), Some("trades")) => ChannelKind::UserTrades,
            _ => ChannelKind::Other,
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    fn method(self) -> &'static str {
        match self {
            Side::Buy => "private/buy",
            Side::Sell => "private/sell",
        }
    }
}

/// Order type with its type-specific parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderType {
    /// Good-til-cancelled limit order, not post-only, not reduce-only.
    Limit { price: f64 },
    Market,
}

impl OrderType {
    fn apply(self, params: &mut Map<String, Value>) {
        match self {
            OrderType::Market => {
                params.insert("type".into(), json!("market"));
            }
            OrderType::Limit { price } => {
                params.insert("type".into(), json!("limit"));
                params.insert("price".into(), json!(price));
                params.insert("time_in_force".into(), json!("good_til_cancelled"));
                params.insert("post_only".into(), json!(false));
                params.insert("reduce_only".into(), json!(false));
            }
        }
    }
}

/// Parameters of an order placement.
pub(crate) fn order_params(instrument: &str, amount: f64, order_type: OrderType) -> Value {
    let mut params = Map::new();
    params.insert("instrument_name".into(), json!(instrument));
    params.insert("amount".into(), json!(amount));
    order_type.apply(&mut params);
    Value::Object(params)
}

fn instrument_filter(instrument: Option<&str>) -> Value {
    match instrument {
        Some(name) if !name.is_empty() => json!({ "instrument_name": name }),
        _ => json!({}),
    }
}

impl Session {
    /// Server time in milliseconds.
    pub async fn get_time(&self) -> Result<Value> {
        self.call("public/get_time", json!({}), false).await
    }

    pub async fn get_currencies(&self) -> Result<Value> {
        self.call("public/get_currencies", json!({}), false).await
    }

    /// Instruments of `currency`, filtered by `kind` (`future`, `option`, ...).
    pub async fn get_instruments(&self, currency: &str, kind: &str) -> Result<Value> {
        let params = json!({ "currency": currency, "kind": kind });
        self.call("public/get_instruments", params, false).await
    }

    pub async fn get_order_book(&self, instrument: &str, depth: u32) -> Result<Value> {
        let params = json!({ "instrument_name": instrument, "depth": depth });
        self.call("public/get_order_book", params, false).await
    }

    /// Candles between two millisecond timestamps.
    pub async fn get_tradingview_chart_data(
        &self,
        instrument: &str,
        start_timestamp: u64,
        end_timestamp: u64,
        resolution: &str,
    ) -> Result<Value> {
        let params = json!({
            "instrument_name": instrument,
            "start_timestamp": start_timestamp,
            "end_timestamp": end_timestamp,
            "resolution": resolution,
        });
        self.call("public/get_tradingview_chart_data", params, false)
            .await
    }

    pub async fn get_account_summary(&self, currency: &str) -> Result<Value> {
        let params = json!({ "currency": currency });
        self.call("private/get_account_summary", params, true).await
    }

    pub async fn get_positions(&self, currency: &str) -> Result<Value> {
        let params = json!({ "currency": currency });
        self.call("private/get_positions", params, true).await
    }

    /// Place an order.
    pub async fn place_order(
        &self,
        side: Side,
        instrument: &str,
        amount: f64,
        order_type: OrderType,
    ) -> Result<Value> {
        let params = order_params(instrument, amount, order_type);
        self.call(side.method(), params, true).await
    }

    pub async fn buy(&self, instrument: &str, amount: f64, order_type: OrderType) -> Result<Value> {
        self.place_order(Side::Buy, instrument, amount, order_type)
            .await
    }

    pub async fn sell(&self, instrument: &str, amount: f64, order_type: OrderType) -> Result<Value> {
        self.place_order(Side::Sell, instrument, amount, order_type)
            .await
    }

    pub async fn cancel(&self, order_id: &str) -> Result<Value> {
        let params = json!({ "order_id": order_id });
        self.call("private/cancel", params, true).await
    }

    pub async fn cancel_all(&self) -> Result<Value> {
        self.call("private/cancel_all", json!({}), true).await
    }

    /// Change amount and price of an open order.
    pub async fn edit(&self, order_id: &str, amount: f64, price: f64) -> Result<Value> {
        let params = json!({ "order_id": order_id, "amount": amount, "price": price });
        self.call("private/edit", params, true).await
    }

    pub async fn get_open_orders(&self, instrument: Option<&str>) -> Result<Value> {
        self.call(
            "private/get_open_orders_by_instrument",
            instrument_filter(instrument),
            true,
        )
        .await
    }

    pub async fn get_order_history(&self, instrument: Option<&str>) -> Result<Value> {
        self.call(
            "private/get_order_history_by_instrument",
            instrument_filter(instrument),
            true,
        )
        .await
    }
}
