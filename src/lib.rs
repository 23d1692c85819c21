//! Streaming market-data client for the TradingView websocket feed.
//!
//! One [`Client`] owns one websocket connection and multiplexes any number
//! of chart and quote sessions over it. Outbound messages are queued in
//! order from the moment a session is created, so the full subscription
//! setup can be declared before [`Client::connect`] opens the socket.
//!
//! # Data flow
//!
//! ```text
//!            +-----------------------------------------------+
//!  wss ----> | connect loop: decode ~m~ frames, echo pings,  |
//!            | route {m, p} by p[0] via the session registry |
//!            +-----------------------+-----------------------+
//!                                    |
//!                     +--------------+--------------+
//!                     v                             v
//!              ChartSession (cs_*)           QuoteSession (qs_*)
//!              bars, symbol_loaded,          per-symbol qsd fan-out,
//!              bar_closed, update            symbol_ready
//! ```
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use tradingview_stream::{Client, QuoteSessionOptions};
//!
//! # async fn run() -> Result<(), tradingview_stream::ClientError> {
//! let client = Client::new();
//!
//! let chart = client.chart_session();
//! chart.set_up();
//! chart.set_market("BINANCE:BTCUSDT", &json!({"timeframe": "60"}));
//! chart.on_update(|bars| println!("bars: {bars}"));
//!
//! let quotes = client.quote_session(QuoteSessionOptions::default());
//! quotes.set_up();
//! quotes.add_symbols(&["NASDAQ:AAPL".to_string()], false, false);
//! quotes.on_symbol("NASDAQ:AAPL", |data| println!("quote: {data}"));
//!
//! // Runs until the connection ends.
//! client.connect().await
//! # }
//! ```

pub mod auth;
pub mod chart;
pub mod client;
pub mod events;
pub mod protocol;
pub mod quote;
pub mod session;

pub use auth::{AuthError, fetch_auth_token};
pub use chart::{Bar, ChartSession, ChartState};
pub use client::{Client, ClientBuilder, ClientError, ClientHandle, ConnectionState};
pub use events::{EventHub, ListenerId};
pub use protocol::{PacketError, ServerPacket};
pub use quote::{QuoteSession, QuoteSessionOptions};
pub use session::{Session, SessionKind, SessionRegistry, generate_session_id};
