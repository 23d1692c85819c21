//! Stream one-minute candles for a symbol and print closed bars.
//!
//! ```sh
//! cargo run --example minute_candles -- BINANCE:BTCUSDT
//! ```

use serde_json::json;
use tradingview_stream::{Client, ClientError};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradingview_stream=info".into()),
        )
        .init();

    let symbol = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "BINANCE:BTCUSDT".to_string());

    let client = match std::env::var("TV_AUTH_TOKEN") {
        Ok(token) => Client::builder().auth_token(token).build()?,
        Err(_) => Client::new(),
    };

    let chart = client.chart_session();
    chart.set_up();
    chart.set_market(&symbol, &json!({"timeframe": "1", "range": 10}));

    chart.on_symbol_loaded({
        let symbol = symbol.clone();
        move |info| {
            println!(
                "{symbol} resolved ({})",
                info["description"].as_str().unwrap_or("?")
            );
        }
    });
    chart.on_bar_closed(move |bar| {
        println!(
            "closed bar t={} o={} h={} l={} c={} v={}",
            bar["time"], bar["open"], bar["high"], bar["low"], bar["close"], bar["volume"],
        );
    });
    chart.on_error(|details| eprintln!("chart error: {details}"));

    client.connect().await
}
