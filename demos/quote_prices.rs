//! Subscribe to live quotes for a handful of symbols and print last prices.
//!
//! ```sh
//! cargo run --example quote_prices -- NASDAQ:AAPL FX:EURUSD
//! ```

use tradingview_stream::{Client, ClientError, QuoteSessionOptions};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradingview_stream=info".into()),
        )
        .init();

    let symbols: Vec<String> = {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.is_empty() {
            vec!["BINANCE:BTCUSDT".to_string(), "NASDAQ:AAPL".to_string()]
        } else {
            args
        }
    };

    let client = match std::env::var("TV_AUTH_TOKEN") {
        Ok(token) => Client::builder().auth_token(token).build()?,
        Err(_) => Client::new(),
    };

    let quotes = client.quote_session(QuoteSessionOptions::default());
    quotes.set_up();
    quotes.add_symbols(&symbols, true, false);

    for symbol in &symbols {
        let tag = symbol.clone();
        quotes.on_symbol(symbol, move |data| {
            if let Some(lp) = data["v"]["lp"].as_f64() {
                println!("{tag}: {lp}");
            }
        });
    }
    quotes.on_symbol_ready(|symbol| println!("snapshot complete for {symbol}"));
    client.on_closed(|_| println!("connection closed"));

    client.connect().await
}
