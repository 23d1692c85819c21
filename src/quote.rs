//! Quote Session
//!
//! Streams last-price quote data for a set of instruments over one
//! registered quote session. Quote data (`qsd`) messages are fanned out per
//! symbol: each subscribed symbol has its own listener list keyed by the
//! symbol name embedded in the payload, so one session serves many
//! instruments without cross-talk.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::client::ClientHandle;
use crate::events::{EventHub, ListenerId};
use crate::session::{self, Session, SessionKind};

/// Session id prefix for quote sessions.
pub const SESSION_PREFIX: &str = "qs";

/// Fields requested when [`QuoteSessionOptions`] does not override them.
pub const DEFAULT_QUOTE_FIELDS: &[&str] = &[
    "lp",
    "lp_time",
    "bid",
    "ask",
    "volume",
    "ch",
    "chp",
    "currency_code",
    "description",
    "short_name",
];

/// Quote-session event names (session-wide; per-symbol data uses
/// [`QuoteSession::on_symbol`]).
pub mod event {
    /// The server finished the initial snapshot for a symbol; payload is
    /// the symbol name.
    pub const SYMBOL_READY: &str = "symbol_ready";
}

/// Construction options for a quote session.
#[derive(Debug, Clone, Default)]
pub struct QuoteSessionOptions {
    /// Override the requested field set ([`DEFAULT_QUOTE_FIELDS`] when
    /// `None`).
    pub fields: Option<Vec<String>>,
}

/// A quote (last-price) session bound to one client.
pub struct QuoteSession {
    handle: ClientHandle,
    session_id: String,
    fields: Vec<String>,
    symbols: Mutex<HashSet<String>>,
    events: EventHub,
    // Listener lists keyed by symbol name rather than event name.
    symbol_events: EventHub,
}

impl QuoteSession {
    /// Create a quote session with a fresh `qs_` id. The session does not
    /// touch the wire until [`QuoteSession::set_up`].
    #[must_use]
    pub fn new(handle: ClientHandle, options: QuoteSessionOptions) -> Arc<Self> {
        let fields = options.fields.unwrap_or_else(|| {
            DEFAULT_QUOTE_FIELDS
                .iter()
                .map(ToString::to_string)
                .collect()
        });
        Arc::new(Self {
            handle,
            session_id: session::generate_session_id(SESSION_PREFIX),
            fields,
            symbols: Mutex::new(HashSet::new()),
            events: EventHub::new(),
            symbol_events: EventHub::new(),
        })
    }

    /// Register with the owning client, open the session on the wire, and
    /// declare the field set.
    pub fn set_up(self: &Arc<Self>) {
        self.handle.register(self.clone());
        self.handle
            .send("quote_create_session", &[json!(self.session_id)]);

        let mut params = vec![json!(self.session_id)];
        params.extend(self.fields.iter().map(|f| json!(f)));
        self.handle.send("quote_set_fields", &params);
    }

    /// The generated session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The field set this session requests.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Symbols currently subscribed.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.lock().iter().cloned().collect()
    }

    /// The session-wide event hub.
    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Subscribe to quote data for `symbols`.
    ///
    /// With `fast` the same list is also switched to the low-latency
    /// delivery tier. With `force_permission` the subscription carries the
    /// permission-override flag for instruments gated by entitlements.
    pub fn add_symbols(&self, symbols: &[String], fast: bool, force_permission: bool) {
        if symbols.is_empty() {
            return;
        }
        self.symbols.lock().extend(symbols.iter().cloned());

        let mut params = vec![json!(self.session_id)];
        params.extend(symbols.iter().map(|s| json!(s)));
        if force_permission {
            params.push(json!({"flags": ["force_permission"]}));
        }
        self.handle.send("quote_add_symbols", &params);

        if fast {
            let mut fast_params = vec![json!(self.session_id)];
            fast_params.extend(symbols.iter().map(|s| json!(s)));
            self.handle.send("quote_fast_symbols", &fast_params);
        }
    }

    /// Register a callback for quote data on one symbol. The payload is the
    /// `qsd` data object (symbol name under `"n"`, field values under
    /// `"v"`).
    pub fn on_symbol(
        &self,
        symbol: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.symbol_events.on(symbol, callback)
    }

    /// Register a callback for [`event::SYMBOL_READY`].
    pub fn on_symbol_ready(
        &self,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.on(event::SYMBOL_READY, callback)
    }

    /// Unsubscribe `symbol` and drop its listeners.
    pub fn remove_symbol(&self, symbol: &str) {
        self.symbol_events.clear(symbol);
        self.symbols.lock().remove(symbol);
        self.handle
            .send("quote_remove_symbols", &[json!(self.session_id), json!(symbol)]);
    }

    /// Close the wire session and unregister from the client.
    pub fn delete(&self) {
        self.handle
            .send("quote_delete_session", &[json!(self.session_id)]);
        self.handle.unregister(&self.session_id);
    }
}

impl Session for QuoteSession {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Quote
    }

    fn handle_event(&self, method: &str, params: &[Value]) {
        match method {
            "qsd" => {
                let Some(data) = params.get(1) else {
                    return;
                };
                let Some(symbol) = data.get("n").and_then(Value::as_str) else {
                    tracing::trace!(session_id = %self.session_id, "qsd without symbol name");
                    return;
                };
                self.symbol_events.emit(symbol, data);
            }
            "quote_completed" => {
                if let Some(symbol) = params.get(1) {
                    self.events.emit(event::SYMBOL_READY, symbol);
                }
            }
            other => {
                tracing::trace!(session_id = %self.session_id, method = other, "ignoring message");
            }
        }
    }
}

impl std::fmt::Debug for QuoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteSession")
            .field("session_id", &self.session_id)
            .field("symbols", &self.symbols.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::Client;
    use crate::protocol::{format_packet, parse_packets};

    fn decoded_queue(client: &Client) -> Vec<Value> {
        client
            .queued_frames()
            .iter()
            .flat_map(|frame| parse_packets(frame))
            .collect()
    }

    fn qsd_frame(session_id: &str, symbol: &str, lp: f64) -> String {
        format_packet(&json!({
            "m": "qsd",
            "p": [session_id, { "n": symbol, "s": "ok", "v": { "lp": lp } }],
        }))
    }

    #[test]
    fn set_up_declares_default_fields() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();

        let queue = decoded_queue(&client);
        assert_eq!(queue[0]["m"], "quote_create_session");
        assert_eq!(queue[0]["p"], json!([quote.session_id()]));

        assert_eq!(queue[1]["m"], "quote_set_fields");
        let params = queue[1]["p"].as_array().unwrap();
        assert_eq!(params[0], quote.session_id());
        assert_eq!(params.len(), 1 + DEFAULT_QUOTE_FIELDS.len());
        assert!(params.contains(&json!("lp")));
        assert!(quote.session_id().starts_with("qs_"));
    }

    #[test]
    fn custom_fields_override_defaults() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions {
            fields: Some(vec!["lp".to_string(), "volume".to_string()]),
        });
        quote.set_up();

        let queue = decoded_queue(&client);
        assert_eq!(
            queue[1]["p"],
            json!([quote.session_id(), "lp", "volume"])
        );
    }

    #[test]
    fn add_symbols_plain_and_fast() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();
        quote.add_symbols(
            &["BINANCE:BTCUSDT".to_string(), "NASDAQ:AAPL".to_string()],
            true,
            false,
        );

        let queue = decoded_queue(&client);
        assert_eq!(queue[2]["m"], "quote_add_symbols");
        assert_eq!(
            queue[2]["p"],
            json!([quote.session_id(), "BINANCE:BTCUSDT", "NASDAQ:AAPL"])
        );
        assert_eq!(queue[3]["m"], "quote_fast_symbols");
        assert_eq!(
            queue[3]["p"],
            json!([quote.session_id(), "BINANCE:BTCUSDT", "NASDAQ:AAPL"])
        );
    }

    #[test]
    fn force_permission_appends_flags() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();
        quote.add_symbols(&["NSE:NIFTY".to_string()], false, true);

        let queue = decoded_queue(&client);
        assert_eq!(
            queue[2]["p"],
            json!([
                quote.session_id(),
                "NSE:NIFTY",
                { "flags": ["force_permission"] }
            ])
        );
        assert_eq!(queue.len(), 3, "no fast tier requested");
    }

    #[test]
    fn empty_symbol_list_is_a_noop() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();
        let before = client.queued_frames().len();
        quote.add_symbols(&[], true, true);
        assert_eq!(client.queued_frames().len(), before);
    }

    #[test]
    fn qsd_fans_out_by_symbol_without_crosstalk() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();

        let btc = Arc::new(Mutex::new(Vec::new()));
        let aapl = Arc::new(Mutex::new(Vec::new()));
        let btc2 = btc.clone();
        let aapl2 = aapl.clone();
        quote.on_symbol("BINANCE:BTCUSDT", move |data| btc2.lock().push(data.clone()));
        quote.on_symbol("NASDAQ:AAPL", move |data| aapl2.lock().push(data.clone()));

        client.process_incoming(&qsd_frame(quote.session_id(), "BINANCE:BTCUSDT", 65000.0));
        client.process_incoming(&qsd_frame(quote.session_id(), "NASDAQ:AAPL", 180.0));
        client.process_incoming(&qsd_frame(quote.session_id(), "BINANCE:BTCUSDT", 65001.0));

        assert_eq!(btc.lock().len(), 2);
        assert_eq!(aapl.lock().len(), 1);
        assert_eq!(btc.lock()[1]["v"]["lp"], 65001.0);
        assert_eq!(aapl.lock()[0]["n"], "NASDAQ:AAPL");
    }

    #[test]
    fn unsubscribed_symbol_data_is_dropped() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();
        // No listener for this symbol: dispatch is a no-op, not an error.
        client.process_incoming(&qsd_frame(quote.session_id(), "FX:EURUSD", 1.08));
    }

    #[test]
    fn quote_completed_fires_symbol_ready() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();

        let ready = Arc::new(Mutex::new(Vec::new()));
        let ready2 = ready.clone();
        quote.on_symbol_ready(move |symbol| ready2.lock().push(symbol.clone()));

        client.process_incoming(&format_packet(&json!({
            "m": "quote_completed",
            "p": [quote.session_id(), "BINANCE:BTCUSDT"],
        })));

        assert_eq!(*ready.lock(), vec![json!("BINANCE:BTCUSDT")]);
    }

    #[test]
    fn remove_symbol_drops_listeners_and_unsubscribes() {
        let client = Client::new();
        let quote = client.quote_session(QuoteSessionOptions::default());
        quote.set_up();
        quote.add_symbols(&["FX:EURUSD".to_string()], false, false);

        let seen = Arc::new(Mutex::new(0usize));
        let seen2 = seen.clone();
        quote.on_symbol("FX:EURUSD", move |_| *seen2.lock() += 1);

        quote.remove_symbol("FX:EURUSD");
        client.process_incoming(&qsd_frame(quote.session_id(), "FX:EURUSD", 1.08));

        assert_eq!(*seen.lock(), 0);
        assert!(quote.symbols().is_empty());
        let queue = decoded_queue(&client);
        assert_eq!(queue.last().unwrap()["m"], "quote_remove_symbols");
    }
}
