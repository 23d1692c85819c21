//! Chart Session
//!
//! Streams OHLCV bars for one instrument over a registered chart session.
//! A chart session owns a bar cache keyed by timestamp, tracks the forming
//! bar, and publishes lifecycle events as server data arrives.
//!
//! # Flow
//!
//! 1. [`ChartSession::set_up`] registers the session and opens it on the
//!    wire (`create_chart_session`).
//! 2. [`ChartSession::set_market`] resolves the instrument and requests a
//!    bar series for it (`resolve_symbol` + `create_series`).
//! 3. Inbound `symbol_resolved`, `timescale_update`, and `du` messages feed
//!    the cache and fire [`event`] callbacks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::client::ClientHandle;
use crate::events::{EventHub, ListenerId};
use crate::session::{self, Session, SessionKind};

/// Session id prefix for chart sessions.
pub const SESSION_PREFIX: &str = "cs";

/// Series id used for the price series inside a chart session.
const PRICE_SERIES_ID: &str = "$prices";

/// Timeframe used when [`ChartSession::set_market`] options carry none.
pub const DEFAULT_TIMEFRAME: &str = "240";

/// Bar count requested when [`ChartSession::set_market`] options carry none.
pub const DEFAULT_RANGE: u64 = 100;

/// Chart-session event names.
pub mod event {
    /// Instrument resolved; payload is the market metadata object.
    pub const SYMBOL_LOADED: &str = "symbol_loaded";
    /// A batch of bars arrived; payload is the batch as an array.
    pub const UPDATE: &str = "update";
    /// The forming bar was superseded by a newer one; payload is the
    /// finalized bar.
    pub const BAR_CLOSED: &str = "bar_closed";
    /// The requested series finished loading.
    pub const SERIES_LOADED: &str = "series_loaded";
    /// The server rejected the symbol or series; payload is the error
    /// argument list.
    pub const ERROR: &str = "error";
}

/// Symbol-resolution state of a chart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartState {
    /// Session opened, no market set.
    #[default]
    Created,
    /// `resolve_symbol` sent, awaiting the server.
    SymbolResolving,
    /// Market metadata received.
    Resolved,
}

// =============================================================================
// Bar
// =============================================================================

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, seconds since the Unix epoch.
    pub time: f64,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume (zero when the feed omits it).
    pub volume: f64,
}

impl Bar {
    /// The bar's open time truncated to whole seconds, used as cache key.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn timestamp(&self) -> i64 {
        self.time as i64
    }

    /// Build a bar from the wire-format value array `[t, o, h, l, c, v]`.
    /// The volume slot is optional; anything shorter than five elements is
    /// rejected.
    #[must_use]
    pub fn from_values(values: &[Value]) -> Option<Self> {
        let field = |i: usize| values.get(i).and_then(Value::as_f64);
        Some(Self {
            time: field(0)?,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5).unwrap_or(0.0),
        })
    }
}

// =============================================================================
// Chart Session
// =============================================================================

/// A chart (OHLCV bar) session bound to one client.
pub struct ChartSession {
    handle: ClientHandle,
    session_id: String,
    state: Mutex<ChartState>,
    series_counter: AtomicU32,
    current_series: AtomicU32,
    latest_bar: Mutex<Option<Bar>>,
    bars: Mutex<BTreeMap<i64, Bar>>,
    market_info: Mutex<Value>,
    events: EventHub,
}

impl ChartSession {
    /// Create a chart session with a fresh `cs_` id. The session does not
    /// touch the wire until [`ChartSession::set_up`].
    #[must_use]
    pub fn new(handle: ClientHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            session_id: session::generate_session_id(SESSION_PREFIX),
            state: Mutex::new(ChartState::Created),
            series_counter: AtomicU32::new(0),
            current_series: AtomicU32::new(0),
            latest_bar: Mutex::new(None),
            bars: Mutex::new(BTreeMap::new()),
            market_info: Mutex::new(Value::Null),
            events: EventHub::new(),
        })
    }

    /// Register with the owning client and open the session on the wire.
    pub fn set_up(self: &Arc<Self>) {
        self.handle.register(self.clone());
        self.handle.send(
            "create_chart_session",
            &[json!(self.session_id), json!("")],
        );
    }

    /// The generated session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current resolution state.
    #[must_use]
    pub fn state(&self) -> ChartState {
        *self.state.lock()
    }

    /// The most recent (forming) bar, if any data has arrived.
    #[must_use]
    pub fn latest_bar(&self) -> Option<Bar> {
        *self.latest_bar.lock()
    }

    /// Market metadata from symbol resolution (`Null` until resolved).
    #[must_use]
    pub fn market_info(&self) -> Value {
        self.market_info.lock().clone()
    }

    /// All cached bars in ascending time order.
    #[must_use]
    pub fn bars(&self) -> Vec<Bar> {
        self.bars.lock().values().copied().collect()
    }

    /// The session-scoped event hub.
    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Register a callback for [`event::SYMBOL_LOADED`].
    pub fn on_symbol_loaded(
        &self,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.on(event::SYMBOL_LOADED, callback)
    }

    /// Register a callback for [`event::UPDATE`].
    pub fn on_update(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.events.on(event::UPDATE, callback)
    }

    /// Register a callback for [`event::BAR_CLOSED`].
    pub fn on_bar_closed(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.events.on(event::BAR_CLOSED, callback)
    }

    /// Register a callback for [`event::SERIES_LOADED`].
    pub fn on_series_loaded(
        &self,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.on(event::SERIES_LOADED, callback)
    }

    /// Register a callback for [`event::ERROR`].
    pub fn on_error(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.events.on(event::ERROR, callback)
    }

    // =========================================================================
    // Outbound operations
    // =========================================================================

    /// Resolve an instrument and request its bar series.
    ///
    /// Sends exactly one `resolve_symbol` per call, tagged with a fresh
    /// series token, followed by a `create_series` for it. `options` entries
    /// are merged into the resolution payload, except the `timeframe` and
    /// `range` keys which parameterize the series request instead (falling
    /// back to [`DEFAULT_TIMEFRAME`] and [`DEFAULT_RANGE`]).
    pub fn set_market(&self, symbol: &str, options: &Value) {
        let series_token = self.series_counter.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock() = ChartState::SymbolResolving;

        let mut payload = serde_json::Map::new();
        payload.insert("symbol".to_string(), json!(symbol));
        let mut timeframe = DEFAULT_TIMEFRAME.to_string();
        let mut range = json!(DEFAULT_RANGE);
        if let Some(options) = options.as_object() {
            for (key, value) in options {
                match key.as_str() {
                    "timeframe" => {
                        if let Some(tf) = value.as_str() {
                            timeframe = tf.to_string();
                        }
                    }
                    "range" => range = value.clone(),
                    _ => {
                        payload.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        let encoded = format!("={}", Value::Object(payload));
        self.handle.send(
            "resolve_symbol",
            &[
                json!(self.session_id),
                json!(format!("ser_{series_token}")),
                json!(encoded),
            ],
        );
        self.set_series(&timeframe, &range);
    }

    /// Request a bar series for the most recently resolved instrument.
    ///
    /// `range` is either a bar count or a named range string, passed through
    /// as-is. A no-op until the first [`ChartSession::set_market`] call has
    /// allocated a series token.
    pub fn set_series(&self, timeframe: &str, range: &Value) {
        let series_token = self.series_counter.load(Ordering::SeqCst);
        if series_token == 0 {
            tracing::warn!(
                session_id = %self.session_id,
                "set_series without a market set, ignoring"
            );
            return;
        }
        let series = self.current_series.fetch_add(1, Ordering::SeqCst) + 1;
        self.handle.send(
            "create_series",
            &[
                json!(self.session_id),
                json!(PRICE_SERIES_ID),
                json!(format!("s{series}")),
                json!(format!("ser_{series_token}")),
                json!(timeframe),
                range.clone(),
            ],
        );
    }

    /// Ask the server for `count` additional historical bars.
    pub fn fetch_more(&self, count: u64) {
        self.handle.send(
            "request_more_data",
            &[
                json!(self.session_id),
                json!(PRICE_SERIES_ID),
                json!(count),
            ],
        );
    }

    /// Switch the session timezone (affects bar timestamps server-side).
    pub fn set_timezone(&self, timezone: &str) {
        self.handle
            .send("switch_timezone", &[json!(self.session_id), json!(timezone)]);
    }

    /// Deliver all cached bars (ascending) every time a series finishes
    /// loading. Returns the listener id so the caller can stop deliveries.
    pub fn download_data(
        self: &Arc<Self>,
        callback: impl Fn(&[Bar]) + Send + Sync + 'static,
    ) -> ListenerId {
        let weak = Arc::downgrade(self);
        self.events.on(event::SERIES_LOADED, move |_| {
            if let Some(session) = weak.upgrade() {
                callback(&session.bars());
            }
        })
    }

    /// Close the wire session and unregister from the client.
    pub fn delete(&self) {
        self.handle
            .send("chart_delete_session", &[json!(self.session_id)]);
        self.handle.unregister(&self.session_id);
    }

    // =========================================================================
    // Inbound handling
    // =========================================================================

    fn handle_data_batch(&self, params: &[Value]) {
        let Some(data) = params.get(1) else {
            return;
        };
        let batch = extract_bars(data);
        if batch.is_empty() {
            return;
        }

        let mut closed: Option<Bar> = None;
        let newest = batch
            .iter()
            .copied()
            .max_by_key(Bar::timestamp)
            .unwrap_or(batch[0]);
        {
            let mut bars = self.bars.lock();
            for bar in &batch {
                bars.insert(bar.timestamp(), *bar);
            }

            let mut latest = self.latest_bar.lock();
            match *latest {
                Some(prev) if newest.timestamp() > prev.timestamp() => {
                    closed = Some(prev);
                    *latest = Some(newest);
                }
                Some(prev) if newest.timestamp() == prev.timestamp() => {
                    *latest = Some(newest);
                }
                // Historical backfill only; the forming bar stands.
                Some(_) => {}
                None => *latest = Some(newest),
            }
        }

        if let Some(prev) = closed
            && let Ok(payload) = serde_json::to_value(prev)
        {
            self.events.emit(event::BAR_CLOSED, &payload);
        }
        if let Ok(payload) = serde_json::to_value(&batch) {
            self.events.emit(event::UPDATE, &payload);
        }
    }
}

/// Pull bars out of a `timescale_update`/`du` data object.
fn extract_bars(data: &Value) -> Vec<Bar> {
    data.pointer(&format!("/{PRICE_SERIES_ID}/s"))
        .and_then(Value::as_array)
        .map_or_else(Vec::new, |entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("v").and_then(Value::as_array))
                .filter_map(|values| Bar::from_values(values))
                .collect()
        })
}

impl Session for ChartSession {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Chart
    }

    fn handle_event(&self, method: &str, params: &[Value]) {
        match method {
            "symbol_resolved" => {
                if let Some(info) = params.get(2) {
                    *self.market_info.lock() = info.clone();
                    *self.state.lock() = ChartState::Resolved;
                    self.events.emit(event::SYMBOL_LOADED, info);
                }
            }
            "timescale_update" | "du" => self.handle_data_batch(params),
            "series_loaded" | "series_completed" => {
                self.events
                    .emit(event::SERIES_LOADED, &Value::Array(params.to_vec()));
            }
            "symbol_error" | "series_error" => {
                tracing::warn!(session_id = %self.session_id, method, ?params, "chart error");
                self.events.emit(event::ERROR, &Value::Array(params.to_vec()));
            }
            other => {
                tracing::trace!(session_id = %self.session_id, method = other, "ignoring message");
            }
        }
    }
}

impl std::fmt::Debug for ChartSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("bars", &self.bars.lock().len())
            .finish()
    }
}
