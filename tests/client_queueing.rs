//! Client Queueing Integration Tests
//!
//! Exercises the outbound queue ordering guarantees across authentication
//! and multiple sessions, and the read-path behaviors that feed back into
//! the queue (ping echoes).

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::{Value, json};

use tradingview_stream::{Client, QuoteSessionOptions, protocol};

fn decoded_queue(client: &Client) -> Vec<Value> {
    client
        .queued_frames()
        .iter()
        .flat_map(|frame| protocol::parse_packets(frame))
        .collect()
}

fn methods(queue: &[Value]) -> Vec<String> {
    queue
        .iter()
        .map(|packet| packet["m"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn session_setup_is_queued_in_declaration_order() {
    let client = Client::new();

    let chart = client.chart_session();
    chart.set_up();
    chart.set_market("BINANCE:BTCUSDT", &json!({"timeframe": "60"}));

    let quotes = client.quote_session(QuoteSessionOptions::default());
    quotes.set_up();
    quotes.add_symbols(&["NASDAQ:AAPL".to_string()], false, false);

    let queue = decoded_queue(&client);
    assert_eq!(
        methods(&queue),
        vec![
            "create_chart_session",
            "resolve_symbol",
            "create_series",
            "quote_create_session",
            "quote_set_fields",
            "quote_add_symbols",
        ]
    );
}

#[test]
fn builder_token_precedes_all_session_traffic() {
    let client = Client::builder().auth_token("tok-abc").build().unwrap();

    let chart = client.chart_session();
    chart.set_up();

    let queue = decoded_queue(&client);
    assert_eq!(queue[0]["m"], "set_auth_token");
    assert_eq!(queue[0]["p"], json!(["tok-abc"]));
    assert_eq!(queue[1]["m"], "create_chart_session");
}

#[test]
fn ping_echo_lands_on_the_queue_as_a_raw_heartbeat() {
    let client = Client::new();
    let chart = client.chart_session();
    chart.set_up();

    client.process_incoming("~m~4~m~5678");

    let frames = client.queued_frames();
    assert_eq!(frames.last().map(String::as_str), Some("~m~7~m~~h~5678"));
    // The heartbeat echo never decodes as a message.
    assert!(protocol::parse_packets(frames.last().unwrap()).is_empty());
}

#[test]
fn replayed_batch_routes_each_frame_independently() {
    let client = Client::new();
    let chart = client.chart_session();
    chart.set_up();

    // One websocket message carrying a ping, a chart frame, and an
    // unroutable notice, in that order.
    let bars = json!({
        "m": "du",
        "p": [chart.session_id(), { "$prices": { "s": [
            { "v": [100.0, 1.0, 2.0, 0.5, 1.5, 3.0] }
        ] } }],
    });
    let batch = format!(
        "~m~2~m~42{}{}",
        protocol::format_packet(&bars),
        protocol::format_packet(&json!({"session_holder": true})),
    );
    client.process_incoming(&batch);

    assert_eq!(chart.bars().len(), 1);
    assert!(client.is_logged());
    let frames = client.queued_frames();
    assert_eq!(frames.last().map(String::as_str), Some("~m~5~m~~h~42"));
}

#[test]
fn protocol_error_reaches_listeners_without_disturbing_sessions() {
    let client = Client::new();
    let chart = client.chart_session();
    chart.set_up();

    let critical = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let critical2 = critical.clone();
    client.on_critical_error(move |payload| critical2.lock().push(payload.clone()));

    client.process_incoming(&protocol::format_packet(&json!({
        "m": "protocol_error",
        "p": ["unsupported protocol version"],
    })));

    assert_eq!(critical.lock().len(), 1);
    // The chart session is untouched and keeps receiving data.
    client.process_incoming(&protocol::format_packet(&json!({
        "m": "du",
        "p": [chart.session_id(), { "$prices": { "s": [
            { "v": [200.0, 1.0, 2.0, 0.5, 1.5, 3.0] }
        ] } }],
    })));
    assert_eq!(chart.bars().len(), 1);
}
