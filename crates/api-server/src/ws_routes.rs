use std::collections::{HashMap, HashSet};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/quotes", get(ws_quotes_handler))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
}

#[derive(Debug, Serialize)]
struct QuotePush {
    symbol: String,
    ltp: f64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    source_ts: DateTime<Utc>,
}

async fn ws_quotes_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_quote_socket(socket, state))
}

/// Per-connection loop: forward broadcast quotes for the subscribed
/// symbols, conflated (a lagged client just resumes at the latest) and
/// deduped by `(symbol, source_ts)`.
async fn handle_quote_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut quotes = state.stream.subscriber();
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut last_pushed: HashMap<String, DateTime<Utc>> = HashMap::new();

    loop {
        tokio::select! {
            client_msg = receiver.next() => {
                let Some(Ok(msg)) = client_msg else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { symbols }) => {
                                state.stream.subscribe(&symbols).await;
                                for symbol in symbols {
                                    // warm start from the cache so a new client
                                    // does not wait for the next tick
                                    if let Some(entry) = state.quote_cache.get_fresh(&symbol) {
                                        let push = QuotePush {
                                            symbol: symbol.clone(),
                                            ltp: entry.last_trade_price,
                                            open: entry.open,
                                            high: entry.high,
                                            low: entry.low,
                                            close: entry.close,
                                            volume: entry.volume,
                                            source_ts: entry.source_ts,
                                        };
                                        if let Ok(json) = serde_json::to_string(&push) {
                                            let _ = sender.send(Message::Text(json)).await;
                                        }
                                        last_pushed.insert(symbol.clone(), entry.source_ts);
                                    }
                                    subscribed.insert(symbol);
                                }
                            }
                            Ok(ClientMessage::Unsubscribe { symbols }) => {
                                for symbol in &symbols {
                                    subscribed.remove(symbol);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed ws message");
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            tick = quotes.recv() => {
                match tick {
                    Ok(tick) => {
                        if !subscribed.contains(&tick.instrument_key) {
                            continue;
                        }
                        // dedupe: never re-push a source timestamp
                        if last_pushed
                            .get(&tick.instrument_key)
                            .is_some_and(|prev| tick.source_ts <= *prev)
                        {
                            continue;
                        }
                        last_pushed.insert(tick.instrument_key.clone(), tick.source_ts);
                        let push = QuotePush {
                            symbol: tick.instrument_key,
                            ltp: tick.ltp,
                            open: tick.open,
                            high: tick.high,
                            low: tick.low,
                            close: tick.close,
                            volume: tick.volume,
                            source_ts: tick.source_ts,
                        };
                        let Ok(json) = serde_json::to_string(&push) else { continue };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // conflation: this client fell behind, resume from the
                    // latest rather than replaying what it missed
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "ws client lagged, conflating");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!("quote websocket closed");
}
