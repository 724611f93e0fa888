//! Upstox-style REST + streaming adapter for the Indian cash market.
//!
//! The OAuth dance happens outside this process; the adapter is handed a
//! ready access token and treats 401/403 as `Auth`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use market_core::{Bar, OrderSide, OrderType, Timeframe};

use crate::types::{
    AdapterError, AdapterResult, BrokerAdapter, BrokerOrderRequest, OrderPatch, QuoteTick,
};

const DEFAULT_BASE_URL: &str = "https://api.upstox.com/v2";
const DEFAULT_FEED_URL: &str = "wss://api.upstox.com/v2/feed/market-data-feed";

pub struct UpstoxAdapter {
    client: Client,
    base_url: String,
    feed_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    data: CandleData,
}

#[derive(Debug, Deserialize)]
struct CandleData {
    /// [timestamp, open, high, low, close, volume, open_interest]
    candles: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    data: OrderData,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    instrument_key: String,
    ltp: f64,
    #[serde(default)]
    open: f64,
    #[serde(default)]
    high: f64,
    #[serde(default)]
    low: f64,
    #[serde(default)]
    close: f64,
    #[serde(default)]
    volume: f64,
    /// epoch milliseconds
    ts: i64,
}

impl UpstoxAdapter {
    pub fn new(access_token: String) -> AdapterResult<Self> {
        Self::with_urls(
            access_token,
            DEFAULT_BASE_URL.to_string(),
            DEFAULT_FEED_URL.to_string(),
        )
    }

    pub fn with_urls(
        access_token: String,
        base_url: String,
        feed_url: String,
    ) -> AdapterResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| AdapterError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            feed_url,
            access_token,
        })
    }

    fn auth_headers(&self) -> AdapterResult<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        let value = header::HeaderValue::from_str(&format!("Bearer {}", self.access_token))
            .map_err(|_| AdapterError::Auth("access token is not header-safe".into()))?;
        headers.insert(header::AUTHORIZATION, value);
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn interval_for(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::Min5 => "5minute",
            Timeframe::Min15 => "15minute",
            Timeframe::Hour1 => "60minute",
            Timeframe::Daily => "day",
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> AdapterError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AdapterError::Auth(format!("{status}: {body}"))
            }
            StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited(body.to_string()),
            s if s.is_server_error() => AdapterError::Transient(format!("{status}: {body}")),
            _ => AdapterError::Permanent(format!("{status}: {body}")),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> AdapterResult<T> {
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AdapterError::Transient(e.to_string())
                } else {
                    AdapterError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AdapterError::Permanent(format!("decode: {e}")))
    }

    fn parse_candle(candle: &[serde_json::Value]) -> Option<Bar> {
        let ts = candle.first()?;
        let timestamp = if let Some(s) = ts.as_str() {
            DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc)
        } else {
            Utc.timestamp_millis_opt(ts.as_i64()?).single()?
        };
        Some(Bar {
            timestamp,
            open: candle.get(1)?.as_f64()?,
            high: candle.get(2)?.as_f64()?,
            low: candle.get(3)?.as_f64()?,
            close: candle.get(4)?.as_f64()?,
            volume: candle.get(5)?.as_f64().unwrap_or(0.0),
        })
    }
}

#[async_trait]
impl BrokerAdapter for UpstoxAdapter {
    async fn get_historical_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> AdapterResult<Vec<Bar>> {
        let url = format!(
            "{}/historical-candle/{}/{}/{}/{}",
            self.base_url,
            symbol,
            Self::interval_for(timeframe),
            end.format("%Y-%m-%d"),
            start.format("%Y-%m-%d"),
        );

        let response: CandleResponse = self.get_json(&url).await?;

        // the API returns newest-first; the core wants ascending
        let mut bars: Vec<Bar> = response
            .data
            .candles
            .iter()
            .filter_map(|c| Self::parse_candle(c))
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        Ok(bars)
    }

    async fn get_quote(&self, instrument_key: &str) -> AdapterResult<QuoteTick> {
        #[derive(Debug, Deserialize)]
        struct QuoteResponse {
            data: std::collections::HashMap<String, QuotePayload>,
        }
        #[derive(Debug, Deserialize)]
        struct QuotePayload {
            last_price: f64,
            #[serde(default)]
            volume: f64,
            ohlc: Ohlc,
            /// epoch milliseconds
            #[serde(default)]
            last_trade_time: i64,
        }
        #[derive(Debug, Deserialize, Default)]
        struct Ohlc {
            #[serde(default)]
            open: f64,
            #[serde(default)]
            high: f64,
            #[serde(default)]
            low: f64,
            #[serde(default)]
            close: f64,
        }

        let url = format!(
            "{}/market-quote/quotes?instrument_key={instrument_key}",
            self.base_url
        );
        let response: QuoteResponse = self.get_json(&url).await?;
        let (_, payload) = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Permanent(format!("no quote for {instrument_key}")))?;

        let source_ts = Utc
            .timestamp_millis_opt(payload.last_trade_time)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(QuoteTick {
            instrument_key: instrument_key.to_string(),
            ltp: payload.last_price,
            open: payload.ohlc.open,
            high: payload.ohlc.high,
            low: payload.ohlc.low,
            close: payload.ohlc.close,
            volume: payload.volume,
            source_ts,
        })
    }

    async fn subscribe_quotes(
        &self,
        instrument_keys: &[String],
    ) -> AdapterResult<mpsc::Receiver<QuoteTick>> {
        let (ws_stream, _) = connect_async(&self.feed_url).await.map_err(|e| {
            AdapterError::Transient(format!("feed connect: {e}"))
        })?;
        let (mut write, mut read) = ws_stream.split();

        let sub_msg = serde_json::json!({
            "guid": "market-quotes",
            "method": "sub",
            "data": { "mode": "full", "instrumentKeys": instrument_keys },
        });
        write
            .send(Message::Text(sub_msg.to_string().into()))
            .await
            .map_err(|e| AdapterError::Transient(format!("feed subscribe: {e}")))?;

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(feed) = serde_json::from_str::<FeedMessage>(&text) {
                            let Some(source_ts) = Utc.timestamp_millis_opt(feed.ts).single()
                            else {
                                continue;
                            };
                            let tick = QuoteTick {
                                instrument_key: feed.instrument_key,
                                ltp: feed.ltp,
                                open: feed.open,
                                high: feed.high,
                                low: feed.low,
                                close: feed.close,
                                volume: feed.volume,
                                source_ts,
                            };
                            if tx.send(tick).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            tracing::info!("quote feed closed");
        });

        Ok(rx)
    }

    async fn place_order(&self, order: &BrokerOrderRequest) -> AdapterResult<String> {
        let url = format!("{}/order/place", self.base_url);
        let body = serde_json::json!({
            "instrument_token": order.symbol,
            "transaction_type": match order.side {
                OrderSide::Buy => "BUY",
                OrderSide::Sell => "SELL",
            },
            "order_type": match order.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
                OrderType::Stop => "SL",
                OrderType::StopMarket => "SL-M",
            },
            "quantity": order.quantity,
            "price": order.limit_price.unwrap_or(0.0),
            "trigger_price": order.stop_trigger.unwrap_or(0.0),
            "product": "D",
            "validity": "DAY",
            "tag": order.tag,
        });

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        let parsed: OrderResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("decode order ack: {e}")))?;
        tracing::info!(order_id = %parsed.data.order_id, "order placed with broker");
        Ok(parsed.data.order_id)
    }

    async fn modify_order(&self, broker_order_id: &str, patch: &OrderPatch) -> AdapterResult<()> {
        let url = format!("{}/order/modify", self.base_url);
        let mut body = serde_json::json!({ "order_id": broker_order_id });
        if let Some(q) = patch.quantity {
            body["quantity"] = serde_json::json!(q);
        }
        if let Some(p) = patch.limit_price {
            body["price"] = serde_json::json!(p);
        }
        if let Some(t) = patch.stop_trigger {
            body["trigger_price"] = serde_json::json!(t);
        }

        let response = self
            .client
            .put(&url)
            .headers(self.auth_headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        Ok(())
    }

    async fn cancel_order(&self, broker_order_id: &str) -> AdapterResult<()> {
        let url = format!("{}/order/cancel?order_id={broker_order_id}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "upstox"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_parsing_handles_both_timestamp_shapes() {
        let rfc = serde_json::json!(["2024-06-03T09:15:00+05:30", 100.0, 101.0, 99.5, 100.5, 1200.0, 0]);
        let bar = UpstoxAdapter::parse_candle(rfc.as_array().unwrap()).unwrap();
        assert_eq!(bar.close, 100.5);

        let epoch = serde_json::json!([1717400100000i64, 100.0, 101.0, 99.5, 100.5, 1200.0, 0]);
        assert!(UpstoxAdapter::parse_candle(epoch.as_array().unwrap()).is_some());
    }

    #[test]
    fn malformed_candles_are_skipped() {
        assert!(UpstoxAdapter::parse_candle(&[serde_json::json!("not-a-date")]).is_none());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            UpstoxAdapter::classify_status(StatusCode::UNAUTHORIZED, ""),
            AdapterError::Auth(_)
        ));
        assert!(matches!(
            UpstoxAdapter::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            AdapterError::RateLimited(_)
        ));
        assert!(matches!(
            UpstoxAdapter::classify_status(StatusCode::BAD_GATEWAY, ""),
            AdapterError::Transient(_)
        ));
        assert!(matches!(
            UpstoxAdapter::classify_status(StatusCode::BAD_REQUEST, ""),
            AdapterError::Permanent(_)
        ));
    }
}
