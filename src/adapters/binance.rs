use crate::core::types::*;
use crate::ports::exchange::Exchange;
use crate::ports::price_feed::PriceFeed;
use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

pub struct BinanceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()?,
            base_url: config.rest_base_url.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        })
    }

    fn sign(&self, query: &str) -> Result<String> {
        sign_query(&self.api_secret, query)
    }

    /// Open a user-data stream and return its listen key.
    pub async fn create_listen_key(&self) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListenKey {
            listen_key: String,
        }

        let url = format!("{}/api/v3/userDataStream", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance listenKey -> {} : {}", status, body);
        }
        Ok(resp.json::<ListenKey>().await?.listen_key)
    }

    /// Extend a listen key; Binance expires them after 60 minutes.
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        let url = format!(
            "{}/api/v3/userDataStream?listenKey={}",
            self.base_url, listen_key
        );
        let resp = self
            .client
            .put(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance listenKey keepalive -> {} : {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl PriceFeed for BinanceClient {
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Option<Vec<Candle>>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_interval(),
            limit
        );

        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Binance klines request failed: {}", e);
                return Ok(None);
            }
        };

        if !resp.status().is_success() {
            tracing::warn!("Binance klines -> {}", resp.status());
            return Ok(None);
        }

        let raw: Vec<Vec<serde_json::Value>> = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Binance klines parse error: {}", e);
                return Ok(None);
            }
        };

        Ok(Some(parse_klines(raw)))
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn submit_market_order(&self, order: &OrderRequest) -> Result<String> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = [
            format!("symbol={}", order.instrument.symbol()),
            format!("side={}", order.side.as_binance()),
            "type=MARKET".to_string(),
            format!("quantity={}", format_quantity(order.size)),
            format!("newClientOrderId={}", order.client_order_id),
            "newOrderRespType=ACK".to_string(),
            "recvWindow=5000".to_string(),
            format!("timestamp={}", timestamp),
        ]
        .join("&");
        let signature = self.sign(&query)?;
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.base_url, query, signature
        );

        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let reason = serde_json::from_str::<BinanceError>(&text)
                .map(|e| format!("{} ({})", e.msg, e.code))
                .unwrap_or(text);
            anyhow::bail!("Binance order {} -> {} : {}", order.client_order_id, status, reason);
        }

        let ack: OrderAck = serde_json::from_str(&text).map_err(|e| {
            tracing::error!(
                "Deserialize error on order ack: {} (body: {}...)",
                e,
                &text[..text.len().min(300)]
            );
            e
        })?;
        Ok(ack.order_id.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i64,
    msg: String,
}

fn parse_klines(raw: Vec<Vec<serde_json::Value>>) -> Vec<Candle> {
    raw.into_iter()
        .filter_map(|row| {
            if row.len() < 7 {
                return None;
            }
            Some(Candle {
                open_time: row[0].as_i64()?,
                open: row[1].as_str()?.parse().ok()?,
                high: row[2].as_str()?.parse().ok()?,
                low: row[3].as_str()?.parse().ok()?,
                close: row[4].as_str()?.parse().ok()?,
                volume: row[5].as_str()?.parse().ok()?,
                close_time: row[6].as_i64()?,
            })
        })
        .collect()
}

/// HMAC-SHA256 of the query string, hex encoded.
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Quantity with at most 8 decimals and no trailing zeros.
fn format_quantity(size: f64) -> String {
    let s = format!("{:.8}", size);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_binance_docs_example() {
        // Example from the Binance spot API documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn quantity_formatting() {
        assert_eq!(format_quantity(0.1), "0.1");
        assert_eq!(format_quantity(0.1 + 0.2), "0.3");
        assert_eq!(format_quantity(2.0), "2");
        assert_eq!(format_quantity(0.00012345), "0.00012345");
    }

    #[test]
    fn klines_skip_malformed_rows() {
        let raw: Vec<Vec<serde_json::Value>> = serde_json::from_str(
            r#"[
                [1700000000000, "2000.1", "2010.0", "1995.5", "2005.0", "12.5", 1700000059999, "0", 10, "0", "0", "0"],
                [1700000060000, "bad"]
            ]"#,
        )
        .unwrap();
        let candles = parse_klines(raw);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open_time, 1_700_000_000_000);
        assert_eq!(candles[0].close, 2005.0);
        assert_eq!(candles[0].volume, 12.5);
    }

    #[test]
    fn ack_response_yields_order_id() {
        let body = r#"{"symbol":"ETHUSDT","orderId":28457,"orderListId":-1,
            "clientOrderId":"6gCrw2kRUAF9CvJDGP16IP","transactTime":1507725176595}"#;
        let ack: OrderAck = serde_json::from_str(body).unwrap();
        assert_eq!(ack.order_id, 28457);
    }
}
