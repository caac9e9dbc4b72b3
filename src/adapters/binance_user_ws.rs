use crate::adapters::binance::BinanceClient;
use crate::core::types::*;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite;

const KEEPALIVE_SECS: u64 = 30 * 60;

/// Stream order updates from the Binance user-data stream into the event
/// queue. A fresh listen key is requested on every (re)connect.
pub async fn connect(
    client: Arc<BinanceClient>,
    ws_base_url: String,
    instrument: Instrument,
    tx: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    loop {
        let listen_key = match client.create_listen_key().await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Binance user stream listenKey failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        let url = format!("{}/{}", ws_base_url, listen_key);
        tracing::info!("Binance user stream connecting");
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!("Binance user stream connected");
                let (_, mut read) = ws.split();
                let mut keepalive = tokio::time::interval_at(
                    tokio::time::Instant::now() + std::time::Duration::from_secs(KEEPALIVE_SECS),
                    std::time::Duration::from_secs(KEEPALIVE_SECS),
                );

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(tungstenite::Message::Text(text))) => {
                                    if let Some(update) = parse_execution_report(&text, &instrument) {
                                        if tx.send(Event::OrderStatus(update)).await.is_err() {
                                            tracing::warn!("Binance user stream receiver dropped");
                                            return Ok(());
                                        }
                                    }
                                }
                                Some(Ok(tungstenite::Message::Close(_))) => {
                                    tracing::warn!("Binance user stream closed by server");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::warn!("Binance user stream read error: {}", e);
                                    break;
                                }
                                None => {
                                    tracing::warn!("Binance user stream ended");
                                    break;
                                }
                                _ => {}
                            }
                        }
                        _ = keepalive.tick() => {
                            if let Err(e) = client.keepalive_listen_key(&listen_key).await {
                                tracing::warn!("Binance listenKey keepalive failed: {}", e);
                                break;
                            }
                            tracing::debug!("Binance listenKey extended");
                        }
                    }
                }

                if tx.send(Event::Disconnected("user data")).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::warn!("Binance user stream connect failed: {}", e);
            }
        }

        tracing::info!("Binance user stream reconnecting in 5s");
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

fn parse_execution_report(text: &str, instrument: &Instrument) -> Option<OrderStatusUpdate> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    // Newer stream format wraps the payload: {"subscriptionId":0,"event":{...}}
    let v = v.get("event").unwrap_or(&v);

    if v.get("e")?.as_str()? != "executionReport" {
        return None;
    }
    if v.get("s")?.as_str()? != instrument.symbol() {
        return None;
    }

    let status = OrderStatus::from_binance(v.get("X")?.as_str()?)?;
    let side = match v.get("S")?.as_str()? {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        _ => return None,
    };

    // Cancels carry the original client id in "C"; "c" is then the cancel's own id.
    let order_id = v
        .get("C")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .or_else(|| v.get("c").and_then(|c| c.as_str()))?
        .to_string();

    let num = |key: &str| -> f64 {
        v.get(key)
            .and_then(|x| x.as_str())
            .and_then(|x| x.parse().ok())
            .unwrap_or(0.0)
    };
    let size = num("l");
    let price = num("L");
    let commission = num("n");

    let (fee, fee_base) = match v.get("N").and_then(|a| a.as_str()) {
        Some(asset) if asset == instrument.quote => (Some(commission), None),
        Some(asset) if asset == instrument.base => {
            (Some(commission * price), Some(commission))
        }
        _ => (None, None),
    };

    Some(OrderStatusUpdate {
        order_id,
        status,
        side,
        instrument: instrument.clone(),
        size,
        price,
        fee,
        fee_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth() -> Instrument {
        Instrument::new("ETH", "USDT")
    }

    #[test]
    fn parses_trade_execution() {
        let text = r#"{
            "e": "executionReport", "E": 1700000000100, "s": "ETHUSDT",
            "c": "4f1c2a", "S": "BUY", "o": "MARKET", "q": "0.10000000",
            "x": "TRADE", "X": "FILLED", "i": 8812, "l": "0.10000000",
            "L": "2000.00000000", "n": "0.20000000", "N": "USDT", "C": ""
        }"#;
        let update = parse_execution_report(text, &eth()).unwrap();
        assert_eq!(update.order_id, "4f1c2a");
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.side, Side::Buy);
        assert_eq!(update.size, 0.1);
        assert_eq!(update.price, 2000.0);
        assert_eq!(update.fee, Some(0.2));
        assert_eq!(update.fee_base, None);
    }

    #[test]
    fn base_asset_commission_is_converted_to_quote() {
        let text = r#"{"e":"executionReport","s":"ETHUSDT","c":"a","S":"BUY","X":"PARTIALLY_FILLED",
            "l":"0.05","L":"2000.0","n":"0.0001","N":"ETH"}"#;
        let update = parse_execution_report(text, &eth()).unwrap();
        assert_eq!(update.status, OrderStatus::PartiallyFilled);
        assert!((update.fee.unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(update.fee_base, Some(0.0001));
        assert_eq!(update.size, 0.05);
    }

    #[test]
    fn cancel_uses_original_client_id() {
        let text = r#"{"e":"executionReport","s":"ETHUSDT","c":"cancel-1","C":"orig-7","S":"SELL",
            "X":"CANCELED","l":"0","L":"0","n":"0","N":null}"#;
        let update = parse_execution_report(text, &eth()).unwrap();
        assert_eq!(update.order_id, "orig-7");
        assert_eq!(update.status, OrderStatus::Cancelled);
        assert_eq!(update.fee, None);
    }

    #[test]
    fn ignores_other_events() {
        let balance = r#"{"e":"outboundAccountPosition","E":1,"u":1,"B":[]}"#;
        assert!(parse_execution_report(balance, &eth()).is_none());
        let other_symbol = r#"{"e":"executionReport","s":"BTCUSDT","c":"a","S":"BUY","X":"NEW"}"#;
        assert!(parse_execution_report(other_symbol, &eth()).is_none());
    }
}
