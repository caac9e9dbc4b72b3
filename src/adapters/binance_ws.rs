use crate::core::types::*;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;

/// Stream live klines for `instrument` into the event queue, reconnecting
/// forever. Returns only when the receiver is dropped.
pub async fn connect(
    ws_base_url: &str,
    instrument: Instrument,
    timeframe: Timeframe,
    tx: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let url = format!(
        "{}/{}@kline_{}",
        ws_base_url,
        instrument.symbol().to_lowercase(),
        timeframe.as_interval()
    );

    loop {
        tracing::info!("Binance WS connecting to {}", url);
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!("Binance WS connected");
                let (_, mut read) = ws.split();

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                            if let Some(bar) = parse_kline(&text, &instrument, timeframe) {
                                if tx.send(Event::Bar(bar)).await.is_err() {
                                    tracing::warn!("Binance WS receiver dropped");
                                    return Ok(());
                                }
                            }
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => {
                            tracing::warn!("Binance WS closed by server");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Binance WS error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                if tx.send(Event::Disconnected("market data")).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::warn!("Binance WS connect failed: {}", e);
            }
        }
        tracing::info!("Binance WS reconnecting in 5s");
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}

fn parse_kline(text: &str, instrument: &Instrument, timeframe: Timeframe) -> Option<Bar> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;

    // Combined stream format: {"stream":"ethusdt@kline_1m","data":{...}}
    // Single stream format: {"e":"kline","k":{...}}
    let k = if let Some(data) = v.get("data") {
        data.get("k")?
    } else {
        v.get("k")?
    };

    if k.get("s")?.as_str()? != instrument.symbol() {
        return None;
    }

    let num = |key: &str| -> Option<f64> { k.get(key)?.as_str()?.parse().ok() };

    Some(Bar {
        instrument: instrument.clone(),
        timeframe,
        candle: Candle {
            open_time: k.get("t")?.as_i64()?,
            open: num("o")?,
            high: num("h")?,
            low: num("l")?,
            close: num("c")?,
            volume: num("v")?,
            close_time: k.get("T")?.as_i64()?,
        },
        is_live: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLINE: &str = r#"{
        "e": "kline", "E": 1700000030000, "s": "ETHUSDT",
        "k": {
            "t": 1700000000000, "T": 1700000059999, "s": "ETHUSDT", "i": "1m",
            "o": "2000.00", "c": "2003.50", "h": "2004.00", "l": "1999.10",
            "v": "41.20", "x": false
        }
    }"#;

    #[test]
    fn parses_single_stream_kline_as_live_bar() {
        let eth = Instrument::new("ETH", "USDT");
        let bar = parse_kline(KLINE, &eth, Timeframe::M1).unwrap();
        assert!(bar.is_live);
        assert_eq!(bar.candle.open_time, 1_700_000_000_000);
        assert_eq!(bar.candle.close, 2003.5);
        assert_eq!(bar.candle.low, 1999.1);
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let eth = Instrument::new("ETH", "USDT");
        let wrapped = format!(r#"{{"stream":"ethusdt@kline_1m","data":{}}}"#, KLINE);
        assert!(parse_kline(&wrapped, &eth, Timeframe::M1).is_some());
    }

    #[test]
    fn ignores_other_symbols_and_noise() {
        let btc = Instrument::new("BTC", "USDT");
        assert!(parse_kline(KLINE, &btc, Timeframe::M1).is_none());
        assert!(parse_kline(r#"{"result":null,"id":1}"#, &btc, Timeframe::M1).is_none());
    }
}
