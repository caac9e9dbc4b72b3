use crate::core::types::{LedgerRow, TradeResult};
use std::io::Write;
use std::path::Path;

const HEADER: &str = "| Closed | Instrument | Side | Size | Entry | Exit | Gross | Net |\n\
                      |---|---|---|---|---|---|---|---|\n";

pub fn read_ledger(path: &str) -> anyhow::Result<Vec<LedgerRow>> {
    let backup = format!("{}.bak", path);

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) if !Path::new(path).exists() => return Ok(Vec::new()),
        Err(_) => {
            tracing::warn!("{} unreadable — trying backup", path);
            std::fs::read_to_string(&backup)?
        }
    };

    let rows = parse_ledger_content(&content);

    let data_lines = content.lines().filter(|l| is_data_line(l)).count();

    if data_lines > 0 && rows.is_empty() {
        tracing::error!(
            "{} corrupt ({} lines, 0 parsed) — using backup",
            path,
            data_lines
        );
        let backup_content = std::fs::read_to_string(&backup)?;
        return Ok(parse_ledger_content(&backup_content));
    }

    Ok(rows)
}

fn is_data_line(line: &str) -> bool {
    line.starts_with('|') && !line.contains("---") && !line.contains("Closed")
}

fn parse_ledger_content(content: &str) -> Vec<LedgerRow> {
    content
        .lines()
        .filter(|l| is_data_line(l))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('|').map(|s| s.trim()).collect();
            if cols.len() < 9 {
                return None;
            }
            Some(LedgerRow {
                closed_at: cols[1].to_string(),
                instrument: cols[2].to_string(),
                side: cols[3].to_string(),
                size: cols[4].parse().ok()?,
                entry_price: cols[5].parse().ok()?,
                exit_price: cols[6].parse().ok()?,
                gross_pnl: cols[7].parse().ok()?,
                net_pnl: cols[8].parse().ok()?,
            })
        })
        .collect()
}

pub fn append_trade(path: &str, trade: &TradeResult) -> anyhow::Result<()> {
    let backup = format!("{}.bak", path);

    let exists = Path::new(path).exists();
    if exists {
        std::fs::copy(path, &backup)?;
    }

    let line = format!(
        "| {} | {} | {} | {} | {:.2} | {:.2} | {:.2} | {:.2} |",
        trade.closed_at.to_rfc3339(),
        trade.instrument,
        trade.side,
        trade.size,
        trade.entry_price,
        trade.exit_price,
        trade.gross_pnl,
        trade.net_pnl
    );

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if !exists {
        file.write_all(HEADER.as_bytes())?;
    }
    writeln!(file, "{}", line)?;

    Ok(())
}

pub fn total_net_pnl(rows: &[LedgerRow]) -> f64 {
    rows.iter().map(|r| r.net_pnl).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Instrument, Side};
    use chrono::Utc;

    fn temp_ledger() -> String {
        std::env::temp_dir()
            .join(format!("ledger-{}.md", uuid::Uuid::new_v4().simple()))
            .to_string_lossy()
            .into_owned()
    }

    fn trade(net: f64) -> TradeResult {
        TradeResult {
            instrument: Instrument::new("ETH", "USDT"),
            side: Side::Buy,
            size: 0.1,
            entry_price: 2000.0,
            exit_price: 2010.0,
            gross_pnl: 1.0,
            net_pnl: net,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn missing_ledger_is_empty() {
        assert!(read_ledger(&temp_ledger()).unwrap().is_empty());
    }

    #[test]
    fn append_then_read_back() {
        let path = temp_ledger();
        append_trade(&path, &trade(0.6)).unwrap();
        append_trade(&path, &trade(-0.25)).unwrap();

        let rows = read_ledger(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].instrument, "ETH/USDT");
        assert_eq!(rows[0].side, "buy");
        assert_eq!(rows[0].gross_pnl, 1.0);
        assert!((total_net_pnl(&rows) - 0.35).abs() < 1e-9);
        assert!(Path::new(&format!("{}.bak", path)).exists());

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{}.bak", path));
    }

    #[test]
    fn corrupt_ledger_falls_back_to_backup() {
        let path = temp_ledger();
        append_trade(&path, &trade(0.5)).unwrap();
        append_trade(&path, &trade(0.5)).unwrap();
        std::fs::write(&path, "| garbage | row |\n").unwrap();

        let rows = read_ledger(&path).unwrap();
        assert_eq!(rows.len(), 1);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{}.bak", path));
    }
}
