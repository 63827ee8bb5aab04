//! Provider wire formats
//!
//! REST payloads follow the market data v2 API (snapshots, bars) and the
//! company profile API. Stream frames are JSON arrays of messages tagged by
//! the `"T"` field.

use chrono::{DateTime, NaiveDate, Utc};
use market_common::{EnrichmentRecord, HistoricalBar};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::{Profile, Snapshot, UpstreamError, UpstreamResult};

// =================================================================
// REST: market data
// =================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TradeWire {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "s", default)]
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BarWire {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v", default)]
    pub volume: i64,
    #[serde(rename = "vw", default)]
    pub vwap: Option<Decimal>,
}

impl From<BarWire> for HistoricalBar {
    fn from(bar: BarWire) -> Self {
        HistoricalBar {
            timestamp: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            vwap: bar.vwap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub latest_trade: Option<TradeWire>,
    pub minute_bar: Option<BarWire>,
    pub daily_bar: Option<BarWire>,
    pub prev_daily_bar: Option<BarWire>,
}

impl SnapshotResponse {
    pub fn into_snapshot(self, symbol: &str) -> UpstreamResult<Snapshot> {
        let trade = self
            .latest_trade
            .ok_or_else(|| UpstreamError::NotFound(format!("no latest trade for {symbol}")))?;

        let prev_close = self.prev_daily_bar.as_ref().map(|b| b.close);
        let change_amount = prev_close.map(|prev| trade.price - prev);
        let change_percent = match (change_amount, prev_close) {
            (Some(change), Some(prev)) if !prev.is_zero() => {
                Some((change / prev * Decimal::ONE_HUNDRED).round_dp(4))
            }
            _ => None,
        };

        Ok(Snapshot {
            symbol: symbol.to_string(),
            price: trade.price,
            trade_size: trade.size,
            timestamp: trade.timestamp,
            volume: self.daily_bar.as_ref().map(|b| b.volume),
            change_amount,
            change_percent,
            minute_bar: self.minute_bar.map(HistoricalBar::from),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BarsResponse {
    #[serde(default)]
    pub bars: Option<Vec<BarWire>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// =================================================================
// REST: profile and fundamentals
// =================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileWire {
    pub symbol: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    #[serde(rename = "mktCap")]
    pub market_cap: Option<Decimal>,
    pub price: Option<Decimal>,
    pub last_div: Option<Decimal>,
    pub pe: Option<Decimal>,
    /// 52 week range, formatted `"low-high"`
    pub range: Option<String>,
}

impl ProfileWire {
    fn parse_range(&self) -> (Option<Decimal>, Option<Decimal>) {
        let Some(range) = self.range.as_deref() else {
            return (None, None);
        };
        match range.split_once('-') {
            Some((low, high)) => (low.trim().parse().ok(), high.trim().parse().ok()),
            None => (None, None),
        }
    }

    pub fn into_profile(self) -> Profile {
        let (low_52w, high_52w) = self.parse_range();
        let dividend_yield = match (self.last_div, self.price) {
            (Some(div), Some(price)) if !price.is_zero() => Some((div / price).round_dp(6)),
            _ => None,
        };

        Profile {
            symbol: self.symbol,
            name: self.company_name.filter(|n| !n.is_empty()),
            sector: self.sector.filter(|s| !s.is_empty()),
            market_cap: self.market_cap,
            pe_ratio: self.pe,
            dividend_yield,
            high_52w,
            low_52w,
        }
    }
}

/// Convert one statement object into an enrichment record keyed by
/// `(date, "<kind>_<period>")`. Objects without a parseable date are skipped.
pub fn statement_to_record(kind: &str, statement: Value) -> Option<EnrichmentRecord> {
    let date = statement.get("date")?.as_str()?;
    let report_date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let period = statement
        .get("period")
        .and_then(Value::as_str)
        .unwrap_or("FY")
        .to_string();

    Some(EnrichmentRecord {
        report_date,
        report_type: format!("{kind}_{}", period.to_lowercase()),
        payload: statement,
    })
}

// =================================================================
// Stream
// =================================================================

/// Client to server stream requests
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StreamRequest {
    Auth {
        key: String,
        secret: String,
    },
    Subscribe {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        trades: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        bars: Vec<String>,
    },
}

impl StreamRequest {
    pub fn auth(key: impl Into<String>, secret: impl Into<String>) -> Self {
        StreamRequest::Auth {
            key: key.into(),
            secret: secret.into(),
        }
    }

    pub fn subscribe_trades(symbols: &[String]) -> Self {
        StreamRequest::Subscribe {
            trades: symbols.to_vec(),
            bars: Vec::new(),
        }
    }

    pub fn subscribe_bars(symbols: &[String]) -> Self {
        StreamRequest::Subscribe {
            trades: Vec::new(),
            bars: symbols.to_vec(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings and vectors cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamTrade {
    #[serde(rename = "S")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "s", default)]
    pub size: i64,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamBar {
    #[serde(rename = "S")]
    pub symbol: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v", default)]
    pub volume: i64,
    #[serde(rename = "vw", default)]
    pub vwap: Option<Decimal>,
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

impl StreamBar {
    pub fn to_historical(&self) -> HistoricalBar {
        HistoricalBar {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap,
        }
    }
}

/// Server to client stream messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "T")]
pub enum StreamMessage {
    /// `connected` or `authenticated`
    #[serde(rename = "success")]
    Success { msg: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<i64>,
        msg: String,
    },
    #[serde(rename = "subscription")]
    Subscription {
        #[serde(default)]
        trades: Vec<String>,
        #[serde(default)]
        bars: Vec<String>,
    },
    #[serde(rename = "t")]
    Trade(StreamTrade),
    #[serde(rename = "b")]
    Bar(StreamBar),
    /// An element of a frame that did not match its declared type
    #[serde(skip)]
    Malformed(String),
    #[serde(other)]
    Unknown,
}

/// Decode one text frame. A frame that is not JSON fails as a whole; a bad
/// element inside a valid frame becomes [`StreamMessage::Malformed`].
pub fn decode_frame(text: &str) -> Result<Vec<StreamMessage>, serde_json::Error> {
    let elements = match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items,
        single => vec![single],
    };

    Ok(elements
        .into_iter()
        .map(|element| {
            serde_json::from_value::<StreamMessage>(element)
                .unwrap_or_else(|e| StreamMessage::Malformed(e.to_string()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_trade_and_bar_frame() {
        let frame = r#"[
            {"T":"t","S":"AAPL","i":96921,"x":"D","p":126.55,"s":1,"t":"2024-02-22T15:51:44.208Z","c":["@","I"],"z":"C"},
            {"T":"b","S":"SPY","o":388.985,"h":389.13,"l":388.975,"c":389.12,"v":49378,"vw":389.06,"t":"2024-02-22T19:15:00Z","n":461}
        ]"#;

        let messages = decode_frame(frame).unwrap();
        assert_eq!(messages.len(), 2);

        match &messages[0] {
            StreamMessage::Trade(trade) => {
                assert_eq!(trade.symbol, "AAPL");
                assert_eq!(trade.price, dec!(126.55));
                assert_eq!(trade.size, 1);
            }
            other => panic!("expected trade, got {other:?}"),
        }
        match &messages[1] {
            StreamMessage::Bar(bar) => {
                assert_eq!(bar.symbol, "SPY");
                assert_eq!(bar.volume, 49378);
                assert_eq!(bar.vwap, Some(dec!(389.06)));
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_messages() {
        let messages =
            decode_frame(r#"[{"T":"success","msg":"connected"},{"T":"q","S":"AAPL"}]"#).unwrap();
        assert_eq!(
            messages[0],
            StreamMessage::Success {
                msg: "connected".to_string()
            }
        );
        assert_eq!(messages[1], StreamMessage::Unknown);

        let messages = decode_frame(r#"{"T":"error","code":402,"msg":"auth failed"}"#).unwrap();
        assert!(matches!(
            &messages[0],
            StreamMessage::Error { code: Some(402), .. }
        ));
    }

    #[test]
    fn test_malformed_element_does_not_poison_frame() {
        let frame = r#"[{"T":"t","S":"AAPL"},{"T":"t","S":"MSFT","p":410.1,"s":5,"t":"2024-02-22T15:51:44Z"}]"#;
        let messages = decode_frame(frame).unwrap();
        assert!(matches!(messages[0], StreamMessage::Malformed(_)));
        assert!(matches!(messages[1], StreamMessage::Trade(_)));

        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn test_stream_requests_serialize() {
        let auth = StreamRequest::auth("key", "secret").to_json();
        assert_eq!(auth, r#"{"action":"auth","key":"key","secret":"secret"}"#);

        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let trades = StreamRequest::subscribe_trades(&symbols).to_json();
        assert_eq!(trades, r#"{"action":"subscribe","trades":["AAPL","MSFT"]}"#);
        let bars = StreamRequest::subscribe_bars(&symbols).to_json();
        assert_eq!(bars, r#"{"action":"subscribe","bars":["AAPL","MSFT"]}"#);
    }

    #[test]
    fn test_snapshot_response_conversion() {
        let json = r#"{
            "latestTrade": {"t":"2024-02-22T15:51:44Z","p":105.0,"s":10},
            "minuteBar": {"t":"2024-02-22T15:51:00Z","o":104.5,"h":105.2,"l":104.4,"c":105.0,"v":1200,"vw":104.9},
            "dailyBar": {"t":"2024-02-22T05:00:00Z","o":101,"h":106,"l":100,"c":105,"v":250000},
            "prevDailyBar": {"t":"2024-02-21T05:00:00Z","o":99,"h":101,"l":98,"c":100,"v":300000}
        }"#;
        let response: SnapshotResponse = serde_json::from_str(json).unwrap();
        let snapshot = response.into_snapshot("AAPL").unwrap();

        assert_eq!(snapshot.price, dec!(105.0));
        assert_eq!(snapshot.change_amount, Some(dec!(5.0)));
        assert_eq!(snapshot.change_percent, Some(dec!(5)));
        assert_eq!(snapshot.volume, Some(250000));
        assert_eq!(snapshot.minute_bar.unwrap().volume, 1200);
    }

    #[test]
    fn test_snapshot_without_trade_is_not_found() {
        let response: SnapshotResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            response.into_snapshot("ZZZZ"),
            Err(UpstreamError::NotFound(_))
        ));
    }

    #[test]
    fn test_profile_conversion() {
        let json = r#"{"symbol":"AAPL","companyName":"Apple Inc.","sector":"Technology",
            "mktCap":2800000000000,"price":180,"lastDiv":0.96,"range":"124.17-199.62"}"#;
        let profile = serde_json::from_str::<ProfileWire>(json)
            .unwrap()
            .into_profile();

        assert_eq!(profile.name.as_deref(), Some("Apple Inc."));
        assert_eq!(profile.low_52w, Some(dec!(124.17)));
        assert_eq!(profile.high_52w, Some(dec!(199.62)));
        assert_eq!(profile.dividend_yield, Some(dec!(0.005333)));
    }

    #[test]
    fn test_statement_to_record() {
        let statement = serde_json::json!({"date": "2024-09-28", "period": "Q4", "revenue": 94930000000i64});
        let record = statement_to_record("income_statement", statement).unwrap();
        assert_eq!(record.report_type, "income_statement_q4");
        assert_eq!(record.report_date, NaiveDate::from_ymd_opt(2024, 9, 28).unwrap());

        assert!(statement_to_record("income_statement", serde_json::json!({"period": "FY"})).is_none());
    }
}
