use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =================================================================
// Source tags
// =================================================================

/// Provenance of a stored observation.
///
/// Retention only ever deletes `Streaming` rows. When two writers hit the same
/// `(instrument, timestamp)` key, a lower-priority write leaves the stored row
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Streaming,
    Polling,
    Repair,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Streaming => "streaming",
            DataSource::Polling => "polling",
            DataSource::Repair => "repair",
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            DataSource::Streaming => 0,
            DataSource::Polling => 1,
            DataSource::Repair => 2,
        }
    }

    /// Whether a write tagged `incoming` may replace a row tagged `self`.
    /// Lower-priority data never overwrites a stored row.
    pub fn yields_to(self, incoming: DataSource) -> bool {
        incoming.priority() >= self.priority()
    }

}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown data source tag: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for DataSource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(DataSource::Streaming),
            "polling" => Ok(DataSource::Polling),
            "repair" => Ok(DataSource::Repair),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

// =================================================================
// Granularity
// =================================================================

/// Bar size requested from the historical endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Picks the bar size for a requested span.
    ///
    /// Providers cap bars per call, so wider spans need coarser bars:
    /// < 1 day minute, < 1 week hour, < 1 month (30 days) day,
    /// < 1 year (365 days) week, otherwise month.
    pub fn for_span(span: Duration) -> Self {
        if span < Duration::days(1) {
            Granularity::Minute
        } else if span < Duration::weeks(1) {
            Granularity::Hour
        } else if span < Duration::days(30) {
            Granularity::Day
        } else if span < Duration::days(365) {
            Granularity::Week
        } else {
            Granularity::Month
        }
    }

    /// Provider timeframe parameter
    pub fn timeframe(&self) -> &'static str {
        match self {
            Granularity::Minute => "1Min",
            Granularity::Hour => "1Hour",
            Granularity::Day => "1Day",
            Granularity::Week => "1Week",
            Granularity::Month => "1Month",
        }
    }

    pub fn is_finest(&self) -> bool {
        matches!(self, Granularity::Minute)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.timeframe())
    }
}

// =================================================================
// Instruments
// =================================================================

/// A tracked symbol as stored in the `instruments` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: i64,
    pub symbol: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub last_price: Option<Decimal>,
    pub change_amount: Option<Decimal>,
    pub change_percent: Option<Decimal>,
    pub volume: Option<i64>,
    pub market_cap: Option<Decimal>,
    pub pe_ratio: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub high_52w: Option<Decimal>,
    pub low_52w: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

/// Write-side view of an instrument: everything except the surrogate key.
///
/// `None` fields never clear an existing stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub last_price: Option<Decimal>,
    pub change_amount: Option<Decimal>,
    pub change_percent: Option<Decimal>,
    pub volume: Option<i64>,
    pub market_cap: Option<Decimal>,
    pub pe_ratio: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub high_52w: Option<Decimal>,
    pub low_52w: Option<Decimal>,
}

impl InstrumentSnapshot {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.last_price = Some(price);
        self
    }
}

// =================================================================
// Observations
// =================================================================

/// One trade/quote observation. Unique per `(instrument_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub instrument_id: i64,
    pub price: Decimal,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
    pub source: DataSource,
}

impl PricePoint {
    pub fn new(
        instrument_id: i64,
        price: Decimal,
        volume: i64,
        timestamp: DateTime<Utc>,
        source: DataSource,
    ) -> Self {
        Self {
            instrument_id,
            price,
            volume,
            timestamp,
            source,
        }
    }
}

/// One OHLCV bar. Unique per `(instrument_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBar {
    pub instrument_id: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub vwap: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub source: DataSource,
}

/// A bar returned by the provider's historical endpoint, not yet bound to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub vwap: Option<Decimal>,
}

impl HistoricalBar {
    /// The close of the bar as a point observation.
    pub fn to_price_point(&self, instrument_id: i64, source: DataSource) -> PricePoint {
        PricePoint::new(instrument_id, self.close, self.volume, self.timestamp, source)
    }

    pub fn to_aggregate_bar(&self, instrument_id: i64, source: DataSource) -> AggregateBar {
        AggregateBar {
            instrument_id,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap,
            timestamp: self.timestamp,
            source,
        }
    }
}

/// Optional per-instrument enrichment (fundamentals, ratios, indicators),
/// keyed by its natural business key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub report_date: NaiveDate,
    pub report_type: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_granularity_tiers() {
        assert_eq!(Granularity::for_span(Duration::minutes(30)), Granularity::Minute);
        assert_eq!(Granularity::for_span(Duration::hours(23)), Granularity::Minute);
        assert_eq!(Granularity::for_span(Duration::days(1)), Granularity::Hour);
        assert_eq!(Granularity::for_span(Duration::days(6)), Granularity::Hour);
        assert_eq!(Granularity::for_span(Duration::days(7)), Granularity::Day);
        assert_eq!(Granularity::for_span(Duration::days(29)), Granularity::Day);
        assert_eq!(Granularity::for_span(Duration::days(90)), Granularity::Week);
        assert_eq!(Granularity::for_span(Duration::days(365)), Granularity::Month);
    }

    #[test]
    fn test_only_minute_is_finest() {
        assert!(Granularity::Minute.is_finest());
        assert!(!Granularity::Hour.is_finest());
        assert_eq!(Granularity::Week.timeframe(), "1Week");
    }

    #[test]
    fn test_source_round_trip_and_priority() {
        for source in [DataSource::Streaming, DataSource::Polling, DataSource::Repair] {
            assert_eq!(source.as_str().parse::<DataSource>().unwrap(), source);
        }
        assert!("live".parse::<DataSource>().is_err());

        assert!(DataSource::Streaming.yields_to(DataSource::Polling));
        assert!(DataSource::Polling.yields_to(DataSource::Polling));
        assert!(!DataSource::Repair.yields_to(DataSource::Streaming));
        assert!(!DataSource::Polling.yields_to(DataSource::Streaming));
    }

    #[test]
    fn test_historical_bar_conversion() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 15, 0, 0).unwrap();
        let bar = HistoricalBar {
            timestamp: ts,
            open: dec!(10),
            high: dec!(12),
            low: dec!(9),
            close: dec!(11.5),
            volume: 1_000,
            vwap: Some(dec!(10.8)),
        };

        let point = bar.to_price_point(7, DataSource::Repair);
        assert_eq!(point.price, dec!(11.5));
        assert_eq!(point.timestamp, ts);

        let agg = bar.to_aggregate_bar(7, DataSource::Repair);
        assert_eq!(agg.high, dec!(12));
        assert_eq!(agg.vwap, Some(dec!(10.8)));
    }
}
