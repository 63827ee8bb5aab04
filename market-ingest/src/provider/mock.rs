//! Mock upstream provider for testing
//!
//! Generates deterministic snapshots, profiles and bar series. Individual
//! symbols can be configured to fail, and every call is counted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use market_common::{EnrichmentRecord, Granularity, HistoricalBar};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::traits::{Profile, Snapshot, UpstreamApi, UpstreamError, UpstreamResult};

/// One recorded `get_historical_range` call
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalCall {
    pub symbol: String,
    pub granularity: Granularity,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Mock upstream provider
pub struct MockUpstream {
    /// Price used for generated snapshots and bars
    pub base_price: Decimal,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    profiles: Mutex<HashMap<String, Profile>>,
    history: Mutex<HashMap<String, Vec<HistoricalBar>>>,
    fundamentals: Mutex<HashMap<String, Vec<EnrichmentRecord>>>,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    historical_calls: Mutex<Vec<HistoricalCall>>,
    snapshot_calls: AtomicU64,
    profile_calls: AtomicU64,
    fundamentals_calls: AtomicU64,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            base_price: Decimal::from(100),
            snapshots: Mutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            fundamentals: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            historical_calls: Mutex::new(Vec::new()),
            snapshot_calls: AtomicU64::new(0),
            profile_calls: AtomicU64::new(0),
            fundamentals_calls: AtomicU64::new(0),
        }
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.lock().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn set_profile(&self, profile: Profile) {
        self.profiles.lock().insert(profile.symbol.clone(), profile);
    }

    /// Fixed bars for a symbol; calls return the subset inside the requested range
    pub fn set_history(&self, symbol: &str, bars: Vec<HistoricalBar>) {
        self.history.lock().insert(symbol.to_string(), bars);
    }

    pub fn set_fundamentals(&self, symbol: &str, records: Vec<EnrichmentRecord>) {
        self.fundamentals.lock().insert(symbol.to_string(), records);
    }

    /// Every call for `symbol` fails with an HTTP 500 until cleared
    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().insert(symbol.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Delay applied to snapshot calls
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn snapshot_calls(&self) -> u64 {
        self.snapshot_calls.load(Ordering::Relaxed)
    }

    pub fn profile_calls(&self) -> u64 {
        self.profile_calls.load(Ordering::Relaxed)
    }

    pub fn fundamentals_calls(&self) -> u64 {
        self.fundamentals_calls.load(Ordering::Relaxed)
    }

    pub fn historical_calls(&self) -> Vec<HistoricalCall> {
        self.historical_calls.lock().clone()
    }

    fn check_failure(&self, symbol: &str) -> UpstreamResult<()> {
        if self.failing.lock().contains(symbol) {
            return Err(UpstreamError::Http {
                status: 500,
                message: format!("injected failure for {}", symbol),
            });
        }
        Ok(())
    }

    fn generated_bar(&self, timestamp: DateTime<Utc>) -> HistoricalBar {
        HistoricalBar {
            timestamp,
            open: self.base_price,
            high: self.base_price + Decimal::ONE,
            low: self.base_price - Decimal::ONE,
            close: self.base_price,
            volume: 100,
            vwap: Some(self.base_price),
        }
    }

    /// One bar per step from `from` to `to` inclusive
    fn generate_bars(
        &self,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<HistoricalBar> {
        let step = match granularity {
            Granularity::Minute => chrono::Duration::minutes(1),
            Granularity::Hour => chrono::Duration::hours(1),
            Granularity::Day => chrono::Duration::days(1),
            Granularity::Week => chrono::Duration::weeks(1),
            Granularity::Month => chrono::Duration::days(30),
        };

        let mut bars = Vec::new();
        let mut ts = from;
        while ts <= to {
            bars.push(self.generated_bar(ts));
            ts += step;
        }
        bars
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamApi for MockUpstream {
    async fn get_snapshot(&self, symbol: &str) -> UpstreamResult<Snapshot> {
        self.snapshot_calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_failure(symbol)?;

        if let Some(snapshot) = self.snapshots.lock().get(symbol) {
            return Ok(snapshot.clone());
        }

        let now = Utc::now();
        let minute = now
            .duration_trunc(chrono::Duration::minutes(1))
            .unwrap_or(now);
        Ok(Snapshot {
            symbol: symbol.to_string(),
            price: self.base_price,
            trade_size: 10,
            timestamp: now,
            volume: Some(1_000),
            change_amount: Some(Decimal::ZERO),
            change_percent: Some(Decimal::ZERO),
            minute_bar: Some(self.generated_bar(minute)),
        })
    }

    async fn get_profile(&self, symbol: &str) -> UpstreamResult<Profile> {
        self.profile_calls.fetch_add(1, Ordering::Relaxed);
        self.check_failure(symbol)?;

        Ok(self
            .profiles
            .lock()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Profile {
                symbol: symbol.to_string(),
                name: Some(format!("{} Inc.", symbol)),
                sector: Some("Technology".to_string()),
                ..Profile::default()
            }))
    }

    async fn get_historical_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> UpstreamResult<Vec<HistoricalBar>> {
        self.historical_calls.lock().push(HistoricalCall {
            symbol: symbol.to_string(),
            granularity,
            from,
            to,
        });
        self.check_failure(symbol)?;

        if let Some(bars) = self.history.lock().get(symbol) {
            return Ok(bars
                .iter()
                .filter(|bar| bar.timestamp >= from && bar.timestamp <= to)
                .cloned()
                .collect());
        }
        Ok(self.generate_bars(granularity, from, to))
    }

    async fn get_fundamentals(&self, symbol: &str) -> UpstreamResult<Option<Vec<EnrichmentRecord>>> {
        self.fundamentals_calls.fetch_add(1, Ordering::Relaxed);
        self.check_failure(symbol)?;
        Ok(self.fundamentals.lock().get(symbol).cloned())
    }
}
