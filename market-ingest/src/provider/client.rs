//! REST client for the upstream provider
//!
//! Market data (snapshots, historical bars) comes from the data API and is
//! authenticated with key/secret headers. Profiles and fundamentals come from
//! the profile API and are authenticated with an `apikey` query parameter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use market_common::{EnrichmentRecord, Granularity, HistoricalBar};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::cache::TtlCache;
use super::traits::{Profile, Snapshot, UpstreamApi, UpstreamError, UpstreamResult};
use super::types::{statement_to_record, BarsResponse, ProfileWire, SnapshotResponse};
use crate::config::UpstreamSettings;

const KEY_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

/// Statement endpoints merged into the enrichment records
const STATEMENT_KINDS: &[(&str, &str)] = &[
    ("income-statement", "income_statement"),
    ("balance-sheet-statement", "balance_sheet"),
    ("cash-flow-statement", "cash_flow"),
];

/// Number of recent quarterly statements requested per kind
const STATEMENT_LIMIT: &str = "4";

/// Upstream REST client with per-endpoint response caches.
///
/// No retries happen here.
pub struct RestClient {
    client: Client,
    settings: UpstreamSettings,
    historical_timeout: Duration,
    snapshots: TtlCache<Snapshot>,
    profiles: TtlCache<Profile>,
    fundamentals: TtlCache<Option<Vec<EnrichmentRecord>>>,
    history: TtlCache<Vec<HistoricalBar>>,
}

impl RestClient {
    pub fn new(settings: UpstreamSettings) -> UpstreamResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| {
                UpstreamError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        let ttl = Duration::from_secs(settings.cache_ttl_secs);
        Ok(Self {
            client,
            historical_timeout: Duration::from_secs(settings.historical_timeout_secs),
            snapshots: TtlCache::new(Duration::from_secs(settings.snapshot_cache_ttl_secs)),
            profiles: TtlCache::new(ttl),
            fundamentals: TtlCache::new(ttl),
            history: TtlCache::new(ttl),
            settings,
        })
    }

    /// Drop expired entries from every cache, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.snapshots.purge_expired()
            + self.profiles.purge_expired()
            + self.fundamentals.purge_expired()
            + self.history.purge_expired()
    }

    /// `(hits, misses)` summed across caches
    pub fn cache_stats(&self) -> (u64, u64) {
        [
            self.snapshots.stats(),
            self.profiles.stats(),
            self.fundamentals.stats(),
            self.history.stats(),
        ]
        .iter()
        .fold((0, 0), |(hits, misses), (h, m)| (hits + h, misses + m))
    }

    fn data_request(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.settings.data_url.trim_end_matches('/'), path);
        debug!("GET {}", url);
        self.client
            .get(url)
            .header(KEY_HEADER, &self.settings.api_key)
            .header(SECRET_HEADER, &self.settings.api_secret)
    }

    fn profile_request(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.settings.profile_url.trim_end_matches('/'), path);
        debug!("GET {}", url);
        self.client
            .get(url)
            .query(&[("apikey", self.settings.profile_api_key.as_str())])
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> UpstreamResult<T> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Request(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(map_status(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            UpstreamError::Parse(format!("Failed to parse response: {} - body: {}", e, truncate(&body)))
        })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_secs)
    }

    async fn fetch_statements(&self, symbol: &str) -> UpstreamResult<Vec<EnrichmentRecord>> {
        let mut records = Vec::new();
        for (endpoint, kind) in STATEMENT_KINDS {
            let request = self
                .profile_request(&format!("/{}/{}", endpoint, symbol))
                .query(&[("period", "quarter"), ("limit", STATEMENT_LIMIT)]);
            let statements: Vec<Value> = self.send(request, self.request_timeout()).await?;
            records.extend(
                statements
                    .into_iter()
                    .filter_map(|statement| statement_to_record(kind, statement)),
            );
        }
        Ok(records)
    }
}

#[async_trait]
impl UpstreamApi for RestClient {
    async fn get_snapshot(&self, symbol: &str) -> UpstreamResult<Snapshot> {
        if let Some(snapshot) = self.snapshots.get(symbol) {
            return Ok(snapshot);
        }

        let request = self.data_request(&format!("/v2/stocks/{}/snapshot", symbol));
        let response: SnapshotResponse = self.send(request, self.request_timeout()).await?;
        let snapshot = response.into_snapshot(symbol)?;

        self.snapshots.insert(symbol, snapshot.clone());
        Ok(snapshot)
    }

    async fn get_profile(&self, symbol: &str) -> UpstreamResult<Profile> {
        if let Some(profile) = self.profiles.get(symbol) {
            return Ok(profile);
        }

        let request = self.profile_request(&format!("/profile/{}", symbol));
        let profiles: Vec<ProfileWire> = self.send(request, self.request_timeout()).await?;
        let profile = profiles
            .into_iter()
            .next()
            .map(ProfileWire::into_profile)
            .ok_or_else(|| UpstreamError::NotFound(format!("no profile for {}", symbol)))?;

        self.profiles.insert(symbol, profile.clone());
        Ok(profile)
    }

    async fn get_historical_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> UpstreamResult<Vec<HistoricalBar>> {
        let start = from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = to.to_rfc3339_opts(SecondsFormat::Secs, true);
        let cache_key = format!("{}|{}|{}|{}", symbol, granularity, start, end);
        if let Some(bars) = self.history.get(&cache_key) {
            return Ok(bars);
        }

        let limit = self.settings.bar_limit.to_string();
        let mut bars: Vec<HistoricalBar> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .data_request(&format!("/v2/stocks/{}/bars", symbol))
                .query(&[
                    ("timeframe", granularity.timeframe()),
                    ("start", start.as_str()),
                    ("end", end.as_str()),
                    ("limit", limit.as_str()),
                    ("adjustment", "raw"),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("page_token", token.as_str())]);
            }

            let page: BarsResponse = self.send(request, self.historical_timeout).await?;
            bars.extend(page.bars.unwrap_or_default().into_iter().map(HistoricalBar::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        bars.sort_by_key(|bar| bar.timestamp);
        debug!(
            symbol,
            %granularity,
            count = bars.len(),
            "Fetched historical bars"
        );

        self.history.insert(cache_key, bars.clone());
        Ok(bars)
    }

    async fn get_fundamentals(&self, symbol: &str) -> UpstreamResult<Option<Vec<EnrichmentRecord>>> {
        if self.settings.profile_api_key.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.fundamentals.get(symbol) {
            return Ok(cached);
        }

        let records = match self.fetch_statements(symbol).await {
            Ok(records) if records.is_empty() => None,
            Ok(records) => Some(records),
            Err(UpstreamError::NotFound(_)) => None,
            Err(e) => {
                warn!(symbol, error = %e, "Fundamentals request failed");
                return Err(e);
            }
        };

        self.fundamentals.insert(symbol, records.clone());
        Ok(records)
    }
}

fn map_transport_error(error: reqwest::Error, timeout: Duration) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout(timeout)
    } else if error.is_connect() {
        UpstreamError::Connection(error.to_string())
    } else {
        UpstreamError::Request(error.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> UpstreamError {
    let message = truncate(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Authentication(message),
        StatusCode::NOT_FOUND => UpstreamError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimit(message),
        other => UpstreamError::Http {
            status: other.as_u16(),
            message,
        },
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_common::error::ErrorClassification;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, "forbidden"),
            UpstreamError::Authentication(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, ""),
            UpstreamError::NotFound(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            UpstreamError::RateLimit(_)
        ));

        let err = map_status(StatusCode::BAD_GATEWAY, "upstream");
        assert!(matches!(err, UpstreamError::Http { status: 502, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_truncate_long_bodies() {
        let body = "x".repeat(1000);
        let truncated = truncate(&body);
        assert_eq!(truncated.len(), 259);
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn test_fundamentals_disabled_without_profile_key() {
        let client = RestClient::new(UpstreamSettings::default()).unwrap();
        assert_eq!(client.get_fundamentals("AAPL").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let settings = UpstreamSettings {
            data_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 2,
            ..UpstreamSettings::default()
        };
        let client = RestClient::new(settings).unwrap();

        let err = client.get_snapshot("AAPL").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
