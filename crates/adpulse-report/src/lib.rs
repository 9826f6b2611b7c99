//! Reporting-endpoint client: chunked query submission with retry/backoff,
//! plus normalization of the endpoint's two response shapes into [`RawFact`]s.

use std::time::Duration;

use adpulse_core::{RawFact, FETCH_RANGE_DAYS};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "adpulse-report";

/// Retry ceiling for transient upstream failures on one sub-range fetch.
pub const MAX_RETRIES: usize = 3;

/// Base backoff delay; doubles on each attempt.
pub const BASE_BACKOFF: Duration = Duration::from_millis(3000);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed report response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429/500/502 are the signatures of a throttled or transiently broken
/// endpoint; every other non-2xx status fails the sub-range immediately.
pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: BASE_BACKOFF,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// `Some(delay)` when `attempt_index` (0-based) may be retried, `None`
    /// once the ceiling is reached or the failure is permanent.
    pub fn retry_delay(
        &self,
        disposition: RetryDisposition,
        attempt_index: usize,
    ) -> Option<Duration> {
        if disposition == RetryDisposition::Retryable && attempt_index < self.max_retries {
            Some(self.delay_for_attempt(attempt_index))
        } else {
            None
        }
    }
}

/// The reporting endpoint answers a query with either an array of row
/// objects or a `[header_row, ...data_rows]` tabular array. Discriminated
/// once, on the shape of the first element.
#[derive(Debug, Clone)]
pub enum ReportRows {
    Tabular {
        headers: Vec<String>,
        rows: Vec<JsonValue>,
    },
    Objects(Vec<JsonValue>),
}

impl ReportRows {
    pub fn from_value(value: JsonValue) -> Result<Self, ReportError> {
        let JsonValue::Array(items) = value else {
            return Err(ReportError::Decode("top-level value is not an array".into()));
        };
        match items.first() {
            None => Ok(ReportRows::Objects(Vec::new())),
            Some(JsonValue::Array(header)) => {
                let headers = header
                    .iter()
                    .map(|h| h.as_str().unwrap_or_default().trim().to_lowercase())
                    .collect();
                Ok(ReportRows::Tabular {
                    headers,
                    rows: items[1..].to_vec(),
                })
            }
            Some(JsonValue::Object(_)) => Ok(ReportRows::Objects(items)),
            Some(other) => Err(ReportError::Decode(format!(
                "unrecognized row shape: {other}"
            ))),
        }
    }

    /// Normalize to canonical facts. Rows without a parsable date or label,
    /// and rows with zero cost, leads, clicks and impressions, are skipped.
    pub fn into_facts(self) -> Vec<RawFact> {
        match self {
            ReportRows::Objects(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let map = row.as_object()?;
                    let field = |names: &[&str]| {
                        names.iter().find_map(|name| map.get(*name)).cloned()
                    };
                    fact_from_fields(
                        field(&["date", "day"]),
                        field(&["ad_name", "name", "label"]),
                        field(&["leads"]),
                        field(&["cost", "spend"]),
                        field(&["clicks"]),
                        field(&["impressions"]),
                        field(&["avg_duration", "avg_watch_time"]),
                    )
                })
                .collect(),
            ReportRows::Tabular { headers, rows } => {
                let index_of = |names: &[&str]| {
                    headers
                        .iter()
                        .position(|h| names.contains(&h.as_str()))
                };
                let date = index_of(&["date", "day"]);
                let label = index_of(&["ad_name", "name", "label"]);
                let leads = index_of(&["leads"]);
                let cost = index_of(&["cost", "spend"]);
                let clicks = index_of(&["clicks"]);
                let impressions = index_of(&["impressions"]);
                let duration = index_of(&["avg_duration", "avg_watch_time"]);

                rows.into_iter()
                    .filter_map(|row| {
                        let cells = row.as_array()?;
                        let cell = |idx: Option<usize>| {
                            idx.and_then(|i| cells.get(i)).cloned()
                        };
                        fact_from_fields(
                            cell(date),
                            cell(label),
                            cell(leads),
                            cell(cost),
                            cell(clicks),
                            cell(impressions),
                            cell(duration),
                        )
                    })
                    .collect()
            }
        }
    }
}

fn fact_from_fields(
    date: Option<JsonValue>,
    label: Option<JsonValue>,
    leads: Option<JsonValue>,
    cost: Option<JsonValue>,
    clicks: Option<JsonValue>,
    impressions: Option<JsonValue>,
    duration: Option<JsonValue>,
) -> Option<RawFact> {
    let day = date.as_ref().and_then(date_value)?;
    let label = label?;
    let entity_key = entity_key_from_label(label.as_str()?);
    if entity_key.is_empty() {
        return None;
    }

    let leads = number_value(leads.as_ref()) as i64;
    let cost = number_value(cost.as_ref());
    let clicks = number_value(clicks.as_ref()) as i64;
    let impressions = number_value(impressions.as_ref()) as i64;
    if leads == 0 && cost == 0.0 && clicks == 0 && impressions == 0 {
        return None;
    }

    Some(RawFact {
        entity_key,
        day,
        leads,
        cost,
        clicks,
        impressions,
        avg_duration: number_value(duration.as_ref()),
    })
}

fn number_value(value: Option<&JsonValue>) -> f64 {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn date_value(value: &JsonValue) -> Option<NaiveDate> {
    let text = value.as_str()?;
    let prefix = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Entity key is the leading token of the row label, up to the first
/// whitespace or hyphen.
pub fn entity_key_from_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

/// Split `[from, to]` into calendar-month sub-ranges so each request stays
/// within the endpoint's timeout tolerance.
pub fn month_chunks(from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut chunks = Vec::new();
    let mut cursor = from;
    while cursor <= to {
        let month_end = end_of_month(cursor);
        let chunk_end = month_end.min(to);
        chunks.push((cursor, chunk_end));
        match chunk_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    chunks
}

fn end_of_month(day: NaiveDate) -> NaiveDate {
    let (year, month) = (day.year(), day.month());
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|d| d.pred_opt())
        .expect("calendar month always has a last day")
}

/// Query text for the reporting endpoint. The transport is opaque text in,
/// rows out; these are plain templates, not a query builder.
#[derive(Debug, Clone)]
pub struct ReportQueries {
    pub facts_table: String,
}

impl ReportQueries {
    pub fn new(facts_table: impl Into<String>) -> Self {
        Self {
            facts_table: facts_table.into(),
        }
    }

    pub fn facts(&self, from: NaiveDate, to: NaiveDate, entity: Option<&str>) -> String {
        let mut query = format!(
            "SELECT date, ad_name, leads, cost, clicks, impressions, avg_duration \
             FROM {} WHERE date >= '{from}' AND date <= '{to}'",
            self.facts_table
        );
        if let Some(entity) = entity {
            query.push_str(&format!(" AND ad_name LIKE '{entity}%'"));
        }
        query
    }

    pub fn entities(&self, from: NaiveDate, to: NaiveDate) -> String {
        format!(
            "SELECT DISTINCT ad_name FROM {} WHERE date >= '{from}' AND date <= '{to}'",
            self.facts_table
        )
    }
}

/// Source of canonical facts for the pipeline. The production implementation
/// is [`ReportClient`]; tests script their own.
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Facts for `[from, to]`, optionally filtered to one entity. Tolerates
    /// missing sub-ranges: the result may be partial.
    async fn fetch_facts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        entity: Option<&str>,
    ) -> Result<Vec<RawFact>, ReportError>;

    /// Distinct entity keys with any activity in `[from, to]`.
    async fn list_entities(&self, from: NaiveDate, to: NaiveDate)
        -> Result<Vec<String>, ReportError>;
}

#[derive(Debug, Clone)]
pub struct ReportClientConfig {
    pub endpoint_url: String,
    pub facts_table: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ReportClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:9000/query".to_string(),
            facts_table: "ad_stats".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct ReportClient {
    client: reqwest::Client,
    endpoint_url: String,
    queries: ReportQueries,
    backoff: BackoffPolicy,
}

impl ReportClient {
    pub fn new(config: ReportClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            endpoint_url: config.endpoint_url,
            queries: ReportQueries::new(config.facts_table),
            backoff: config.backoff,
        })
    }

    /// Submit one query, retrying transient failures with exponential
    /// backoff. Non-retryable statuses and malformed bodies fail at once.
    pub async fn submit_query(&self, query: &str) -> Result<ReportRows, ReportError> {
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .client
                .post(&self.endpoint_url)
                .json(&serde_json::json!({ "query": query }))
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        let value: JsonValue = serde_json::from_str(&body)
                            .map_err(|err| ReportError::Decode(err.to_string()))?;
                        return ReportRows::from_value(value);
                    }

                    match self.backoff.retry_delay(classify_status(status), attempt) {
                        Some(delay) => {
                            warn!(status = status.as_u16(), attempt, ?delay, "report query throttled, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(ReportError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                    }
                }
                Err(err) => {
                    match self
                        .backoff
                        .retry_delay(classify_transport_error(&err), attempt)
                    {
                        Some(delay) => {
                            warn!(error = %err, attempt, ?delay, "report query transport error, backing off");
                            last_transport_error = Some(err);
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(ReportError::Request(err)),
                    }
                }
            }
        }

        Err(ReportError::Request(
            last_transport_error.expect("retry loop exits early unless a transport error occurred"),
        ))
    }
}

#[async_trait]
impl FactSource for ReportClient {
    async fn fetch_facts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        entity: Option<&str>,
    ) -> Result<Vec<RawFact>, ReportError> {
        let chunks = month_chunks(from, to);
        let mut facts = Vec::new();
        let mut fetched_chunks = 0usize;
        let mut last_error = None;

        // Sub-ranges are fetched sequentially to respect the endpoint's
        // rate limits; a failed month degrades the result set only.
        for (chunk_from, chunk_to) in &chunks {
            let query = self.queries.facts(*chunk_from, *chunk_to, entity);
            let span = info_span!("report_fetch", %chunk_from, %chunk_to, entity = entity.unwrap_or("*"));
            match self.submit_query(&query).instrument(span).await {
                Ok(rows) => {
                    facts.extend(rows.into_facts());
                    fetched_chunks += 1;
                }
                Err(err) => {
                    warn!(%chunk_from, %chunk_to, error = %err, "sub-range fetch failed, continuing");
                    last_error = Some(err);
                }
            }
        }

        if fetched_chunks == 0 {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Ok(facts)
    }

    async fn list_entities(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<String>, ReportError> {
        let rows = self.submit_query(&self.queries.entities(from, to)).await?;
        let labels: Vec<String> = match rows {
            ReportRows::Objects(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let map = row.as_object()?;
                    ["ad_name", "name", "label"]
                        .iter()
                        .find_map(|name| map.get(*name))
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                })
                .collect(),
            ReportRows::Tabular { rows, .. } => rows
                .into_iter()
                .filter_map(|row| {
                    row.as_array()?
                        .first()
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                })
                .collect(),
        };

        let mut keys: Vec<String> = labels
            .iter()
            .map(|label| entity_key_from_label(label))
            .filter(|key| !key.is_empty())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Trailing fetch range for a refresh: `[today - 89, today]`, 90 days.
pub fn fetch_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (today - chrono::Duration::days(FETCH_RANGE_DAYS as i64 - 1), today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(text: &str) -> NaiveDate {
        NaiveDate::parse_from_str(text, "%Y-%m-%d").expect("test date")
    }

    #[test]
    fn backoff_doubles_from_three_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(6000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(12000));
    }

    #[test]
    fn retry_ceiling_is_bounded() {
        let policy = BackoffPolicy::default();
        // attempts 0, 1 and 2 may retry; the 4th attempt (index 3) may not
        assert!(policy.retry_delay(RetryDisposition::Retryable, 0).is_some());
        assert!(policy.retry_delay(RetryDisposition::Retryable, 2).is_some());
        assert!(policy.retry_delay(RetryDisposition::Retryable, 3).is_none());
        assert!(policy
            .retry_delay(RetryDisposition::NonRetryable, 0)
            .is_none());
    }

    #[test]
    fn status_classification_matches_transient_taxonomy() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::NonRetryable);
    }

    #[test]
    fn month_chunks_split_on_calendar_boundaries() {
        let chunks = month_chunks(date("2026-06-15"), date("2026-08-10"));
        assert_eq!(
            chunks,
            vec![
                (date("2026-06-15"), date("2026-06-30")),
                (date("2026-07-01"), date("2026-07-31")),
                (date("2026-08-01"), date("2026-08-10")),
            ]
        );

        let single = month_chunks(date("2026-08-03"), date("2026-08-20"));
        assert_eq!(single, vec![(date("2026-08-03"), date("2026-08-20"))]);

        let year_boundary = month_chunks(date("2025-12-20"), date("2026-01-05"));
        assert_eq!(
            year_boundary,
            vec![
                (date("2025-12-20"), date("2025-12-31")),
                (date("2026-01-01"), date("2026-01-05")),
            ]
        );
    }

    #[test]
    fn object_rows_normalize_to_facts() {
        let rows = ReportRows::from_value(json!([
            {"date": "2026-08-01", "ad_name": "V17 summer promo", "leads": 3, "cost": "12.5", "clicks": 40, "impressions": 900, "avg_duration": 14.2},
            {"date": "2026-08-02", "ad_name": "V17-b", "leads": 0, "cost": 0, "clicks": 0, "impressions": 0},
            {"date": "not-a-date", "ad_name": "V18", "leads": 1, "cost": 1.0, "clicks": 1, "impressions": 1}
        ]))
        .expect("valid shape");

        let facts = rows.into_facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].entity_key, "V17");
        assert_eq!(facts[0].day, date("2026-08-01"));
        assert_eq!(facts[0].leads, 3);
        assert_eq!(facts[0].cost, 12.5);
        assert_eq!(facts[0].avg_duration, 14.2);
    }

    #[test]
    fn tabular_rows_normalize_to_facts() {
        let rows = ReportRows::from_value(json!([
            ["Date", "Ad_Name", "Leads", "Spend", "Clicks", "Impressions"],
            ["2026-08-01", "V9 retarget", 2, 8.0, 30, 600],
            ["2026-08-02", "V9 retarget", 0, 0, 0, 0]
        ]))
        .expect("valid shape");

        let facts = rows.into_facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].entity_key, "V9");
        assert_eq!(facts[0].cost, 8.0);
        assert_eq!(facts[0].clicks, 30);
        assert_eq!(facts[0].avg_duration, 0.0);
    }

    #[test]
    fn empty_and_malformed_bodies() {
        let empty = ReportRows::from_value(json!([])).expect("empty array is valid");
        assert!(empty.into_facts().is_empty());

        assert!(ReportRows::from_value(json!({"rows": []})).is_err());
        assert!(ReportRows::from_value(json!([42, 43])).is_err());
    }

    #[test]
    fn entity_key_is_leading_token() {
        assert_eq!(entity_key_from_label("V42 spring launch"), "V42");
        assert_eq!(entity_key_from_label("V42-variant-b"), "V42");
        assert_eq!(entity_key_from_label("  V7\tretarget"), "V7");
        assert_eq!(entity_key_from_label(""), "");
    }

    #[test]
    fn fetch_range_is_ninety_days_inclusive() {
        let (from, to) = fetch_range(date("2026-08-26"));
        assert_eq!(to, date("2026-08-26"));
        assert_eq!(from, date("2026-05-29"));
        assert_eq!((to - from).num_days(), 89);
    }

    #[test]
    fn facts_query_carries_range_and_entity_filter() {
        let queries = ReportQueries::new("ad_stats");
        let q = queries.facts(date("2026-06-01"), date("2026-06-30"), Some("V3"));
        assert!(q.contains("FROM ad_stats"));
        assert!(q.contains("date >= '2026-06-01'"));
        assert!(q.contains("date <= '2026-06-30'"));
        assert!(q.contains("LIKE 'V3%'"));

        let unfiltered = queries.facts(date("2026-06-01"), date("2026-06-30"), None);
        assert!(!unfiltered.contains("LIKE"));
    }
}
