//! Metric snapshot sources.
//!
//! The evaluator only needs "current numeric value for a series selector, or
//! absent". This module provides that lookup ([`MetricSnapshot`]), the
//! [`MetricSource`] seam the evaluator pulls from, and two sources:
//!
//! - [`PrometheusScraper`]: pulls a Prometheus text exposition over HTTP and
//!   parses it.
//! - [`StaticMetricSource`]: in-memory values, for tests and embedding.
//!
//! # Series keys
//!
//! Every sample is stored under its canonical key: the metric name followed
//! by its labels sorted by name, e.g. `http_requests{code="500",method="GET"}`.
//! An unlabelled sample is keyed by its bare name. A bare-name selector also
//! matches a family that holds exactly one series.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::SecretString;
use crate::error::SnapshotError;
use crate::rules::Labels;

/// A pull interface returning current metric values.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Read a consistent snapshot of all current values.
    async fn snapshot(&self) -> Result<MetricSnapshot, SnapshotError>;
}

/// Point-in-time metric values keyed by canonical series.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    series: HashMap<String, f64>,
    families: HashMap<String, Vec<String>>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a sample.
    pub fn insert(&mut self, series: &Series, value: f64) {
        let key = series.canonical();
        let members = self.families.entry(series.name.clone()).or_default();
        if !members.contains(&key) {
            members.push(key.clone());
        }
        self.series.insert(key, value);
    }

    /// Insert a sample by selector text. Invalid selectors are ignored.
    pub fn set(&mut self, selector: &str, value: f64) {
        match Series::parse(selector) {
            Ok(series) => self.insert(&series, value),
            Err(e) => tracing::debug!(selector = %selector, error = %e, "Ignoring invalid selector"),
        }
    }

    /// Remove a sample by selector text.
    pub fn remove(&mut self, selector: &str) {
        let Ok(series) = Series::parse(selector) else {
            return;
        };
        let key = series.canonical();
        if self.series.remove(&key).is_some()
            && let Some(members) = self.families.get_mut(&series.name)
        {
            members.retain(|m| m != &key);
            if members.is_empty() {
                self.families.remove(&series.name);
            }
        }
    }

    /// Current value for a series selector, or `None` if absent.
    pub fn value(&self, selector: &str) -> Option<f64> {
        if let Some(v) = self.series.get(selector) {
            return Some(*v);
        }

        let series = Series::parse(selector).ok()?;
        let key = series.canonical();
        if let Some(v) = self.series.get(&key) {
            return Some(*v);
        }

        if series.labels.is_empty() {
            let members = self.families.get(&series.name)?;
            if let [only] = members.as_slice() {
                return self.series.get(only).copied();
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<(S, f64)> for MetricSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut snapshot = MetricSnapshot::new();
        for (selector, value) in iter {
            snapshot.set(selector.as_ref(), value);
        }
        snapshot
    }
}

/// A metric name plus its label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub name: String,
    pub labels: Labels,
}

impl Series {
    /// Parse `name` or `name{label="value",...}`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut cursor = Cursor::new(text.trim());
        let series = cursor.series()?;
        cursor.skip_ws();
        if !cursor.at_end() {
            return Err(format!("unexpected trailing input in '{}'", text));
        }
        Ok(series)
    }

    /// Canonical key: name plus labels sorted by name.
    pub fn canonical(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

/// Canonicalize a selector, for validation and normalisation of rule metrics.
pub fn canonical_selector(selector: &str) -> Result<String, String> {
    Series::parse(selector).map(|s| s.canonical())
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Result of parsing a text exposition body.
#[derive(Debug, Default)]
pub struct ParsedExposition {
    pub snapshot: MetricSnapshot,
    /// Sample lines that could not be parsed and were skipped.
    pub skipped: usize,
}

/// Parse a Prometheus text exposition body.
///
/// Comment and blank lines are ignored. Malformed sample lines are skipped
/// individually; they never fail the whole body.
pub fn parse_exposition(body: &str) -> ParsedExposition {
    let mut parsed = ParsedExposition::default();

    for (lineno, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_sample_line(line) {
            Ok((series, value)) => parsed.snapshot.insert(&series, value),
            Err(e) => {
                tracing::debug!(line = lineno + 1, error = %e, "Skipping malformed exposition line");
                parsed.skipped += 1;
            }
        }
    }

    parsed
}

fn parse_sample_line(line: &str) -> Result<(Series, f64), String> {
    let mut cursor = Cursor::new(line);
    let series = cursor.series()?;
    let rest = cursor.remaining();

    let mut tokens = rest.split_whitespace();
    let value_token = tokens
        .next()
        .ok_or_else(|| format!("missing value for '{}'", series.name))?;
    let value: f64 = value_token
        .parse()
        .map_err(|_| format!("invalid value '{}' for '{}'", value_token, series.name))?;

    // Optional timestamp, ignored.
    if let Some(ts) = tokens.next()
        && ts.parse::<i64>().is_err()
    {
        return Err(format!("invalid timestamp '{}'", ts));
    }
    if tokens.next().is_some() {
        return Err(format!("unexpected trailing tokens after '{}'", series.name));
    }

    Ok((series, value))
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(format!("expected '{}', found '{}'", want, c)),
            None => Err(format!("expected '{}', found end of input", want)),
        }
    }

    fn identifier(&mut self, allow_colon: bool) -> Result<String, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let first = self.pos == start;
            let ok = c.is_ascii_alphabetic()
                || c == '_'
                || (allow_colon && c == ':')
                || (!first && c.is_ascii_digit());
            if !ok {
                break;
            }
            self.bump();
        }
        if self.pos == start {
            return Err(format!("expected identifier at offset {}", start));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn quoted(&mut self) -> Result<String, String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err("unterminated escape in label value".to_string()),
                },
                Some(c) => out.push(c),
                None => return Err("unterminated label value".to_string()),
            }
        }
    }

    fn series(&mut self) -> Result<Series, String> {
        let name = self.identifier(true)?;
        let mut labels = Labels::new();

        if self.peek() == Some('{') {
            self.bump();
            loop {
                self.skip_ws();
                if self.peek() == Some('}') {
                    self.bump();
                    break;
                }
                let key = self.identifier(false)?;
                self.skip_ws();
                self.expect('=')?;
                self.skip_ws();
                let value = self.quoted()?;
                labels.insert(key, value);
                self.skip_ws();
                match self.bump() {
                    Some(',') => continue,
                    Some('}') => break,
                    Some(c) => return Err(format!("expected ',' or '}}', found '{}'", c)),
                    None => return Err("unterminated label set".to_string()),
                }
            }
        }

        Ok(Series { name, labels })
    }
}

/// Pulls the Prometheus text exposition from an HTTP endpoint.
pub struct PrometheusScraper {
    client: Client,
    url: SecretString,
    headers: HashMap<String, SecretString>,
}

impl PrometheusScraper {
    /// Build a scraper with its own HTTP client.
    pub fn new(
        url: SecretString,
        timeout: Duration,
        headers: HashMap<String, SecretString>,
        tls_verify: bool,
    ) -> Result<Self, SnapshotError> {
        let mut builder = Client::builder().timeout(timeout);
        if !tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| SnapshotError::Fetch(e.to_string()))?;

        Ok(Self {
            client,
            url,
            headers,
        })
    }
}

impl std::fmt::Debug for PrometheusScraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusScraper")
            .field("url", &self.url)
            .field("header_count", &self.headers.len())
            .finish()
    }
}

#[async_trait]
impl MetricSource for PrometheusScraper {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn snapshot(&self) -> Result<MetricSnapshot, SnapshotError> {
        let mut request = self
            .client
            .get(self.url.expose())
            .header("Accept", "text/plain; version=0.0.4");
        for (name, value) in &self.headers {
            request = request.header(name, value.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SnapshotError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SnapshotError::HttpStatus(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SnapshotError::Body(e.to_string()))?;

        let parsed = parse_exposition(&body);
        if parsed.skipped > 0 {
            tracing::warn!(skipped = parsed.skipped, "Skipped malformed exposition lines");
            metrics::counter!("alertd_exposition_lines_skipped_total")
                .increment(parsed.skipped as u64);
        }
        tracing::trace!(series = parsed.snapshot.len(), "Metrics scraped");

        Ok(parsed.snapshot)
    }
}

/// In-memory metric source.
#[derive(Debug, Default)]
pub struct StaticMetricSource {
    values: Mutex<MetricSnapshot>,
    fail_next: AtomicBool,
}

impl StaticMetricSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, selector: &str, value: f64) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(selector, value);
    }

    pub fn remove(&self, selector: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(selector);
    }

    pub fn replace(&self, snapshot: MetricSnapshot) {
        *self.values.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn clear(&self) {
        self.replace(MetricSnapshot::new());
    }

    /// Make the next `snapshot()` call fail once.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricSource for StaticMetricSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn snapshot(&self) -> Result<MetricSnapshot, SnapshotError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SnapshotError::Fetch("injected failure".to_string()));
        }
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
