//! Result data model
//!
//! Probe outcomes are strongly typed while being produced and flattened into
//! a field-name → [`ProbeValue`] map for persistence and comparison. Every
//! declared field is always present; failures are written as sentinels.

use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::NOT_AVAILABLE;

/// Canonical field names of a flattened probe result.
pub mod fields {
    pub const TIME: &str = "Time";
    pub const URL: &str = "URL";
    pub const DNS_STATUS: &str = "DNS Status";
    pub const DNS_IPS: &str = "DNS IPs";
    pub const TCP_STATUS: &str = "TCP Status";
    pub const TCP_REMOTE_IP: &str = "TCP Remote IP";
    pub const PING_STATUS: &str = "PING Status";
    pub const PING_IP: &str = "PING IP";
    pub const TRACE_HOPS: &str = "Trace hop IP";
    pub const REDIRECT_STATUS: &str = "Redirected Status";
    pub const REDIRECT_LOCATION: &str = "Redirected Location";
    pub const REDIRECT_LOCATION_IPS: &str = "Redirected Location IPs";
    pub const HTTP_STATUS: &str = "HTTP Status";
    pub const CONTENT_LENGTH: &str = "Content Length";
    pub const HEADERS: &str = "Headers";
    pub const HTML_CONTENT: &str = "HTML Content";
    pub const CERT_STATUS: &str = "Cert Status";
    pub const CERT_CONTENT: &str = "Cert Content";
    pub const MIDDLEBOX_HEADER: &str = "Middle box - header manipulation test";
    pub const MIDDLEBOX_REQUEST_LINE: &str = "Middle box - invalid request line";
    pub const DNS_REPEATED_QUERY: &str = "DNS manipulation - repeated query";
    pub const DNS_HIJACKING: &str = "DNS manipulation - hijacking detect";
    pub const SEARCH_PRESENCE: &str = "Is domain in G search";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const ERROR: &str = "Error";
}

/// One traceroute hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub address: String,
    pub rtt_ms: f64,
}

/// A single probe field value.
///
/// Serialized untagged so result files stay plain JSON; variant order is the
/// order tried when reading a file back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeValue {
    Integer(i64),
    Ratio(f64),
    Text(String),
    Addresses(Vec<String>),
    Hops(Vec<Hop>),
    Headers(BTreeMap<String, String>),
    Record(serde_json::Value),
    /// Diagnostic of a failed probe; read back as [`ProbeValue::Text`].
    #[serde(skip_deserializing)]
    Error(String),
}

impl ProbeValue {
    /// The "N/A" sentinel.
    pub fn na() -> Self {
        ProbeValue::Text(NOT_AVAILABLE.to_string())
    }

    pub fn text(value: impl Into<String>) -> Self {
        ProbeValue::Text(value.into())
    }

    /// String content of `Text` and `Error` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ProbeValue::Text(s) | ProbeValue::Error(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric content of `Integer` and `Ratio` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ProbeValue::Integer(n) => Some(*n as f64),
            ProbeValue::Ratio(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_text(&self, expected: &str) -> bool {
        self.as_str() == Some(expected)
    }
}

impl fmt::Display for ProbeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeValue::Integer(n) => write!(f, "{}", n),
            ProbeValue::Ratio(r) => write!(f, "{}", r),
            ProbeValue::Text(s) | ProbeValue::Error(s) => f.write_str(s),
            other => match serde_json::to_string(other) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

/// Flattened form of a probe result.
pub type FieldMap = BTreeMap<String, ProbeValue>;

/// DNS lookup outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    pub status: ProbeValue,
    pub addresses: ProbeValue,
}

impl DnsRecord {
    pub fn unavailable() -> Self {
        Self { status: ProbeValue::na(), addresses: ProbeValue::na() }
    }

    pub fn addresses(&self) -> &[String] {
        match &self.addresses {
            ProbeValue::Addresses(list) => list,
            _ => &[],
        }
    }

    pub fn to_value(&self) -> ProbeValue {
        ProbeValue::Record(serde_json::json!({
            "status": self.status,
            "addresses": self.addresses,
        }))
    }
}

/// TCP handshake outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpRecord {
    pub status: ProbeValue,
    pub remote: ProbeValue,
}

impl TcpRecord {
    pub fn unavailable() -> Self {
        Self { status: ProbeValue::na(), remote: ProbeValue::na() }
    }
}

/// ICMP echo outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRecord {
    pub status: ProbeValue,
    pub source: ProbeValue,
}

impl PingRecord {
    pub fn unavailable() -> Self {
        Self { status: ProbeValue::na(), source: ProbeValue::na() }
    }
}

/// Redirect check outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectRecord {
    pub status: ProbeValue,
    pub location: ProbeValue,
    pub location_dns: ProbeValue,
}

impl RedirectRecord {
    pub fn unavailable() -> Self {
        Self {
            status: ProbeValue::na(),
            location: ProbeValue::na(),
            location_dns: ProbeValue::na(),
        }
    }
}

/// HTTP GET outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRecord {
    pub status: ProbeValue,
    pub content_length: ProbeValue,
    pub headers: ProbeValue,
    pub body: ProbeValue,
}

impl HttpRecord {
    pub fn unavailable() -> Self {
        Self {
            status: ProbeValue::na(),
            content_length: ProbeValue::na(),
            headers: ProbeValue::na(),
            body: ProbeValue::na(),
        }
    }

    pub fn status_code(&self) -> Option<i64> {
        match self.status {
            ProbeValue::Integer(code) => Some(code),
            _ => None,
        }
    }
}

/// TLS certificate outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct CertRecord {
    pub status: ProbeValue,
    pub content: ProbeValue,
}

impl CertRecord {
    pub fn unavailable() -> Self {
        Self { status: ProbeValue::na(), content: ProbeValue::na() }
    }
}

/// Middlebox test outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct MiddleboxRecord {
    pub header_manipulation: ProbeValue,
    pub invalid_request_line: ProbeValue,
}

impl MiddleboxRecord {
    pub fn unavailable() -> Self {
        Self { header_manipulation: ProbeValue::na(), invalid_request_line: ProbeValue::na() }
    }
}

/// DNS manipulation test outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsManipulationRecord {
    pub repeated_query: ProbeValue,
    pub hijacking: ProbeValue,
}

impl DnsManipulationRecord {
    pub fn unavailable() -> Self {
        Self { repeated_query: ProbeValue::na(), hijacking: ProbeValue::na() }
    }
}

/// Every protocol outcome for one target from one vantage point.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub url: String,
    pub dns: DnsRecord,
    pub tcp: TcpRecord,
    pub ping: PingRecord,
    pub trace: ProbeValue,
    pub redirect: RedirectRecord,
    pub http: HttpRecord,
    pub cert: CertRecord,
    pub middlebox: MiddleboxRecord,
    pub dns_manipulation: DnsManipulationRecord,
    /// Diagnostic when assembly was aborted by an unexpected fault.
    pub error: Option<String>,
    pub timestamp: DateTime<Local>,
    /// Wall-clock seconds spent probing, rounded to centiseconds.
    pub elapsed: f64,
}

impl ProbeResult {
    /// Result with every field set to "N/A".
    pub fn unavailable(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dns: DnsRecord::unavailable(),
            tcp: TcpRecord::unavailable(),
            ping: PingRecord::unavailable(),
            trace: ProbeValue::na(),
            redirect: RedirectRecord::unavailable(),
            http: HttpRecord::unavailable(),
            cert: CertRecord::unavailable(),
            middlebox: MiddleboxRecord::unavailable(),
            dns_manipulation: DnsManipulationRecord::unavailable(),
            error: None,
            timestamp: Local::now(),
            elapsed: 0.0,
        }
    }

    /// Error-tagged result for a target whose assembly failed.
    pub fn partial(url: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        let mut result = Self::unavailable(url);
        result.error = Some(diagnostic.into());
        result
    }

    pub fn is_rate_limited(&self) -> bool {
        self.http.status_code() == Some(429)
    }

    /// Flatten into the persisted field map.
    pub fn fields(&self) -> FieldMap {
        use self::fields::*;

        let mut map = FieldMap::new();
        let mut put = |name: &str, value: &ProbeValue| {
            map.insert(name.to_string(), value.clone());
        };

        put(TIME, &ProbeValue::Ratio(self.elapsed));
        put(URL, &ProbeValue::text(&self.url));
        put(DNS_STATUS, &self.dns.status);
        put(DNS_IPS, &self.dns.addresses);
        put(TCP_STATUS, &self.tcp.status);
        put(TCP_REMOTE_IP, &self.tcp.remote);
        put(PING_STATUS, &self.ping.status);
        put(PING_IP, &self.ping.source);
        put(TRACE_HOPS, &self.trace);
        put(REDIRECT_STATUS, &self.redirect.status);
        put(REDIRECT_LOCATION, &self.redirect.location);
        put(REDIRECT_LOCATION_IPS, &self.redirect.location_dns);
        put(HTTP_STATUS, &self.http.status);
        put(CONTENT_LENGTH, &self.http.content_length);
        put(HEADERS, &self.http.headers);
        put(HTML_CONTENT, &self.http.body);
        put(CERT_STATUS, &self.cert.status);
        put(CERT_CONTENT, &self.cert.content);
        put(MIDDLEBOX_HEADER, &self.middlebox.header_manipulation);
        put(MIDDLEBOX_REQUEST_LINE, &self.middlebox.invalid_request_line);
        put(DNS_REPEATED_QUERY, &self.dns_manipulation.repeated_query);
        put(DNS_HIJACKING, &self.dns_manipulation.hijacking);
        put(
            TIMESTAMP,
            &ProbeValue::text(self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
        );
        if let Some(error) = &self.error {
            put(ERROR, &ProbeValue::Error(error.clone()));
        }
        map
    }
}

impl Serialize for ProbeResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = self.fields();
        let mut map = serializer.serialize_map(Some(fields.len()))?;
        for (name, value) in &fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Identifies one probing batch; pairs result files across vantage points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId {
    pub label: String,
    pub batch: usize,
    pub timestamp: DateTime<Local>,
}

impl RunId {
    pub fn new(label: impl Into<String>, batch: usize) -> Self {
        Self { label: label.into(), batch, timestamp: Local::now() }
    }

    /// `results_<label>_<batch>_<timestamp>.json`
    pub fn file_name(&self) -> String {
        format!(
            "results_{}_{}_{}.json",
            self.label,
            self.batch,
            self.timestamp.format("%d-%m-%Y_%H-%M")
        )
    }
}

/// All probe results of one batch at one vantage point, keyed by target.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub run: RunId,
    results: BTreeMap<String, ProbeResult>,
}

impl ResultSet {
    pub fn new(run: RunId) -> Self {
        Self { run, results: BTreeMap::new() }
    }

    /// Insert the final result for a target, replacing any earlier one.
    pub fn insert(&mut self, target: impl Into<String>, result: ProbeResult) {
        self.results.insert(target.into(), result);
    }

    pub fn get(&self, target: &str) -> Option<&ProbeResult> {
        self.results.get(target)
    }

    pub fn contains(&self, target: &str) -> bool {
        self.results.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProbeResult)> {
        self.results.iter()
    }

    /// Flattened form, as it would be read back from disk.
    pub fn to_recorded(&self) -> RecordedSet {
        self.results
            .iter()
            .map(|(target, result)| (target.clone(), result.fields()))
            .collect()
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.results.len()))?;
        for (target, result) in &self.results {
            map.serialize_entry(target, result)?;
        }
        map.end()
    }
}

/// A result set as loaded from disk: target → flattened fields.
pub type RecordedSet = BTreeMap<String, FieldMap>;
