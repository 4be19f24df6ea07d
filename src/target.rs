//! Target normalisation and target-list loading
//!
//! A target keeps the string it was given (used as the result key and for
//! HTTP requests) alongside the bare domain used for DNS and TLS SNI.

use anyhow::Context;
use std::fmt;
use std::path::Path;
use url::{Host, Url};

use crate::constants::HTTPS_PORT;

/// A hostname or URL under measurement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    raw: String,
    url: String,
    domain: String,
}

impl Target {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let url = with_http(&raw);
        let domain = extract_domain(&raw);
        Self { raw, url, domain }
    }

    /// The original string, used as the result key.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// URL for HTTP requests (`http://` added when no scheme was given).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Scheme-, path- and port-free domain for DNS and SNI.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Port the certificate probe should use, or `None` when the target
    /// is explicitly served over plain HTTP on a non-TLS port.
    pub fn https_port(&self) -> Option<u16> {
        let parsed = Url::parse(&self.url).ok()?;
        match (parsed.scheme(), parsed.port()) {
            ("https", port) => Some(port.unwrap_or(HTTPS_PORT)),
            (_, Some(HTTPS_PORT)) | (_, None) => Some(HTTPS_PORT),
            (_, Some(_)) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Target {
    fn from(raw: &str) -> Self {
        Target::new(raw)
    }
}

/// Prefix `http://` unless the string already carries a scheme.
pub fn with_http(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Extract the bare domain from a URL-ish string.
pub fn extract_domain(address: &str) -> String {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    match Url::parse(&candidate).ok().and_then(|u| u.host().map(|h| h.to_owned())) {
        Some(Host::Domain(domain)) => domain,
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => {
            // Not a valid URL; fall back to a textual split.
            let without_scheme = address.split("://").last().unwrap_or(address);
            let netloc = without_scheme.split('/').next().unwrap_or(without_scheme);
            netloc.split(':').next().unwrap_or(netloc).to_string()
        }
    }
}

/// Load targets from a plain list (one per line) or a header-bearing CSV
/// file, where each row contributes its first populated column.
pub fn load_targets<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let is_csv = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"));

    if is_csv {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Cannot open target CSV {:?}", path))?;

        let mut targets = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Malformed row in {:?}", path))?;
            if let Some(first) = record.iter().map(str::trim).find(|field| !field.is_empty()) {
                targets.push(first.to_string());
            }
        }
        Ok(targets)
    } else {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read target list {:?}", path))?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_extract_domain_variants() {
        assert_eq!(extract_domain("example.com"), "example.com");
        assert_eq!(extract_domain("https://www.example.com/path?q=1"), "www.example.com");
        assert_eq!(extract_domain("www.example.com:8080/x"), "www.example.com");
        assert_eq!(extract_domain("http://127.0.0.1:8080"), "127.0.0.1");
    }

    #[test]
    fn test_with_http() {
        assert_eq!(with_http("example.com"), "http://example.com");
        assert_eq!(with_http("https://example.com"), "https://example.com");
        assert_eq!(with_http("HTTP://example.com"), "HTTP://example.com");
    }

    #[test]
    fn test_host_starting_with_http_gets_scheme() {
        assert_eq!(with_http("httpbin.org"), "http://httpbin.org");

        let target = Target::new("httpbin.org");
        assert_eq!(target.url(), "http://httpbin.org");
        assert_eq!(target.domain(), "httpbin.org");
        assert_eq!(target.https_port(), Some(HTTPS_PORT));
        assert_eq!(Target::new("http.cat/404").url(), "http://http.cat/404");
    }

    #[test]
    fn test_target_keeps_original_string() {
        let target = Target::new("  https://Example.com/news ");
        assert_eq!(target.as_str(), "https://Example.com/news");
        assert_eq!(target.url(), "https://Example.com/news");
        assert_eq!(target.domain(), "example.com");
    }

    #[test]
    fn test_https_port_gate() {
        assert_eq!(Target::new("example.com").https_port(), Some(443));
        assert_eq!(Target::new("https://example.com:8443").https_port(), Some(8443));
        assert_eq!(Target::new("http://example.com:8080").https_port(), None);
    }

    #[test]
    fn test_load_plain_list() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        writeln!(file, "example.com\n\n# comment\n  idnes.cz  ").unwrap();
        let targets = load_targets(file.path()).unwrap();
        assert_eq!(targets, vec!["example.com", "idnes.cz"]);
    }

    #[test]
    fn test_load_csv_first_populated_column() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "url,rank\nexample.com,1\n,idnes.cz\n,\nbelarus.by,3").unwrap();
        let targets = load_targets(file.path()).unwrap();
        assert_eq!(targets, vec!["example.com", "idnes.cz", "belarus.by"]);
    }
}
