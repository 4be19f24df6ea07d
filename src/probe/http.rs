//! HTTP GET and redirect probes

use reqwest::header::{HeaderMap, LOCATION};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use super::{ProbeSettings, Prober};
use crate::constants::{NOT_REDIRECTED, REDIRECTED};
use crate::error::ProbeError;
use crate::model::{HttpRecord, ProbeValue, RedirectRecord};
use crate::target::extract_domain;

pub(crate) fn build_client(
    settings: &ProbeSettings,
    policy: reqwest::redirect::Policy,
) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .user_agent(settings.user_agent.as_str())
        .redirect(policy)
        .connect_timeout(settings.tcp_timeout)
        .timeout(settings.http_timeout)
        .build()
        .map_err(|e| ProbeError::Unclassified(format!("HTTP client setup: {}", e)))
}

/// Collapse a header map into name → value, joining repeated headers.
pub fn join_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut joined: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        joined
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    joined
}

impl Prober {
    /// Classify a reqwest failure against the configured deadlines.
    pub(crate) fn request_error(&self, err: reqwest::Error) -> ProbeError {
        ProbeError::from_reqwest(err, self.settings.tcp_timeout, self.settings.http_timeout)
    }

    async fn fetch(&self, url: &str) -> Result<HttpRecord, ProbeError> {
        let response = self.http.get(url).send().await.map_err(|e| self.request_error(e))?;
        let status = response.status().as_u16();
        let headers = join_headers(response.headers());
        let body = response.bytes().await.map_err(|e| self.request_error(e))?;

        Ok(HttpRecord {
            status: ProbeValue::Integer(i64::from(status)),
            content_length: ProbeValue::Integer(body.len() as i64),
            headers: ProbeValue::Headers(headers),
            body: ProbeValue::Text(String::from_utf8_lossy(&body).into_owned()),
        })
    }

    /// GET `url` with the browser user agent, following redirects.
    ///
    /// On failure the status carries the diagnostic and the other fields
    /// are "N/A".
    pub async fn http_get(&self, url: &str) -> HttpRecord {
        match self.fetch(url).await {
            Ok(record) => {
                debug!(url, status = ?record.status, "HTTP GET finished");
                record
            }
            Err(err) => {
                debug!(url, %err, "HTTP GET failed");
                HttpRecord { status: ProbeValue::Error(err.to_string()), ..HttpRecord::unavailable() }
            }
        }
    }

    /// GET `url` without following redirects. A 3xx with a Location header
    /// is reported together with the DNS result for the location's host.
    pub async fn redirect(&self, url: &str) -> RedirectRecord {
        let response = match self.no_redirect.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(url, err = %self.request_error(err), "Redirect check failed");
                return RedirectRecord::unavailable();
            }
        };

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        match location {
            Some(location) if response.status().is_redirection() => {
                // Relative locations point back at the same host.
                let absolute = Url::parse(url)
                    .and_then(|base| base.join(&location))
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| location.clone());
                let host = extract_domain(&absolute);
                let dns = self.dns(&host).await;
                debug!(url, %location, "Redirect observed");

                RedirectRecord {
                    status: ProbeValue::text(REDIRECTED),
                    location: ProbeValue::text(location),
                    location_dns: dns.to_value(),
                }
            }
            _ => RedirectRecord {
                status: ProbeValue::text(NOT_REDIRECTED),
                location: ProbeValue::na(),
                location_dns: ProbeValue::na(),
            },
        }
    }
}
