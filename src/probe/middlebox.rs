//! Middlebox detection probes
//!
//! The header test sends a raw request whose User-Agent header name and
//! value use mixed case. When the server reflects the request headers, the
//! reflected line must match byte for byte; anything in the path that
//! normalises headers breaks the echo. Servers that reflect nothing give no
//! verdict. The request-line test counts how many invented methods are
//! rejected with 400.

use reqwest::Method;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use super::Prober;
use crate::constants::{
    FAIL, HTTPS_PORT, HTTP_PORT, MANIPULATED, MIXED_CASE_HEADER, MIXED_CASE_VALUE,
    NOT_AVAILABLE, NO_MANIPULATION, RAW_RESPONSE_LIMIT,
};
use crate::error::ProbeError;
use crate::model::{MiddleboxRecord, ProbeValue};
use crate::target::Target;

/// Raw request carrying the mixed-case header.
pub fn mixed_case_request(host: &str, path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n{}: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        path, host, MIXED_CASE_HEADER, MIXED_CASE_VALUE
    )
}

/// How the mixed-case header came back in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEcho {
    /// Reflected byte for byte.
    Exact,
    /// Reflected with a different name casing or value.
    Altered,
    /// Not reflected at all.
    Absent,
}

/// Find the reflected header in a raw response. Plain `Name: value` lines
/// and JSON-style `"Name": "value",` lines are both recognised.
pub fn header_echo(response: &str) -> HeaderEcho {
    let strip = |s: &str| {
        s.trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | ',' | '{' | '}'))
            .to_string()
    };

    let mut altered = false;
    for line in response.lines() {
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = strip(name);
        if !name.eq_ignore_ascii_case(MIXED_CASE_HEADER) {
            continue;
        }
        if name == MIXED_CASE_HEADER && strip(value) == MIXED_CASE_VALUE {
            return HeaderEcho::Exact;
        }
        altered = true;
    }

    if altered {
        HeaderEcho::Altered
    } else {
        HeaderEcho::Absent
    }
}

async fn exchange<S>(stream: &mut S, request: &str) -> Result<String, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    while response.len() < RAW_RESPONSE_LIMIT {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            // Peers often close TLS without close_notify once they are done.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}

impl Prober {
    async fn raw_exchange(&self, target: &Target, addr: IpAddr) -> Result<String, ProbeError> {
        let url = Url::parse(target.url()).map_err(|e| ProbeError::Malformed(e.to_string()))?;
        let https = url.scheme() == "https";
        let port = url.port().unwrap_or(if https { HTTPS_PORT } else { HTTP_PORT });
        let host = url.host_str().unwrap_or(target.domain());
        let request = mixed_case_request(host, url.path());

        if https {
            let (mut stream, _) = self.tls_connect(target.domain(), addr, port).await?;
            exchange(&mut stream, &request).await
        } else {
            let mut stream = TcpStream::connect((addr, port)).await?;
            exchange(&mut stream, &request).await
        }
    }

    /// "No manipulation" when the mixed-case header comes back unchanged,
    /// "Manipulated" when it comes back altered, "N/A" when the server does
    /// not reflect it or no exchange was possible.
    pub async fn header_manipulation(&self, target: &Target, addr: IpAddr) -> ProbeValue {
        let deadline = self.settings.http_timeout;
        let outcome = tokio::time::timeout(deadline, self.raw_exchange(target, addr))
            .await
            .unwrap_or(Err(ProbeError::Timeout(deadline)));

        match outcome.map(|response| header_echo(&response)) {
            Ok(HeaderEcho::Exact) => ProbeValue::text(NO_MANIPULATION),
            Ok(HeaderEcho::Altered) => ProbeValue::text(MANIPULATED),
            Ok(HeaderEcho::Absent) => {
                debug!(site = %target, "Server does not reflect request headers");
                ProbeValue::na()
            }
            Err(err) => {
                debug!(site = %target, %err, "Header manipulation test failed");
                ProbeValue::na()
            }
        }
    }

    /// Fraction of invented request methods answered with HTTP 400.
    pub async fn invalid_request_line(&self, url: &str) -> ProbeValue {
        let methods = &self.settings.invalid_methods;
        if methods.is_empty() {
            return ProbeValue::na();
        }

        let mut rejected = 0usize;
        for name in methods {
            let method = match Method::from_bytes(name.as_bytes()) {
                Ok(method) => method,
                Err(err) => {
                    debug!(method = %name, %err, "Skipping unusable method");
                    return ProbeValue::na();
                }
            };

            match self.http.request(method, url).send().await {
                Ok(response) => {
                    if response.status().as_u16() == 400 {
                        rejected += 1;
                    }
                }
                Err(err) => {
                    let err = self.request_error(err);
                    debug!(url, method = %name, %err, "Invalid request line test failed");
                    let verdict = if matches!(err, ProbeError::Timeout(_)) { NOT_AVAILABLE } else { FAIL };
                    return ProbeValue::text(verdict);
                }
            }
        }

        ProbeValue::Ratio(rejected as f64 / methods.len() as f64)
    }

    pub async fn middlebox(&self, target: &Target, addr: Option<IpAddr>) -> MiddleboxRecord {
        let header_manipulation = match addr {
            Some(addr) => self.header_manipulation(target, addr).await,
            None => ProbeValue::na(),
        };
        MiddleboxRecord {
            header_manipulation,
            invalid_request_line: self.invalid_request_line(target.url()).await,
        }
    }
}
