//! Protocol probes
//!
//! Every probe is an async method on [`Prober`], runs under its own deadline
//! and degrades any fault to sentinel values instead of returning an error.

pub mod dns;
pub mod dns_manipulation;
pub mod http;
pub mod icmp;
pub mod middlebox;
pub mod tcp;
pub mod tls;
pub mod trace;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::ProbeConfig;
use crate::constants::{BROWSER_USER_AGENT, HTTP_PORT, MAX_HOPS, TRACE_BASE_PORT};
use crate::error::ProbeError;

/// Address family preference for a probing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpVersion {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            IpVersion::Ipv4 => addr.is_ipv4(),
            IpVersion::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for IpVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "4" => Ok(IpVersion::Ipv4),
            "ipv6" | "6" => Ok(IpVersion::Ipv6),
            _ => Err(anyhow::anyhow!("Invalid IP version: {} (expected ipv4 or ipv6)", s)),
        }
    }
}

/// Runtime knobs for all probes, derived from [`ProbeConfig`].
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub ip_version: IpVersion,
    pub nameservers: Vec<IpAddr>,
    pub nameserver_port: u16,
    pub dns_timeout: Duration,
    pub dns_attempts: usize,
    pub tcp_port: u16,
    pub tcp_timeout: Duration,
    pub icmp_timeout: Duration,
    pub trace_hop_timeout: Duration,
    pub max_hops: u8,
    pub trace_port: u16,
    pub http_timeout: Duration,
    pub tls_timeout: Duration,
    pub user_agent: String,
    pub invalid_methods: Vec<String>,
    pub nx_label: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::Ipv4,
            nameservers: Vec::new(),
            nameserver_port: 53,
            dns_timeout: Duration::from_secs(5),
            dns_attempts: 2,
            tcp_port: HTTP_PORT,
            tcp_timeout: Duration::from_secs(5),
            icmp_timeout: Duration::from_secs(5),
            trace_hop_timeout: Duration::from_secs(1),
            max_hops: MAX_HOPS,
            trace_port: TRACE_BASE_PORT,
            http_timeout: Duration::from_secs(10),
            tls_timeout: Duration::from_secs(5),
            user_agent: BROWSER_USER_AGENT.to_string(),
            invalid_methods: crate::constants::INVALID_METHODS.iter().map(|m| m.to_string()).collect(),
            nx_label: "vantage-nx".to_string(),
        }
    }
}

impl From<&ProbeConfig> for ProbeSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            ip_version: config.ip_version,
            nameservers: config.nameservers.clone(),
            nameserver_port: config.nameserver_port,
            dns_timeout: Duration::from_millis(config.dns_timeout_ms),
            dns_attempts: config.dns_attempts,
            tcp_port: config.tcp_port,
            tcp_timeout: Duration::from_millis(config.tcp_timeout_ms),
            icmp_timeout: Duration::from_millis(config.icmp_timeout_ms),
            trace_hop_timeout: Duration::from_millis(config.trace_hop_timeout_ms),
            max_hops: config.max_hops,
            trace_port: config.trace_port,
            http_timeout: Duration::from_millis(config.http_timeout_ms),
            tls_timeout: Duration::from_millis(config.tls_timeout_ms),
            user_agent: config.user_agent.clone(),
            invalid_methods: config.invalid_methods.clone(),
            nx_label: config.nx_label.clone(),
        }
    }
}

/// Shared probing context: resolver, HTTP clients and TLS connector are
/// built once per run and reused for every target.
pub struct Prober {
    settings: ProbeSettings,
    resolver: TokioAsyncResolver,
    http: reqwest::Client,
    no_redirect: reqwest::Client,
    tls: tls::TlsContext,
}

impl Prober {
    pub fn new(settings: ProbeSettings) -> Result<Self, ProbeError> {
        let resolver = dns::build_resolver(&settings);
        let http = http::build_client(&settings, reqwest::redirect::Policy::default())?;
        let no_redirect = http::build_client(&settings, reqwest::redirect::Policy::none())?;
        let tls = tls::TlsContext::new();
        Ok(Self { settings, resolver, http, no_redirect, tls })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }
}

/// Pick one address of the preferred family from a DNS answer list.
///
/// IPv4-mapped IPv6 addresses are unwrapped before the family check.
pub fn select_address(addresses: &[String], version: IpVersion) -> Option<IpAddr> {
    let candidates: Vec<IpAddr> = addresses
        .iter()
        .filter_map(|a| a.parse::<IpAddr>().ok())
        .map(|addr| match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        })
        .filter(|addr| version.matches(addr))
        .collect();

    candidates.choose(&mut rand::thread_rng()).copied()
}
