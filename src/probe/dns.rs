//! DNS resolution probe

use std::net::IpAddr;
use tracing::{debug, warn};
use trust_dns_resolver::config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::error::ProtoErrorKind;
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::TokioAsyncResolver;

use super::{IpVersion, ProbeSettings, Prober};
use crate::constants::OK;
use crate::error::ProbeError;
use crate::model::{DnsRecord, ProbeValue};

/// How a single lookup ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Answers(Vec<IpAddr>),
    /// The name does not exist (NXDOMAIN).
    NxDomain,
    /// The name exists but carries no address records.
    NoAnswer,
    Timeout,
    Failed(String),
}

/// Build the run's resolver. Caching is disabled so repeated queries reach
/// the network every time.
pub(crate) fn build_resolver(settings: &ProbeSettings) -> TokioAsyncResolver {
    let (config, mut opts) = if settings.nameservers.is_empty() {
        match trust_dns_resolver::system_conf::read_system_conf() {
            Ok(system) => system,
            Err(err) => {
                warn!(%err, "Failed to read system resolver configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        }
    } else {
        let group = NameServerConfigGroup::from_ips_clear(
            &settings.nameservers,
            settings.nameserver_port,
            true,
        );
        (ResolverConfig::from_parts(None, vec![], group), ResolverOpts::default())
    };

    opts.timeout = settings.dns_timeout;
    opts.attempts = settings.dns_attempts;
    opts.cache_size = 0;
    opts.ip_strategy = match settings.ip_version {
        IpVersion::Ipv4 => LookupIpStrategy::Ipv4Only,
        IpVersion::Ipv6 => LookupIpStrategy::Ipv4AndIpv6,
    };

    TokioAsyncResolver::tokio(config, opts)
}

fn classify(err: &ResolveError) -> Lookup {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            if *response_code == ResponseCode::NXDomain {
                Lookup::NxDomain
            } else {
                Lookup::NoAnswer
            }
        }
        ResolveErrorKind::Timeout => Lookup::Timeout,
        ResolveErrorKind::Proto(proto) if matches!(proto.kind(), ProtoErrorKind::Timeout) => {
            Lookup::Timeout
        }
        _ => Lookup::Failed(err.to_string()),
    }
}

impl Prober {
    /// One lookup bounded by the DNS deadline.
    pub async fn lookup(&self, domain: &str) -> Lookup {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Lookup::Answers(vec![ip]);
        }

        // Resolver attempts multiply its own per-query timeout.
        let deadline = self.settings.dns_timeout * (self.settings.dns_attempts.max(1) as u32 + 1);
        match tokio::time::timeout(deadline, self.resolver.lookup_ip(domain)).await {
            Ok(Ok(answer)) => {
                let addresses: Vec<IpAddr> = answer.iter().collect();
                if addresses.is_empty() {
                    Lookup::NoAnswer
                } else {
                    Lookup::Answers(addresses)
                }
            }
            Ok(Err(err)) => classify(&err),
            Err(_) => Lookup::Timeout,
        }
    }

    /// Resolve `domain` into "OK" plus its address list, or "N/A".
    pub async fn dns(&self, domain: &str) -> DnsRecord {
        match self.lookup(domain).await {
            Lookup::Answers(addresses) => {
                debug!(domain, count = addresses.len(), "DNS resolved");
                DnsRecord {
                    status: ProbeValue::text(OK),
                    addresses: ProbeValue::Addresses(
                        addresses.iter().map(IpAddr::to_string).collect(),
                    ),
                }
            }
            other => {
                let err = match other {
                    Lookup::Timeout => ProbeError::Timeout(self.settings.dns_timeout),
                    Lookup::Failed(reason) => ProbeError::Resolution(reason),
                    outcome => ProbeError::Resolution(format!("{:?}", outcome)),
                };
                debug!(domain, %err, "DNS probe degraded");
                DnsRecord::unavailable()
            }
        }
    }
}
