//! Per-target probe pipeline
//!
//! DNS runs first; every other probe depends on a successful resolution.
//! Assembly runs on its own task so a fault inside any probe becomes an
//! error-tagged partial result instead of taking the batch down.

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::constants::OK;
use crate::error::ProbeError;
use crate::model::{ProbeResult, ProbeValue};
use crate::probe::{select_address, Prober};
use crate::target::Target;

/// Produces one result per target.
///
/// The only error ever returned is [`ProbeError::RateLimited`], carrying
/// the degraded result of the attempt.
#[async_trait]
pub trait TargetProber: Send + Sync {
    async fn probe(&self, target: &Target) -> Result<ProbeResult, ProbeError>;
}

pub struct Pipeline {
    prober: Arc<Prober>,
}

impl Pipeline {
    pub fn new(prober: Prober) -> Self {
        Self { prober: Arc::new(prober) }
    }

    /// Run every probe for `target` in order.
    pub async fn assemble(prober: Arc<Prober>, target: Target) -> ProbeResult {
        let started = Instant::now();
        let domain = target.domain();
        let mut result = ProbeResult::unavailable(target.as_str());

        result.dns = prober.dns(domain).await;
        if result.dns.status.is_text(OK) {
            let addr = select_address(result.dns.addresses(), prober.settings().ip_version);
            if addr.is_none() {
                debug!(site = %target, "No address of the requested family");
            }

            if let Some(addr) = addr {
                result.tcp = prober.tcp(addr).await;
                result.ping = prober.ping(addr).await;
                if !result.ping.status.is_text(OK) {
                    result.trace = prober.trace(addr).await;
                }
            }

            result.redirect = prober.redirect(target.url()).await;
            result.http = prober.http_get(target.url()).await;
            if let Some(addr) = addr {
                result.cert = prober.certificate(domain, addr, target.https_port()).await;
            }
            result.middlebox = prober.middlebox(&target, addr).await;
            result.dns_manipulation = prober.dns_manipulation(domain).await;
        }

        result.timestamp = Local::now();
        result.elapsed = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        info!(site = %target, elapsed = result.elapsed, "Target probed");
        result
    }
}

/// Map the assembly task outcome to the pipeline result.
pub(crate) fn settle(target: &Target, joined: Result<ProbeResult, JoinError>) -> Result<ProbeResult, ProbeError> {
    let result = match joined {
        Ok(result) => result,
        Err(err) => {
            warn!(site = %target, %err, "Probe assembly aborted");
            ProbeResult::partial(target.as_str(), format!("probe assembly aborted: {}", err))
        }
    };

    if result.is_rate_limited() {
        warn!(site = %target, "Rate limited (HTTP 429)");
        return Err(ProbeError::RateLimited { last: Box::new(result) });
    }
    Ok(result)
}

#[async_trait]
impl TargetProber for Pipeline {
    async fn probe(&self, target: &Target) -> Result<ProbeResult, ProbeError> {
        let joined = tokio::spawn(Self::assemble(self.prober.clone(), target.clone())).await;
        settle(target, joined)
    }
}

/// Every field other than the bookkeeping ones, for assertions.
#[cfg(test)]
pub(crate) fn probe_fields(result: &ProbeResult) -> Vec<(String, ProbeValue)> {
    use crate::model::fields;
    result
        .fields()
        .into_iter()
        .filter(|(name, _)| ![fields::TIME, fields::URL, fields::TIMESTAMP].contains(&name.as_str()))
        .collect()
}
