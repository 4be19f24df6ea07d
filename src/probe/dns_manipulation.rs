//! DNS manipulation checks
//!
//! The repeated-query check asks twice for a name that should not exist; an
//! NXDOMAIN followed by an answer means something injected the second reply.
//! The hijacking check asks for the real domain and flags an empty answer.

use rand::Rng;
use tracing::debug;

use super::dns::Lookup;
use super::Prober;
use crate::constants::{MANIPULATE, NOT_AVAILABLE, NO_MANIPULATION};
use crate::model::{DnsManipulationRecord, ProbeValue};

impl Prober {
    /// Random label under `domain` that honest resolvers answer with NXDOMAIN.
    pub fn nonexistent_name(&self, domain: &str) -> String {
        let nonce: u32 = rand::thread_rng().gen();
        format!("{}-{:08x}.{}", self.settings.nx_label, nonce, domain)
    }

    pub async fn repeated_query(&self, domain: &str) -> ProbeValue {
        let name = self.nonexistent_name(domain);
        let verdict = match self.lookup(&name).await {
            Lookup::Timeout => NOT_AVAILABLE,
            Lookup::NxDomain => match self.lookup(&name).await {
                Lookup::Answers(_) => MANIPULATE,
                Lookup::Timeout => NOT_AVAILABLE,
                _ => NO_MANIPULATION,
            },
            _ => NO_MANIPULATION,
        };
        debug!(domain, %name, verdict, "Repeated query check");
        ProbeValue::text(verdict)
    }

    pub async fn hijacking(&self, domain: &str) -> ProbeValue {
        let verdict = match self.lookup(domain).await {
            Lookup::NoAnswer => MANIPULATE,
            Lookup::Timeout => NOT_AVAILABLE,
            _ => NO_MANIPULATION,
        };
        debug!(domain, verdict, "Hijacking check");
        ProbeValue::text(verdict)
    }

    pub async fn dns_manipulation(&self, domain: &str) -> DnsManipulationRecord {
        DnsManipulationRecord {
            repeated_query: self.repeated_query(domain).await,
            hijacking: self.hijacking(domain).await,
        }
    }
}
