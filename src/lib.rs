//! Vantage connectivity measurement library
//!
//! Probes targets over DNS, TCP, ICMP, HTTP and TLS from one vantage point,
//! writes the results in batches, and compares the results of two vantage
//! points to classify differences as censorship categories.

pub mod analysis;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod pacing;
pub mod pipeline;
pub mod probe;
pub mod sink;
pub mod target;

pub use error::ProbeError;
pub use model::{ProbeResult, ProbeValue, ResultSet};
pub use target::Target;
