//! Plain network reachability checks for cited URLs.
//!
//! A probe is a bounded-concurrency GET with a per-request timeout. It makes
//! no AI calls; a URL is either reachable (2xx after redirects) or dead
//! (HTTP error, timeout, transport failure, or blocked as an SSRF target).
//! Reachable pages also yield their title and meta description, which the
//! verification stage hands to the relevance check as context.

mod engine;
mod ssrf;

pub use engine::{ProbeConfig, ProbeOutcome, Prober, Reachability};
pub use ssrf::is_ssrf_target;
