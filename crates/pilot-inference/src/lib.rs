//! `pilot-inference` – the two-tier inference bridge.
//!
//! Bridges latency-variable model calls into the cooperative control loop
//! without ever stalling it.  The fast tier serves reflex decisions and
//! classification; the slow tier serves multi-step planning.
//!
//! # Modules
//!
//! - [`bridge`] – [`InferenceBridge`][bridge::InferenceBridge]: request
//!   router with monotonic ids, a pending registry, hard timeouts, soft
//!   cancellation, quota-based rate limiting, and a memory-isolated worker
//!   task reachable only via channels.
//! - [`client`] – [`InferenceClient`][client::InferenceClient]:
//!   OpenAI-compatible chat client with endpoint fallback and
//!   structured-output downgrade.
//! - [`sanitize`] – bounded-depth payload copying and prompt budgeting
//!   with explicit truncation markers.
//! - [`parse`] – defensive extraction of structured data from model
//!   output: direct parse, fenced block, bracket scan, in that order.

pub mod bridge;
pub mod client;
pub mod parse;
pub mod sanitize;

pub use bridge::{BridgeConfig, InferenceBridge, InferenceError, Tier};
pub use client::{ClientConfig, ClientError, EndpointConfig, InferenceClient, TierConfig};
pub use parse::parse_structured;
