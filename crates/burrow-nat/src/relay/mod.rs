//! Relayed forwarding, the terminal fallback of the cascade.
//!
//! When no direct path can be established the two peers exchange traffic
//! through a mutually reachable relay peer. A session is a token-scoped
//! forwarding binding kept alive by periodic keep-alives; consecutive
//! missed acknowledgments tear it down and notify the owner so cached
//! connectivity decisions can be dropped.

pub mod client;

pub use client::{RelayEvent, RelayFallback, RelaySession};
