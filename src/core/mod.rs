//! Core iptables functionality
//!
//! - [`exec`]: Process invocation and output capture
//! - [`probe`]: Version and flag support detection
//! - [`lock`]: Serialization of mutating commands
//! - [`stats`]: Parsing of `-L -n -v -x` listings
//! - [`error`]: Error types and diagnostic classification
//! - [`iptables`]: The rule/chain operations facade

pub mod error;
pub mod exec;
pub mod iptables;
pub mod lock;
pub mod probe;
pub mod stats;

#[cfg(test)]
pub mod test_helpers;
