//! iptctl - a thread-safe iptables/ip6tables facade
//!
//! Drives the installed `iptables` or `ip6tables` binary as a subprocess and
//! exposes rule and chain operations with typed results.
//!
//! # Architecture
//!
//! - [`core`] - Probing, locking, invocation, listing parser and the facade
//! - [`config`] - Options loaded from `config.json`
//! - [`utils`] - `PATH` lookup and XDG directories
//!
//! # Behavior
//!
//! - Flag support (`-C`, `--wait`, `--wait <secs>`, `--random-fully`) is
//!   probed once at construction
//! - Mutations are serialized through the tool's own xtables lock, or an
//!   external `flock(2)` on the same file when the tool cannot lock
//! - Failures carry the full command line, the diagnostic text and exit code
//! - Idempotent writes report [`Outcome::AlreadyExists`] or
//!   [`Outcome::AlreadyAbsent`] instead of failing

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod utils;

pub use crate::core::error::{CommandError, Diagnosis, Error, Result};
pub use crate::core::iptables::{IpTables, IpTablesOptions, Outcome};
pub use crate::core::probe::{BackendMode, Capabilities, Family, Version};
pub use crate::core::stats::{ChainListing, Policy, Stat};
