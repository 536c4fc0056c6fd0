//! One-time capability detection for the iptables binary
//!
//! Flag support is resolved once when the facade is built and then treated as
//! plain configuration data when commands are assembled. Detection has two
//! layers:
//!
//! 1. `--version` gives the version triple and backend marker. Version
//!    thresholds from the tool's release history give a baseline.
//! 2. Help-text dry runs (`--help`, `-j MASQUERADE --help`) confirm or override
//!    that baseline, since distributions backport and strip features so support
//!    is not strictly monotonic with version.
//!
//! Only a failed version query is fatal.

use crate::core::error::{Error, Result};
use crate::core::exec::Executor;
use crate::core::stats::ListingSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::{info, warn};

static VERSION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"v(\d+)\.(\d+)\.(\d+)\S*(?:\s+\((\w+)\))?")
        .expect("version pattern is valid")
});

/// Address family selector. Picks the binary and the unrestricted network.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl Family {
    /// Binary name looked up in `PATH` when no explicit path is configured
    pub const fn binary_name(self) -> &'static str {
        match self {
            Family::Ipv4 => "iptables",
            Family::Ipv6 => "ip6tables",
        }
    }
}

/// Kernel representation the tool compiles rules to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    #[default]
    Legacy,
    NfTables,
    Other(String),
}

impl BackendMode {
    fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            None | Some("legacy") => BackendMode::Legacy,
            Some("nf_tables") => BackendMode::NfTables,
            Some(other) => BackendMode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BackendMode::Legacy => "legacy",
            BackendMode::NfTables => "nf_tables",
            BackendMode::Other(s) => s,
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-part tool version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

const CHECK_SINCE: Version = Version::new(1, 4, 11);
const WAIT_SINCE: Version = Version::new(1, 4, 20);
const WAIT_SECONDS_SINCE: Version = Version::new(1, 6, 0);
const RANDOM_FULLY_SINCE: Version = Version::new(1, 6, 2);

/// Optional flags the installed tool accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `-C` / `--check`
    pub check: bool,
    /// `--wait` (built-in xtables lock)
    pub wait: bool,
    /// `--wait <seconds>`
    pub wait_seconds: bool,
    /// `--random-fully` on NAT targets
    pub random_fully: bool,
}

impl Capabilities {
    /// Baseline derived from the version alone
    pub fn for_version(version: Version) -> Self {
        Self {
            check: version >= CHECK_SINCE,
            wait: version >= WAIT_SINCE,
            wait_seconds: version >= WAIT_SECONDS_SINCE,
            random_fully: version >= RANDOM_FULLY_SINCE,
        }
    }

    /// Overrides the baseline with markers from `--help` output.
    fn refine_with_help(&mut self, help: &str) {
        self.check = help.contains("--check");
        self.wait = help.contains("--wait");
        self.wait_seconds = self.wait && help.contains("[seconds]");
    }

    /// Overrides `random_fully` with the marker from the MASQUERADE target help.
    fn refine_with_target_help(&mut self, help: &str) {
        self.random_fully = help.contains("--random-fully");
    }
}

/// Everything learned about the tool at construction time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub version: Version,
    pub mode: BackendMode,
    pub capabilities: Capabilities,
    pub schema: ListingSchema,
}

/// Extracts the version triple and backend marker from `--version` output.
///
/// Accepts build suffixes (`v1.8.7-rc1`, `v1.4.21+git`) and a missing backend marker.
pub fn parse_version(output: &str) -> Option<(Version, BackendMode)> {
    let caps = VERSION_RE.captures(output)?;
    let num = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
    let version = Version::new(num(1)?, num(2)?, num(3)?);
    let mode = BackendMode::from_marker(caps.get(4).map(|m| m.as_str()));
    Some((version, mode))
}

/// Probes the tool behind `exec`.
///
/// # Errors
///
/// Returns `Err` if the binary cannot be run or `--version` fails or prints no version.
/// Help dry-run failures are logged and the version baseline kept.
pub fn probe(exec: &Executor, family: Family) -> Result<ProbeReport> {
    let version_output = match exec.run(&["--version"]) {
        Ok(out) => out,
        Err(e @ Error::ToolUnavailable { .. }) => return Err(e),
        Err(e) => return Err(Error::Probe(format!("version query failed: {e}"))),
    };

    let (version, mode) = parse_version(&version_output).ok_or_else(|| {
        Error::Probe(format!(
            "no version found in {:?}",
            version_output.trim_end()
        ))
    })?;

    let mut capabilities = Capabilities::for_version(version);

    match exec.run(&["--help"]) {
        Ok(help) => capabilities.refine_with_help(&help),
        Err(e) => warn!(error = %e, "Help dry run failed, using version baseline"),
    }

    match exec.run(&["-j", "MASQUERADE", "--help"]) {
        Ok(help) => capabilities.refine_with_target_help(&help),
        Err(e) => warn!(error = %e, "MASQUERADE help dry run failed, using version baseline"),
    }

    let schema = ListingSchema::for_family(family);

    info!(
        path = %exec.path().display(),
        %family,
        %version,
        %mode,
        ?capabilities,
        "Probed iptables"
    );

    Ok(ProbeReport {
        version,
        mode,
        capabilities,
        schema,
    })
}
