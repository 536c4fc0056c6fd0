//! Shared test utilities for core module tests
//!
//! Each [`MockTool`] owns a temporary directory holding a symlink to
//! `tests/mock_iptables.sh`, the mock's `mock.conf`, its rule state and the
//! lock file. The mock reads everything relative to the symlink, so tests run
//! in parallel without touching process-wide environment variables.

use crate::core::iptables::{IpTables, IpTablesOptions};
use crate::core::probe::Family;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tempfile::TempDir;

/// One-time initialization flag for making the mock script executable
static MOCK_SCRIPT_INIT: Once = Once::new();

/// Mock configuration of a tool old enough to lack `-C` and `--wait`
pub const OLD_TOOL_CONF: &str = "VERSION=\"v1.4.7\"\nNO_CHECK=1\nNO_WAIT=1\nRANDOM_FULLY=0\n";

/// Mock configuration of a current tool
pub const MODERN_TOOL_CONF: &str = "VERSION=\"v1.8.7 (legacy)\"\n";

fn mock_script() -> PathBuf {
    let path = PathBuf::from(format!(
        "{}/tests/mock_iptables.sh",
        env!("CARGO_MANIFEST_DIR")
    ));
    MOCK_SCRIPT_INIT.call_once(|| {
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
    });
    path
}

/// A private mock `iptables`/`ip6tables` installation
pub struct MockTool {
    dir: TempDir,
    family: Family,
}

impl MockTool {
    /// Current IPv4 tool with every capability
    pub fn modern() -> Self {
        Self::with_conf(Family::Ipv4, MODERN_TOOL_CONF)
    }

    /// Tool without `-C`, `--wait` or `--random-fully`
    pub fn old() -> Self {
        Self::with_conf(Family::Ipv4, OLD_TOOL_CONF)
    }

    pub fn with_conf(family: Family, conf: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create mock dir");
        std::os::unix::fs::symlink(mock_script(), dir.path().join(family.binary_name()))
            .expect("Failed to link mock script");
        std::fs::write(dir.path().join("mock.conf"), conf).expect("Failed to write mock.conf");
        Self { dir, family }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn binary(&self) -> PathBuf {
        self.dir.path().join(self.family.binary_name())
    }

    /// Options pointing at this mock, with the external lock file kept private
    pub fn options(&self) -> IpTablesOptions {
        IpTablesOptions::default()
            .with_family(self.family)
            .with_path(self.binary())
            .with_lock_path(self.dir.path().join("xtables.lock"))
    }

    pub fn iptables(&self) -> IpTables {
        IpTables::with_options(self.options()).expect("Failed to probe mock iptables")
    }

    /// Argument lists of every invocation so far, one string per call
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    /// Holds the mock's built-in xtables lock until the returned guard is dropped
    pub fn hold_builtin_lock(&self) -> BuiltinLockGuard {
        let path = self.dir.path().join("xtables.lock.d");
        std::fs::create_dir(&path).expect("Failed to take mock lock");
        BuiltinLockGuard { path }
    }
}

pub struct BuiltinLockGuard {
    path: PathBuf,
}

impl Drop for BuiltinLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.path);
    }
}
