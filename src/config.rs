use crate::core::error::{Error, Result};
use crate::core::iptables::IpTablesOptions;
use crate::utils::get_config_dir;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name looked up in the config directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// `~/.config/iptctl/config.json`, if a home directory can be determined
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Loads facade options from `path`, or from [`default_config_path`] when `None`.
///
/// A missing file yields the defaults. Fields absent from the file keep their
/// default values.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> Result<IpTablesOptions> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return Ok(IpTablesOptions::default());
    };

    let json = match std::fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(IpTablesOptions::default());
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };

    serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}
