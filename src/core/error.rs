use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core error types for iptctl
#[derive(Debug, Error)]
pub enum Error {
    /// The tool binary is missing or cannot be spawned. Fatal to the facade.
    #[error("{} is not available: {source}", path.display())]
    ToolUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Capability probing failed at construction time
    #[error("Capability probe failed: {0}")]
    Probe(String),

    /// The tool ran and exited with a non-zero status
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A listing line did not match the expected column layout
    #[error("Malformed listing output at line {line}: {reason} ({content:?})")]
    Parse {
        line: usize,
        content: String,
        reason: String,
    },

    /// The external lock file could not be acquired before the deadline
    #[error("Timed out after {0:?} waiting for the xtables lock")]
    LockTimeout(Duration),

    /// The external lock file could not be opened or locked
    #[error("Failed to lock {}: {message}", path.display())]
    Lock { path: PathBuf, message: String },

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classification of the captured diagnostic text, if this is a command failure.
    pub fn diagnosis(&self) -> Option<Diagnosis> {
        match self {
            Error::Command(e) => Some(e.diagnosis()),
            _ => None,
        }
    }

    /// Returns true if the failure means the chain, rule or table does not exist.
    pub fn is_not_exist(&self) -> bool {
        self.diagnosis() == Some(Diagnosis::NotExist)
    }
}

/// A failed invocation of the tool: the full command line, what it printed and how it exited.
#[derive(Debug, Clone, Error)]
#[error("running {command:?}: exit status {}: {}", self.status(), self.output.trim_end())]
pub struct CommandError {
    command: Vec<String>,
    output: String,
    exit_code: Option<i32>,
}

impl CommandError {
    pub fn new(command: Vec<String>, output: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            command,
            output: output.into(),
            exit_code,
        }
    }

    /// Program followed by its arguments, exactly as spawned
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Captured diagnostic text (stderr, then stdout)
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Exit status, or `None` if the process was killed by a signal
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn status(&self) -> String {
        self.exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string())
    }

    /// Classifies the diagnostic text against [`DIAGNOSTIC_PATTERNS`].
    pub fn diagnosis(&self) -> Diagnosis {
        Diagnosis::classify(&self.output)
    }

    /// Returns true if the failure is due to the chain or rule not existing.
    pub fn is_not_exist(&self) -> bool {
        self.diagnosis() == Diagnosis::NotExist
    }
}

/// What a failed invocation's diagnostic text says about the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Diagnosis {
    /// Chain, rule, target or table does not exist
    NotExist,
    /// Chain already exists
    AlreadyExists,
    /// Not root / missing `CAP_NET_ADMIN`
    PermissionDenied,
    /// Another process holds the xtables lock
    LockBusy,
    /// Anything else: syntax errors, unknown matches, kernel errors
    Other,
}

/// Ordered phrase table used to classify diagnostics. First match wins.
///
/// Matching is by case-sensitive substring. The wording differs by table/chain/rule
/// context and across tool versions, so keep this in sync with the tool's messages.
pub const DIAGNOSTIC_PATTERNS: &[(&str, Diagnosis)] = &[
    (
        "Bad rule (does a matching rule exist in that chain?).\n",
        Diagnosis::NotExist,
    ),
    ("No chain/target/match by that name.\n", Diagnosis::NotExist),
    ("No such file or directory", Diagnosis::NotExist),
    ("does not exist", Diagnosis::NotExist),
    ("Chain already exists", Diagnosis::AlreadyExists),
    ("File exists", Diagnosis::AlreadyExists),
    ("Permission denied", Diagnosis::PermissionDenied),
    ("Operation not permitted", Diagnosis::PermissionDenied),
    (
        "Another app is currently holding the xtables lock",
        Diagnosis::LockBusy,
    ),
    ("Resource temporarily unavailable", Diagnosis::LockBusy),
];

impl Diagnosis {
    /// Matches diagnostic text against [`DIAGNOSTIC_PATTERNS`].
    pub fn classify(text: &str) -> Self {
        DIAGNOSTIC_PATTERNS
            .iter()
            .find(|(pattern, _)| text.contains(pattern))
            .map_or(Diagnosis::Other, |&(_, diagnosis)| diagnosis)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
