//! Rule and chain operations on top of the probed tool
//!
//! [`IpTables`] is built once, probes the binary, and is immutable afterwards.
//! It is `Send + Sync`; share it across threads behind an `Arc`.
//!
//! Every mutating operation runs under the lock strategy picked at probe time
//! (see [`crate::core::lock`]). Listings and checks never take the external
//! lock and reflect a best-effort snapshot. Tools that lock by themselves still
//! get `--wait` on reads, since they take the xtables lock for `-L`/`-S`/`-C`
//! as well and would otherwise fail while another process writes.
//!
//! Rule bodies are opaque: they are passed to the tool verbatim and never
//! validated here.
//!
//! # Example
//!
//! ```no_run
//! use iptctl::{IpTables, IpTablesOptions, Outcome};
//!
//! # fn example() -> iptctl::Result<()> {
//! let ipt = IpTables::with_options(IpTablesOptions::default().with_lock_timeout(5))?;
//!
//! // Canonical form, as `-S` prints it back
//! let rule = ["-p", "tcp", "-m", "tcp", "--dport", "22", "-j", "ACCEPT"];
//! ipt.append("filter", "INPUT", &rule)?;
//! assert!(ipt.check("filter", "INPUT", &rule)?);
//!
//! if ipt.delete("filter", "INPUT", &rule)? == Outcome::AlreadyAbsent {
//!     println!("someone else removed it first");
//! }
//! # Ok(())
//! # }
//! ```

use crate::core::error::{Diagnosis, Error, Result};
use crate::core::exec::Executor;
use crate::core::lock::{DEFAULT_LOCK_PATH, LockStrategy};
use crate::core::probe::{self, BackendMode, Capabilities, Family, Version};
use crate::core::stats::{self, ChainListing, ListingSchema, Stat};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Construction options
///
/// Defaults: IPv4, binary resolved through `PATH`, wait indefinitely for the
/// lock, lock file at `/run/xtables.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpTablesOptions {
    pub family: Family,
    /// Binary to run. A bare name is looked up in `PATH`; `None` looks up
    /// `iptables` or `ip6tables` for the family.
    pub path: Option<PathBuf>,
    /// Seconds to wait for the xtables lock; 0 waits indefinitely
    pub lock_timeout_secs: u64,
    /// Lock file used when the tool cannot lock by itself
    pub lock_path: PathBuf,
}

impl Default for IpTablesOptions {
    fn default() -> Self {
        Self {
            family: Family::Ipv4,
            path: None,
            lock_timeout_secs: 0,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
        }
    }
}

impl IpTablesOptions {
    pub fn with_family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_lock_timeout(mut self, secs: u64) -> Self {
        self.lock_timeout_secs = secs;
        self
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }
}

/// Result of an idempotent write
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    /// The kernel state was changed
    Changed,
    /// Nothing to create: the chain or rule was already there
    AlreadyExists,
    /// Nothing to remove: the chain or rule was already gone
    AlreadyAbsent,
}

/// Facade over one `iptables` or `ip6tables` binary
#[derive(Debug, Clone)]
pub struct IpTables {
    exec: Executor,
    family: Family,
    version: Version,
    mode: BackendMode,
    capabilities: Capabilities,
    schema: ListingSchema,
    lock: LockStrategy,
    lock_timeout_secs: u64,
}

impl IpTables {
    /// Probes the default IPv4 binary.
    ///
    /// # Errors
    ///
    /// See [`IpTables::with_options`].
    pub fn new() -> Result<Self> {
        Self::with_options(IpTablesOptions::default())
    }

    /// Resolves the binary, probes its capabilities and picks a lock strategy.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolUnavailable`] if the binary cannot be found or run
    /// - [`Error::Probe`] if the version query fails
    pub fn with_options(options: IpTablesOptions) -> Result<Self> {
        let path = match options.path {
            Some(path) if utils::is_explicit_path(&path) => path,
            bare => {
                let name = bare
                    .as_deref()
                    .and_then(Path::to_str)
                    .unwrap_or(options.family.binary_name());
                utils::find_binary(name).ok_or_else(|| Error::ToolUnavailable {
                    path: PathBuf::from(name),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "not found in PATH",
                    ),
                })?
            }
        };

        let exec = Executor::new(path);
        let report = probe::probe(&exec, options.family)?;
        let lock = LockStrategy::select(
            &report.capabilities,
            options.lock_timeout_secs,
            &options.lock_path,
        );
        debug!(?lock, "Selected lock strategy");

        Ok(Self {
            exec,
            family: options.family,
            version: report.version,
            mode: report.mode,
            capabilities: report.capabilities,
            schema: report.schema,
            lock,
            lock_timeout_secs: options.lock_timeout_secs,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn path(&self) -> &Path {
        self.exec.path()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn mode(&self) -> &BackendMode {
        &self.mode
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether NAT rules may use `--random-fully`
    pub fn has_random_fully(&self) -> bool {
        self.capabilities.random_fully
    }

    /// Configured lock wait in seconds; 0 waits indefinitely
    pub fn lock_timeout(&self) -> u64 {
        self.lock_timeout_secs
    }

    pub fn lock_strategy(&self) -> &LockStrategy {
        &self.lock
    }

    /// Appends `rule` to the end of `chain`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tool rejects the rule or the lock cannot be taken.
    pub fn append<R: AsRef<str>>(&self, table: &str, chain: &str, rule: &[R]) -> Result<()> {
        self.mutate(command(table, "-A", chain, &[], rule))?;
        Ok(())
    }

    /// Appends `rule` unless an identical rule is already in `chain`.
    ///
    /// The check and the append are two invocations; a concurrent writer can
    /// still slip a duplicate in between.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the check or the append fails.
    pub fn append_unique<R: AsRef<str>>(
        &self,
        table: &str,
        chain: &str,
        rule: &[R],
    ) -> Result<Outcome> {
        if self.check(table, chain, rule)? {
            return Ok(Outcome::AlreadyExists);
        }
        self.append(table, chain, rule)?;
        Ok(Outcome::Changed)
    }

    /// Inserts `rule` at 1-based `position` in `chain`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tool rejects the rule or position.
    pub fn insert<R: AsRef<str>>(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[R],
    ) -> Result<()> {
        self.mutate(command(table, "-I", chain, &[position.to_string()], rule))?;
        Ok(())
    }

    /// Inserts `rule` at `position` unless an identical rule is already in `chain`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the check or the insert fails.
    pub fn insert_unique<R: AsRef<str>>(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[R],
    ) -> Result<Outcome> {
        if self.check(table, chain, rule)? {
            return Ok(Outcome::AlreadyExists);
        }
        self.insert(table, chain, position, rule)?;
        Ok(Outcome::Changed)
    }

    /// Replaces the rule at 1-based `position` with `rule`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the position does not exist or the rule is rejected.
    pub fn replace<R: AsRef<str>>(
        &self,
        table: &str,
        chain: &str,
        position: u32,
        rule: &[R],
    ) -> Result<()> {
        self.mutate(command(table, "-R", chain, &[position.to_string()], rule))?;
        Ok(())
    }

    /// Deletes the first rule in `chain` matching `rule`.
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than a missing rule or chain, which
    /// yield [`Outcome::AlreadyAbsent`].
    pub fn delete<R: AsRef<str>>(&self, table: &str, chain: &str, rule: &[R]) -> Result<Outcome> {
        absent_ok(self.mutate(command(table, "-D", chain, &[], rule)))
    }

    /// Deletes the rule at 1-based `position`.
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than a missing rule or chain.
    pub fn delete_at(&self, table: &str, chain: &str, position: u32) -> Result<Outcome> {
        absent_ok(self.mutate(command::<&str>(
            table,
            "-D",
            chain,
            &[position.to_string()],
            &[],
        )))
    }

    /// Returns whether `chain` contains a rule matching `rule`.
    ///
    /// Uses `-C` when the tool has it. Otherwise compares the `-S` dump of the
    /// chain line by line against `-A <chain> <rule>`.
    ///
    /// The fallback only matches rules written in the tool's canonical form,
    /// exactly as `-S` prints them: `-s 10.0.0.1/32` rather than `-s 10.0.0.1`,
    /// and `-p tcp -m tcp --dport 22` rather than `-p tcp --dport 22`. Rules
    /// in any other spelling are reported absent on tools without `-C`.
    ///
    /// A missing chain is reported as `false` on both paths.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tool fails for any other reason.
    pub fn check<R: AsRef<str>>(&self, table: &str, chain: &str, rule: &[R]) -> Result<bool> {
        if !self.capabilities.check {
            return self.check_by_listing(table, chain, rule);
        }

        match self.query(command(table, "-C", chain, &[], rule)) {
            Ok(_) => Ok(true),
            Err(Error::Command(e)) if e.exit_code() == Some(1) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn check_by_listing<R: AsRef<str>>(&self, table: &str, chain: &str, rule: &[R]) -> Result<bool> {
        debug!(table, chain, "No -C support, checking rule through -S listing");
        let wanted = std::iter::once("-A")
            .chain(std::iter::once(chain))
            .chain(rule.iter().map(AsRef::as_ref))
            .collect::<Vec<_>>()
            .join(" ");

        match self.rules(table, chain) {
            Ok(lines) => Ok(lines.iter().any(|line| *line == wanted)),
            Err(e) if e.is_not_exist() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists `chain` as structured rule statistics.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the listing fails or any line is malformed.
    pub fn list(&self, table: &str, chain: &str) -> Result<Vec<Stat>> {
        Ok(self.stats(table, chain)?.rules)
    }

    /// Lists `chain` with its header: policy counters or reference count.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the listing fails or any line is malformed.
    pub fn stats(&self, table: &str, chain: &str) -> Result<ChainListing> {
        let out = self.query(owned(&["-t", table, "-L", chain, "-n", "-v", "-x"]))?;
        stats::parse_listing(&out, self.family, self.schema)
    }

    /// Rule specifications of `chain` as printed by `-S`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain does not exist or the tool fails.
    pub fn rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let out = self.query(owned(&["-t", table, "-S", chain]))?;
        Ok(spec_lines(&out))
    }

    /// Like [`IpTables::rules`], with `-c <packets> <bytes>` counters on each rule.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain does not exist or the tool fails.
    pub fn rules_with_counters(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let out = self.query(owned(&["-t", table, "-v", "-S", chain]))?;
        Ok(spec_lines(&out))
    }

    /// Names of built-in and user-defined chains in `table`, in listing order.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the table cannot be listed.
    pub fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let out = self.query(owned(&["-t", table, "-S"]))?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("-P" | "-N"), Some(chain)) => Some(chain.to_string()),
                    _ => None,
                }
            })
            .collect())
    }

    /// # Errors
    ///
    /// Returns `Err` if the table cannot be listed.
    pub fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        Ok(self.list_chains(table)?.iter().any(|c| c == chain))
    }

    /// Creates a user-defined chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than the chain already existing,
    /// which yields [`Outcome::AlreadyExists`].
    pub fn new_chain(&self, table: &str, chain: &str) -> Result<Outcome> {
        match self.mutate(vec!["-t".into(), table.into(), "-N".into(), chain.into()]) {
            Ok(_) => Ok(Outcome::Changed),
            Err(e) if e.diagnosis() == Some(Diagnosis::AlreadyExists) => Ok(Outcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    /// Removes every rule from `chain`.
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than a missing chain.
    pub fn flush_chain(&self, table: &str, chain: &str) -> Result<Outcome> {
        absent_ok(self.mutate(vec![
            "-t".into(),
            table.into(),
            "-F".into(),
            chain.into(),
        ]))
    }

    /// Leaves `chain` existing and empty: creates it, or flushes it if present.
    ///
    /// A chain deleted by someone else between the two steps is created again.
    ///
    /// # Errors
    ///
    /// Returns `Err` if creating or flushing fails.
    pub fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        if self.new_chain(table, chain)? == Outcome::Changed {
            return Ok(());
        }
        if self.flush_chain(table, chain)? == Outcome::AlreadyAbsent {
            debug!(table, chain, "Chain vanished before flush, creating it again");
            let _ = self.new_chain(table, chain)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Err` if `old` does not exist or `new` is taken.
    pub fn rename_chain(&self, table: &str, old: &str, new: &str) -> Result<()> {
        self.mutate(vec![
            "-t".into(),
            table.into(),
            "-E".into(),
            old.into(),
            new.into(),
        ])?;
        Ok(())
    }

    /// Deletes an empty, unreferenced user-defined chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than a missing chain (non-empty or
    /// still referenced chains are errors).
    pub fn delete_chain(&self, table: &str, chain: &str) -> Result<Outcome> {
        absent_ok(self.mutate(vec![
            "-t".into(),
            table.into(),
            "-X".into(),
            chain.into(),
        ]))
    }

    /// Flushes and deletes `chain`; [`Outcome::AlreadyAbsent`] if it was missing.
    ///
    /// # Errors
    ///
    /// Returns `Err` if flushing or deleting fails for another reason.
    pub fn clear_and_delete_chain(&self, table: &str, chain: &str) -> Result<Outcome> {
        if self.flush_chain(table, chain)? == Outcome::AlreadyAbsent {
            return Ok(Outcome::AlreadyAbsent);
        }
        self.delete_chain(table, chain)
    }

    /// Sets the policy of a built-in chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain is not built-in or the target is invalid.
    pub fn change_policy(&self, table: &str, chain: &str, target: &str) -> Result<()> {
        self.mutate(vec![
            "-t".into(),
            table.into(),
            "-P".into(),
            chain.into(),
            target.into(),
        ])?;
        Ok(())
    }

    /// Flushes every chain in `table`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tool fails.
    pub fn flush_table(&self, table: &str) -> Result<()> {
        self.mutate(vec!["-t".into(), table.into(), "-F".into()])?;
        Ok(())
    }

    /// Deletes every user-defined chain in `table`. They must be empty.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the tool fails.
    pub fn delete_user_chains(&self, table: &str) -> Result<()> {
        self.mutate(vec!["-t".into(), table.into(), "-X".into()])?;
        Ok(())
    }

    /// Runs a mutating command under the lock strategy.
    fn mutate(&self, args: Vec<String>) -> Result<String> {
        let _guard = self.lock.acquire()?;
        self.query(args)
    }

    /// Runs a command with the tool's wait flags but without the external lock.
    fn query(&self, args: Vec<String>) -> Result<String> {
        let mut full = self.lock.wait_args();
        full.extend(args);
        self.exec.run(&full)
    }
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

/// `-t <table> <op> <chain> [extra...] [rule...]`
fn command<R: AsRef<str>>(
    table: &str,
    op: &str,
    chain: &str,
    extra: &[String],
    rule: &[R],
) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        table.to_string(),
        op.to_string(),
        chain.to_string(),
    ];
    args.extend(extra.iter().cloned());
    args.extend(rule.iter().map(|r| r.as_ref().to_string()));
    args
}

fn absent_ok(result: Result<String>) -> Result<Outcome> {
    match result {
        Ok(_) => Ok(Outcome::Changed),
        Err(e) if e.is_not_exist() => Ok(Outcome::AlreadyAbsent),
        Err(e) => Err(e),
    }
}

fn spec_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
