//! iptctl - command line front end for the iptables facade
//!
//! # Usage
//!
//! ```bash
//! iptctl probe                                   # Version, backend and flag support
//! iptctl list filter INPUT --json                # Parsed rule counters
//! iptctl append filter INPUT -- -p tcp --dport 22 -j ACCEPT
//! iptctl check filter INPUT -- -p tcp --dport 22 -j ACCEPT
//! iptctl --ipv6 --wait-timeout 5 new-chain filter MY-CHAIN
//! ```
//!
//! Options are read from `~/.config/iptctl/config.json` (or `--config`) and
//! overridden by command line flags.

use clap::{Parser, Subcommand};
use iptctl::{Family, IpTables, Outcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

#[derive(Parser)]
#[command(name = "iptctl", version)]
#[command(about = "Thread-safe iptables/ip6tables front end", long_about = None)]
struct Cli {
    /// Operate on ip6tables instead of iptables
    #[arg(short = '6', long, global = true)]
    ipv6: bool,

    /// Path or name of the iptables binary
    #[arg(long, global = true, value_name = "PATH")]
    path: Option<PathBuf>,

    /// Seconds to wait for the xtables lock (0 waits indefinitely)
    #[arg(long, global = true, value_name = "SECONDS")]
    wait_timeout: Option<u64>,

    /// Configuration file (default: ~/.config/iptctl/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected version, backend and supported flags
    Probe,
    /// List a chain's rules with counters
    List {
        table: String,
        chain: String,
        /// Print the full listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a chain's rule specifications
    Rules {
        table: String,
        chain: String,
        /// Include packet and byte counters
        #[arg(short, long)]
        counters: bool,
    },
    /// List the chains of a table
    Chains { table: String },
    /// Append a rule
    Append {
        table: String,
        chain: String,
        /// Skip the append if an identical rule exists
        #[arg(long)]
        unique: bool,
        #[arg(last = true, required = true)]
        rule: Vec<String>,
    },
    /// Insert a rule at a 1-based position
    Insert {
        table: String,
        chain: String,
        position: u32,
        /// Skip the insert if an identical rule exists
        #[arg(long)]
        unique: bool,
        #[arg(last = true, required = true)]
        rule: Vec<String>,
    },
    /// Delete a matching rule
    Delete {
        table: String,
        chain: String,
        #[arg(last = true, required = true)]
        rule: Vec<String>,
    },
    /// Exit 0 if the rule exists, 1 otherwise
    Check {
        table: String,
        chain: String,
        #[arg(last = true, required = true)]
        rule: Vec<String>,
    },
    /// Create a user-defined chain
    NewChain { table: String, chain: String },
    /// Delete an empty user-defined chain
    DeleteChain {
        table: String,
        chain: String,
        /// Flush the chain first
        #[arg(long)]
        flush: bool,
    },
    /// Create a chain, or flush it if it exists
    ClearChain { table: String, chain: String },
    /// Rename a user-defined chain
    RenameChain {
        table: String,
        old: String,
        new: String,
    },
    /// Set a built-in chain's policy
    Policy {
        table: String,
        chain: String,
        target: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn report(outcome: Outcome, what: &str) {
    match outcome {
        Outcome::Changed => println!("✓ {what}"),
        Outcome::AlreadyExists => println!("{what}: already exists"),
        Outcome::AlreadyAbsent => println!("{what}: already absent"),
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut options = iptctl::config::load_config(cli.config.as_deref())?;
    if cli.ipv6 {
        options.family = Family::Ipv6;
    }
    if let Some(path) = cli.path {
        options.path = Some(path);
    }
    if let Some(secs) = cli.wait_timeout {
        options.lock_timeout_secs = secs;
    }

    if !nix::unistd::getuid().is_root() && !matches!(cli.command, Commands::Probe) {
        tracing::warn!("Not running as root; iptables will likely refuse to run");
    }

    let ipt = IpTables::with_options(options)?;

    match cli.command {
        Commands::Probe => {
            let caps = ipt.capabilities();
            println!("Binary:        {}", ipt.path().display());
            println!("Version:       {}", ipt.version());
            println!("Backend:       {}", ipt.mode());
            println!("--check:       {}", caps.check);
            println!("--wait:        {}", caps.wait);
            println!("--wait <secs>: {}", caps.wait_seconds);
            println!("--random-fully: {}", caps.random_fully);
        }
        Commands::List { table, chain, json } => {
            let listing = ipt.stats(&table, &chain)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                if let Some(policy) = &listing.policy {
                    println!(
                        "Chain {} (policy {}: {} packets, {} bytes)",
                        listing.chain, policy.target, policy.packets, policy.bytes
                    );
                } else if let Some(refs) = listing.references {
                    println!("Chain {} ({refs} references)", listing.chain);
                }
                let bang = |inverted: bool| if inverted { "!" } else { "" };
                for stat in &listing.rules {
                    println!(
                        "{:>10} {:>12} {:<12} {:<5} {}{} -> {}{} {}",
                        stat.packets,
                        stat.bytes,
                        stat.target,
                        stat.protocol,
                        bang(stat.source_inverted),
                        stat.source,
                        bang(stat.destination_inverted),
                        stat.destination,
                        stat.options
                    );
                }
            }
        }
        Commands::Rules {
            table,
            chain,
            counters,
        } => {
            let rules = if counters {
                ipt.rules_with_counters(&table, &chain)?
            } else {
                ipt.rules(&table, &chain)?
            };
            for rule in rules {
                println!("{rule}");
            }
        }
        Commands::Chains { table } => {
            for chain in ipt.list_chains(&table)? {
                println!("{chain}");
            }
        }
        Commands::Append {
            table,
            chain,
            unique,
            rule,
        } => {
            if unique {
                report(ipt.append_unique(&table, &chain, &rule)?, "Rule appended");
            } else {
                ipt.append(&table, &chain, &rule)?;
                report(Outcome::Changed, "Rule appended");
            }
        }
        Commands::Insert {
            table,
            chain,
            position,
            unique,
            rule,
        } => {
            if unique {
                report(
                    ipt.insert_unique(&table, &chain, position, &rule)?,
                    "Rule inserted",
                );
            } else {
                ipt.insert(&table, &chain, position, &rule)?;
                report(Outcome::Changed, "Rule inserted");
            }
        }
        Commands::Delete { table, chain, rule } => {
            report(ipt.delete(&table, &chain, &rule)?, "Rule deleted");
        }
        Commands::Check { table, chain, rule } => {
            if !ipt.check(&table, &chain, &rule)? {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::NewChain { table, chain } => {
            report(ipt.new_chain(&table, &chain)?, "Chain created");
        }
        Commands::DeleteChain {
            table,
            chain,
            flush,
        } => {
            let outcome = if flush {
                ipt.clear_and_delete_chain(&table, &chain)?
            } else {
                ipt.delete_chain(&table, &chain)?
            };
            report(outcome, "Chain deleted");
        }
        Commands::ClearChain { table, chain } => {
            ipt.clear_chain(&table, &chain)?;
            report(Outcome::Changed, "Chain cleared");
        }
        Commands::RenameChain { table, old, new } => {
            ipt.rename_chain(&table, &old, &new)?;
            report(Outcome::Changed, "Chain renamed");
        }
        Commands::Policy {
            table,
            chain,
            target,
        } => {
            ipt.change_policy(&table, &chain, &target)?;
            report(Outcome::Changed, "Policy changed");
        }
    }

    Ok(ExitCode::SUCCESS)
}
