//! Parser for `iptables -L <chain> -n -v -x` listings
//!
//! The verbose listing is a whitespace-aligned table:
//!
//! ```text
//! Chain INPUT (policy ACCEPT 2394 packets, 1.2M bytes)
//!     pkts      bytes target     prot opt in     out     source               destination
//!       12      720 ACCEPT     tcp  --  eth0   *       10.0.0.0/8           0.0.0.0/0            tcp dpt:22
//! ```
//!
//! All assumptions about that layout live here, behind [`ListingSchema`]. The
//! schema variant is picked once at probe time from the address family.
//!
//! # Counters
//!
//! Counters are exact with `-x`, but without it the tool abbreviates with
//! decimal magnitude suffixes (`K`, `M`, `G`, `T`, `P`, `E`). Fractional values
//! are truncated to the exact reported digits: `1.5K` is 1500 and `1.2345K` is
//! 1234. Nothing is rounded up.
//!
//! # Errors
//!
//! A line that does not fit the schema is reported with its 1-based position
//! and content. Lines are never skipped or zero-filled.

use crate::core::error::{Error, Result};
use crate::core::probe::Family;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// pkts, bytes, target, prot, opt, in, out, source, destination
pub const FIXED_COLUMNS: usize = 9;

/// Largest number of fractional digits accepted on a suffixed counter
const MAX_FRACTION_DIGITS: usize = 18;

/// Column layout variant of the verbose listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingSchema {
    /// iptables: every data line carries all nine fixed columns
    Standard,
    /// ip6tables: the `opt` column may be printed as blanks and vanish on split
    Ipv6OptionalOpt,
}

impl ListingSchema {
    pub const fn for_family(family: Family) -> Self {
        match family {
            Family::Ipv4 => ListingSchema::Standard,
            Family::Ipv6 => ListingSchema::Ipv6OptionalOpt,
        }
    }

    /// Restores empty columns the whitespace split swallowed.
    fn normalize<'a>(self, mut fields: Vec<&'a str>) -> Vec<&'a str> {
        match self {
            // An empty target shifts prot into the target slot and opt into prot
            ListingSchema::Standard => {
                if fields.len() > 3 && is_opt_value(fields[3]) {
                    fields.insert(2, "");
                }
            }
            // in, out, source and destination are always printed, so the
            // position of the address pair tells how many columns vanished
            ListingSchema::Ipv6OptionalOpt => match source_column(&fields) {
                Some(5) => {
                    fields.insert(2, "");
                    fields.insert(4, "");
                }
                Some(6) if is_opt_value(fields[3]) => fields.insert(2, ""),
                Some(6) => fields.insert(4, ""),
                _ => {}
            },
        }

        fields
    }
}

/// Index of the source column: the first of two adjacent network tokens
fn source_column(fields: &[&str]) -> Option<usize> {
    let is_network = |token: &str| parse_address(token.strip_prefix('!').unwrap_or(token)).is_some();
    (5..FIXED_COLUMNS - 1)
        .take_while(|&i| i + 1 < fields.len())
        .find(|&i| is_network(fields[i]) && is_network(fields[i + 1]))
}

fn is_opt_value(token: &str) -> bool {
    matches!(token, "--" | "-f" | "!f")
}

/// One rule's counters and match summary as printed by the verbose listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    #[serde(rename = "pkts")]
    pub packets: u64,
    pub bytes: u64,
    pub target: String,
    #[serde(rename = "prot")]
    pub protocol: String,
    pub opt: String,
    #[serde(rename = "in")]
    pub input: String,
    #[serde(rename = "out")]
    pub output: String,
    pub source: IpNetwork,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub source_inverted: bool,
    pub destination: IpNetwork,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub destination_inverted: bool,
    pub options: String,
}

/// Policy counters printed in a built-in chain's header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub target: String,
    pub packets: u64,
    pub bytes: u64,
}

/// A fully parsed single-chain listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainListing {
    pub chain: String,
    /// Set for built-in chains
    pub policy: Option<Policy>,
    /// Set for user-defined chains
    pub references: Option<u64>,
    pub rules: Vec<Stat>,
}

/// Parses the rule lines of a verbose listing, skipping headers.
///
/// # Errors
///
/// Returns [`Error::Parse`] for the first line that does not fit `schema`.
pub fn parse_stats(output: &str, family: Family, schema: ListingSchema) -> Result<Vec<Stat>> {
    Ok(parse_listing(output, family, schema)?.rules)
}

/// Parses a verbose listing including the chain header.
///
/// # Errors
///
/// Returns [`Error::Parse`] for the first line that does not fit `schema`,
/// including a malformed `Chain` header.
pub fn parse_listing(output: &str, family: Family, schema: ListingSchema) -> Result<ChainListing> {
    let mut listing = ChainListing::default();

    for (idx, line) in output.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(header) = trimmed.strip_prefix("Chain ") {
            parse_chain_header(header, &mut listing).map_err(|reason| Error::Parse {
                line: line_no,
                content: line.to_string(),
                reason,
            })?;
            continue;
        }

        if trimmed.split_whitespace().next() == Some("pkts") {
            continue;
        }

        let stat = parse_stat_line(trimmed, family, schema).map_err(|reason| Error::Parse {
            line: line_no,
            content: line.to_string(),
            reason,
        })?;
        listing.rules.push(stat);
    }

    Ok(listing)
}

/// Parses one data line of the verbose listing.
///
/// # Errors
///
/// Returns a description of the problem if the line has too few columns or an
/// unparsable counter or network.
pub fn parse_stat_line(
    line: &str,
    family: Family,
    schema: ListingSchema,
) -> std::result::Result<Stat, String> {
    let fields = schema.normalize(line.split_whitespace().collect());

    if fields.len() < FIXED_COLUMNS {
        return Err(format!(
            "expected at least {FIXED_COLUMNS} columns, found {}",
            fields.len()
        ));
    }

    let packets = parse_counter(fields[0]).map_err(|e| format!("packet counter: {e}"))?;
    let bytes = parse_counter(fields[1]).map_err(|e| format!("byte counter: {e}"))?;
    let (source, source_inverted) =
        parse_network(fields[7], family).map_err(|e| format!("source: {e}"))?;
    let (destination, destination_inverted) =
        parse_network(fields[8], family).map_err(|e| format!("destination: {e}"))?;

    Ok(Stat {
        packets,
        bytes,
        target: fields[2].to_string(),
        protocol: fields[3].to_string(),
        opt: fields[4].to_string(),
        input: fields[5].to_string(),
        output: fields[6].to_string(),
        source,
        source_inverted,
        destination,
        destination_inverted,
        options: fields[FIXED_COLUMNS..].join(" "),
    })
}

/// `INPUT (policy ACCEPT 0 packets, 0 bytes)` or `DOCKER (2 references)`
fn parse_chain_header(header: &str, listing: &mut ChainListing) -> std::result::Result<(), String> {
    let (name, rest) = header
        .split_once(' ')
        .map_or((header, ""), |(n, r)| (n, r.trim()));
    listing.chain = name.to_string();

    let Some(inner) = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) else {
        return if rest.is_empty() {
            Ok(())
        } else {
            Err(format!("unexpected chain header suffix {rest:?}"))
        };
    };

    let words: Vec<&str> = inner.split_whitespace().collect();
    match words.as_slice() {
        ["policy", target, packets, "packets,", bytes, "bytes"] => {
            listing.policy = Some(Policy {
                target: (*target).to_string(),
                packets: parse_counter(packets).map_err(|e| format!("policy packets: {e}"))?,
                bytes: parse_counter(bytes).map_err(|e| format!("policy bytes: {e}"))?,
            });
            Ok(())
        }
        [count, "references" | "reference"] => {
            listing.references = Some(
                count
                    .parse()
                    .map_err(|_| format!("invalid reference count {count:?}"))?,
            );
            Ok(())
        }
        _ => Err(format!("unrecognized chain header ({inner})")),
    }
}

/// Parses a counter that may carry a decimal magnitude suffix.
///
/// Fractional digits are truncated after scaling, never rounded.
///
/// # Errors
///
/// Returns `Err` for empty input, non-digits, an unknown suffix, a fraction
/// without a suffix, or a value that does not fit in `u64`.
///
/// # Examples
///
/// ```
/// use iptctl::core::stats::parse_counter;
///
/// assert_eq!(parse_counter("0"), Ok(0));
/// assert_eq!(parse_counter("1.5K"), Ok(1500));
/// assert_eq!(parse_counter("2M"), Ok(2_000_000));
/// ```
pub fn parse_counter(token: &str) -> std::result::Result<u64, String> {
    let (number, multiplier) = match token.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier: u128 = match c {
                'K' => 1_000,
                'M' => 1_000_000,
                'G' => 1_000_000_000,
                'T' => 1_000_000_000_000,
                'P' => 1_000_000_000_000_000,
                'E' => 1_000_000_000_000_000_000,
                other => return Err(format!("unknown magnitude suffix {other:?} in {token:?}")),
            };
            (&token[..idx], Some(multiplier))
        }
        Some(_) => (token, None),
        None => return Err("empty counter".to_string()),
    };

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (number, None),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid counter {token:?}"));
    }

    let overflow = || format!("counter {token:?} does not fit in 64 bits");
    let whole: u128 = whole.parse().map_err(|_| overflow())?;

    let value = match (fraction, multiplier) {
        (None, None) => whole,
        (None, Some(m)) => whole.checked_mul(m).ok_or_else(overflow)?,
        (Some(_), None) => return Err(format!("fractional counter {token:?} without suffix")),
        (Some(f), Some(m)) => {
            if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("invalid counter {token:?}"));
            }
            if f.len() > MAX_FRACTION_DIGITS {
                return Err(format!("too many fractional digits in {token:?}"));
            }
            let digits: u128 = f.parse().map_err(|_| overflow())?;
            let scale = 10u128.pow(u32::try_from(f.len()).map_err(|_| overflow())?);
            let frac = digits * m / scale;
            whole
                .checked_mul(m)
                .and_then(|w| w.checked_add(frac))
                .ok_or_else(overflow)?
        }
    };

    u64::try_from(value).map_err(|_| overflow())
}

/// Parses a source/destination column into a network and its `!` inversion flag.
///
/// `anywhere` and a bare address (full-length prefix) are accepted besides CIDR.
///
/// # Errors
///
/// Returns `Err` if the token is not a valid address or network.
pub fn parse_network(token: &str, family: Family) -> std::result::Result<(IpNetwork, bool), String> {
    let (inverted, literal) = match token.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, token),
    };

    if literal == "anywhere" {
        return Ok((unrestricted(family), inverted));
    }

    parse_address(literal)
        .map(|net| (net, inverted))
        .ok_or_else(|| format!("invalid network {token:?}"))
}

fn parse_address(literal: &str) -> Option<IpNetwork> {
    if literal.contains('/') {
        literal.parse::<IpNetwork>().ok()
    } else {
        literal.parse::<IpAddr>().ok().map(IpNetwork::from)
    }
}

/// `0.0.0.0/0` or `::/0`
pub fn unrestricted(family: Family) -> IpNetwork {
    let addr = match family {
        Family::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    // A zero-length prefix is valid for either family
    IpNetwork::new(addr, 0).unwrap_or_else(|_| IpNetwork::from(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT_LISTING: &str = "\
Chain INPUT (policy ACCEPT 2394 packets, 1.2M bytes)
    pkts      bytes target     prot opt in     out     source               destination
      12      720 ACCEPT     tcp  --  eth0   *       10.0.0.0/8           0.0.0.0/0            tcp dpt:22
    1.5K     3.25M DROP       all  --  *      *       !192.168.1.5         0.0.0.0/0
";

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_counter_plain_and_suffixed() {
        assert_eq!(parse_counter("0"), Ok(0));
        assert_eq!(parse_counter("42"), Ok(42));
        assert_eq!(parse_counter("1.5K"), Ok(1_500));
        assert_eq!(parse_counter("3.25M"), Ok(3_250_000));
        assert_eq!(parse_counter("7G"), Ok(7_000_000_000));
        assert_eq!(parse_counter("2T"), Ok(2_000_000_000_000));
        assert_eq!(parse_counter("1P"), Ok(1_000_000_000_000_000));
        assert_eq!(parse_counter("18E"), Ok(18_000_000_000_000_000_000));
        assert_eq!(parse_counter("18446744073709551615"), Ok(u64::MAX));
    }

    #[test]
    fn test_parse_counter_truncates_fraction() {
        assert_eq!(parse_counter("1.2345K"), Ok(1_234));
        assert_eq!(parse_counter("0.9999K"), Ok(999));
        assert_eq!(parse_counter("1.0000001M"), Ok(1_000_000));
    }

    #[test]
    fn test_parse_counter_rejects_malformed() {
        assert!(parse_counter("").is_err());
        assert!(parse_counter("K").is_err());
        assert!(parse_counter("1.5").is_err());
        assert!(parse_counter("1.K").is_err());
        assert!(parse_counter("1X").is_err());
        assert!(parse_counter("1k").is_err());
        assert!(parse_counter("-1").is_err());
        assert!(parse_counter("12a4").is_err());
        assert!(parse_counter("19E").is_err());
        assert!(parse_counter("18446744073709551616").is_err());
    }

    #[test]
    fn test_parse_network_forms() {
        assert_eq!(
            parse_network("0.0.0.0/0", Family::Ipv4),
            Ok((net("0.0.0.0/0"), false))
        );
        assert_eq!(
            parse_network("anywhere", Family::Ipv4),
            Ok((net("0.0.0.0/0"), false))
        );
        assert_eq!(
            parse_network("anywhere", Family::Ipv6),
            Ok((net("::/0"), false))
        );
        assert_eq!(
            parse_network("10.1.2.3", Family::Ipv4),
            Ok((net("10.1.2.3/32"), false))
        );
        assert_eq!(
            parse_network("!fe80::/10", Family::Ipv6),
            Ok((net("fe80::/10"), true))
        );
        assert!(parse_network("10.0.0.0/33", Family::Ipv4).is_err());
        assert!(parse_network("eth0", Family::Ipv4).is_err());
    }

    #[test]
    fn test_parse_listing_input_chain() {
        let listing = parse_listing(INPUT_LISTING, Family::Ipv4, ListingSchema::Standard).unwrap();

        assert_eq!(listing.chain, "INPUT");
        assert_eq!(
            listing.policy,
            Some(Policy {
                target: "ACCEPT".into(),
                packets: 2394,
                bytes: 1_200_000,
            })
        );
        assert_eq!(listing.references, None);
        assert_eq!(listing.rules.len(), 2);

        let ssh = &listing.rules[0];
        assert_eq!(ssh.packets, 12);
        assert_eq!(ssh.bytes, 720);
        assert_eq!(ssh.target, "ACCEPT");
        assert_eq!(ssh.protocol, "tcp");
        assert_eq!(ssh.opt, "--");
        assert_eq!(ssh.input, "eth0");
        assert_eq!(ssh.output, "*");
        assert_eq!(ssh.source, net("10.0.0.0/8"));
        assert_eq!(ssh.destination, net("0.0.0.0/0"));
        assert_eq!(ssh.options, "tcp dpt:22");

        let drop = &listing.rules[1];
        assert_eq!(drop.packets, 1_500);
        assert_eq!(drop.bytes, 3_250_000);
        assert!(drop.source_inverted);
        assert_eq!(drop.source, net("192.168.1.5/32"));
        assert_eq!(drop.options, "");
    }

    #[test]
    fn test_empty_chain_yields_no_rules() {
        let out = "Chain FOO (0 references)\n pkts bytes target     prot opt in     out     source               destination\n";
        let listing = parse_listing(out, Family::Ipv4, ListingSchema::Standard).unwrap();
        assert!(listing.rules.is_empty());
        assert_eq!(listing.references, Some(0));
        assert!(parse_stats("", Family::Ipv4, ListingSchema::Standard).unwrap().is_empty());
    }

    #[test]
    fn test_short_line_is_parse_error_with_position() {
        let out = "Chain INPUT (policy ACCEPT 0 packets, 0 bytes)\n pkts bytes target prot opt in out source destination\n 0 0 ACCEPT all -- * *\n";
        let err = parse_stats(out, Family::Ipv4, ListingSchema::Standard).unwrap_err();
        match err {
            Error::Parse { line, content, .. } => {
                assert_eq!(line, 3);
                assert!(content.contains("ACCEPT all"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_counter_is_parse_error() {
        let out = "    x1    0 ACCEPT all -- * * 0.0.0.0/0 0.0.0.0/0\n";
        let err = parse_stats(out, Family::Ipv4, ListingSchema::Standard).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_bad_network_is_parse_error() {
        let out = "0 0 ACCEPT all -- * * 300.0.0.1/8 0.0.0.0/0\n";
        let err = parse_stats(out, Family::Ipv4, ListingSchema::Standard).unwrap_err();
        assert!(err.to_string().contains("source"));
    }

    #[test]
    fn test_empty_target_column() {
        let out = "    5   300            all  --  *      *       0.0.0.0/0            0.0.0.0/0\n";
        let rules = parse_stats(out, Family::Ipv4, ListingSchema::Standard).unwrap();
        assert_eq!(rules[0].target, "");
        assert_eq!(rules[0].protocol, "all");
        assert_eq!(rules[0].opt, "--");
        assert_eq!(rules[0].packets, 5);
    }

    #[test]
    fn test_ipv6_blank_opt_column() {
        let out = "\
Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
 pkts bytes target     prot opt in     out     source               destination
    3   240 ACCEPT     ipv6-icmp    *      *       ::/0                 ::/0                 ipv6-icmptype 128
    0     0 DROP       all      eth1   *       2001:db8::/32        ::/0
";
        let rules = parse_stats(out, Family::Ipv6, ListingSchema::Ipv6OptionalOpt).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].opt, "");
        assert_eq!(rules[0].protocol, "ipv6-icmp");
        assert_eq!(rules[0].input, "*");
        assert_eq!(rules[0].options, "ipv6-icmptype 128");
        assert_eq!(rules[1].input, "eth1");
        assert_eq!(rules[1].source, net("2001:db8::/32"));
    }

    #[test]
    fn test_ipv6_counting_rule_without_target_or_opt() {
        let out = "    0     0            all      *      *       2001:db8::1          ::/0\n";
        let rules = parse_stats(out, Family::Ipv6, ListingSchema::Ipv6OptionalOpt).unwrap();
        assert_eq!(rules[0].target, "");
        assert_eq!(rules[0].protocol, "all");
        assert_eq!(rules[0].opt, "");
        assert_eq!(rules[0].input, "*");
        assert_eq!(rules[0].source, net("2001:db8::1/128"));
        assert_eq!(rules[0].destination, net("::/0"));
    }

    #[test]
    fn test_ipv6_empty_target_with_opt() {
        let out = "    0     0            tcp  --  *      *       !fe80::/10           ::/0                 tcp dpt:22\n";
        let rules = parse_stats(out, Family::Ipv6, ListingSchema::Ipv6OptionalOpt).unwrap();
        assert_eq!(rules[0].target, "");
        assert_eq!(rules[0].opt, "--");
        assert!(rules[0].source_inverted);
        assert_eq!(rules[0].options, "tcp dpt:22");
    }

    #[test]
    fn test_ipv6_with_opt_column_present() {
        let out = "    0     0 ACCEPT     all  --  *      *       ::/0                 ::/0\n";
        let rules = parse_stats(out, Family::Ipv6, ListingSchema::Ipv6OptionalOpt).unwrap();
        assert_eq!(rules[0].opt, "--");
        assert_eq!(rules[0].destination, net("::/0"));
    }

    #[test]
    fn test_malformed_chain_header() {
        let out = "Chain INPUT (policy)\n";
        let err = parse_listing(out, Family::Ipv4, ListingSchema::Standard).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }

    #[test]
    fn test_stat_json_field_names() {
        let rules = parse_stats(INPUT_LISTING, Family::Ipv4, ListingSchema::Standard).unwrap();
        let json = serde_json::to_value(&rules[0]).unwrap();
        assert_eq!(json["pkts"], 12);
        assert_eq!(json["prot"], "tcp");
        assert_eq!(json["in"], "eth0");
        assert_eq!(json["source"], "10.0.0.0/8");
        assert!(json.get("source_inverted").is_none());
    }
}
