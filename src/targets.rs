use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::ProbeError;
use crate::types::Target;

/// Shortest IPv4 prefix accepted for expansion (`/16` is 65534 hosts).
pub const MIN_CIDR_PREFIX: u8 = 16;

/// Parse a raw target list into a deduplicated list of targets.
///
/// Supported formats:
/// - separators: ASCII comma, full-width comma (`，`) and any whitespace
/// - IPv4 CIDR entries such as `10.0.0.0/30` expand to their host addresses
/// - comments: everything after `#` on a line is ignored
///
/// First occurrence wins; case is preserved. A CIDR shorter than
/// [`MIN_CIDR_PREFIX`] is rejected with `InvalidTarget`.
pub fn parse_targets(raw: &str) -> Result<Vec<Target>, ProbeError> {
    let mut out: Vec<Target> = Vec::new();
    let mut seen = HashSet::new();

    for line in raw.lines() {
        let line = line.split('#').next().unwrap_or("");
        for token in line
            .split(|c: char| c == ',' || c == '\u{ff0c}' || c.is_whitespace())
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            match expand_cidr(token)? {
                Some(hosts) => {
                    for ip in hosts {
                        let t = Target::new(ip.to_string());
                        if seen.insert(t.clone()) {
                            out.push(t);
                        }
                    }
                }
                None => {
                    let t = Target::from(token);
                    if seen.insert(t.clone()) {
                        out.push(t);
                    }
                }
            }
        }
    }

    Ok(out)
}

/// Deduplicate an already-split list, preserving first-occurrence order.
pub fn dedup_targets<I, T>(items: I) -> Vec<Target>
where
    I: IntoIterator<Item = T>,
    T: Into<Target>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(Into::into)
        .filter(|t: &Target| !t.as_str().trim().is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Load targets from a newline (or comma) separated file.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read targets file: {}", path.as_ref().display()))?;
    parse_targets(&content)
        .with_context(|| format!("invalid targets file: {}", path.as_ref().display()))
}

/// Expand an IPv4 CIDR token into host addresses (network and broadcast excluded).
/// Returns `Ok(None)` when the token is not a CIDR; it is then treated as an opaque target.
fn expand_cidr(token: &str) -> Result<Option<Vec<Ipv4Addr>>, ProbeError> {
    if !token.contains('/') {
        return Ok(None);
    }
    let Ok(net) = token.parse::<Ipv4Net>() else {
        return Ok(None);
    };
    if net.prefix_len() < MIN_CIDR_PREFIX {
        return Err(ProbeError::InvalidTarget {
            target: token.to_string(),
            reason: format!("prefix shorter than /{MIN_CIDR_PREFIX}"),
        });
    }
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        // /31 and /32 have no network/broadcast split
        return Ok(Some((start..=end).map(Ipv4Addr::from).collect()));
    }
    Ok(Some((start + 1..end).map(Ipv4Addr::from).collect()))
}
