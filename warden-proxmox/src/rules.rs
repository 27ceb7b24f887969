//! Rule tagging.
//!
//! Rules created here are recognised later by their comment, which holds a
//! `warden:<ip>` token followed by the block kind.

use std::net::IpAddr;

use serde::Deserialize;
use warden_engine::BlockDuration;

/// A firewall rule as listed by the API. Only the fields we match on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirewallRule {
    pub pos: u64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// `warden:<ip>`
pub fn tag_for(ip: IpAddr) -> String {
    format!("warden:{ip}")
}

/// Comment for a new block rule.
pub fn rule_comment(ip: IpAddr, duration: BlockDuration) -> String {
    match duration {
        BlockDuration::Temporary { secs } => format!("{} temp {secs}s", tag_for(ip)),
        BlockDuration::Permanent => format!("{} permanent", tag_for(ip)),
    }
}

/// True if `comment` carries the tag for exactly `ip`.
pub fn is_tagged_for(comment: &str, ip: IpAddr) -> bool {
    let tag = tag_for(ip);
    comment.split_whitespace().any(|token| token == tag)
}

/// Positions of the rules tagged for `ip`, highest first.
///
/// Deleting a rule shifts every rule below it up by one, so deletes must
/// run from the bottom.
pub fn tagged_positions(rules: &[FirewallRule], ip: IpAddr) -> Vec<u64> {
    let mut positions: Vec<u64> = rules
        .iter()
        .filter(|rule| {
            rule.comment
                .as_deref()
                .is_some_and(|comment| is_tagged_for(comment, ip))
        })
        .map(|rule| rule.pos)
        .collect();
    positions.sort_unstable_by(|a, b| b.cmp(a));
    positions
}
