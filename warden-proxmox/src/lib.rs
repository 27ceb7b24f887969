//! Proxmox VE firewall adapter.
//!
//! Implements `warden_engine::FirewallAdapter` against the node-level
//! firewall of a Proxmox VE host. Every rule the adapter creates carries a
//! `warden:<ip>` tag in its comment; unblocking deletes tagged rules only,
//! so hand-written rules are never touched.

mod client;
mod config;
mod rules;

pub use client::{ProxmoxError, ProxmoxFirewall};
pub use config::{ConfigError, ProxmoxConfig, DEFAULT_NODE, DEFAULT_TIMEOUT};
pub use rules::{is_tagged_for, rule_comment, tag_for, tagged_positions, FirewallRule};
