//! Blocking HTTPS client for the Proxmox firewall API.

use std::net::IpAddr;

use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use warden_engine::{AdapterError, BlockDuration, FirewallAdapter};

use crate::config::{ConfigError, ProxmoxConfig};
use crate::rules::{rule_comment, tagged_positions, FirewallRule};

/// Errors constructing the client.
#[derive(Debug, Error)]
pub enum ProxmoxError {
    #[error("invalid Proxmox config: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// `{"data": ...}` wrapper every API reply uses.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

/// Proxmox node firewall adapter.
///
/// The auth ticket is fetched on first use, cached, and fetched again once
/// if a request comes back 401.
///
/// Rules are deleted by position, and any insert or delete shifts the
/// positions of the rules around it. Each block/unblock therefore holds
/// `rules` from the listing until its last write, so concurrent calls never
/// act on a stale listing.
pub struct ProxmoxFirewall {
    config: ProxmoxConfig,
    http: Client,
    ticket: Mutex<Option<Ticket>>,
    rules: Mutex<()>,
}

impl ProxmoxFirewall {
    pub fn new(config: ProxmoxConfig) -> Result<Self, ProxmoxError> {
        config.validate()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(ProxmoxError::Client)?;

        Ok(Self {
            config,
            http,
            ticket: Mutex::new(None),
            rules: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ProxmoxConfig {
        &self.config
    }

    fn transport(&self, err: reqwest::Error) -> AdapterError {
        if err.is_timeout() {
            AdapterError::Timeout(self.config.timeout)
        } else {
            AdapterError::Unavailable(err.to_string())
        }
    }

    fn rules_path(&self) -> String {
        format!("/nodes/{}/firewall/rules", self.config.node)
    }

    fn login(&self) -> Result<Ticket, AdapterError> {
        let response = self
            .http
            .post(self.config.endpoint("/access/ticket"))
            .form(&[
                ("username", self.config.user.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .map_err(|e| self.transport(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Rejected(format!(
                "login as {} failed: {status}",
                self.config.user
            )));
        }
        self.decode::<Ticket>(response)
    }

    fn ticket(&self, refresh: bool) -> Result<Ticket, AdapterError> {
        let mut cached = self.ticket.lock();
        match cached.as_ref() {
            Some(ticket) if !refresh => Ok(ticket.clone()),
            _ => {
                let ticket = self.login()?;
                *cached = Some(ticket.clone());
                Ok(ticket)
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T, AdapterError> {
        let body = response.text().map_err(|e| self.transport(e))?;
        serde_json::from_str::<Envelope<T>>(&body)
            .map(|envelope| envelope.data)
            .map_err(|e| AdapterError::Rejected(format!("unexpected API reply: {e}")))
    }

    /// Authenticated request; re-authenticates once on 401.
    fn send(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<Response, AdapterError> {
        let url = self.config.endpoint(path);
        let mut refreshed = false;

        loop {
            let ticket = self.ticket(refreshed)?;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Cookie", format!("PVEAuthCookie={}", ticket.ticket));
            if method != Method::GET {
                request = request
                    .header("CSRFPreventionToken", &ticket.csrf_token)
                    .form(form);
            }

            let response = request.send().map_err(|e| self.transport(e))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                continue;
            }
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(AdapterError::Rejected(format!(
                    "{method} {path}: {status} {}",
                    body.trim()
                )));
            }
            return Ok(response);
        }
    }

    fn list_rules(&self) -> Result<Vec<FirewallRule>, AdapterError> {
        let response = self.send(Method::GET, &self.rules_path(), &[])?;
        self.decode(response)
    }

    /// Delete every rule tagged for `ip`. Returns how many were removed.
    ///
    /// Callers hold `self.rules`.
    fn delete_tagged(&self, ip: IpAddr) -> Result<usize, AdapterError> {
        let positions = tagged_positions(&self.list_rules()?, ip);
        for pos in &positions {
            self.send(Method::DELETE, &format!("{}/{pos}", self.rules_path()), &[])?;
        }
        Ok(positions.len())
    }
}

impl FirewallAdapter for ProxmoxFirewall {
    fn block(&self, ip: IpAddr, duration: BlockDuration) -> Result<(), AdapterError> {
        let _rules = self.rules.lock();
        // Replace rather than stack: a retried block must not add a second rule.
        self.delete_tagged(ip)?;

        let form = [
            ("enable", "1".to_string()),
            ("type", "in".to_string()),
            ("action", "DROP".to_string()),
            ("source", ip.to_string()),
            ("comment", rule_comment(ip, duration)),
        ];
        self.send(Method::POST, &self.rules_path(), &form)?;
        Ok(())
    }

    fn unblock(&self, ip: IpAddr) -> Result<(), AdapterError> {
        let _rules = self.rules.lock();
        self.delete_tagged(ip)?;
        Ok(())
    }
}
