//! Sends viewers that sit on the camera's own network to the camera's local
//! address instead of relaying frames to them.

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use axum::http::HeaderMap;

/// Decision for one incoming viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Send the viewer this URL and close.
    Redirect(String),
}

/// The network treated as "home".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeNetwork {
    /// `2001:db8:1::/48`, `192.168.1.0/24`: matched bitwise.
    Cidr { base: IpAddr, prefix_len: u8 },
    /// Anything else is a textual address prefix.
    Prefix(String),
}

impl HomeNetwork {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            anyhow::bail!("home network is empty");
        }
        let Some((base, len)) = text.split_once('/') else {
            return Ok(HomeNetwork::Prefix(text.to_string()));
        };

        let base: IpAddr = base
            .parse()
            .with_context(|| format!("home network {}: bad address", text))?;
        let prefix_len: u8 = len
            .parse()
            .with_context(|| format!("home network {}: bad prefix length", text))?;
        let max = if base.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            anyhow::bail!("home network {}: prefix length above {}", text, max);
        }
        Ok(HomeNetwork::Cidr {
            base: base.to_canonical(),
            prefix_len,
        })
    }

    pub fn contains(&self, client: &str) -> bool {
        match self {
            HomeNetwork::Prefix(prefix) => client.starts_with(prefix.as_str()),
            HomeNetwork::Cidr { base, prefix_len } => match client.parse::<IpAddr>() {
                Ok(addr) => same_prefix(*base, addr.to_canonical(), *prefix_len),
                Err(_) => false,
            },
        }
    }
}

impl Display for HomeNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HomeNetwork::Cidr { base, prefix_len } => write!(f, "{}/{}", base, prefix_len),
            HomeNetwork::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

fn same_prefix(base: IpAddr, addr: IpAddr, prefix_len: u8) -> bool {
    match (base, addr) {
        (IpAddr::V4(base), IpAddr::V4(addr)) => {
            masked(u32::from(base) as u128, 32, prefix_len)
                == masked(u32::from(addr) as u128, 32, prefix_len)
        }
        (IpAddr::V6(base), IpAddr::V6(addr)) => {
            masked(u128::from(base), 128, prefix_len) == masked(u128::from(addr), 128, prefix_len)
        }
        _ => false,
    }
}

fn masked(bits: u128, width: u32, prefix_len: u8) -> u128 {
    let keep = u32::from(prefix_len).min(width);
    if keep == 0 {
        return 0;
    }
    bits >> (width - keep)
}

/// Address of the viewer behind any proxies: the first `X-Forwarded-For`
/// entry, else `X-Real-IP`, else the socket peer.
pub fn client_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    match forwarded.or_else(real_ip) {
        Some(addr) => addr.to_string(),
        None => peer.ip().to_canonical().to_string(),
    }
}

/// Decides whether a viewer is admitted or redirected to the local camera.
#[derive(Debug, Clone)]
pub struct RedirectAdvisor {
    home: HomeNetwork,
    local_addr: String,
}

impl RedirectAdvisor {
    pub fn new(home_network: &str, local_addr: &str) -> anyhow::Result<Self> {
        let local_addr = local_addr.trim();
        if local_addr.is_empty() {
            anyhow::bail!("redirect needs a local address");
        }
        Ok(Self {
            home: HomeNetwork::parse(home_network)?,
            local_addr: local_addr.to_string(),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// A home viewer is redirected only while the relay is idle; once frames
    /// flow anyway it may as well join. The streaming flag can change right
    /// after this returns, so the decision is best-effort.
    pub fn advise(&self, client: &str, relay_active: bool) -> Admission {
        if !relay_active && self.home.contains(client) {
            log::info!(
                "redirect: {} is inside {}, sending it to {}",
                client,
                self.home,
                self.local_addr
            );
            Admission::Redirect(self.local_addr.clone())
        } else {
            Admission::Admit
        }
    }
}

/// The single text message sent to a redirected viewer.
pub fn redirect_payload(url: &str) -> String {
    serde_json::json!({ "type": "redirect", "url": url }).to_string()
}

#[cfg(test)]
#[path = "redirect_test.rs"]
mod redirect_test;
