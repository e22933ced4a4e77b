//! HTTP transport with per-request source address binding
//!
//! The fetch layer talks to the network through the [`Transport`] capability
//! so the source-binding behavior stays injectable: the production
//! [`HttpTransport`] binds each connection's local endpoint to the requested
//! address, while tests substitute a transport that merely records what was
//! asked of it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use socket2::{Domain, Socket, Type};
use url::Url;

use crate::{HarvestError, Result};

const USER_AGENT: &str = concat!("ao3-harvest/", env!("CARGO_PKG_VERSION"));

/// Raw outcome of a single HTTP exchange, before classification.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: String,
}

/// Capability to perform a GET whose connection is bound to a chosen local
/// address (`None` = system default egress).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: Url, local_addr: Option<IpAddr>) -> Result<TransportReply>;
}

/// Production transport backed by reqwest.
///
/// One client is kept per source address so connection pools stay warm across
/// requests that happen to draw the same address. Before the first client for
/// a non-default address is built, a raw socket bind with `IP_FREEBIND`
/// verifies that the kernel accepts the address as a source even when it is
/// not assigned to any local interface; a refusal is a configuration problem
/// and surfaces as [`HarvestError::Permission`].
pub struct HttpTransport {
    clients: Mutex<HashMap<Option<IpAddr>, Client>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Checks that `addr` is usable as a source address, without sending
    /// anything. Callers with a configured range run this at startup so a
    /// refused bind aborts the process instead of every page task.
    pub fn probe(addr: IpAddr) -> Result<()> {
        probe_source_bind(addr).map_err(|source| HarvestError::Permission { addr, source })
    }

    fn client_for(&self, local_addr: Option<IpAddr>, url: &Url) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&local_addr) {
            return Ok(client.clone());
        }

        if let Some(addr) = local_addr {
            Self::probe(addr)?;
        }

        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true);
        if let Some(addr) = local_addr {
            // reqwest repeats this bind before every connect on the pool
            builder = builder.local_address(addr);
        }
        let client = builder.build().map_err(|source| HarvestError::Transport {
            url: url.to_string(),
            source,
        })?;

        clients.insert(local_addr, client.clone());
        Ok(client)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: Url, local_addr: Option<IpAddr>) -> Result<TransportReply> {
        let client = self.client_for(local_addr, &url)?;

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| HarvestError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|source| HarvestError::Transport {
                url: url.to_string(),
                source,
            })?;

        Ok(TransportReply { status, body })
    }
}

/// The bind-before-connect dance: create a stream socket, mark it freebind
/// (`SOL_IP`/`IP_FREEBIND`), and bind the candidate address to an ephemeral
/// port. Any failure means the platform will not let us source traffic from
/// this address.
fn probe_source_bind(addr: IpAddr) -> std::io::Result<()> {
    let domain = match addr {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket.set_freebind(true)?;

    socket.bind(&SocketAddr::new(addr, 0).into())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_accepts_loopback() {
        assert!(HttpTransport::probe("127.0.0.1".parse().unwrap()).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn probe_accepts_unassigned_loopback_address() {
        // 127.0.0.0/8 routes locally even for addresses no interface owns
        assert!(HttpTransport::probe("127.1.2.3".parse().unwrap()).is_ok());
    }
}
