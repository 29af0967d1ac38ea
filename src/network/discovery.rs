//! UDP discovery responder
//!
//! A client broadcasts the literal token; the sender answers with the reply prefix
//! followed by `{"port":..,"pcm":..,"name":..}`.

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::config::ServerConfig;
use crate::constants::{DISCOVERY_REPLY_PREFIX, DISCOVERY_TOKEN};
use crate::error::{NetworkError, Result};
use crate::pipeline::AudioPipeline;

/// Reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    /// HTTP port
    pub port: u16,
    /// Raw PCM port
    pub pcm: u16,
    pub name: String,
}

impl DiscoveryReply {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            port: config.port,
            pcm: config.pcm_port,
            name: config.host_name.clone(),
        }
    }

    pub fn to_datagram(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self).map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(format!("{}{}", DISCOVERY_REPLY_PREFIX, json).into_bytes())
    }

    /// Parse a reply datagram; anything without the prefix is ignored
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?;
        let json = text.strip_prefix(DISCOVERY_REPLY_PREFIX)?;
        serde_json::from_str(json.trim()).ok()
    }
}

/// Request match; trailing whitespace is tolerated
pub fn is_discovery_request(datagram: &[u8]) -> bool {
    let end = datagram
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &datagram[..end] == DISCOVERY_TOKEN
}

/// Bind a reusable broadcast-capable UDP socket
pub fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

pub struct DiscoveryResponder {
    pipeline: Arc<AudioPipeline>,
}

impl DiscoveryResponder {
    pub fn new(pipeline: Arc<AudioPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.pipeline.config().snapshot();
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.discovery_port)
            .parse()
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", config.bind_address, e)))?;
        let socket = bind_socket(addr)?;
        self.serve(socket).await
    }

    pub async fn serve(self, socket: UdpSocket) -> Result<()> {
        tracing::info!("Discovery responder on udp://{}", socket.local_addr()?);
        let mut shutdown = self.pipeline.shutdown_signal();
        let mut buf = [0u8; 512];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!("Discovery recv failed: {}", e);
                            continue;
                        }
                    };
                    if !is_discovery_request(&buf[..len]) {
                        continue;
                    }
                    // ports and name can change through the config API
                    let reply = DiscoveryReply::from_config(&self.pipeline.config().snapshot());
                    let datagram = reply.to_datagram()?;
                    match socket.send_to(&datagram, peer).await {
                        Ok(_) => tracing::debug!("Answered discovery from {}", peer),
                        Err(e) => tracing::warn!("Discovery reply to {} failed: {}", peer, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Send one discovery request to `target` and wait for the first valid reply
pub async fn probe(target: SocketAddr, timeout: Duration) -> Result<Option<(SocketAddr, DiscoveryReply)>> {
    let local: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = bind_socket(local)?;
    socket.send_to(DISCOVERY_TOKEN, target).await?;

    let mut buf = [0u8; 512];
    let wait = async {
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            if let Some(reply) = DiscoveryReply::parse(&buf[..len]) {
                return Ok::<_, std::io::Error>((peer, reply));
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(found) => Ok(Some(found?)),
        Err(_) => Ok(None),
    }
}
