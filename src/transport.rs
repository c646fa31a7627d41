//! Transport collaborators.
//!
//! The engine only ever sees the [`Transport`] trait and an inbound frame
//! channel. Two implementations ship with the crate:
//!
//! - [`MemoryNetwork`]: an in-process fabric for tests and simulation, with
//!   a blackhole switch per address to exercise timeout paths;
//! - [`UdpTransport`]: one datagram per frame, used by the node binary.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocols::{InboundFrames, Transport};

/// Depth of the inbound frame queue handed to the engine.
pub const INBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Default)]
struct MemoryInner {
    peers: HashMap<String, mpsc::Sender<(String, Vec<u8>)>>,
    blackholes: HashSet<String>,
}

/// In-process frame fabric. Every registered address gets an inbound
/// receiver; sends are routed by destination address.
#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<MemoryInner>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an address and return its transport handle and inbound
    /// stream.
    pub fn register(self: &Arc<Self>, address: &str) -> (MemoryTransport, InboundFrames) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.inner
            .lock()
            .expect("memory network lock")
            .peers
            .insert(address.to_string(), tx);
        (
            MemoryTransport {
                address: address.to_string(),
                network: Arc::clone(self),
            },
            rx,
        )
    }

    /// Silently swallow frames addressed to `address`. Simulates a dead or
    /// unreachable peer without tearing down its registration.
    pub fn set_blackhole(&self, address: &str, enabled: bool) {
        let mut inner = self.inner.lock().expect("memory network lock");
        if enabled {
            inner.blackholes.insert(address.to_string());
        } else {
            inner.blackholes.remove(address);
        }
    }

    pub fn unregister(&self, address: &str) {
        self.inner
            .lock()
            .expect("memory network lock")
            .peers
            .remove(address);
    }
}

/// Sending half of a [`MemoryNetwork`] registration.
pub struct MemoryTransport {
    address: String,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &str, frame: Vec<u8>) -> Result<()> {
        let tx = {
            let inner = self.network.inner.lock().expect("memory network lock");
            if inner.blackholes.contains(to) {
                return Ok(());
            }
            inner.peers.get(to).cloned()
        };
        match tx {
            Some(tx) => tx
                .send((self.address.clone(), frame))
                .await
                .map_err(|_| anyhow!("peer {} stopped receiving", to)),
            None => Err(anyhow!("no such peer: {}", to)),
        }
    }
}

/// UDP datagram transport: one datagram per frame, source address reported
/// as `ip:port`.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a socket and spawn the receive pump. Returns the transport, the
    /// inbound stream for the engine, and the bound address.
    pub async fn bind(addr: &str) -> Result<(Self, InboundFrames, SocketAddr)> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding UDP socket on {}", addr))?,
        );
        let local = socket.local_addr().context("reading bound address")?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        if tx.send((src.to_string(), buf[..len].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                    }
                }
            }
        });

        Ok((Self { socket }, rx, local))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: &str, frame: Vec<u8>) -> Result<()> {
        let addr: SocketAddr = to
            .parse()
            .with_context(|| format!("invalid peer address: {}", to))?;
        self.socket
            .send_to(&frame, addr)
            .await
            .with_context(|| format!("sending frame to {}", to))?;
        Ok(())
    }
}
