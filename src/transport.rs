//! Datagram transport abstraction (§4.2, external contract).
//!
//! The underlying shared-memory ring and interrupt plumbing the original
//! source used is explicitly out of scope (§1); this module only needs a
//! reliable, in-order, bidirectional datagram endpoint with a way to wake
//! a blocked reader on shutdown. `std::net::SocketAddr` stands in for the
//! `(processor, endpoint)` pair the original addresses with.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::info;

use crate::error::{Error, Result};

/// Stand-in for the original's `(processor id, endpoint)` pair.
pub type Address = SocketAddr;

/// A bidirectional datagram endpoint (§4.2).
pub trait Transport: Send + Sync {
    /// This endpoint's own address, as handed to peers for replies.
    fn local_addr(&self) -> Address;

    /// Sends one datagram to `dst`. Surfaced to the caller immediately on
    /// failure; no retry (§7).
    fn send(&self, dst: Address, bytes: &[u8]) -> Result<()>;

    /// Blocks (up to `timeout`, or forever if `None`) for the next
    /// datagram. Returns [`Error::Timeout`] on expiry and
    /// [`Error::Unblocked`] if [`Transport::unblock`] fired.
    fn recv(&self, timeout: Option<Duration>) -> Result<(Vec<u8>, Address)>;

    /// Causes any thread currently blocked in `recv` to return
    /// [`Error::Unblocked`], so it can check a shutdown flag and exit.
    fn unblock(&self);

    /// Publishes `name` on this endpoint's `port` to a well-known
    /// name-service peer (§4.2, §6 name announcement record).
    fn announce(&self, name: &str, port: u16) -> Result<()>;

    /// Withdraws a previously announced name.
    fn withdraw(&self, name: &str, port: u16) -> Result<()>;
}

/// A real UDP-socket-backed transport. Illustrative: the original ran over
/// shared-memory rings and interrupts, which §1 scopes out; UDP is the
/// closest portable stand-in for "a datagram endpoint between two
/// processors."
pub struct UdpTransport {
    socket: UdpSocket,
    unblocked: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Binds a UDP socket and configures it for the poll-based `unblock`
    /// protocol below.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;
        Ok(UdpTransport {
            socket,
            unblocked: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> Address {
        self.socket
            .local_addr()
            .expect("bound socket always has a local address")
    }

    fn send(&self, dst: Address, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, dst)?;
        Ok(())
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<(Vec<u8>, Address)> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if self.unblocked.swap(false, Ordering::SeqCst) {
                return Err(Error::Unblocked);
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => return Ok((buf[..n].to_vec(), src)),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if let Some(dl) = deadline {
                        if Instant::now() >= dl {
                            return Err(Error::Timeout);
                        }
                    }
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn unblock(&self) {
        self.unblocked.store(true, Ordering::SeqCst);
    }

    fn announce(&self, name: &str, port: u16) -> Result<()> {
        info!("announce: no name-service peer configured for UdpTransport ({name}:{port})");
        Ok(())
    }

    fn withdraw(&self, name: &str, port: u16) -> Result<()> {
        info!("withdraw: no name-service peer configured for UdpTransport ({name}:{port})");
        Ok(())
    }
}

type Mailbag = (Vec<u8>, Address);

/// Shared registry backing an in-process "network" of [`LoopbackTransport`]
/// endpoints — used by this crate's own test suite, and usable by a host
/// application that wants co-located client and server instances without
/// going through a real socket.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routes: Arc<Mutex<HashMap<Address, Sender<Mailbag>>>>,
    next_port: Arc<AtomicU16>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        LoopbackNetwork {
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_port: Arc::new(AtomicU16::new(20000)),
        }
    }

    /// Allocates a fresh loopback address and registers a new endpoint
    /// under it.
    pub fn endpoint(&self) -> LoopbackTransport {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let address: Address = format!("127.0.0.1:{port}").parse().unwrap();
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.routes.lock().unwrap().insert(address, sender.clone());
        LoopbackTransport {
            address,
            self_sender: sender,
            receiver,
            network: self.clone(),
        }
    }
}

/// An in-process `Transport` implementation routed through
/// [`LoopbackNetwork`]. `unblock` is implemented with a reserved
/// empty-payload sentinel rather than a side flag, since the channel
/// receiver has no poll-and-check loop to race against a real socket
/// timeout.
pub struct LoopbackTransport {
    address: Address,
    self_sender: Sender<Mailbag>,
    receiver: Receiver<Mailbag>,
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    fn local_addr(&self) -> Address {
        self.address
    }

    fn send(&self, dst: Address, bytes: &[u8]) -> Result<()> {
        let routes = self.network.routes.lock().unwrap();
        let sender = routes
            .get(&dst)
            .ok_or_else(|| Error::Transport(format!("no loopback endpoint at {dst}")))?;
        sender
            .send((bytes.to_vec(), self.address))
            .map_err(|_| Error::ChannelClosed)
    }

    fn recv(&self, timeout: Option<Duration>) -> Result<(Vec<u8>, Address)> {
        let (bytes, src) = match timeout {
            Some(d) => self.receiver.recv_timeout(d).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::Unblocked,
            })?,
            None => self.receiver.recv().map_err(|_| Error::Unblocked)?,
        };
        if bytes.is_empty() {
            return Err(Error::Unblocked);
        }
        Ok((bytes, src))
    }

    fn unblock(&self) {
        let _ = self.self_sender.send((Vec::new(), self.address));
    }

    fn announce(&self, name: &str, port: u16) -> Result<()> {
        info!("announce: {name} on loopback port {port}");
        Ok(())
    }

    fn withdraw(&self, name: &str, port: u16) -> Result<()> {
        info!("withdraw: {name} on loopback port {port}");
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.routes.lock().unwrap().remove(&self.address);
    }
}
