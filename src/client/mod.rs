//! RCM client: marshals requests, drives the mailbox/mailman demultiplexer,
//! and maps reply status codes back to [`crate::Error`] (§4.7 "Other client
//! operations").

pub mod mailbox;

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::packet::{self, DescType, Header, Packet, Status};
use crate::transport::{Address, Transport};
use mailbox::ClientMailbox;

/// Construction parameters for a [`Client`] (§4.11 ambient configuration).
pub struct ClientConfig {
    /// The server's endpoint every non-error request is sent to.
    pub server_addr: Address,
    /// Endpoint used for ordinary request/reply traffic.
    pub transport: Arc<dyn Transport>,
    /// A second endpoint one-way `CMD` errors are addressed to, drained by
    /// [`Client::check_for_error`]. Defaults to `transport` when absent,
    /// which is fine for tests but means CMD errors and ordinary replies
    /// share one reader.
    pub error_transport: Option<Arc<dyn Transport>>,
    /// The original's callback-mode clients are out of scope (§1); set
    /// this and every constructor call fails with `Error::NotImplemented`.
    pub callback_notification: bool,
}

impl ClientConfig {
    pub fn new(server_addr: Address, transport: Arc<dyn Transport>) -> Self {
        ClientConfig {
            server_addr,
            transport,
            error_transport: None,
            callback_notification: false,
        }
    }
}

/// A handle for one caller's conversation with a remote RCM server.
/// Cheap to share: `exec`-family methods take `&self`, so a `Client` is
/// typically wrapped in an `Arc` and used from multiple threads, each
/// blocking on its own reply via the shared [`ClientMailbox`].
pub struct Client {
    mailbox: ClientMailbox,
    error_transport: Arc<dyn Transport>,
    server_addr: Address,
    next_msg_id: Mutex<u16>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.callback_notification {
            return Err(Error::NotImplemented("callback-mode clients"));
        }
        let error_transport = match config.error_transport {
            Some(t) => t,
            None => Arc::clone(&config.transport),
        };
        Ok(Client {
            mailbox: ClientMailbox::new(config.transport),
            error_transport,
            server_addr: config.server_addr,
            next_msg_id: Mutex::new(1),
        })
    }

    fn fresh_msg_id(&self) -> u16 {
        let mut next = self.next_msg_id.lock().unwrap();
        packet::gen_msg_id(&mut next)
    }

    fn map_status(status: Status) -> Result<()> {
        match status {
            Status::Success => Ok(()),
            Status::InvalidFxn => Err(Error::InvalidFxn),
            Status::SymbolNotFound => Err(Error::SymbolNotFound),
            Status::InvalidMsgType => Err(Error::InvalidMsgType),
            Status::MsgFxnErr => Err(Error::MessageFunctionError(0)),
            Status::Error => Err(Error::ServerError),
            Status::Unprocessed => Err(Error::MessageLost),
            Status::JobNotFound => Err(Error::JobNotFound),
            Status::PoolNotFound => Err(Error::PoolNotFound),
        }
    }

    /// Sends `packet` as a `MSG`, blocks for the matching reply, and maps
    /// its status to a `Result` (§4.7 `exec`).
    pub fn exec(&self, mut packet: Packet, fxn_idx: u32) -> Result<Packet> {
        let msg_id = self.fresh_msg_id();
        packet.header.msg_id = msg_id;
        packet.header.fxn_idx = fxn_idx;
        packet.header.desc = packet::set_type(packet.header.desc, DescType::Msg);
        self.mailbox.send(self.server_addr, &packet)?;

        let reply = self.mailbox.wait_for(msg_id)?;
        let status = packet::get_status(reply.header.desc)?;
        match status {
            Status::MsgFxnErr => Err(Error::MessageFunctionError(reply.header.result)),
            _ => {
                Self::map_status(status)?;
                Ok(reply)
            }
        }
    }

    /// Sends `packet` as a `MSG` without waiting for the reply, returning
    /// the `msg_id` the caller can later pass to
    /// [`ClientMailbox::wait_for`] (§4.7 `exec_no_wait`).
    pub fn exec_no_wait(&self, mut packet: Packet, fxn_idx: u32) -> Result<u16> {
        let msg_id = self.fresh_msg_id();
        packet.header.msg_id = msg_id;
        packet.header.fxn_idx = fxn_idx;
        packet.header.desc = packet::set_type(packet.header.desc, DescType::Msg);
        self.mailbox.send(self.server_addr, &packet)?;
        Ok(msg_id)
    }

    /// Blocks for a reply previously requested via `exec_no_wait`.
    pub fn wait(&self, msg_id: u16) -> Result<Packet> {
        let reply = self.mailbox.wait_for(msg_id)?;
        let status = packet::get_status(reply.header.desc)?;
        match status {
            Status::MsgFxnErr => Err(Error::MessageFunctionError(reply.header.result)),
            _ => {
                Self::map_status(status)?;
                Ok(reply)
            }
        }
    }

    /// As [`Client::wait`], but gives up with [`Error::Timeout`] once
    /// `deadline` passes, for the one caller the design permits a timeout
    /// (§5: `ResourceClient`).
    pub fn wait_deadline(&self, msg_id: u16, deadline: std::time::Instant) -> Result<Packet> {
        let reply = self.mailbox.wait_for_deadline(msg_id, Some(deadline))?;
        let status = packet::get_status(reply.header.desc)?;
        match status {
            Status::MsgFxnErr => Err(Error::MessageFunctionError(reply.header.result)),
            _ => {
                Self::map_status(status)?;
                Ok(reply)
            }
        }
    }

    /// Fires a one-way `CMD`: any error reply lands on the error queue
    /// endpoint, not the caller's mailbox, and this never blocks (§4.7
    /// `exec_cmd`).
    pub fn exec_cmd(&self, mut packet: Packet, fxn_idx: u32) -> Result<()> {
        let msg_id = self.fresh_msg_id();
        packet.header.msg_id = msg_id;
        packet.header.fxn_idx = fxn_idx;
        packet.header.desc = packet::set_type(packet.header.desc, DescType::Cmd);
        self.error_transport
            .send(self.server_addr, &packet.encode())
            .map(|_| ())
    }

    /// Non-blocking drain of one pending `CMD` error, if any (§4.7
    /// `check_for_error`).
    pub fn check_for_error(&self) -> Result<Option<Packet>> {
        match self.error_transport.recv(Some(std::time::Duration::ZERO)) {
            Ok((bytes, _src)) => {
                let packet = Packet::decode(&bytes)?;
                Ok(Some(packet))
            }
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves a handler's function index by name (§4.7 `get_symbol_index`).
    pub fn get_symbol_index(&self, name: &str) -> Result<u32> {
        let msg_id = self.fresh_msg_id();
        let mut header = Header::new_request(msg_id);
        header.desc = packet::set_type(header.desc, DescType::SymIdx);
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        let packet = Packet::new(header, data);
        self.mailbox.send(self.server_addr, &packet)?;

        let reply = self.mailbox.wait_for(msg_id)?;
        Self::map_status(packet::get_status(reply.header.desc)?)?;
        if reply.data.len() < 4 {
            return Err(Error::Truncated("symbol index reply".into()));
        }
        Ok(u32::from_le_bytes(reply.data[0..4].try_into().unwrap()))
    }

    /// Acquires a fresh job id for in-order execution of a sequence of
    /// `MSG` packets (§4.7 `acquire_job_id`).
    pub fn acquire_job_id(&self) -> Result<u16> {
        let msg_id = self.fresh_msg_id();
        let mut header = Header::new_request(msg_id);
        header.desc = packet::set_type(header.desc, DescType::JobAcq);
        let packet = Packet::new(header, vec![0; 4]);
        self.mailbox.send(self.server_addr, &packet)?;

        let reply = self.mailbox.wait_for(msg_id)?;
        Self::map_status(packet::get_status(reply.header.desc)?)?;
        Ok(u32::from_le_bytes(reply.data[0..4].try_into().unwrap()) as u16)
    }

    /// Releases a job id, flushing any packets still queued behind an
    /// in-flight one as `UNPROCESSED` (§4.7 `release_job_id`).
    pub fn release_job_id(&self, job_id: u16) -> Result<()> {
        let msg_id = self.fresh_msg_id();
        let mut header = Header::new_request(msg_id);
        header.desc = packet::set_type(header.desc, DescType::JobRel);
        let mut data = vec![0u8; 4];
        data[0..4].copy_from_slice(&(job_id as u32).to_le_bytes());
        let packet = Packet::new(header, data);
        self.mailbox.send(self.server_addr, &packet)?;

        let reply = self.mailbox.wait_for(msg_id)?;
        Self::map_status(packet::get_status(reply.header.desc)?)
    }

    /// Builds a request header stamped with `job_id` (or `JOB_ID_DISCRETE`)
    /// ready for `exec`/`exec_no_wait` (§6 pool/job flags field).
    pub fn new_packet(&self, pool_id: u16, job_id: u16, data: Vec<u8>) -> Packet {
        let mut header = Header::new_request(0);
        header.set_pool_job(pool_id, job_id);
        Packet::new(header, data)
    }

    /// Allocates a payload buffer, matching the original's buffer-heap
    /// wrapper; the minimum payload size is 4 bytes (§4.7 `alloc`).
    pub fn alloc(&self, data_size: usize) -> Packet {
        let size = data_size.max(4);
        self.new_packet(crate::POOL_ID_DEFAULT, crate::JOB_ID_DISCRETE, vec![0u8; size])
    }

    /// Releases a packet's payload back to the allocator. Since `Packet`
    /// owns its buffer outright, this is simply dropping it — kept as a
    /// named operation to mirror the original's explicit `free` call and
    /// give callers a documented point to release resources at (§4.7
    /// `free`).
    pub fn free(&self, _packet: Packet) {}

    pub fn local_addr(&self) -> Address {
        self.mailbox.local_addr()
    }

    pub fn server_addr(&self) -> Address {
        self.server_addr
    }
}
