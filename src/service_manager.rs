//! The service manager: a registry of named server factories that lazily
//! spawns a server instance by name on an incoming connection request
//! (§4.8). Grounded on `examples/original_source/src/ti/srvmgr/ServiceMgr.c`
//! and `rpmsg_omx.h`'s outer message header.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::function_table::StaticSlotSpec;
use crate::server::{Server, ServerConfig};
use crate::transport::{Address, Transport};
use crate::worker_pool::WorkerPoolConfig;

/// Outer framing used by the service manager's own protocol, distinct from
/// the RCM packet header (§4.8: "framed by a small outer header"). Matches
/// `rpmsg_omx.h`'s `struct omx_msg_hdr { u32 type; u32 flags; u32 len; ... }`
/// (`HDRSIZE = 3 * sizeof(u32)`).
const OUTER_HEADER_LEN: usize = 12;

/// Message types from `rpmsg_omx.h`'s `omx_msg_types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OmxType {
    ConnReq = 0,
    ConnRsp = 1,
    PingMsg = 2,
    PongMsg = 3,
    DiscReq = 4,
    RawMsg = 5,
    DiscRsp = 6,
}

impl TryFrom<u32> for OmxType {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            0 => OmxType::ConnReq,
            1 => OmxType::ConnRsp,
            2 => OmxType::PingMsg,
            3 => OmxType::PongMsg,
            4 => OmxType::DiscReq,
            5 => OmxType::RawMsg,
            6 => OmxType::DiscRsp,
            _ => return Err(Error::InvalidMsgType),
        })
    }
}

/// Connection-response status codes, matching `rpmsg_omx.h`'s
/// `enum omx_error_codes` (§4.8 `CONN_RSP{status, new_endpoint}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnStatus {
    Success = 0,
    NotSupp = 1,
    NoMem = 2,
    Fail = 3,
}

struct OuterHeader {
    msg_type: u32,
    flags: u32,
    len: u32,
}

fn encode_outer(header: &OuterHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OUTER_HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.msg_type.to_le_bytes());
    buf.extend_from_slice(&header.flags.to_le_bytes());
    buf.extend_from_slice(&header.len.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_outer(bytes: &[u8]) -> Result<(OuterHeader, &[u8])> {
    if bytes.len() < OUTER_HEADER_LEN {
        return Err(Error::Truncated(format!(
            "need {OUTER_HEADER_LEN} outer header bytes, got {}",
            bytes.len()
        )));
    }
    let msg_type = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let flags = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let len = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let end = OUTER_HEADER_LEN
        .checked_add(len as usize)
        .ok_or_else(|| Error::Truncated("outer len overflow".into()))?;
    if bytes.len() < end {
        return Err(Error::Truncated("outer payload shorter than declared len".into()));
    }
    Ok((OuterHeader { msg_type, flags, len }, &bytes[OUTER_HEADER_LEN..end]))
}

/// A named server factory: how to build the `FunctionTable`/pool layout
/// for one service type (§4.8 `ServiceDef`).
pub struct ServiceDef {
    pub name: String,
    pub static_slots_factory: Arc<dyn Fn() -> Vec<StaticSlotSpec> + Send + Sync>,
    pub pools_factory: Arc<dyn Fn() -> Vec<WorkerPoolConfig> + Send + Sync>,
}

struct Instance {
    server: Server,
    /// Kept for diagnostics; the tuple's key is the client's own address.
    #[allow(dead_code)]
    endpoint_port: u16,
}

/// Construction parameters for a [`ServiceManager`] (§4.11 ambient config;
/// `max_services` corresponds to the original's `MAX_TUPLES = 256`, kept
/// configurable per `spec.md` §9 Open Questions rather than hard-coded).
pub struct ServiceManagerConfig {
    pub transport: Arc<dyn Transport>,
    pub services: Vec<ServiceDef>,
    pub max_services: usize,
    /// Mints a fresh, independent transport endpoint for each connected
    /// service instance (e.g. `LoopbackNetwork::endpoint` or
    /// `UdpTransport::bind` wrapped in a closure).
    pub new_endpoint: Arc<dyn Fn() -> Result<Arc<dyn Transport>> + Send + Sync>,
}

impl ServiceManagerConfig {
    pub fn new(
        transport: Arc<dyn Transport>,
        new_endpoint: Arc<dyn Fn() -> Result<Arc<dyn Transport>> + Send + Sync>,
    ) -> Self {
        ServiceManagerConfig {
            transport,
            services: Vec::new(),
            max_services: 256,
            new_endpoint,
        }
    }
}

/// Listens on a fixed well-known endpoint and lazily spawns server
/// instances by name on `CONN_REQ` (§4.8).
pub struct ServiceManager {
    transport: Arc<dyn Transport>,
    services: HashMap<String, ServiceDef>,
    max_services: usize,
    new_endpoint: Arc<dyn Fn() -> Result<Arc<dyn Transport>> + Send + Sync>,
    instances: Mutex<HashMap<Address, Instance>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(config: ServiceManagerConfig) -> Self {
        let services = config.services.into_iter().map(|s| (s.name.clone(), s)).collect();
        ServiceManager {
            transport: config.transport,
            services,
            max_services: config.max_services,
            new_endpoint: config.new_endpoint,
            instances: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Publishes `rpmsg-omx` on this manager's own port and starts serving
    /// `CONN_REQ`/`DISC_REQ` on a dedicated thread (§4.8 "On start...").
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let port = self.transport.local_addr().port();
        self.transport.announce("rpmsg-omx", port)?;

        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("service-manager".into())
            .spawn(move || manager.serve_loop())
            .map_err(|_| Error::NoMemory)?;
        *self.dispatcher.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn serve_loop(&self) {
        loop {
            match self.transport.recv(None) {
                Ok((bytes, src)) => self.handle_message(&bytes, src),
                Err(Error::Unblocked) => break,
                Err(Error::Timeout) => continue,
                Err(e) => warn!("service manager: recv failed: {e}"),
            }
        }
    }

    fn handle_message(&self, bytes: &[u8], src: Address) {
        let (header, payload) = match decode_outer(bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("service manager: dropping undecodable message from {src}: {e}");
                return;
            }
        };
        let msg_type = match OmxType::try_from(header.msg_type) {
            Ok(t) => t,
            Err(_) => {
                self.reply_not_supp(src);
                return;
            }
        };
        match msg_type {
            OmxType::ConnReq => self.handle_conn_req(payload, src),
            OmxType::DiscReq => self.handle_disc_req(payload, src),
            OmxType::PingMsg => self.handle_ping(payload, src),
            _ => self.reply_not_supp(src),
        }
    }

    fn handle_conn_req(&self, payload: &[u8], src: Address) {
        let name = std::ffi::CStr::from_bytes_until_nul(payload)
            .map(|c| c.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned());

        let (status, new_endpoint_port) = self.connect(&name, src);
        debug!("service manager: CONN_REQ {name} from {src} -> {status:?}");

        let mut reply_payload = vec![0u8; 8];
        reply_payload[0..4].copy_from_slice(&(status as u32).to_le_bytes());
        reply_payload[4..8].copy_from_slice(&(new_endpoint_port as u32).to_le_bytes());
        let reply = encode_outer(
            &OuterHeader { msg_type: OmxType::ConnRsp as u32, flags: 0, len: reply_payload.len() as u32 },
            &reply_payload,
        );
        if let Err(e) = self.transport.send(src, &reply) {
            warn!("service manager: failed to reply to {src}: {e}");
        }
    }

    /// Instantiates `name` on a freshly minted endpoint distinct from this
    /// manager's own listening port, so the new server's RCM traffic never
    /// contends with this manager's CONN_REQ/DISC_REQ control channel
    /// (§4.8 `CONN_RSP{status, new_endpoint}`). Returns the new endpoint's
    /// port on success, `0` otherwise.
    fn connect(&self, name: &str, src: Address) -> (ConnStatus, u16) {
        let Some(service) = self.services.get(name) else {
            return (ConnStatus::NotSupp, 0);
        };

        let mut instances = self.instances.lock().unwrap();
        if instances.len() >= self.max_services {
            return (ConnStatus::Fail, 0);
        }

        let instance_transport = match (self.new_endpoint)() {
            Ok(t) => t,
            Err(e) => {
                warn!("service manager: failed to mint endpoint for {name}: {e}");
                return (ConnStatus::Fail, 0);
            }
        };
        let instance_port = instance_transport.local_addr().port();

        let mut config = ServerConfig::new(name);
        config.static_slots = (service.static_slots_factory)();
        let pools = (service.pools_factory)();
        if !pools.is_empty() {
            config.pools = pools;
        }

        let server = match Server::new(config, instance_transport) {
            Ok(mut server) => {
                server.start();
                server
            }
            Err(e) => {
                warn!("service manager: failed to construct service {name}: {e}");
                return (ConnStatus::Fail, 0);
            }
        };

        instances.insert(src, Instance { server, endpoint_port: instance_port });
        (ConnStatus::Success, instance_port)
    }

    fn handle_disc_req(&self, _payload: &[u8], src: Address) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.remove(&src) {
            instance.server.shutdown();
        }
        // §4.8: "no reply" on DISC_REQ.
    }

    fn handle_ping(&self, payload: &[u8], src: Address) {
        let reply = encode_outer(
            &OuterHeader { msg_type: OmxType::PongMsg as u32, flags: 0, len: payload.len() as u32 },
            payload,
        );
        if let Err(e) = self.transport.send(src, &reply) {
            warn!("service manager: failed to pong {src}: {e}");
        }
    }

    fn reply_not_supp(&self, src: Address) {
        let mut payload = vec![0u8; 8];
        payload[0..4].copy_from_slice(&(ConnStatus::NotSupp as u32).to_le_bytes());
        let reply = encode_outer(
            &OuterHeader { msg_type: OmxType::ConnRsp as u32, flags: 0, len: payload.len() as u32 },
            &payload,
        );
        let _ = self.transport.send(src, &reply);
    }

    pub fn service_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            self.transport.unblock();
            let _ = handle.join();
        }
        info!("service manager: shutting down {} live instance(s)", self.instances.lock().unwrap().len());
        for (_key, instance) in self.instances.lock().unwrap().drain() {
            instance.server.shutdown();
        }
    }
}
