//! Server-side dispatcher: function table, worker pools, job registry, and
//! the main dispatch loop (§4.3–§4.6).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::function_table::{FunctionTable, PlainHandler, Resolved, StaticSlotSpec};
use crate::job_registry::{Inbound, JobRegistry};
use crate::packet::{self, DescType, Packet, Status};
use crate::transport::{Address, Transport};
use crate::worker_pool::{PoolHandle, WorkerPool, WorkerPoolConfig};
use crate::JOB_ID_DISCRETE;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Construction parameters for a [`Server`] (§3 `Server`, §4.3, §4.4).
pub struct ServerConfig {
    pub name: String,
    pub static_slots: Vec<StaticSlotSpec>,
    pub pools: Vec<WorkerPoolConfig>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ServerConfig {
            name: name.into(),
            static_slots: Vec::new(),
            pools: vec![WorkerPoolConfig::new("default", 4)],
        }
    }
}

/// Dispatcher lifecycle states (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Constructed,
    Running,
    Draining,
    Terminated,
}

struct ServerShared {
    name: String,
    instance_id: u64,
    function_table: Mutex<FunctionTable>,
    jobs: Mutex<JobRegistry>,
    pool_handles: Vec<PoolHandle<Inbound>>,
    inline_pools: Vec<bool>,
    transport: Arc<dyn Transport>,
}

impl ServerShared {
    fn pool_index(&self, wire_pool_id: u16) -> Option<usize> {
        if wire_pool_id & crate::POOL_ID_DEFAULT == 0 {
            return None; // dynamic pool ids are reserved, unsupported (§4.4)
        }
        let offset = (wire_pool_id & 0x00FF) as usize;
        (offset < self.pool_handles.len()).then_some(offset)
    }

    fn send_reply(&self, dst: Address, packet: &Packet) {
        if let Err(e) = self.transport.send(dst, &packet.encode()) {
            error!("{}: failed to reply to {dst}: {e}", self.name);
        }
    }

    fn reply_status(&self, inbound: Inbound, status: Status) {
        let mut header = inbound.packet.header;
        header.desc = packet::set_status(header.desc, status);
        let reply = Packet::new(header, inbound.packet.data);
        self.send_reply(inbound.reply_addr, &reply);
    }
}

/// A handle given to `CreateFxn` handlers (static slot 0) so a
/// construction function can retain server identity for later callbacks
/// (§3 `FunctionSlot`).
#[derive(Clone)]
pub struct ServerHandle(Arc<ServerShared>);

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn instance_id(&self) -> u64 {
        self.0.instance_id
    }

    /// Registers a new dynamic handler on this running server.
    pub fn add_symbol(&self, name: impl Into<String>, handler: PlainHandler) -> Result<u32> {
        self.0.function_table.lock().unwrap().add(name.into(), handler)
    }

    /// Removes a dynamic handler by name.
    pub fn remove_symbol(&self, name: &str) -> Result<()> {
        self.0.function_table.lock().unwrap().remove(name)
    }
}

/// A running (or stopped) RCM server instance (§3 `Server`).
pub struct Server {
    shared: Arc<ServerShared>,
    pools: Vec<WorkerPool<Inbound>>,
    dispatcher_thread: Option<JoinHandle<()>>,
    shutdown_flag: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    state: ServerState,
}

impl Server {
    /// Builds the function table and pools but does not yet start the
    /// dispatcher thread (`Constructed`, §4.6).
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        if config.pools.is_empty() {
            return Err(Error::InvalidArgument("at least one pool (the default) is required".into()));
        }
        let function_table = FunctionTable::new(config.static_slots)?;
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst);

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let function_table = Mutex::new(function_table);

        let inline_pools: Vec<bool> = config.pools.iter().map(|p| p.count == 0).collect();

        let mut pools = Vec::with_capacity(config.pools.len());
        let mut pool_handles = Vec::with_capacity(config.pools.len());

        // Each pool's worker closure needs a ServerHandle to reach the
        // function table and job registry, but ServerShared isn't built
        // until every pool's handle exists. Give the closures a cell to
        // read from instead, and publish ServerShared into it right after.
        let shared_cell: Arc<Mutex<Option<Arc<ServerShared>>>> = Arc::new(Mutex::new(None));

        for (index, pool_config) in config.pools.into_iter().enumerate() {
            let wire_id = crate::POOL_ID_DEFAULT | (index as u16);
            let shared_cell = Arc::clone(&shared_cell);
            let pool = WorkerPool::start(pool_config, move |inbound: Inbound| {
                // spin-free: by the time any item is posted, ServerShared
                // has been published (pools cannot receive work before
                // `start()` returns, and nothing posts to them before
                // `Server::new` returns).
                let shared = shared_cell
                    .lock()
                    .unwrap()
                    .clone()
                    .expect("ServerShared published before any dispatch");
                run_job_chain(&shared, inbound, wire_id);
            });
            pool_handles.push(pool.handle());
            pools.push(pool);
        }

        let shared = Arc::new(ServerShared {
            name: config.name,
            instance_id,
            function_table,
            jobs: Mutex::new(JobRegistry::new()),
            pool_handles,
            inline_pools,
            transport: Arc::clone(&transport),
        });
        *shared_cell.lock().unwrap() = Some(Arc::clone(&shared));

        Ok(Server {
            shared,
            pools,
            dispatcher_thread: None,
            shutdown_flag,
            transport,
            state: ServerState::Constructed,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// A handle usable from a `CreateFxn` (or any external caller that
    /// needs to register symbols on this server).
    pub fn handle(&self) -> ServerHandle {
        ServerHandle(Arc::clone(&self.shared))
    }

    /// Spawns the dispatcher thread (`Constructed -> Running`, §4.6).
    pub fn start(&mut self) {
        assert_eq!(self.state, ServerState::Constructed, "Server::start called twice");
        let shared = Arc::clone(&self.shared);
        let transport = Arc::clone(&self.transport);
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let name = self.shared.name.clone();

        self.dispatcher_thread = Some(
            std::thread::Builder::new()
                .name(format!("{name}-dispatcher"))
                .spawn(move || dispatch_loop(&shared, transport.as_ref(), &shutdown_flag))
                .expect("failed to spawn dispatcher thread"),
        );
        self.state = ServerState::Running;
    }

    /// Cooperative shutdown (§4.6, §5): unblock the transport, join the
    /// dispatcher, flush every still-registered job's pending packets with
    /// `UNPROCESSED`, then join every worker pool.
    pub fn shutdown(mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.transport.unblock();
        self.state = ServerState::Draining;
        if let Some(handle) = self.dispatcher_thread.take() {
            let _ = handle.join();
        }

        let job_ids = self.shared.jobs.lock().unwrap().ids();
        for job_id in job_ids {
            let leftover = match self.shared.jobs.lock().unwrap().release(job_id) {
                Ok(leftover) => leftover,
                Err(_) => continue,
            };
            for inbound in leftover {
                debug!("{}: flushing job {job_id} packet as UNPROCESSED", self.shared.name);
                self.shared.reply_status(inbound, Status::Unprocessed);
            }
        }

        for pool in self.pools.drain(..) {
            pool.shutdown();
        }
        self.state = ServerState::Terminated;
    }
}

fn dispatch_loop(shared: &Arc<ServerShared>, transport: &dyn Transport, shutdown_flag: &AtomicBool) {
    loop {
        match transport.recv(None) {
            Ok((bytes, src)) => match Packet::decode(&bytes) {
                Ok(packet) => handle_packet(shared, Inbound { packet, reply_addr: src }),
                Err(e) => warn!("{}: dropping undecodable packet from {src}: {e}", shared.name),
            },
            Err(Error::Unblocked) => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(Error::Timeout) => continue,
            Err(e) => error!("{}: transport recv failed: {e}", shared.name),
        }
    }
}

fn handle_packet(shared: &Arc<ServerShared>, inbound: Inbound) {
    let desc_type = match packet::get_type(inbound.packet.header.desc) {
        Ok(t) => t,
        Err(_) => {
            shared.reply_status(inbound, Status::InvalidMsgType);
            return;
        }
    };
    match desc_type {
        DescType::Msg => handle_msg(shared, inbound),
        DescType::Cmd => handle_cmd(shared, inbound),
        DescType::Dpc => handle_dpc(shared, inbound),
        DescType::SymIdx => handle_sym_idx(shared, inbound),
        DescType::SymAdd => debug!("{}: SYM_ADD reserved, ignoring", shared.name),
        DescType::JobAcq => handle_job_acq(shared, inbound),
        DescType::JobRel => handle_job_rel(shared, inbound),
    }
}

fn handle_msg(shared: &Arc<ServerShared>, inbound: Inbound) {
    let wire_pool_id = inbound.packet.header.pool_id();
    let Some(pool_index) = shared.pool_index(wire_pool_id) else {
        shared.reply_status(inbound, Status::PoolNotFound);
        return;
    };

    if shared.inline_pools[pool_index] {
        run_job_chain(shared, inbound, wire_pool_id);
        return;
    }

    let job_id = inbound.packet.header.job_id();
    let mut jobs = shared.jobs.lock().unwrap();
    if job_id != JOB_ID_DISCRETE && !jobs.contains(job_id) {
        drop(jobs);
        shared.reply_status(inbound, Status::JobNotFound);
        return;
    }
    let ready = jobs.dispatch(inbound);
    drop(jobs);
    match ready {
        Ok(Some(inbound)) => shared.pool_handles[pool_index].dispatch(inbound),
        Ok(None) => {} // queued behind an in-flight packet on the same job
        Err(e) => error!("{}: unexpected job dispatch error: {e}", shared.name),
    }
}

fn handle_cmd(shared: &Arc<ServerShared>, inbound: Inbound) {
    let Inbound { mut packet, reply_addr } = inbound;
    let fxn_idx = packet.header.fxn_idx;
    let (result, status) = execute(shared, fxn_idx, &mut packet.data);
    packet.header.result = result;
    if status != Status::Success {
        packet.header.desc = packet::set_status(packet.header.desc, status);
        shared.send_reply(reply_addr, &packet);
    }
    // success: one-way command, no reply (§4.6)
}

/// Resolves `fxn_idx` and replies with the real status before invoking the
/// handler, mirroring `RcmServer_process`'s `RcmClient_Desc_DPC` case: the
/// reply carries the caller's real outcome (resolution success/failure),
/// and only then is the handler invoked with an empty payload, its result
/// discarded since a DPC call is one-way by design (§4.6).
fn handle_dpc(shared: &Arc<ServerShared>, inbound: Inbound) {
    let Inbound { mut packet, reply_addr } = inbound;
    let fxn_idx = packet.header.fxn_idx;
    let resolved = shared.function_table.lock().unwrap().resolve_index(fxn_idx);
    let status = if resolved.is_ok() { Status::Success } else { Status::InvalidFxn };
    packet.header.desc = packet::set_status(packet.header.desc, status);
    shared.send_reply(reply_addr, &packet);

    if let Ok(resolved) = resolved {
        let mut empty = Vec::new();
        match resolved {
            Resolved::Plain(handler) => {
                handler(&mut empty);
            }
            Resolved::Create(handler) => {
                let server_handle = ServerHandle(Arc::clone(shared));
                handler(&server_handle, &mut empty);
            }
        }
    }
}

fn handle_sym_idx(shared: &Arc<ServerShared>, inbound: Inbound) {
    let Inbound { mut packet, reply_addr } = inbound;
    let name = match std::ffi::CStr::from_bytes_until_nul(&packet.data) {
        Ok(c) => c.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(&packet.data).into_owned(),
    };
    let status = match shared.function_table.lock().unwrap().resolve_name(&name) {
        Ok(idx) => {
            write_u32_le(&mut packet.data, idx);
            Status::Success
        }
        Err(_) => Status::SymbolNotFound,
    };
    packet.header.desc = packet::set_status(packet.header.desc, status);
    shared.send_reply(reply_addr, &packet);
}

fn handle_job_acq(shared: &Arc<ServerShared>, inbound: Inbound) {
    let Inbound { mut packet, reply_addr } = inbound;
    let status = match shared.jobs.lock().unwrap().acquire() {
        Ok(job_id) => {
            write_u32_le(&mut packet.data, job_id as u32);
            Status::Success
        }
        Err(_) => Status::Error,
    };
    packet.header.desc = packet::set_status(packet.header.desc, status);
    shared.send_reply(reply_addr, &packet);
}

fn handle_job_rel(shared: &Arc<ServerShared>, inbound: Inbound) {
    let Inbound { mut packet, reply_addr } = inbound;
    let job_id = read_u32_le(&packet.data) as u16;
    match shared.jobs.lock().unwrap().release(job_id) {
        Ok(leftover) => {
            for pending in leftover {
                shared.reply_status(pending, Status::Unprocessed);
            }
            packet.header.desc = packet::set_status(packet.header.desc, Status::Success);
        }
        Err(_) => {
            packet.header.desc = packet::set_status(packet.header.desc, Status::JobNotFound);
        }
    }
    shared.send_reply(reply_addr, &packet);
}

/// Executes a resolved handler, setting `packet.header.result` and the
/// reply status, and following the job-continuation chain as long as the
/// next packet targets the same pool (§4.4 "stay on-thread" optimisation)
/// — otherwise it is handed to the correct pool and this loop stops.
fn run_job_chain(shared: &Arc<ServerShared>, mut inbound: Inbound, mut current_pool_wire_id: u16) {
    loop {
        let job_id = inbound.packet.header.job_id();
        let fxn_idx = inbound.packet.header.fxn_idx;
        let (result, status) = execute(shared, fxn_idx, &mut inbound.packet.data);
        inbound.packet.header.result = result;
        inbound.packet.header.desc = packet::set_status(inbound.packet.header.desc, status);
        shared.send_reply(inbound.reply_addr, &inbound.packet);

        if job_id == JOB_ID_DISCRETE {
            return;
        }
        let next = shared.jobs.lock().unwrap().complete(job_id);
        match next {
            None => return,
            Some(next) => {
                let next_wire_id = next.packet.header.pool_id();
                if next_wire_id == current_pool_wire_id {
                    inbound = next;
                    continue;
                }
                match shared.pool_index(next_wire_id) {
                    Some(index) => {
                        shared.pool_handles[index].dispatch(next);
                    }
                    None => shared.reply_status(next, Status::PoolNotFound),
                }
                current_pool_wire_id = next_wire_id;
                return;
            }
        }
    }
}

fn execute(shared: &Arc<ServerShared>, fxn_idx: u32, payload: &mut [u8]) -> (i32, Status) {
    let resolved = shared.function_table.lock().unwrap().resolve_index(fxn_idx);
    match resolved {
        Err(_) => (0, Status::InvalidFxn),
        Ok(Resolved::Plain(handler)) => {
            let result = handler(payload);
            (result, if result < 0 { Status::MsgFxnErr } else { Status::Success })
        }
        Ok(Resolved::Create(handler)) => {
            let server_handle = ServerHandle(Arc::clone(shared));
            let result = handler(&server_handle, payload);
            (result, if result < 0 { Status::MsgFxnErr } else { Status::Success })
        }
    }
}

fn write_u32_le(data: &mut Vec<u8>, value: u32) {
    if data.len() < 4 {
        data.resize(4, 0);
    }
    data[0..4].copy_from_slice(&value.to_le_bytes());
}

fn read_u32_le(data: &[u8]) -> u32 {
    if data.len() < 4 {
        return 0;
    }
    u32::from_le_bytes(data[0..4].try_into().unwrap())
}
