//! Remote Command Message (RCM) RPC layer.
//!
//! A lightweight RPC facility between a host application (the [`client`])
//! and a remote processor running a cooperative, multithreaded kernel (the
//! [`server`]). Clients marshal a function index plus a payload into a
//! fixed-header [`Packet`](packet::Packet), send it over a [`Transport`],
//! and get back a packet carrying the callee's return code and any
//! out-bound payload.
//!
//! See `SPEC_FULL.md` in the repository root for the full design.

pub mod client;
pub mod error;
pub mod function_table;
pub mod job_registry;
pub mod packet;
pub mod resource_client;
pub mod server;
pub mod service_manager;
pub mod sync;
pub mod transport;
pub mod worker_pool;

pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use packet::Packet;
pub use resource_client::{ResourceClient, ResourceReply, ResourceRequest};
pub use server::{Server, ServerConfig};
pub use service_manager::{ServiceManager, ServiceManagerConfig};
pub use transport::Transport;

/// Reserved job id meaning "no ordering requirement" (§6, `JOB_ID_DISCRETE`).
pub const JOB_ID_DISCRETE: u16 = 0;

/// Sentinel `msg_id` meaning "invalid" (§6, `INVALID_MSG_ID`).
pub const INVALID_MSG_ID: u16 = 0;

/// All-ones function index meaning "unset" (§6, `INVALID_FXN_IDX`).
pub const INVALID_FXN_IDX: u32 = 0xFFFF_FFFF;

/// High bit of a wire pool id marks it as a static pool (§6, `POOL_ID_DEFAULT`).
pub const POOL_ID_DEFAULT: u16 = 0x8000;
