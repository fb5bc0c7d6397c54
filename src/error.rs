//! Crate-wide error type.
//!
//! Mirrors the error kinds enumerated in the RCM design (packet codec
//! failures, function table lookups, job/pool dispatch failures, and the
//! ambient transport/IO failures the distilled protocol treats as fatal).

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in an RCM client or server.
#[derive(Debug, Error)]
pub enum Error {
    /// A packet byte slice was shorter than its declared header or payload.
    #[error("truncated packet: {0}")]
    Truncated(String),

    /// A caller-supplied argument violated a precondition (e.g. registering
    /// a `Create` handler outside static slot 0).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `fxn_idx` did not resolve to a live slot (bad offset, sub-table, or
    /// stale key).
    #[error("invalid function index")]
    InvalidFxn,

    /// `resolve_name` found no slot with the requested name.
    #[error("symbol not found")]
    SymbolNotFound,

    /// `remove` was called on a static slot.
    #[error("cannot remove a static symbol")]
    SymbolStatic,

    /// All eight dynamic sub-tables are fully populated.
    #[error("symbol table full")]
    SymbolTableFull,

    /// The service manager's bounded instance table has no free slot.
    #[error("service table full")]
    ServiceTableFull,

    /// Allocation failed (table growth, packet payload, recipient list).
    #[error("out of memory")]
    NoMemory,

    /// `JobRegistry::acquire` could not find a free id within one full
    /// scan of the 16-bit space.
    #[error("no job ids available")]
    JobIdExhausted,

    /// `JobRegistry::dispatch`/`release` referenced an unknown job id.
    #[error("job id not found")]
    JobNotFound,

    /// A packet named a pool id with no corresponding configured pool.
    #[error("pool id not found")]
    PoolNotFound,

    /// The callee handler returned a negative result code.
    #[error("message function error: {0}")]
    MessageFunctionError(i32),

    /// Generic server-side failure status (`ERROR` on the wire).
    #[error("server error")]
    ServerError,

    /// A reply arrived bearing an unrecognised message type on the request
    /// path, or a status outside `0..=15` on the reply path.
    #[error("invalid message type")]
    InvalidMsgType,

    /// `wait_for`'s transport reader observed a gap it cannot account for:
    /// the transport reported success but delivered no bytes, or reported
    /// a non-timeout error mid-read.
    #[error("message lost")]
    MessageLost,

    /// No server is registered under the requested name.
    #[error("server not found")]
    ServerNotFound,

    /// A feature the original left unimplemented (callback-mode clients,
    /// `SYM_ADD`).
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// A blocking operation exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// `Transport::unblock` fired; the caller should check its shutdown
    /// flag rather than treat this as a real failure.
    #[error("transport unblocked")]
    Unblocked,

    /// The in-process channel backing a queue/pool was disconnected
    /// because its owning thread exited.
    #[error("internal channel closed")]
    ChannelClosed,

    /// Underlying transport I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An `std::io::Error` surfaced from a transport implementation.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `ResourceClient` peer errno-like code: the requested resource does
    /// not exist.
    #[error("no such resource")]
    NoResource,

    /// `ResourceClient` peer errno-like code: the broker is out of memory.
    #[error("resource broker out of memory")]
    OutOfMemory,

    /// `ResourceClient` peer errno-like code: the resource is already
    /// held by another owner.
    #[error("resource busy")]
    Busy,

    /// `ResourceClient` peer errno-like code: the request payload was
    /// malformed.
    #[error("invalid resource request arguments")]
    InvalidArgs,
}
