//! Illustrative typed request/reply wrapper over [`crate::Client`] for an
//! off-device resource broker (§4.9, marked "illustrative" — not a core
//! protocol module).
//!
//! Round-trips a `(resource_type, request_type, resource_handle, payload)`
//! tuple to a typed acknowledgement, translating the broker's numeric
//! errno-like reply codes into domain errors and `Error::Timeout` on a
//! blocked wait that exceeds its deadline.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::{Client, ClientConfig};

/// Function index the broker's static slot 0 (a `CreateFxn`-style
/// dispatcher) is registered under on the remote server, by convention.
const RESOURCE_REQUEST_FXN: u32 = 0x8000_0000;

/// Errno-like codes the broker encodes in `reply.header.result` on failure,
/// mirrored from the negative-result convention every RCM handler uses
/// (§4.4: a negative result maps to `MsgFxnErr`).
mod errno {
    pub const NO_RESOURCE: i32 = -1;
    pub const OUT_OF_MEMORY: i32 = -2;
    pub const BUSY: i32 = -3;
    pub const INVALID_ARGS: i32 = -4;
}

/// One resource request (§4.9).
pub struct ResourceRequest {
    pub resource_type: u32,
    pub request_type: u32,
    pub resource_handle: u32,
    pub payload: Vec<u8>,
}

/// The broker's acknowledgement: an opaque payload plus the handle it was
/// issued against (a create request returns a freshly allocated handle; a
/// release echoes the one supplied).
pub struct ResourceReply {
    pub resource_handle: u32,
    pub payload: Vec<u8>,
}

fn encode_request(req: &ResourceRequest) -> Vec<u8> {
    let mut data = Vec::with_capacity(12 + req.payload.len());
    data.extend_from_slice(&req.resource_type.to_le_bytes());
    data.extend_from_slice(&req.request_type.to_le_bytes());
    data.extend_from_slice(&req.resource_handle.to_le_bytes());
    data.extend_from_slice(&req.payload);
    data
}

fn decode_reply(handle: u32, data: &[u8]) -> ResourceReply {
    ResourceReply { resource_handle: handle, payload: data.to_vec() }
}

fn translate_errno(code: i32) -> Error {
    match code {
        errno::NO_RESOURCE => Error::NoResource,
        errno::OUT_OF_MEMORY => Error::OutOfMemory,
        errno::BUSY => Error::Busy,
        errno::INVALID_ARGS => Error::InvalidArgs,
        other => Error::MessageFunctionError(other),
    }
}

/// A client specialised to the resource-broker request shape. Wraps a
/// plain [`Client`] rather than re-implementing transport/mailbox
/// handling.
pub struct ResourceClient {
    client: Client,
    timeout: Duration,
}

impl ResourceClient {
    pub fn new(config: ClientConfig, timeout: Duration) -> Result<Self> {
        Ok(ResourceClient { client: Client::new(config)?, timeout })
    }

    /// Sends one resource request and blocks (up to `self.timeout`) for
    /// the broker's typed acknowledgement, translating any errno-like
    /// failure code into a domain [`Error`] (§4.9).
    pub fn request(&self, req: ResourceRequest) -> Result<ResourceReply> {
        let handle = req.resource_handle;
        let packet = self.client.new_packet(crate::POOL_ID_DEFAULT, crate::JOB_ID_DISCRETE, encode_request(&req));

        let msg_id = self.client.exec_no_wait(packet, RESOURCE_REQUEST_FXN)?;
        let deadline = std::time::Instant::now() + self.timeout;

        // `wait_deadline` already maps non-MsgFxnErr statuses to their
        // Error variant; a MsgFxnErr status instead surfaces here as
        // Err(MessageFunctionError(result)) so the errno translation below
        // still runs on the broker's actual result code.
        match self.client.wait_deadline(msg_id, deadline) {
            Ok(reply) => Ok(decode_reply(handle, &reply.data)),
            Err(Error::MessageFunctionError(code)) => Err(translate_errno(code)),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> crate::transport::Address {
        self.client.local_addr()
    }
}
