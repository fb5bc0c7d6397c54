//! RCM packet header codec (§4.1).
//!
//! A `Packet` is a fixed 20-byte header followed by a `data_size`-byte
//! payload, little-endian, no implicit padding (§6). Encode/decode are pure
//! functions; `Packet` itself owns its payload so it can move by value
//! through worker-pool queues and the client mailbox without any shared
//! pointer bookkeeping (see `SPEC_FULL.md` §3).

use crate::error::{Error, Result};

/// Size in bytes of the fixed packet header.
pub const HEADER_LEN: usize = 20;

/// Client→server descriptor type values (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescType {
    /// Client exec message, dispatched through a pool/job stream.
    Msg = 0x1,
    /// Deferred procedure call: acknowledged before the handler runs.
    Dpc = 0x2,
    /// Reserved: dynamic symbol add. Never implemented (§1 Non-goals).
    SymAdd = 0x3,
    /// Query a symbol's function index by name.
    SymIdx = 0x4,
    /// One-way command; never replied to on success.
    Cmd = 0x5,
    /// Acquire a fresh job id.
    JobAcq = 0x6,
    /// Release a job id, flushing its pending queue.
    JobRel = 0x7,
}

impl TryFrom<u8> for DescType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0x1 => DescType::Msg,
            0x2 => DescType::Dpc,
            0x3 => DescType::SymAdd,
            0x4 => DescType::SymIdx,
            0x5 => DescType::Cmd,
            0x6 => DescType::JobAcq,
            0x7 => DescType::JobRel,
            _ => return Err(Error::InvalidMsgType),
        })
    }
}

/// Server→client status values (§6), written into the same 4-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    InvalidFxn = 1,
    SymbolNotFound = 2,
    InvalidMsgType = 3,
    MsgFxnErr = 4,
    Error = 5,
    Unprocessed = 6,
    JobNotFound = 7,
    PoolNotFound = 8,
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Status::Success,
            1 => Status::InvalidFxn,
            2 => Status::SymbolNotFound,
            3 => Status::InvalidMsgType,
            4 => Status::MsgFxnErr,
            5 => Status::Error,
            6 => Status::Unprocessed,
            7 => Status::JobNotFound,
            8 => Status::PoolNotFound,
            _ => return Err(Error::InvalidMsgType),
        })
    }
}

const TYPE_SHIFT: u16 = 8;
const TYPE_MASK: u16 = 0x0F00;
const VERSION_MASK: u16 = 0x00FF;

/// Fixed packet header (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// bits 0-7 protocol version, bits 8-11 type-or-status, 12-15 reserved.
    pub desc: u16,
    /// Nonzero on every client-originated message; 0 is `INVALID_MSG_ID`.
    pub msg_id: u16,
    /// bits 0-15 pool id, bits 16-31 job id.
    pub flags: u32,
    /// Encoded function index; `INVALID_FXN_IDX` until the caller sets it.
    pub fxn_idx: u32,
    /// Callee's signed return code.
    pub result: i32,
    /// Declared payload length; must equal the transmitted payload.
    pub data_size: u32,
}

impl Header {
    /// Builds a request header with version 1, type `Msg`, and a fresh
    /// `msg_id`. Caller fills in `fxn_idx`, `flags`, and payload length.
    pub fn new_request(msg_id: u16) -> Self {
        let mut desc = 1u16; // protocol version
        desc = set_type(desc, DescType::Msg);
        Header {
            desc,
            msg_id,
            flags: 0,
            fxn_idx: crate::INVALID_FXN_IDX,
            result: 0,
            data_size: 0,
        }
    }

    /// Low byte of `desc`: the protocol version.
    pub fn version(&self) -> u8 {
        (self.desc & VERSION_MASK) as u8
    }

    /// Pool id carried in the low 16 bits of `flags`.
    pub fn pool_id(&self) -> u16 {
        (self.flags & 0xFFFF) as u16
    }

    /// Job id carried in the high 16 bits of `flags`.
    pub fn job_id(&self) -> u16 {
        (self.flags >> 16) as u16
    }

    /// Rewrites the pool/job id pair.
    pub fn set_pool_job(&mut self, pool_id: u16, job_id: u16) {
        self.flags = (pool_id as u32) | ((job_id as u32) << 16);
    }
}

/// Reads bits 8-11 of `desc` as a request type. Fails if the value is not
/// one of the seven recognised types (§6).
pub fn get_type(desc: u16) -> Result<DescType> {
    DescType::try_from(((desc & TYPE_MASK) >> TYPE_SHIFT) as u8)
}

/// Overwrites bits 8-11 of `desc` with a request type, leaving the version
/// and reserved bits untouched.
pub fn set_type(desc: u16, t: DescType) -> u16 {
    (desc & !TYPE_MASK) | (((t as u16) << TYPE_SHIFT) & TYPE_MASK)
}

/// Reads bits 8-11 of `desc` as a reply status (0..=15, §4.1).
pub fn get_status(desc: u16) -> Result<Status> {
    Status::try_from(((desc & TYPE_MASK) >> TYPE_SHIFT) as u8)
}

/// Clears the prior type field and writes a reply status (§5: "descriptor
/// type field must be cleared before the status field is written so the
/// caller cannot observe a hybrid value" — a single masked write already
/// satisfies that atomically from the caller's point of view).
pub fn set_status(desc: u16, s: Status) -> u16 {
    (desc & !TYPE_MASK) | (((s as u16) << TYPE_SHIFT) & TYPE_MASK)
}

/// Sequential `msg_id` generator. Wraps from `0xFFFF` back to `1`, never
/// emitting `0` (P2).
pub fn gen_msg_id(next: &mut u16) -> u16 {
    let id = *next;
    *next = if *next == 0xFFFF { 1 } else { *next + 1 };
    id
}

/// An owned RCM packet: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub data: Vec<u8>,
}

impl Packet {
    /// Builds a packet, setting `data_size` from the payload length.
    pub fn new(mut header: Header, data: Vec<u8>) -> Self {
        header.data_size = data.len() as u32;
        Packet { header, data }
    }

    /// Serialises header + payload into a contiguous little-endian frame.
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.header, &self.data)
    }

    /// Parses a frame produced by [`Packet::encode`] / [`encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, data) = decode(bytes)?;
        Ok(Packet {
            header,
            data: data.to_vec(),
        })
    }
}

/// Encodes a header and payload into one little-endian byte buffer.
pub fn encode(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.desc.to_le_bytes());
    buf.extend_from_slice(&header.msg_id.to_le_bytes());
    buf.extend_from_slice(&header.flags.to_le_bytes());
    buf.extend_from_slice(&header.fxn_idx.to_le_bytes());
    buf.extend_from_slice(&header.result.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a header and a borrowed payload slice out of `bytes`.
///
/// Fails with [`Error::Truncated`] when `bytes` is shorter than the fixed
/// header, or shorter than header + declared `data_size`.
pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Truncated(format!(
            "need {HEADER_LEN} header bytes, got {}",
            bytes.len()
        )));
    }
    let desc = u16::from_le_bytes([bytes[0], bytes[1]]);
    let msg_id = u16::from_le_bytes([bytes[2], bytes[3]]);
    let flags = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let fxn_idx = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let result = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let data_size = u32::from_le_bytes(bytes[16..20].try_into().unwrap());

    let end = HEADER_LEN
        .checked_add(data_size as usize)
        .ok_or_else(|| Error::Truncated("data_size overflow".into()))?;
    if bytes.len() < end {
        return Err(Error::Truncated(format!(
            "need {end} total bytes, got {}",
            bytes.len()
        )));
    }

    let header = Header {
        desc,
        msg_id,
        flags,
        fxn_idx,
        result,
        data_size,
    };
    Ok((header, &bytes[HEADER_LEN..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        let mut h = Header::new_request(42);
        h.set_pool_job(crate::POOL_ID_DEFAULT, 7);
        h.fxn_idx = 0x8000_0003;
        h.result = -1;
        h
    }

    #[test]
    fn round_trip_encode_decode() {
        // P4
        let header = sample_header();
        let payload = vec![1, 2, 3, 4, 5];
        let packet = Packet::new(header, payload.clone());
        let bytes = packet.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.header, packet.header);
        assert_eq!(decoded.data, payload);
    }

    #[test]
    fn round_trip_empty_payload() {
        let header = sample_header();
        let packet = Packet::new(header, vec![]);
        let bytes = packet.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_rejects_short_header() {
        let err = decode(&[0u8; HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, Error::Truncated(_)));
    }

    #[test]
    fn decode_rejects_short_payload() {
        let header = sample_header();
        let mut bytes = encode(&header, &[1, 2, 3]);
        bytes.truncate(bytes.len() - 1);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Truncated(_)));
    }

    #[test]
    fn status_round_trip() {
        // P5
        for raw in 0u8..=8 {
            let status = Status::try_from(raw).unwrap();
            let desc = set_status(0x01FF, status);
            assert_eq!(get_status(desc).unwrap() as u8, raw);
        }
    }

    #[test]
    fn set_status_clears_prior_type() {
        let desc = set_type(0x0001, DescType::JobRel);
        assert_eq!(get_type(desc).unwrap(), DescType::JobRel);
        let desc = set_status(desc, Status::PoolNotFound);
        assert_eq!(get_status(desc).unwrap(), Status::PoolNotFound);
        // version byte untouched
        assert_eq!(desc & VERSION_MASK, 0x0001);
    }

    #[test]
    fn msg_id_sequence_skips_zero_and_wraps() {
        // P2
        let mut next: u16 = 0xFFFE;
        assert_eq!(gen_msg_id(&mut next), 0xFFFE);
        assert_eq!(gen_msg_id(&mut next), 0xFFFF);
        assert_eq!(gen_msg_id(&mut next), 1);
        assert_eq!(gen_msg_id(&mut next), 2);
    }
}
