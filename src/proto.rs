use bytes::BytesMut;
use logbus_rpc_core::error::RpcError;
use std::fmt;
use std::mem::size_of;
use zerocopy::byteorder::{BigEndian, I32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Ref, Unaligned};

/// Discriminator at offset 8 of every frame.
///
/// COMPLETE only ever terminates a streaming reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Request = 1,
    Response = 2,
    Error = 3,
    Complete = 4,
}

impl TryFrom<u8> for MsgKind {
    type Error = RpcError;

    #[inline]
    fn try_from(b: u8) -> Result<Self, RpcError> {
        match b {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Error),
            4 => Ok(Self::Complete),
            _ => Err(RpcError::MalformedFrame("unknown message kind")),
        }
    }
}

/// Fixed head = 12B
/// | 8B         | 1B   | 3B       |
/// | request_id | kind | reserved |
///
/// Followed by three i32-length-prefixed sections:
/// service name (utf-8), method name (utf-8), payload.
/// All integers big-endian. Reserved bytes are written as zero and
/// ignored on read.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, PartialEq, Clone, Copy)]
#[repr(C)]
pub struct MsgHead {
    pub request_id: U64<BigEndian>,
    pub kind: u8,
    pub reserved: [u8; 3],
}

pub const RPC_HEAD_LEN: usize = size_of::<MsgHead>();

const SECTION_LEN: usize = size_of::<I32<BigEndian>>();

/// Total frame size for the given variable sections.
#[inline]
pub fn wire_len(service: &str, method: &str, payload_len: usize) -> usize {
    RPC_HEAD_LEN
        + SECTION_LEN
        + service.len()
        + SECTION_LEN
        + method.len()
        + SECTION_LEN
        + payload_len
}

/// Append one frame to `buf`. The payload bytes are copied exactly once.
pub fn encode_into(
    buf: &mut BytesMut, request_id: u64, kind: MsgKind, service: &str, method: &str,
    payload: &[u8],
) {
    buf.reserve(wire_len(service, method, payload.len()));
    let head = MsgHead { request_id: U64::new(request_id), kind: kind as u8, reserved: [0u8; 3] };
    buf.extend_from_slice(head.as_bytes());
    put_section(buf, service.as_bytes());
    put_section(buf, method.as_bytes());
    put_section(buf, payload);
}

#[inline]
fn put_section(buf: &mut BytesMut, bytes: &[u8]) {
    buf.extend_from_slice(I32::<BigEndian>::new(bytes.len() as i32).as_bytes());
    buf.extend_from_slice(bytes);
}

/// An owned RPC message, mostly used by construction sites and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub request_id: u64,
    pub kind: MsgKind,
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
}

impl RpcMessage {
    #[inline]
    pub fn wire_len(&self) -> usize {
        wire_len(&self.service, &self.method, self.payload.len())
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        encode_into(&mut buf, self.request_id, self.kind, &self.service, &self.method, &self.payload);
        buf
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[id:{}, kind:{:?}, service:{}, method:{}, payload:{}B]",
            self.request_id,
            self.kind,
            self.service,
            self.method,
            self.payload.len()
        )
    }
}

/// Borrowed view of a decoded frame.
///
/// The slices point into the transport-owned buffer; callers copy the
/// payload out before handing it past the poll cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpcFrame<'a> {
    pub request_id: u64,
    pub kind: MsgKind,
    pub service: &'a str,
    pub method: &'a str,
    pub payload: &'a [u8],
}

impl<'a> RpcFrame<'a> {
    /// Every declared length is validated against the remaining slice;
    /// a frame whose sections overrun the buffer never reads past it.
    pub fn decode(buf: &'a [u8]) -> Result<Self, RpcError> {
        let (head, mut rest) = Ref::<_, MsgHead>::new_from_prefix(buf)
            .ok_or(RpcError::MalformedFrame("frame shorter than fixed head"))?;
        let kind = MsgKind::try_from(head.kind)?;
        let service = take_str(&mut rest)?;
        let method = take_str(&mut rest)?;
        let payload = take_section(&mut rest)?;
        Ok(Self { request_id: head.request_id.get(), kind, service, method, payload })
    }

    pub fn to_owned(&self) -> RpcMessage {
        RpcMessage {
            request_id: self.request_id,
            kind: self.kind,
            service: self.service.to_string(),
            method: self.method.to_string(),
            payload: self.payload.to_vec(),
        }
    }
}

fn take_section<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8], RpcError> {
    let (len, after) = Ref::<_, I32<BigEndian>>::new_from_prefix(*rest)
        .ok_or(RpcError::MalformedFrame("truncated length prefix"))?;
    let len = len.get();
    if len < 0 {
        return Err(RpcError::MalformedFrame("negative section length"));
    }
    let len = len as usize;
    if after.len() < len {
        return Err(RpcError::MalformedFrame("section length overruns frame"));
    }
    let (section, tail) = after.split_at(len);
    *rest = tail;
    Ok(section)
}

#[inline]
fn take_str<'a>(rest: &mut &'a [u8]) -> Result<&'a str, RpcError> {
    std::str::from_utf8(take_section(rest)?)
        .map_err(|_| RpcError::MalformedFrame("name section is not valid utf-8"))
}
