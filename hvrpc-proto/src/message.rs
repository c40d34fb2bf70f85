//! Fixed-layout message header, buffer descriptors and the message itself.
//!
//! Header layout (64 bytes, little-endian):
//!
//! ```text
//! off  size  field
//!   0     4  magic          0xCAFEBABE
//!   4     4  version        1
//!   8     4  message kind   REQUEST / RESPONSE / ERROR
//!  12     4  api id         ECHO / BUFFER_TEST / PERF_TEST
//!  16     8  request id
//!  24     4  buffer count
//!  28     4  inline size
//!  32     4  error code     (signed)
//!  36     4  flags
//!  40     8  timestamp      (ns)
//!  48    16  reserved       (zero)
//! ```

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::payload::Payload;

/// Magic constant opening every valid message.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Size of one buffer descriptor slot in bytes.
pub const DESC_SIZE: usize = 16;

/// Number of buffer descriptor slots per message.
pub const MAX_BUFFERS: usize = 8;

/// Capacity of the inline payload region in bytes.
pub const MAX_INLINE: usize = 3072;

/// Largest region a single descriptor may reference (64 MiB).
pub const MAX_BUFFER_SIZE: u32 = 64 * 1024 * 1024;

/// Total encoded size of every message, independent of its contents.
pub const MESSAGE_SIZE: usize = HEADER_SIZE + MAX_BUFFERS * DESC_SIZE + MAX_INLINE;

/// Page granularity expected by transports for shared regions.
pub const PAGE_SIZE: usize = 4096;

/// Offset of the descriptor array within a message.
const DESC_OFFSET: usize = HEADER_SIZE;

/// Offset of the inline payload region within a message.
const INLINE_OFFSET: usize = DESC_OFFSET + MAX_BUFFERS * DESC_SIZE;

/// One encoded message.
pub type Frame = [u8; MESSAGE_SIZE];

/// Rounds `size` up to the next multiple of [`PAGE_SIZE`].
pub const fn align_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Message kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u32)]
pub enum MessageKind {
    /// Guest → host call.
    Request = 1,
    /// Host → guest reply.
    Response = 2,
    /// Host → guest rejection; the error code says why.
    Error = 3,
}

impl MessageKind {
    /// Parses a raw wire value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Remote function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u32)]
pub enum ApiId {
    /// Echo a byte string back.
    Echo = 1,
    /// Read, fill or verify shared buffers.
    BufferTest = 2,
    /// Host-side latency or throughput measurement.
    PerfTest = 3,
}

impl ApiId {
    /// Parses a raw wire value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Echo),
            2 => Some(Self::BufferTest),
            3 => Some(Self::PerfTest),
            _ => None,
        }
    }
}

/// Status codes crossing the guest/host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Api id not recognized.
    InvalidApi = -1,
    /// Malformed call parameters.
    InvalidParams = -2,
    /// The host could not map a shared buffer.
    MemoryMapFailed = -3,
    /// A shared buffer exceeds 64 MiB.
    BufferTooLarge = -4,
    /// Anything else, including a failed verification.
    Unknown = -99,
}

impl ErrorCode {
    /// Parses a raw wire value.
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            -1 => Some(Self::InvalidApi),
            -2 => Some(Self::InvalidParams),
            -3 => Some(Self::MemoryMapFailed),
            -4 => Some(Self::BufferTooLarge),
            -99 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// The raw wire value.
    pub const fn raw(self) -> i32 {
        self as i32
    }
}

/// Open bit-set of message flags.
///
/// Unknown bits are preserved so that newer peers can round-trip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageFlags(u32);

impl MessageFlags {
    /// The caller blocks until the response arrives.
    pub const SYNC: Self = Self(0x01);
    /// Reserved marker for asynchronous delivery; never set by the client.
    pub const ASYNC: Self = Self(0x02);

    /// No flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wraps raw bits, keeping any unknown ones.
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Access rights the host is granted on a shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Access(u32);

impl Access {
    /// Host reads the region.
    pub const READ: Self = Self(0x01);
    /// Host writes the region.
    pub const WRITE: Self = Self(0x02);
    /// Host reads and writes the region.
    pub const READ_WRITE: Self = Self(0x03);

    /// Wraps raw bits, keeping any unknown ones.
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether the host may read the region.
    pub const fn reads(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Whether the host may write the region.
    pub const fn writes(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

/// Reference to a shared memory region.
///
/// `reference` is an address-equivalent capability meaningful only to the
/// transport; this crate never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct BufferDesc {
    /// Opaque capability reference (an address on the guest side).
    pub reference: u64,
    /// Region size in bytes, at most [`MAX_BUFFER_SIZE`].
    pub size: u32,
    /// Access granted to the host.
    pub access: Access,
}

impl BufferDesc {
    /// Describes a region of `len` bytes, rejecting anything above 64 MiB.
    pub fn new(reference: u64, len: usize, access: Access) -> Result<Self, WireError> {
        let size = u32::try_from(len)
            .ok()
            .filter(|s| *s <= MAX_BUFFER_SIZE)
            .ok_or(WireError::BufferTooLarge(len as u64))?;
        Ok(Self {
            reference,
            size,
            access,
        })
    }

    /// Region size as a `usize`.
    pub const fn len(&self) -> usize {
        self.size as usize
    }

    /// Whether the region is empty.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Writes the 16-byte slot.
    fn encode_into(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.reference);
        put_u32(buf, 8, self.size);
        put_u32(buf, 12, self.access.bits());
    }

    /// Parses a 16-byte slot.
    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let size = get_u32(buf, 8);
        if size > MAX_BUFFER_SIZE {
            return Err(WireError::BufferTooLarge(u64::from(size)));
        }
        Ok(Self {
            reference: get_u64(buf, 0),
            size,
            access: Access::from_bits_retain(get_u32(buf, 12)),
        })
    }
}

/// Decoded message header.
///
/// Magic and version are implied: they are written on encode and checked
/// on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Header {
    /// Request, response or error.
    pub kind: MessageKind,
    /// Remote function.
    pub api: ApiId,
    /// Correlation token chosen by the caller.
    pub request_id: u64,
    /// Number of populated descriptor slots.
    pub buffer_count: u32,
    /// Number of meaningful inline bytes.
    pub inline_size: u32,
    /// Raw [`ErrorCode`] (meaningful on responses).
    pub error_code: i32,
    /// Flag bit-set.
    pub flags: MessageFlags,
    /// Send time in nanoseconds.
    pub timestamp: u64,
}

impl Header {
    /// Writes the 64-byte header, reserved bytes zeroed.
    fn encode_into(&self, buf: &mut [u8]) {
        put_u32(buf, 0, MAGIC);
        put_u32(buf, 4, PROTOCOL_VERSION);
        put_u32(buf, 8, self.kind as u32);
        put_u32(buf, 12, self.api as u32);
        put_u64(buf, 16, self.request_id);
        put_u32(buf, 24, self.buffer_count);
        put_u32(buf, 28, self.inline_size);
        buf[32..36].copy_from_slice(&self.error_code.to_le_bytes());
        put_u32(buf, 36, self.flags.bits());
        put_u64(buf, 40, self.timestamp);
        buf[48..HEADER_SIZE].fill(0);
    }

    /// Parses and validates a 64-byte header.
    ///
    /// Checks run in wire order: magic, version, kind, api, then the
    /// descriptor and inline bounds.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                len: buf.len(),
                expected: HEADER_SIZE,
            });
        }
        let magic = get_u32(buf, 0);
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = get_u32(buf, 4);
        if version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch(version));
        }
        let raw_kind = get_u32(buf, 8);
        let kind = MessageKind::from_raw(raw_kind).ok_or(WireError::UnknownKind(raw_kind))?;
        let raw_api = get_u32(buf, 12);
        let api = ApiId::from_raw(raw_api).ok_or(WireError::UnknownApi(raw_api))?;

        let buffer_count = get_u32(buf, 24);
        if buffer_count as usize > MAX_BUFFERS {
            return Err(WireError::TooManyBuffers(buffer_count as usize));
        }
        let inline_size = get_u32(buf, 28);
        if inline_size as usize > MAX_INLINE {
            return Err(WireError::InlineTooLarge(inline_size as usize));
        }

        let mut code = [0u8; 4];
        code.copy_from_slice(&buf[32..36]);

        Ok(Self {
            kind,
            api,
            request_id: get_u64(buf, 16),
            buffer_count,
            inline_size,
            error_code: i32::from_le_bytes(code),
            flags: MessageFlags::from_bits_retain(get_u32(buf, 36)),
            timestamp: get_u64(buf, 40),
        })
    }
}

/// A complete message: header, populated descriptors, inline payload.
///
/// The header's `buffer_count` and `inline_size` are kept in sync with
/// the descriptor list and payload by the mutating methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header fields.
    header: Header,
    /// Populated descriptor slots (at most [`MAX_BUFFERS`]).
    buffers: Vec<BufferDesc>,
    /// Meaningful inline bytes (at most [`MAX_INLINE`]).
    inline: Vec<u8>,
}

impl Message {
    /// Creates an empty message with the SYNC flag set.
    pub const fn new(kind: MessageKind, api: ApiId, request_id: u64) -> Self {
        Self {
            header: Header {
                kind,
                api,
                request_id,
                buffer_count: 0,
                inline_size: 0,
                error_code: ErrorCode::Ok.raw(),
                flags: MessageFlags::SYNC,
                timestamp: 0,
            },
            buffers: Vec::new(),
            inline: Vec::new(),
        }
    }

    /// Creates an empty request.
    pub const fn request(api: ApiId, request_id: u64) -> Self {
        Self::new(MessageKind::Request, api, request_id)
    }

    /// Creates an empty reply correlated with `self`.
    pub const fn reply(&self, kind: MessageKind, code: ErrorCode) -> Self {
        let mut msg = Self::new(kind, self.header.api, self.header.request_id);
        msg.header.flags = self.header.flags;
        msg.header.error_code = code.raw();
        msg
    }

    /// Header fields.
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Sets the raw error code.
    pub const fn set_error_code(&mut self, code: i32) {
        self.header.error_code = code;
    }

    /// Replaces the flag bit-set.
    pub const fn set_flags(&mut self, flags: MessageFlags) {
        self.header.flags = flags;
    }

    /// Sets the send timestamp.
    pub const fn set_timestamp(&mut self, ns: u64) {
        self.header.timestamp = ns;
    }

    /// Populated descriptors, in slot order.
    pub fn buffers(&self) -> &[BufferDesc] {
        &self.buffers
    }

    /// Appends a descriptor to the next free slot.
    pub fn push_buffer(&mut self, desc: BufferDesc) -> Result<(), WireError> {
        if self.buffers.len() == MAX_BUFFERS {
            return Err(WireError::TooManyBuffers(MAX_BUFFERS + 1));
        }
        if desc.size > MAX_BUFFER_SIZE {
            return Err(WireError::BufferTooLarge(u64::from(desc.size)));
        }
        self.buffers.push(desc);
        self.header.buffer_count = len_u32(self.buffers.len());
        Ok(())
    }

    /// Meaningful inline bytes.
    pub fn inline(&self) -> &[u8] {
        &self.inline
    }

    /// Replaces the inline payload with raw bytes.
    pub fn set_inline(&mut self, data: &[u8]) -> Result<(), WireError> {
        if data.len() > MAX_INLINE {
            return Err(WireError::InlineTooLarge(data.len()));
        }
        self.inline = data.to_vec();
        self.header.inline_size = len_u32(data.len());
        Ok(())
    }

    /// Encodes a typed payload into the inline region.
    pub fn put<P: Payload>(&mut self, payload: &P) {
        debug_assert_eq!(P::API, self.header.api);
        let mut buf = vec![0u8; P::SIZE];
        payload.write_to(&mut buf);
        self.inline = buf;
        self.header.inline_size = len_u32(P::SIZE);
    }

    /// Decodes a typed payload from the inline region.
    pub fn get<P: Payload>(&self) -> Result<P, WireError> {
        if self.inline.len() < P::SIZE {
            return Err(WireError::PayloadTooShort {
                got: self.inline.len(),
                expected: P::SIZE,
            });
        }
        P::read_from(&self.inline[..P::SIZE])
    }

    /// Encodes into a full frame; unused slots and inline bytes are zero.
    pub fn encode_into(&self, frame: &mut Frame) {
        frame.fill(0);
        self.header.encode_into(&mut frame[..HEADER_SIZE]);
        for (i, desc) in self.buffers.iter().enumerate() {
            let off = DESC_OFFSET + i * DESC_SIZE;
            desc.encode_into(&mut frame[off..off + DESC_SIZE]);
        }
        frame[INLINE_OFFSET..INLINE_OFFSET + self.inline.len()].copy_from_slice(&self.inline);
    }

    /// Encodes into a freshly allocated frame.
    pub fn to_frame(&self) -> Box<Frame> {
        let mut frame = Box::new([0u8; MESSAGE_SIZE]);
        self.encode_into(&mut frame);
        frame
    }

    /// Parses and validates a full frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < MESSAGE_SIZE {
            return Err(WireError::Truncated {
                len: bytes.len(),
                expected: MESSAGE_SIZE,
            });
        }
        let header = Header::decode(&bytes[..HEADER_SIZE])?;
        let buffers = (0..header.buffer_count as usize)
            .map(|i| {
                let off = DESC_OFFSET + i * DESC_SIZE;
                BufferDesc::decode(&bytes[off..off + DESC_SIZE])
            })
            .collect::<Result<Vec<_>, _>>()?;
        let inline = bytes[INLINE_OFFSET..INLINE_OFFSET + header.inline_size as usize].to_vec();
        Ok(Self {
            header,
            buffers,
            inline,
        })
    }
}

/// Narrows a length already bounded by the message layout.
#[allow(clippy::cast_possible_truncation)]
const fn len_u32(len: usize) -> u32 {
    len as u32
}

/// Reads a little-endian `u32` at `off`.
pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

/// Reads a little-endian `u64` at `off`.
pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Writes a little-endian `u32` at `off`.
pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Writes a little-endian `u64` at `off`.
pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{BufferOp, BufferTestReq};

    fn sample() -> Message {
        let mut msg = Message::request(ApiId::BufferTest, 0x1122_3344_5566_7788);
        msg.set_timestamp(42);
        msg.push_buffer(BufferDesc::new(0x7000, 4096, Access::READ_WRITE).unwrap())
            .unwrap();
        msg.put(&BufferTestReq {
            pattern: 0xAB,
            op: BufferOp::Write,
        });
        msg
    }

    #[test]
    fn sizes_are_fixed() {
        assert_eq!(HEADER_SIZE, 64);
        assert_eq!(MESSAGE_SIZE, 64 + 8 * 16 + 3072);
    }

    #[test]
    fn header_fields_land_at_their_offsets() {
        let frame = sample().to_frame();
        assert_eq!(frame[0..4], 0xCAFE_BABEu32.to_le_bytes());
        assert_eq!(get_u32(&frame[..], 4), 1);
        assert_eq!(get_u32(&frame[..], 8), 1);
        assert_eq!(get_u32(&frame[..], 12), 2);
        assert_eq!(get_u64(&frame[..], 16), 0x1122_3344_5566_7788);
        assert_eq!(get_u32(&frame[..], 24), 1);
        assert_eq!(get_u32(&frame[..], 28), 8);
        assert_eq!(get_u32(&frame[..], 36), MessageFlags::SYNC.bits());
        assert_eq!(get_u64(&frame[..], 40), 42);
        assert!(frame[48..64].iter().all(|b| *b == 0));
        // First descriptor slot.
        assert_eq!(get_u64(&frame[..], 64), 0x7000);
        assert_eq!(get_u32(&frame[..], 72), 4096);
        assert_eq!(get_u32(&frame[..], 76), 3);
        // Unused slots stay zero.
        assert!(frame[80..INLINE_OFFSET].iter().all(|b| *b == 0));
    }

    #[test]
    fn decode_restores_message() {
        let msg = sample();
        let decoded = Message::decode(&msg.to_frame()[..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = sample().to_frame();
        frame[0] ^= 0xFF;
        assert!(matches!(
            Message::decode(&frame[..]),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut frame = sample().to_frame();
        put_u32(&mut frame[..], 4, 2);
        assert_eq!(
            Message::decode(&frame[..]),
            Err(WireError::VersionMismatch(2))
        );
    }

    #[test]
    fn rejects_unknown_kind_and_api() {
        let mut frame = sample().to_frame();
        put_u32(&mut frame[..], 8, 7);
        assert_eq!(Message::decode(&frame[..]), Err(WireError::UnknownKind(7)));

        let mut frame = sample().to_frame();
        put_u32(&mut frame[..], 12, 9);
        assert_eq!(Message::decode(&frame[..]), Err(WireError::UnknownApi(9)));
    }

    #[test]
    fn rejects_out_of_range_counts() {
        let mut frame = sample().to_frame();
        put_u32(&mut frame[..], 24, 9);
        assert_eq!(
            Message::decode(&frame[..]),
            Err(WireError::TooManyBuffers(9))
        );

        let mut frame = sample().to_frame();
        put_u32(&mut frame[..], 28, 3073);
        assert_eq!(
            Message::decode(&frame[..]),
            Err(WireError::InlineTooLarge(3073))
        );

        let mut frame = sample().to_frame();
        put_u32(&mut frame[..], 72, MAX_BUFFER_SIZE + 1);
        assert_eq!(
            Message::decode(&frame[..]),
            Err(WireError::BufferTooLarge(67_108_865))
        );
    }

    #[test]
    fn rejects_truncated_frame() {
        let frame = sample().to_frame();
        assert!(matches!(
            Message::decode(&frame[..100]),
            Err(WireError::Truncated { len: 100, .. })
        ));
    }

    #[test]
    fn descriptor_size_limit() {
        assert!(BufferDesc::new(0, 64 * 1024 * 1024, Access::READ).is_ok());
        assert_eq!(
            BufferDesc::new(0, 67_108_865, Access::READ),
            Err(WireError::BufferTooLarge(67_108_865))
        );
    }

    #[test]
    fn ninth_descriptor_is_rejected() {
        let mut msg = Message::request(ApiId::BufferTest, 1);
        let desc = BufferDesc::new(0, 16, Access::READ).unwrap();
        for _ in 0..MAX_BUFFERS {
            msg.push_buffer(desc).unwrap();
        }
        assert_eq!(msg.push_buffer(desc), Err(WireError::TooManyBuffers(9)));
        assert_eq!(msg.header().buffer_count, 8);
    }

    #[test]
    fn inline_limit() {
        let mut msg = Message::request(ApiId::Echo, 1);
        assert!(msg.set_inline(&[0u8; MAX_INLINE]).is_ok());
        assert_eq!(
            msg.set_inline(&[0u8; MAX_INLINE + 1]),
            Err(WireError::InlineTooLarge(MAX_INLINE + 1))
        );
    }

    #[test]
    fn align_page_rounds_up() {
        assert_eq!(align_page(0), 0);
        assert_eq!(align_page(1), 4096);
        assert_eq!(align_page(4096), 4096);
        assert_eq!(align_page(4097), 8192);
    }

    #[test]
    fn flags_keep_unknown_bits() {
        let flags = MessageFlags::from_bits_retain(0x8000_0001);
        assert!(flags.contains(MessageFlags::SYNC));
        assert!(!flags.contains(MessageFlags::ASYNC));
        assert_eq!((flags | MessageFlags::ASYNC).bits(), 0x8000_0003);
    }

    #[test]
    fn reply_keeps_correlation() {
        let req = sample();
        let resp = req.reply(MessageKind::Error, ErrorCode::InvalidParams);
        assert_eq!(resp.header().request_id, req.header().request_id);
        assert_eq!(resp.header().api, ApiId::BufferTest);
        assert_eq!(resp.header().error_code, -2);
    }
}
