//! Typed inline payloads for the three reference calls.
//!
//! Layouts follow C natural alignment so that a host reading the inline
//! region as a plain struct sees the same bytes.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::message::{ApiId, ErrorCode, MAX_INLINE, get_u32, get_u64, put_u32, put_u64};

/// Longest echo string: the inline region minus its `u32` length prefix.
pub const ECHO_MAX: usize = MAX_INLINE - 4;

/// A fixed-layout structure carried in the inline region.
pub trait Payload: Sized {
    /// Api this payload belongs to.
    const API: ApiId;
    /// Encoded size in bytes; never more than [`MAX_INLINE`].
    const SIZE: usize;

    /// Writes the payload into `buf`, which is exactly [`Self::SIZE`] bytes
    /// and zero-filled.
    fn write_to(&self, buf: &mut [u8]);

    /// Parses the payload from exactly [`Self::SIZE`] bytes.
    fn read_from(buf: &[u8]) -> Result<Self, WireError>;
}

/// Writes a length-prefixed byte string.
fn write_string(buf: &mut [u8], data: &[u8]) {
    let len = data.len().min(ECHO_MAX);
    #[allow(clippy::cast_possible_truncation)]
    put_u32(buf, 0, len as u32);
    buf[4..4 + len].copy_from_slice(&data[..len]);
}

/// Reads a length-prefixed byte string.
fn read_string(buf: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = get_u32(buf, 0);
    if len as usize > ECHO_MAX {
        return Err(WireError::LengthOutOfRange { len, max: ECHO_MAX });
    }
    Ok(buf[4..4 + len as usize].to_vec())
}

/// Echo request: the bytes to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct EchoReq {
    /// Input bytes, at most [`ECHO_MAX`].
    pub input: Vec<u8>,
}

impl EchoReq {
    /// Wraps the input bytes.
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

impl Payload for EchoReq {
    const API: ApiId = ApiId::Echo;
    const SIZE: usize = MAX_INLINE;

    fn write_to(&self, buf: &mut [u8]) {
        write_string(buf, &self.input);
    }

    fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        read_string(buf).map(|input| Self { input })
    }
}

/// Echo response: the bytes returned by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct EchoResp {
    /// Output bytes, at most [`ECHO_MAX`].
    pub output: Vec<u8>,
}

impl EchoResp {
    /// Wraps the output bytes.
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

impl Payload for EchoResp {
    const API: ApiId = ApiId::Echo;
    const SIZE: usize = MAX_INLINE;

    fn write_to(&self, buf: &mut [u8]) {
        write_string(buf, &self.output);
    }

    fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        read_string(buf).map(|output| Self { output })
    }
}

/// Buffer-exercise operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
#[repr(u32)]
pub enum BufferOp {
    /// Consume the contents without comparing them.
    Read = 1,
    /// Fill every buffer with the pattern byte.
    Write = 2,
    /// Compare the contents against the pattern byte.
    Verify = 3,
}

impl BufferOp {
    /// Parses a raw wire value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Verify),
            _ => None,
        }
    }
}

/// Buffer-exercise request (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct BufferTestReq {
    /// Fill pattern; only the low byte is used.
    pub pattern: u32,
    /// Operation to perform on every buffer.
    pub op: BufferOp,
}

impl BufferTestReq {
    /// Creates a request.
    pub const fn new(op: BufferOp, pattern: u32) -> Self {
        Self { pattern, op }
    }
}

impl Payload for BufferTestReq {
    const API: ApiId = ApiId::BufferTest;
    const SIZE: usize = 8;

    fn write_to(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.pattern);
        put_u32(buf, 4, self.op as u32);
    }

    fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        let raw = get_u32(buf, 4);
        Ok(Self {
            pattern: get_u32(buf, 0),
            op: BufferOp::from_raw(raw).ok_or(WireError::UnknownOperation(raw))?,
        })
    }
}

/// Buffer-exercise result (16 bytes).
///
/// A non-zero `status` is an operation-level outcome (for example a failed
/// VERIFY), not a transport or protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BufferTestResp {
    /// Total bytes the host processed.
    pub bytes_processed: u64,
    /// Wrapping byte sum over all processed bytes.
    pub checksum: u32,
    /// Raw [`ErrorCode`]; zero on success.
    pub status: i32,
}

impl BufferTestResp {
    /// Creates a result.
    pub const fn new(bytes_processed: u64, checksum: u32, status: i32) -> Self {
        Self {
            bytes_processed,
            checksum,
            status,
        }
    }

    /// Whether the operation succeeded (for VERIFY: the pattern matched).
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// The status as a known code, if it is one.
    pub const fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_raw(self.status)
    }
}

impl Payload for BufferTestResp {
    const API: ApiId = ApiId::BufferTest;
    const SIZE: usize = 16;

    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.bytes_processed);
        put_u32(buf, 8, self.checksum);
        buf[12..16].copy_from_slice(&self.status.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        let mut status = [0u8; 4];
        status.copy_from_slice(&buf[12..16]);
        Ok(Self {
            bytes_processed: get_u64(buf, 0),
            checksum: get_u32(buf, 8),
            status: i32::from_le_bytes(status),
        })
    }
}

/// Performance test kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
#[repr(u32)]
pub enum PerfKind {
    /// Repeated small round trips; reports min/max/average.
    Latency = 1,
    /// Bulk transfer over the supplied buffers; reports MB/s.
    Throughput = 2,
}

impl PerfKind {
    /// Parses a raw wire value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Latency),
            2 => Some(Self::Throughput),
            _ => None,
        }
    }
}

/// Performance request (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PerfReq {
    /// Latency or throughput.
    pub kind: PerfKind,
    /// Number of iterations (latency).
    pub iterations: u32,
    /// Cumulative bytes to move (throughput).
    pub target_bytes: u64,
}

impl PerfReq {
    /// Creates a request.
    pub const fn new(kind: PerfKind, iterations: u32, target_bytes: u64) -> Self {
        Self {
            kind,
            iterations,
            target_bytes,
        }
    }

    /// A latency run of `iterations` round trips.
    pub const fn latency(iterations: u32) -> Self {
        Self {
            kind: PerfKind::Latency,
            iterations,
            target_bytes: 0,
        }
    }

    /// A throughput run moving at least `target_bytes`.
    pub const fn throughput(target_bytes: u64) -> Self {
        Self {
            kind: PerfKind::Throughput,
            iterations: 0,
            target_bytes,
        }
    }
}

impl Payload for PerfReq {
    const API: ApiId = ApiId::PerfTest;
    const SIZE: usize = 16;

    fn write_to(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.kind as u32);
        put_u32(buf, 4, self.iterations);
        put_u64(buf, 8, self.target_bytes);
    }

    fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        let raw = get_u32(buf, 0);
        Ok(Self {
            kind: PerfKind::from_raw(raw).ok_or(WireError::UnknownPerfKind(raw))?,
            iterations: get_u32(buf, 4),
            target_bytes: get_u64(buf, 8),
        })
    }
}

/// Performance result (40 bytes, last 4 are padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PerfResp {
    /// Fastest iteration in nanoseconds.
    pub min_latency_ns: u64,
    /// Slowest iteration in nanoseconds.
    pub max_latency_ns: u64,
    /// Mean iteration time in nanoseconds.
    pub avg_latency_ns: u64,
    /// Aggregate throughput in MB/s.
    pub throughput_mbps: u64,
    /// Iterations that actually ran.
    pub iterations_completed: u32,
}

impl PerfResp {
    /// Creates a result.
    pub const fn new(
        min_latency_ns: u64,
        max_latency_ns: u64,
        avg_latency_ns: u64,
        throughput_mbps: u64,
        iterations_completed: u32,
    ) -> Self {
        Self {
            min_latency_ns,
            max_latency_ns,
            avg_latency_ns,
            throughput_mbps,
            iterations_completed,
        }
    }

    /// Whether every requested iteration ran. A shorter count is a partial
    /// result, not a full success.
    pub const fn is_complete(&self, requested: u32) -> bool {
        self.iterations_completed >= requested
    }
}

impl Payload for PerfResp {
    const API: ApiId = ApiId::PerfTest;
    const SIZE: usize = 40;

    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.min_latency_ns);
        put_u64(buf, 8, self.max_latency_ns);
        put_u64(buf, 16, self.avg_latency_ns);
        put_u64(buf, 24, self.throughput_mbps);
        put_u32(buf, 32, self.iterations_completed);
    }

    fn read_from(buf: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            min_latency_ns: get_u64(buf, 0),
            max_latency_ns: get_u64(buf, 8),
            avg_latency_ns: get_u64(buf, 16),
            throughput_mbps: get_u64(buf, 24),
            iterations_completed: get_u32(buf, 32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn echo_occupies_full_inline_region() {
        let mut msg = Message::request(ApiId::Echo, 1);
        msg.put(&EchoReq::new(&b"hello"[..]));
        assert_eq!(msg.inline().len(), MAX_INLINE);
        assert_eq!(msg.inline()[..4], 5u32.to_le_bytes());
        assert_eq!(&msg.inline()[4..9], b"hello");
        assert_eq!(msg.get::<EchoReq>().unwrap().input, b"hello");
    }

    #[test]
    fn echo_length_prefix_is_bounded() {
        let mut raw = vec![0u8; MAX_INLINE];
        put_u32(&mut raw, 0, 3069);
        assert_eq!(
            EchoResp::read_from(&raw),
            Err(WireError::LengthOutOfRange {
                len: 3069,
                max: ECHO_MAX
            })
        );
    }

    #[test]
    fn buffer_test_rejects_unknown_operation() {
        let mut raw = [0u8; 8];
        put_u32(&mut raw, 4, 4);
        assert_eq!(
            BufferTestReq::read_from(&raw),
            Err(WireError::UnknownOperation(4))
        );
    }

    #[test]
    fn buffer_test_status_is_signed() {
        let mut raw = [0u8; 16];
        BufferTestResp::new(4096, 7, ErrorCode::Unknown.raw()).write_to(&mut raw);
        let resp = BufferTestResp::read_from(&raw).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.code(), Some(ErrorCode::Unknown));
    }

    #[test]
    fn perf_response_layout() {
        let resp = PerfResp {
            min_latency_ns: 1,
            max_latency_ns: 3,
            avg_latency_ns: 2,
            throughput_mbps: 900,
            iterations_completed: 100,
        };
        let mut raw = [0u8; 40];
        resp.write_to(&mut raw);
        assert_eq!(get_u32(&raw, 32), 100);
        assert_eq!(raw[36..], [0u8; 4]);
        assert!(PerfResp::read_from(&raw).unwrap().is_complete(100));
    }

    #[test]
    fn short_payload_is_rejected() {
        let mut msg = Message::request(ApiId::PerfTest, 1);
        msg.set_inline(&[0u8; 8]).unwrap();
        assert_eq!(
            msg.get::<PerfReq>(),
            Err(WireError::PayloadTooShort {
                got: 8,
                expected: 16
            })
        );
    }
}
