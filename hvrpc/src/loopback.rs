//! In-process reference host.
//!
//! [`Host`] implements the host side of the three reference calls. It is
//! reachable two ways: [`Loopback`] runs it inside the caller's process on
//! copies of the caller's regions, and [`serve`] runs it over a byte stream
//! using the [`StreamTransport`](crate::StreamTransport) framing.

use std::hint::black_box;
use std::io::{self, Read, Write};
use std::time::Instant;

use hvrpc_proto::{
    ApiId, BufferOp, BufferTestReq, BufferTestResp, EchoReq, EchoResp, ErrorCode, Message,
    MessageKind, PerfKind, PerfReq, byte_sum,
};

use crate::bench::{Stats, mbps, nanos};
use crate::transport::{Reply, Transport, check_regions};

/// Host-side call handlers.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct Host;

impl Host {
    /// Creates a host.
    pub const fn new() -> Self {
        Self
    }

    /// Handles one request and builds its reply.
    ///
    /// `regions[i]` backs `request.buffers()[i]`. Rejections come back as
    /// ERROR messages carrying the reason in the header.
    pub fn handle(&self, request: &Message, regions: &mut [&mut [u8]]) -> Message {
        let header = request.header();
        tracing::debug!(api = ?header.api, id = header.request_id, "host handling request");
        if header.kind != MessageKind::Request {
            return request.reply(MessageKind::Error, ErrorCode::InvalidParams);
        }
        let result = match header.api {
            ApiId::Echo => Self::echo(request),
            ApiId::BufferTest => Self::buffer_test(request, regions),
            ApiId::PerfTest => Self::perf_test(request, regions),
            _ => Err(ErrorCode::InvalidApi),
        };
        result.unwrap_or_else(|code| {
            tracing::debug!(api = ?header.api, ?code, "host rejected request");
            request.reply(MessageKind::Error, code)
        })
    }

    /// Sends the input back unchanged.
    fn echo(request: &Message) -> Result<Message, ErrorCode> {
        let req = request
            .get::<EchoReq>()
            .map_err(|_| ErrorCode::InvalidParams)?;
        let mut resp = request.reply(MessageKind::Response, ErrorCode::Ok);
        resp.put(&EchoResp::new(req.input));
        Ok(resp)
    }

    /// Reads, fills or verifies every region with the pattern byte.
    fn buffer_test(request: &Message, regions: &mut [&mut [u8]]) -> Result<Message, ErrorCode> {
        let req = request
            .get::<BufferTestReq>()
            .map_err(|_| ErrorCode::InvalidParams)?;
        let descs = request.buffers();
        if descs.is_empty() {
            return Err(ErrorCode::InvalidParams);
        }
        if regions.len() < descs.len() {
            return Err(ErrorCode::MemoryMapFailed);
        }

        #[allow(clippy::cast_possible_truncation)]
        let byte = (req.pattern & 0xFF) as u8;
        let mut checksum = 0u32;
        let mut total = 0u64;
        let mut status = ErrorCode::Ok;

        for (desc, region) in descs.iter().zip(regions.iter_mut()) {
            let data = region
                .get_mut(..desc.len())
                .ok_or(ErrorCode::MemoryMapFailed)?;
            match req.op {
                BufferOp::Write if !desc.access.writes() => return Err(ErrorCode::InvalidParams),
                BufferOp::Write => data.fill(byte),
                BufferOp::Verify => {
                    if data.iter().any(|b| *b != byte) {
                        status = ErrorCode::Unknown;
                    }
                }
                _ => {}
            }
            checksum = byte_sum(checksum, data);
            total += desc.len() as u64;
        }

        let mut resp = request.reply(MessageKind::Response, ErrorCode::Ok);
        resp.put(&BufferTestResp::new(total, checksum, status.raw()));
        Ok(resp)
    }

    /// Times a simulated workload on the host side.
    fn perf_test(request: &Message, regions: &mut [&mut [u8]]) -> Result<Message, ErrorCode> {
        let req = request
            .get::<PerfReq>()
            .map_err(|_| ErrorCode::InvalidParams)?;
        let result = match req.kind {
            PerfKind::Latency => {
                let mut stats = Stats::default();
                let src = [0x5Au8; 64];
                let mut dst = [0u8; 64];
                for _ in 0..req.iterations {
                    let start = Instant::now();
                    dst.copy_from_slice(black_box(&src));
                    black_box(&dst);
                    stats.record(nanos(start.elapsed()));
                }
                stats.finish(0)
            }
            PerfKind::Throughput if regions.iter().all(|r| r.is_empty()) => {
                Stats::default().finish(0)
            }
            PerfKind::Throughput => {
                let mut stats = Stats::default();
                let mut total = 0u64;
                let start = Instant::now();
                while total < req.target_bytes {
                    let pass = Instant::now();
                    for region in regions.iter() {
                        black_box(byte_sum(0, region));
                        total += region.len() as u64;
                    }
                    stats.record(nanos(pass.elapsed()));
                }
                stats.finish(mbps(total, start.elapsed()))
            }
            _ => return Err(ErrorCode::InvalidParams),
        };
        let mut resp = request.reply(MessageKind::Response, ErrorCode::Ok);
        resp.put(&result);
        Ok(resp)
    }
}

/// [`Transport`] that hands requests straight to an in-process [`Host`].
///
/// Requests still go through a full encode/decode so framing bugs surface
/// here as they would over a real channel.
#[derive(Debug, Default)]
pub struct Loopback {
    /// Handlers.
    host: Host,
    /// Fail every exchange once this many have succeeded.
    fail_after: Option<u64>,
    /// Exchanges completed so far.
    calls: u64,
}

impl Loopback {
    /// Creates a loopback transport.
    pub const fn new() -> Self {
        Self {
            host: Host::new(),
            fail_after: None,
            calls: 0,
        }
    }

    /// Makes every exchange after the first `n` fail with a broken pipe.
    #[must_use]
    pub const fn with_failure_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl Transport for Loopback {
    fn transact(&mut self, request: &Message, regions: &[&mut [u8]]) -> io::Result<Reply> {
        check_regions(request, regions)?;
        if self.fail_after.is_some_and(|n| self.calls >= n) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "loopback channel closed",
            ));
        }
        self.calls += 1;
        let decoded = Message::decode(&request.to_frame()[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut shared: Vec<Vec<u8>> = regions.iter().map(|r| r.to_vec()).collect();
        let mut views: Vec<&mut [u8]> = shared.iter_mut().map(Vec::as_mut_slice).collect();
        let mut reply = Reply::new(self.host.handle(&decoded, &mut views).to_frame());
        for (i, desc) in decoded.buffers().iter().enumerate() {
            if desc.access.writes() {
                reply = reply.with_write_back(i, std::mem::take(&mut shared[i]));
            }
        }
        Ok(reply)
    }
}

/// Serves requests arriving on `stream` until the peer hangs up.
///
/// An undecodable frame ends the session with [`io::ErrorKind::InvalidData`]
/// since the stream can no longer be trusted to be in step.
pub fn serve<S: Read + Write>(mut stream: S) -> io::Result<()> {
    let host = Host::new();
    loop {
        let request = match hvrpc_proto::recv(&mut stream) {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "dropping session on bad frame");
                return Err(e);
            }
        };

        let mut regions: Vec<Vec<u8>> = request
            .buffers()
            .iter()
            .map(|d| vec![0u8; d.len()])
            .collect();
        for (desc, region) in request.buffers().iter().zip(regions.iter_mut()) {
            if desc.access.reads() {
                stream.read_exact(region)?;
            }
        }

        let mut views: Vec<&mut [u8]> = regions.iter_mut().map(Vec::as_mut_slice).collect();
        let response = host.handle(&request, &mut views);

        hvrpc_proto::send(&mut stream, &response)?;
        for (desc, region) in request.buffers().iter().zip(&regions) {
            if desc.access.writes() {
                stream.write_all(region)?;
            }
        }
        stream.flush()?;
    }
}
