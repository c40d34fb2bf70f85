//! Typed calls into the host.

use std::time::{SystemTime, UNIX_EPOCH};

use hvrpc_proto::{
    Access, ApiId, BufferDesc, BufferOp, BufferTestReq, BufferTestResp, ECHO_MAX, EchoReq,
    EchoResp, MAX_BUFFERS, Message, MessageKind, PerfReq, PerfResp,
};

use crate::endpoint::Endpoint;
use crate::error::{Error, Invalid, Result};
use crate::loopback::Loopback;
use crate::transport::Handle;

/// A connection to the host that speaks the three reference calls.
///
/// Every call blocks until the matching response arrives. Buffers passed to
/// a call are borrowed for its duration and may not be touched elsewhere
/// until it returns.
#[derive(Debug)]
pub struct Client {
    /// Channel to the host.
    handle: Handle,
    /// Id for the next request.
    next_id: u64,
}

impl Client {
    /// Connects to `endpoint`.
    pub fn open(endpoint: &Endpoint) -> Result<Self> {
        Handle::open(endpoint).map(Self::new)
    }

    /// Wraps an open handle.
    pub const fn new(handle: Handle) -> Self {
        Self { handle, next_id: 1 }
    }

    /// A client wired to an in-process reference host.
    pub fn loopback() -> Self {
        Self::new(Handle::from_transport(Loopback::new(), "loopback"))
    }

    /// The underlying handle.
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether calls can still be made.
    pub const fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Closes the channel. Later calls fail with a transport error.
    pub fn close(&mut self) {
        self.handle.close();
    }

    /// Echoes `input` through the host into `output`.
    ///
    /// The result is truncated to `output.len() - 1` bytes and followed by
    /// a zero byte; the returned count excludes it. `input` must be shorter
    /// than [`ECHO_MAX`] bytes.
    pub fn echo(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let Some(room) = output.len().checked_sub(1) else {
            return Err(Invalid::Params("echo output buffer is empty").into());
        };
        let echoed = self.echo_bytes(input)?;
        let n = echoed.len().min(room);
        output[..n].copy_from_slice(&echoed[..n]);
        output[n] = 0;
        Ok(n)
    }

    /// Echoes `input` through the host and returns what came back.
    pub fn echo_bytes(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() >= ECHO_MAX {
            return Err(Invalid::Params("echo input too long").into());
        }
        let mut req = self.request(ApiId::Echo);
        req.put(&EchoReq::new(input));
        let resp = self.call(&req, &mut [])?;
        Ok(resp.get::<EchoResp>().map_err(Error::from_wire)?.output)
    }

    /// Has the host read, fill or verify `buffers` with `pattern`.
    ///
    /// Takes one to [`MAX_BUFFERS`] buffers of at most 64 MiB each. A failed
    /// VERIFY is reported in [`BufferTestResp::status`], not as an error.
    pub fn buffer_test<B: AsMut<[u8]>>(
        &mut self,
        buffers: &mut [B],
        op: BufferOp,
        pattern: u32,
    ) -> Result<BufferTestResp> {
        if buffers.is_empty() || buffers.len() > MAX_BUFFERS {
            return Err(Invalid::Params("buffer count must be between 1 and 8").into());
        }
        let mut regions: Vec<&mut [u8]> = buffers.iter_mut().map(AsMut::as_mut).collect();
        let mut req = self.request(ApiId::BufferTest);
        describe(&mut req, &regions, Access::READ_WRITE)?;
        req.put(&BufferTestReq::new(op, pattern));

        let resp = self.call(&req, &mut regions)?;
        resp.get::<BufferTestResp>().map_err(Error::from_wire)
    }

    /// Asks the host to time itself over an optional set of buffers.
    ///
    /// See [`crate::bench::measure`] for timing from the guest side.
    pub fn perf_test<B: AsMut<[u8]>>(
        &mut self,
        perf: PerfReq,
        buffers: &mut [B],
    ) -> Result<PerfResp> {
        if buffers.len() > MAX_BUFFERS {
            return Err(Invalid::Params("at most 8 buffers").into());
        }
        let mut regions: Vec<&mut [u8]> = buffers.iter_mut().map(AsMut::as_mut).collect();
        let mut req = self.request(ApiId::PerfTest);
        describe(&mut req, &regions, Access::READ)?;
        req.put(&perf);

        let resp = self.call(&req, &mut regions)?;
        resp.get::<PerfResp>().map_err(Error::from_wire)
    }

    /// Builds an empty request with a fresh id and the current time.
    fn request(&mut self, api: ApiId) -> Message {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        let mut msg = Message::request(api, id);
        msg.set_timestamp(now_ns());
        msg
    }

    /// Dispatches `req` and validates the response against it.
    fn call(&mut self, req: &Message, regions: &mut [&mut [u8]]) -> Result<Message> {
        let api = req.header().api;
        let id = req.header().request_id;
        tracing::debug!(?api, id, buffers = req.buffers().len(), "dispatch");

        self.exchange(req, regions).inspect_err(|e| {
            tracing::warn!(?api, id, error = %e, "call failed");
        })
    }

    /// One exchange plus response checks: id, then kind, then api.
    ///
    /// Host writes reach `regions` only once every check has passed.
    fn exchange(&mut self, req: &Message, regions: &mut [&mut [u8]]) -> Result<Message> {
        let api = req.header().api;
        let id = req.header().request_id;

        let reply = self.handle.dispatch(req, regions)?;
        let resp = Message::decode(reply.frame()).map_err(Error::from_wire)?;
        let header = resp.header();

        if header.request_id != id {
            return Err(Error::Correlation {
                expected: id,
                got: header.request_id,
            });
        }
        match header.kind {
            MessageKind::Response if header.error_code == 0 => {}
            MessageKind::Response | MessageKind::Error => {
                return Err(Error::Host {
                    api,
                    code: header.error_code,
                });
            }
            other => return Err(Error::UnexpectedKind(other)),
        }
        if header.api != api {
            return Err(Error::UnexpectedApi {
                expected: api,
                got: header.api,
            });
        }
        reply.apply(regions)?;
        Ok(resp)
    }
}

/// Adds one descriptor per region.
fn describe(req: &mut Message, regions: &[&mut [u8]], access: Access) -> Result<()> {
    for region in regions {
        if region.is_empty() {
            return Err(Invalid::Params("buffers must not be empty").into());
        }
        let desc = BufferDesc::new(region.as_ptr() as u64, region.len(), access)
            .map_err(|_| Invalid::BufferTooLarge(region.len() as u64))?;
        req.push_buffer(desc)
            .map_err(|_| Invalid::Params("too many buffers"))?;
    }
    Ok(())
}

/// Wall-clock time in nanoseconds since the Unix epoch.
fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
