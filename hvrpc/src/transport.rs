//! The guest/host channel and the handle that owns it.
//!
//! A [`Transport`] moves one encoded request to the host and returns the
//! raw response frame as a [`Reply`]. Shared regions travel alongside: a
//! region the host may read is made visible before the call, and what the
//! host wrote comes back staged in the [`Reply`]. Caller memory changes only
//! when the reply is applied, after the response has been checked.
//!
//! Over a byte stream ([`StreamTransport`]) this is done by copying. After
//! the request frame come the contents of every READ region, in descriptor
//! order. After the response frame come the contents of every WRITE region,
//! also in descriptor order.

use std::io::{self, Read, Write};

use hvrpc_proto::{Frame, Message};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// A synchronous request/response channel to the host.
pub trait Transport: Send {
    /// Performs one exchange.
    ///
    /// `regions[i]` is the memory behind `request.buffers()[i]`. The
    /// response is returned undecoded; callers validate it before applying
    /// its write-backs.
    fn transact(&mut self, request: &Message, regions: &[&mut [u8]]) -> io::Result<Reply>;
}

/// An undecoded response frame plus the region contents the host wrote.
#[derive(Debug)]
pub struct Reply {
    /// Raw response.
    frame: Box<Frame>,
    /// `(region index, new contents)`, in descriptor order.
    write_back: Vec<(usize, Vec<u8>)>,
}

impl Reply {
    /// A reply with nothing to write back.
    pub const fn new(frame: Box<Frame>) -> Self {
        Self {
            frame,
            write_back: Vec::new(),
        }
    }

    /// Stages `data` as the new contents of region `index`.
    #[must_use]
    pub fn with_write_back(mut self, index: usize, data: Vec<u8>) -> Self {
        self.write_back.push((index, data));
        self
    }

    /// The response frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Mutable access to the response frame.
    pub fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    /// Copies the staged contents into `regions`.
    ///
    /// Every entry is checked first; on a bad index or size nothing is
    /// written.
    pub fn apply(self, regions: &mut [&mut [u8]]) -> io::Result<()> {
        let fits = self
            .write_back
            .iter()
            .all(|(i, data)| regions.get(*i).is_some_and(|r| r.len() == data.len()));
        if !fits {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "write-back does not match the call's regions",
            ));
        }
        for (i, data) in self.write_back {
            regions[i].copy_from_slice(&data);
        }
        Ok(())
    }
}

/// Checks that every descriptor has a region of matching size.
pub(crate) fn check_regions(request: &Message, regions: &[&mut [u8]]) -> io::Result<()> {
    let descs = request.buffers();
    if descs.len() != regions.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} descriptors but {} regions",
                descs.len(),
                regions.len()
            ),
        ));
    }
    if let Some((i, _)) = descs
        .iter()
        .zip(regions)
        .enumerate()
        .find(|(_, (d, r))| d.len() != r.len())
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("region {i} does not match its descriptor size"),
        ));
    }
    Ok(())
}

/// [`Transport`] over any blocking byte stream.
#[derive(Debug)]
pub struct StreamTransport<S> {
    /// Connected stream to the host.
    stream: S,
}

impl<S: Read + Write + Send> StreamTransport<S> {
    /// Wraps a connected stream.
    pub const fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Unwraps the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn transact(&mut self, request: &Message, regions: &[&mut [u8]]) -> io::Result<Reply> {
        check_regions(request, regions)?;
        let descs = request.buffers();

        hvrpc_proto::send(&mut self.stream, request)?;
        for (desc, region) in descs.iter().zip(regions.iter()) {
            if desc.access.reads() {
                self.stream.write_all(region)?;
            }
        }
        self.stream.flush()?;

        let mut reply = Reply::new(hvrpc_proto::recv_frame(&mut self.stream)?);
        for (i, desc) in descs.iter().enumerate() {
            if desc.access.writes() {
                let mut data = vec![0u8; desc.len()];
                self.stream.read_exact(&mut data)?;
                reply = reply.with_write_back(i, data);
            }
        }
        Ok(reply)
    }
}

/// An open channel to the host.
///
/// Closing is idempotent and also happens on drop. A closed handle fails
/// every dispatch with [`io::ErrorKind::NotConnected`].
pub struct Handle {
    /// Live transport; `None` once closed.
    transport: Option<Box<dyn Transport>>,
    /// Where the transport leads, for diagnostics.
    label: String,
}

impl Handle {
    /// Connects to `endpoint`.
    ///
    /// Fails with [`Error::TransportUnavailable`] when the endpoint does not
    /// exist, refuses the connection or is not permitted.
    pub fn open(endpoint: &Endpoint) -> Result<Self> {
        let transport = connect(endpoint).map_err(|source| {
            tracing::warn!(%endpoint, error = %source, "transport unavailable");
            Error::TransportUnavailable {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;
        tracing::debug!(%endpoint, "transport opened");
        Ok(Self {
            transport: Some(transport),
            label: endpoint.to_string(),
        })
    }

    /// Wraps an already-connected transport.
    pub fn from_transport(transport: impl Transport + 'static, label: impl Into<String>) -> Self {
        Self {
            transport: Some(Box::new(transport)),
            label: label.into(),
        }
    }

    /// Whether the handle can still dispatch.
    pub const fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Where the handle leads.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sends `request` and returns the unchecked reply.
    pub fn dispatch(&mut self, request: &Message, regions: &[&mut [u8]]) -> Result<Reply> {
        let transport = self.transport.as_mut().ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "handle is closed",
            ))
        })?;
        Ok(transport.transact(request, regions)?)
    }

    /// Releases the transport. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            tracing::debug!(endpoint = %self.label, "transport closed");
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("endpoint", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a stream transport for `endpoint`.
fn connect(endpoint: &Endpoint) -> io::Result<Box<dyn Transport>> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = std::os::unix::net::UnixStream::connect(path)?;
            Ok(Box::new(StreamTransport::new(stream)))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
        Endpoint::Vsock { cid, port } => {
            let stream = crate::vsock::connect(*cid, *port)?;
            Ok(Box::new(StreamTransport::new(stream)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use hvrpc_proto::{Access, ApiId, BufferDesc, MESSAGE_SIZE, MessageKind};

    use super::*;

    /// A stream whose reads come from a fixed script and whose writes are kept.
    struct Scripted {
        /// Bytes the peer "sends".
        input: Cursor<Vec<u8>>,
        /// Bytes we sent.
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(access: Access, len: usize) -> Message {
        let mut msg = Message::request(ApiId::BufferTest, 1);
        msg.push_buffer(BufferDesc::new(0, len, access).unwrap())
            .unwrap();
        msg
    }

    #[test]
    fn region_bytes_follow_frames() {
        let req = request(Access::READ_WRITE, 4);
        let resp = req.reply(MessageKind::Response, hvrpc_proto::ErrorCode::Ok);
        let mut input = resp.to_frame().to_vec();
        input.extend_from_slice(&[9, 9, 9, 9]);

        let mut t = StreamTransport::new(Scripted {
            input: Cursor::new(input),
            output: Vec::new(),
        });
        let mut region = [1u8, 2, 3, 4];
        let reply = t.transact(&req, &[&mut region[..]]).unwrap();
        assert_eq!(Message::decode(reply.frame()).unwrap(), resp);
        reply.apply(&mut [&mut region[..]]).unwrap();

        assert_eq!(region, [9, 9, 9, 9]);
        let sent = t.into_inner().output;
        assert_eq!(sent.len(), MESSAGE_SIZE + 4);
        assert_eq!(sent[MESSAGE_SIZE..], [1, 2, 3, 4]);
    }

    #[test]
    fn short_write_back_leaves_region_untouched() {
        let req = request(Access::READ_WRITE, 4);
        let resp = req.reply(MessageKind::Response, hvrpc_proto::ErrorCode::Ok);
        let mut input = resp.to_frame().to_vec();
        input.extend_from_slice(&[9, 9]);

        let mut t = StreamTransport::new(Scripted {
            input: Cursor::new(input),
            output: Vec::new(),
        });
        let mut region = [1u8, 2, 3, 4];
        let err = t.transact(&req, &[&mut region[..]]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(region, [1, 2, 3, 4]);
    }

    #[test]
    fn write_back_waits_for_apply() {
        let req = request(Access::READ_WRITE, 4);
        let resp = req.reply(MessageKind::Response, hvrpc_proto::ErrorCode::Ok);
        let mut input = resp.to_frame().to_vec();
        input.extend_from_slice(&[9, 9, 9, 9]);

        let mut t = StreamTransport::new(Scripted {
            input: Cursor::new(input),
            output: Vec::new(),
        });
        let mut region = [1u8, 2, 3, 4];
        let reply = t.transact(&req, &[&mut region[..]]).unwrap();
        drop(reply);
        assert_eq!(region, [1, 2, 3, 4]);
    }

    #[test]
    fn mismatched_write_back_writes_nothing() {
        let reply = Reply::new(Box::new([0u8; MESSAGE_SIZE]))
            .with_write_back(0, vec![7; 2])
            .with_write_back(1, vec![7; 3]);
        let mut a = [1u8; 2];
        let mut b = [1u8; 2];
        let err = reply.apply(&mut [&mut a[..], &mut b[..]]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!((a, b), ([1, 1], [1, 1]));
    }

    #[test]
    fn region_count_must_match() {
        let req = request(Access::READ, 4);
        let mut t = StreamTransport::new(Scripted {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        });
        let err = t.transact(&req, &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(t.into_inner().output.is_empty());
    }

    #[test]
    fn closed_handle_refuses_dispatch() {
        let mut handle = Handle::from_transport(
            StreamTransport::new(Scripted {
                input: Cursor::new(Vec::new()),
                output: Vec::new(),
            }),
            "scripted",
        );
        assert!(handle.is_open());
        handle.close();
        handle.close();
        assert!(!handle.is_open());

        let req = Message::request(ApiId::Echo, 1);
        match handle.dispatch(&req, &[]) {
            Err(Error::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::NotConnected),
            other => panic!("unexpected {other:?}"),
        }
    }
}
