//! Guest-side client for synchronous calls into a hypervisor host.
//!
//! A guest opens a [`Client`] on an [`Endpoint`] (a vsock address or a Unix
//! socket mapped onto one), then issues typed calls. Each call sends one
//! fixed-size [`hvrpc_proto`] message, optionally references shared
//! [`Buffer`]s, and blocks until the matching response arrives.
//!
//! # Quick start
//!
//! ```no_run
//! use hvrpc::{Buffer, BufferOp, Client, Endpoint};
//!
//! let mut client = Client::open(&Endpoint::from_env()?)?;
//!
//! let mut out = [0u8; 64];
//! let n = client.echo(b"Hello from guest!", &mut out)?;
//! assert_eq!(&out[..n], b"Hello from guest!");
//!
//! let mut bufs = [Buffer::allocate(4096)?];
//! client.buffer_test(&mut bufs, BufferOp::Write, 0xAB)?;
//! let verify = client.buffer_test(&mut bufs, BufferOp::Verify, 0xAB)?;
//! assert!(verify.is_ok());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`Client::loopback`] wires the same API to an in-process reference host,
//! and [`loopback::serve`] runs that host over any byte stream.

pub mod bench;
mod buffer;
mod client;
mod endpoint;
mod error;
pub mod loopback;
mod transport;
mod vsock;

pub use buffer::Buffer;
pub use client::Client;
pub use endpoint::{DEFAULT_PORT, ENV_ENDPOINT, Endpoint, HOST_CID, ParseEndpointError};
pub use error::{Error, ErrorKind, Invalid, Result};
pub use hvrpc_proto as proto;
pub use hvrpc_proto::{
    ApiId, BufferOp, BufferTestResp, ECHO_MAX, ErrorCode, MAX_BUFFER_SIZE, MAX_BUFFERS, PAGE_SIZE,
    PerfKind, PerfReq, PerfResp, pattern_checksum,
};
pub use transport::{Handle, Reply, StreamTransport, Transport};
