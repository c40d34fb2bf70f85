//! Wire protocol for hvrpc guest→host calls.
//!
//! Every exchange is a single fixed-size [`Message`] of [`MESSAGE_SIZE`]
//! bytes: a 64-byte header, eight 16-byte buffer descriptors and a
//! 3072-byte inline payload region. All integers are little-endian.
//!
//! ```text
//! ┌────────────┬──────────────────────┬───────────────────┐
//! │ header     │ descriptors          │ inline payload    │
//! │ 64 bytes   │ 8 × 16 bytes         │ 3072 bytes        │
//! └────────────┴──────────────────────┴───────────────────┘
//! ```
//!
//! Bulk data never travels in the message body: it is referenced through
//! [`BufferDesc`] entries whose meaning is owned by the transport.

mod checksum;
mod codec;
mod error;
mod message;
mod payload;

pub use checksum::{byte_sum, pattern_checksum};
pub use codec::{recv, recv_frame, send};
pub use error::WireError;
pub use message::{
    Access, ApiId, BufferDesc, DESC_SIZE, ErrorCode, Frame, HEADER_SIZE, Header, MAGIC,
    MAX_BUFFER_SIZE, MAX_BUFFERS, MAX_INLINE, MESSAGE_SIZE, Message, MessageFlags, MessageKind,
    PAGE_SIZE, PROTOCOL_VERSION, align_page,
};
pub use payload::{
    BufferOp, BufferTestReq, BufferTestResp, ECHO_MAX, EchoReq, EchoResp, Payload, PerfKind,
    PerfReq, PerfResp,
};
