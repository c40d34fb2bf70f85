//! Errors raised while building or parsing wire messages.

/// A message or payload violated the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    /// Fewer bytes than a full message were supplied.
    #[error("truncated message: {len} bytes, expected {expected}")]
    Truncated {
        /// Bytes available.
        len: usize,
        /// Bytes required.
        expected: usize,
    },

    /// The magic constant was missing or wrong.
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: got {0}")]
    VersionMismatch(u32),

    /// Unknown message kind.
    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    /// Api id outside the known enumeration.
    #[error("unknown api id {0}")]
    UnknownApi(u32),

    /// Unknown buffer-exercise operation.
    #[error("unknown buffer operation {0}")]
    UnknownOperation(u32),

    /// Unknown performance test kind.
    #[error("unknown performance test kind {0}")]
    UnknownPerfKind(u32),

    /// More descriptors than the message has slots for.
    #[error("{0} buffers exceed the limit of 8")]
    TooManyBuffers(usize),

    /// A descriptor references more than 64 MiB.
    #[error("buffer of {0} bytes exceeds the 64 MiB limit")]
    BufferTooLarge(u64),

    /// The inline payload does not fit the inline region.
    #[error("inline payload of {0} bytes exceeds the 3072-byte region")]
    InlineTooLarge(usize),

    /// The inline payload is shorter than the expected structure.
    #[error("inline payload of {got} bytes, expected at least {expected}")]
    PayloadTooShort {
        /// Bytes present.
        got: usize,
        /// Bytes required.
        expected: usize,
    },

    /// A length prefix inside a payload is out of range.
    #[error("length {len} exceeds payload capacity {max}")]
    LengthOutOfRange {
        /// Declared length.
        len: u32,
        /// Capacity of the payload field.
        max: usize,
    },
}
