//! Fixed-frame codec over any `Read`/`Write` stream.
//!
//! Unlike a length-prefixed codec, every frame is exactly
//! [`MESSAGE_SIZE`] bytes, so no framing header is needed.

use std::io::{self, Read, Write};

use crate::message::{Frame, MESSAGE_SIZE, Message};

/// Writes `msg` as one full frame. Does not flush.
pub fn send<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    w.write_all(&msg.to_frame()[..])
}

/// Reads one full frame without interpreting it.
pub fn recv_frame<R: Read>(r: &mut R) -> io::Result<Box<Frame>> {
    let mut frame = Box::new([0u8; MESSAGE_SIZE]);
    r.read_exact(&mut frame[..])?;
    Ok(frame)
}

/// Reads one frame and validates it as a [`Message`].
pub fn recv<R: Read>(r: &mut R) -> io::Result<Message> {
    let frame = recv_frame(r)?;
    Message::decode(&frame[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
