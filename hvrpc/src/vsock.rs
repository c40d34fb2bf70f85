//! `AF_VSOCK` stream connector.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;

/// Connects a vsock stream socket to `cid:port`.
///
/// The socket is returned as a [`File`] so it can be read and written like
/// any other blocking stream.
#[cfg(target_os = "linux")]
pub fn connect(cid: u32, port: u32) -> io::Result<File> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created socket we exclusively own.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: sockaddr_vm is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_vm = unsafe { std::mem::zeroed() };
    addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
    addr.svm_cid = cid;
    addr.svm_port = port;

    // SAFETY: addr is a valid sockaddr_vm and the length matches it.
    let ret = unsafe {
        libc::connect(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(File::from(sock))
}

/// Vsock is only available on Linux.
#[cfg(not(target_os = "linux"))]
pub fn connect(_cid: u32, _port: u32) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock transport requires Linux",
    ))
}
