//! Framed request/reply transport over a `/dev/cuse` file descriptor.
//!
//! One request is read per readiness event into a reusable buffer; replies
//! are always written as a single `write()` call, retrying on `EINTR`.
//! Mirrors `read_from_cuse`/`send_response`/`complete_status_only` in
//! `devfile.c`.

pub mod wire;

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use wire::{InHeader, OutHeader, IN_HEADER_SIZE, OUT_HEADER_SIZE};

/// Negated-errno reply value. Distinct from [`crate::error::Error`]: sending
/// one of these is a *successful* outcome of handling a request, not a
/// daemon failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const OK: Errno = Errno(0);
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    pub const ENODEV: Errno = Errno(libc::ENODEV);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);

    fn negated(self) -> i32 {
        -self.0
    }
}

/// A decoded request: the fixed header plus whatever body bytes followed it
/// in the same read.
pub struct Request {
    pub header: InHeader,
    pub body: Vec<u8>,
}

/// Reads exactly one CDUS request from `fd` into `buf`. `buf` must be at
/// least [`wire::max_request_bufsize`] bytes. Returns `Ok(None)` on a
/// benign `EINTR` (the next readiness event will retry); `Ok(Some(_))` on a
/// full request; `Err` if the read itself failed or if the kernel's `len`
/// field disagrees with the number of bytes actually read (fatal, per
/// spec.md §4.4).
pub fn read_request(fd: RawFd, buf: &mut [u8]) -> Result<Option<Request>> {
    let n = match nix::unistd::read(fd, buf) {
        Ok(n) => n,
        Err(nix::errno::Errno::EINTR) => return Ok(None),
        Err(e) => return Err(Error::Errno(e)),
    };

    if n < IN_HEADER_SIZE {
        return Err(Error::Protocol("short CDUS request, missing header"));
    }

    let header: InHeader = unsafe { wire::read_struct(&buf[..n]) }
        .ok_or(Error::Protocol("truncated CDUS header"))?;

    if header.len as usize != n {
        return Err(Error::Fatal(format!(
            "CDUS read loop: mismatch between read length {} and len field {}",
            n, header.len
        )));
    }

    Ok(Some(Request {
        header,
        body: buf[IN_HEADER_SIZE..n].to_vec(),
    }))
}

/// Writes `frame` to `fd` in one call, retrying on `EINTR`. A short write
/// is fatal (spec.md §4.4).
fn send_frame(fd: RawFd, frame: &[u8]) -> Result<()> {
    loop {
        match nix::unistd::write(fd, frame) {
            Ok(n) if n == frame.len() => return Ok(()),
            Ok(n) => {
                return Err(Error::Fatal(format!(
                    "wrote {} bytes of response, only {} accepted",
                    frame.len(),
                    n
                )))
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Errno(e)),
        }
    }
}

/// Sends a header-only reply carrying just a status code (0 or a negated
/// errno), e.g. the `EBUSY`/`ENODEV`/`ENOSYS` fast paths.
pub fn send_status(fd: RawFd, unique: u64, errno: Errno) -> Result<()> {
    let header = OutHeader {
        len: OUT_HEADER_SIZE as u32,
        error: errno.negated(),
        unique,
    };
    let bytes = unsafe { wire::struct_as_bytes(&header) };
    send_frame(fd, bytes)
}

/// Sends a reply whose body is `body` (already including whatever
/// opcode-specific struct plus any trailing bytes, e.g. READ's payload or
/// INIT's `DEVNAME=` appendix).
pub fn send_reply(fd: RawFd, unique: u64, body: &[u8]) -> Result<()> {
    let header = OutHeader {
        len: (OUT_HEADER_SIZE + body.len()) as u32,
        error: 0,
        unique,
    };
    let mut frame = Vec::with_capacity(OUT_HEADER_SIZE + body.len());
    frame.extend_from_slice(unsafe { wire::struct_as_bytes(&header) });
    frame.extend_from_slice(body);
    send_frame(fd, &frame)
}
