//! Datagram I/O with `SCM_RIGHTS` descriptor passing
//!
//! One frame is one datagram.  Receives are non-blocking and mark
//! every arriving descriptor close-on-exec atomically
//! (`MSG_CMSG_CLOEXEC`); sends never raise SIGPIPE (`MSG_NOSIGNAL`).
//! All descriptors travel in a single `SCM_RIGHTS` control block.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::SigSet;
use nix::sys::time::TimeSpec;

use crate::payload::FdQueue;
use crate::protocol::MAX_SEND_FDS;

/// Grace period for a peer whose datagram queue has filled
/// (see `/proc/sys/net/unix/max_dgram_qlen`).
const SEND_TIMEOUT_SECS: i64 = 10;

/// Control buffer sized for [`crate::protocol::MAX_RECV_FDS`]
/// descriptors, aligned for `cmsghdr` access.
#[repr(align(8))]
struct CmsgBuffer([u8; 256]);

impl CmsgBuffer {
    const fn new() -> Self {
        Self([0; 256])
    }
}

/// One received frame: payload length and the descriptors that came
/// with it.
#[derive(Debug)]
pub struct Datagram {
    pub len: usize,
    pub fds: FdQueue,
}

/// Send one datagram carrying `payload` and up to
/// [`MAX_SEND_FDS`] borrowed descriptors.
pub fn send(fd: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
    assert!(fds.len() <= MAX_SEND_FDS);

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr().cast_mut().cast(),
        iov_len: payload.len(),
    };

    let mut cmsg_buf = CmsgBuffer::new();
    // SAFETY: msghdr is valid when zeroed
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let payload_len = fds.len() * mem::size_of::<RawFd>();
        // SAFETY: CMSG_* operate on the aligned buffer set up above
        unsafe {
            msg.msg_control = cmsg_buf.0.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(payload_len as u32) as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr().cast::<u8>(),
                libc::CMSG_DATA(cmsg),
                payload_len,
            );
        }
    }

    // SAFETY: msg points at live iovec/control buffers
    let n = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send with the retry discipline for busy peers: on `EAGAIN`, wait
/// once for `POLLOUT` with a bounded timeout and all signals masked
/// (the next SIGCHLD must not cut the wait short), then try again.
pub fn send_retry(fd: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
    match send(fd, payload, fds) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let mut pfd = [PollFd::new(fd, PollFlags::POLLOUT)];
            let timeout = TimeSpec::new(SEND_TIMEOUT_SECS, 0);
            let ready = ppoll(&mut pfd, Some(timeout), Some(SigSet::all()))
                .map_err(io::Error::from)?;
            if ready > 0 {
                send(fd, payload, fds)
            } else {
                Err(io::Error::from(io::ErrorKind::TimedOut))
            }
        }
        other => other,
    }
}

/// Receive one datagram without blocking.
///
/// Returns `WouldBlock` when nothing is queued.  A `len` of zero
/// means the peer hung up.  Ill-formed or truncated control data
/// aborts the frame with `InvalidData`; descriptors collected up to
/// that point are closed by the returned error path.
pub fn receive(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut cmsg_buf = CmsgBuffer::new();
    // SAFETY: msghdr is valid when zeroed
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.0.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&cmsg_buf.0) as _;

    // SAFETY: msg points at live iovec/control buffers
    let n = unsafe {
        libc::recvmsg(
            fd.as_raw_fd(),
            &mut msg,
            libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control up to msg_controllen; the
    // CMSG_* walk stays inside that region
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                // cmsg_len as declared by the sender bounds the slice
                let data_len = (hdr.cmsg_len as usize).saturating_sub(libc::CMSG_LEN(0) as usize);
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let raw = data.add(i).read_unaligned();
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        // dropping `fds` closes everything that did arrive
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated control data",
        ));
    }

    Ok(Datagram {
        len: n as usize,
        fds: FdQueue::new(fds),
    })
}
