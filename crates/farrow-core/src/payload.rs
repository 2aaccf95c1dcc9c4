//! Bounds-checked decoding of received datagrams
//!
//! [`Payload`] walks the byte body of one frame; every read fails with
//! [`SpawnError::MalformedPayload`] on underflow, so a truncated or
//! corrupt frame can never run past its end.  [`FdQueue`] owns the
//! file descriptors that arrived with the frame and hands them out in
//! the order they were attached; whatever is left when the queue is
//! dropped is closed.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::fd::OwnedFd;

use crate::error::SpawnError;
use crate::Result;

/// Cursor over the body of a received frame.
pub struct Payload<'a> {
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(SpawnError::MalformedPayload);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_ne_bytes([raw[0], raw[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let raw = self.take(4)?;
        Ok(i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_ne_bytes(bytes))
    }

    /// Read a NUL-terminated byte string, bounded by the remaining
    /// payload.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let nul = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(SpawnError::MalformedPayload)?;
        let raw = self.take(nul + 1)?;
        Ok(&raw[..nul])
    }

    /// Read a NUL-terminated UTF-8 string.
    pub fn read_str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| SpawnError::MalformedPayload)
    }

    /// Read a NUL-terminated string as an owned C string (arbitrary
    /// non-NUL bytes; used for paths and argv).
    pub fn read_cstring(&mut self) -> Result<CString> {
        CString::new(self.read_bytes()?).map_err(|_| SpawnError::MalformedPayload)
    }
}

/// FIFO of file descriptors received with one frame.
#[derive(Debug, Default)]
pub struct FdQueue {
    fds: VecDeque<OwnedFd>,
}

impl FdQueue {
    #[must_use]
    pub fn new(fds: Vec<OwnedFd>) -> Self {
        Self { fds: fds.into() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Move out the next received descriptor; a frame that consumes
    /// more descriptors than it carried is malformed.
    pub fn take(&mut self) -> Result<OwnedFd> {
        self.fds.pop_front().ok_or(SpawnError::MalformedPayload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn reads_are_bounds_checked() {
        let mut p = Payload::new(&[0x42]);
        assert_eq!(p.read_byte().unwrap(), 0x42);
        assert!(p.is_empty());
        assert!(matches!(
            p.read_byte(),
            Err(SpawnError::MalformedPayload)
        ));

        let mut p = Payload::new(&[1, 2, 3]);
        assert!(p.read_i32().is_err());
    }

    #[test]
    fn integers_use_native_endianness() {
        let value = 0x1234_5678i32;
        let bytes = value.to_ne_bytes();
        let mut p = Payload::new(&bytes);
        assert_eq!(p.read_i32().unwrap(), value);

        let value = 0o644u16;
        let bytes = value.to_ne_bytes();
        let mut p = Payload::new(&bytes);
        assert_eq!(p.read_u16().unwrap(), value);
    }

    #[test]
    fn strings_stop_at_nul() {
        let mut p = Payload::new(b"hello\0world\0");
        assert_eq!(p.read_str().unwrap(), "hello");
        assert_eq!(p.read_cstring().unwrap().as_bytes(), b"world");
        assert!(p.is_empty());
    }

    #[test]
    fn unterminated_string_is_malformed() {
        let mut p = Payload::new(b"no terminator");
        assert!(matches!(
            p.read_str(),
            Err(SpawnError::MalformedPayload)
        ));
    }

    #[test]
    fn fd_queue_is_fifo_and_bounded() {
        let (r, w) = pipe().unwrap();
        let mut queue = FdQueue::new(vec![r, w]);
        assert_eq!(queue.len(), 2);

        let first = queue.take().unwrap();
        let second = queue.take().unwrap();
        use std::os::fd::AsRawFd;
        assert!(first.as_raw_fd() != second.as_raw_fd());
        assert!(queue.take().is_err());
    }
}
