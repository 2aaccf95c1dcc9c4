//! Bounded encoding of outgoing datagrams
//!
//! The encoder owns a payload buffer capped at
//! [`protocol::MAX_PAYLOAD`] and a file-descriptor array capped at
//! [`protocol::MAX_SEND_FDS`]; every append fails with
//! [`SpawnError::PayloadTooLarge`] once a cap is hit.  Descriptors
//! are borrowed, not owned: the caller keeps them alive until the
//! datagram has been sent.

use std::ffi::CStr;
use std::os::fd::RawFd;

use crate::error::SpawnError;
use crate::protocol::{ExecCommand, RequestCommand, ResponseCommand, MAX_PAYLOAD, MAX_SEND_FDS};
use crate::Result;

pub struct Serializer {
    buffer: Vec<u8>,
    fds: Vec<RawFd>,
}

impl Serializer {
    #[must_use]
    pub fn request(cmd: RequestCommand) -> Self {
        Self::with_opcode(cmd as u8)
    }

    #[must_use]
    pub fn response(cmd: ResponseCommand) -> Self {
        Self::with_opcode(cmd as u8)
    }

    fn with_opcode(opcode: u8) -> Self {
        let mut buffer = Vec::with_capacity(256);
        buffer.push(opcode);
        Self {
            buffer,
            fds: Vec::new(),
        }
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_raw(&value.to_ne_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_raw(&value.to_ne_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_raw(&value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_ne_bytes())
    }

    /// Append a NUL-terminated string.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        debug_assert!(!value.as_bytes().contains(&0));
        self.write_raw(value.as_bytes())?;
        self.write_raw(&[0])
    }

    /// Append a NUL-terminated C string.
    pub fn write_cstr(&mut self, value: &CStr) -> Result<()> {
        self.write_raw(value.to_bytes_with_nul())
    }

    pub fn write_exec(&mut self, cmd: ExecCommand) -> Result<()> {
        self.write_byte(cmd as u8)
    }

    /// Append a flag sub-command only when `value` is set.
    pub fn write_exec_optional(&mut self, cmd: ExecCommand, value: bool) -> Result<()> {
        if value {
            self.write_exec(cmd)?;
        }
        Ok(())
    }

    /// Append a string-valued sub-command.
    pub fn write_exec_str(&mut self, cmd: ExecCommand, value: &str) -> Result<()> {
        self.write_exec(cmd)?;
        self.write_str(value)
    }

    /// Append a sub-command that consumes one passed descriptor.
    pub fn write_exec_fd(&mut self, cmd: ExecCommand, fd: RawFd) -> Result<()> {
        if self.fds.len() >= MAX_SEND_FDS {
            return Err(SpawnError::PayloadTooLarge);
        }
        self.write_exec(cmd)?;
        self.fds.push(fd);
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buffer.len() + bytes.len() > MAX_PAYLOAD {
            return Err(SpawnError::PayloadTooLarge);
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    #[test]
    fn encode_then_decode_exit_response() {
        let mut s = Serializer::response(ResponseCommand::Exit);
        s.write_i32(7).unwrap();
        s.write_i32(0x0f00).unwrap();

        let mut p = Payload::new(s.payload());
        assert_eq!(
            ResponseCommand::try_from(p.read_byte().unwrap()).unwrap(),
            ResponseCommand::Exit
        );
        assert_eq!(p.read_i32().unwrap(), 7);
        assert_eq!(p.read_i32().unwrap(), 0x0f00);
        assert!(p.is_empty());
    }

    #[test]
    fn payload_cap_is_enforced() {
        let mut s = Serializer::request(RequestCommand::Execute);
        let chunk = "x".repeat(4096);
        loop {
            match s.write_str(&chunk) {
                Ok(()) => continue,
                Err(SpawnError::PayloadTooLarge) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(s.payload().len() <= MAX_PAYLOAD);
    }

    #[test]
    fn fd_cap_is_enforced() {
        let mut s = Serializer::request(RequestCommand::Execute);
        for _ in 0..MAX_SEND_FDS {
            s.write_exec_fd(ExecCommand::Stdin, 0).unwrap();
        }
        assert!(matches!(
            s.write_exec_fd(ExecCommand::Stdin, 0),
            Err(SpawnError::PayloadTooLarge)
        ));
    }

    #[test]
    fn optional_flags_are_omitted_when_clear() {
        let mut s = Serializer::request(RequestCommand::Execute);
        s.write_exec_optional(ExecCommand::Tty, false).unwrap();
        s.write_exec_optional(ExecCommand::NoNewPrivs, true).unwrap();
        assert_eq!(s.payload().len(), 2);
        assert_eq!(s.payload()[1], ExecCommand::NoNewPrivs as u8);
    }
}
