// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable, contiguous byte buffer with scatter-read and gather-ready peek.
//!
//! Three cursors partition the backing allocation:
//! `[0, read)` is prependable, `[read, write)` is readable, `[write, cap)`
//! is writable. The invariant `0 <= read <= write <= cap` holds after every
//! operation.

use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::os::fd::RawFd;

/// 64 KiB overflow region used by `read_from_fd`'s scatter read. Also the
/// theoretical max size of a single IP packet, which bounds how much a
/// single `readv` is likely to return beyond the buffer's own tail.
const OVERFLOW_LEN: usize = 65536;

/// A growable byte buffer used for both the per-connection read and write
/// sides.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl Buffer {
    /// Creates a buffer with at least `capacity` bytes of initial storage.
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0u8; capacity], read: 0, write: 0 }
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write - self.read
    }

    /// Bytes available to write without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write
    }

    /// Bytes prependable (already retrieved, reusable space at the front).
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read
    }

    /// A view of the currently readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Advances the read cursor by `n` bytes, which must not exceed
    /// `readable_bytes()`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        self.read += n;
    }

    /// Advances the read cursor up to (and including) `end`, a pointer-like
    /// offset into the readable region, expressed here as a byte count from
    /// the start of `peek()`.
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    /// Zeros the buffer and resets both cursors to zero.
    pub fn retrieve_all(&mut self) {
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.read = 0;
        self.write = 0;
    }

    /// Retrieves everything readable as an owned `String`, resetting the
    /// buffer in the process.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Ensures at least `len` writable bytes are available, sliding the
    /// readable region down to offset 0 if there is enough combined slack,
    /// otherwise reallocating.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len {
            self.buf.resize(self.write + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = readable;
        }
    }

    /// Appends `data`, growing the buffer first if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write += data.len();
    }

    /// The writable tail as a mutable slice, for direct writes followed by
    /// `mark_written`.
    fn writable_tail_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.write..]
    }

    /// Marks `n` bytes of the writable tail as now readable.
    fn mark_written(&mut self, n: usize) {
        self.write = self.buf.len().min(self.write + n);
    }

    /// Scatter-reads from `fd` into the buffer's writable tail and a 64 KiB
    /// stack overflow region in a single `readv`, minimizing syscalls per
    /// readiness notification. Returns the number of bytes read, `0` on
    /// peer shutdown, or an `io::Error` (callers check `ErrorKind::WouldBlock`
    /// for the non-fatal case under edge-triggered readiness).
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_LEN];
        let writable = self.writable_bytes();

        let tail = self.writable_tail_mut();
        let iov = [
            libc::iovec { iov_base: tail.as_mut_ptr().cast(), iov_len: tail.len() },
            libc::iovec { iov_base: overflow.as_mut_ptr().cast(), iov_len: overflow.len() },
        ];

        // SAFETY: both iovec entries point into live, appropriately sized
        // buffers for the duration of the call; `fd` is a valid, open
        // descriptor owned by the caller for the lifetime of this call.
        let len = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as i32) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = len as usize;
        if n <= writable {
            self.mark_written(n);
        } else {
            self.mark_written(writable);
            self.append(&overflow[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd` in a single `write`, advancing the
    /// read cursor by the amount actually written.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        // SAFETY: `readable` is a valid slice for the duration of the call;
        // `fd` is a valid, open descriptor owned by the caller.
        let len = unsafe { libc::write(fd, readable.as_ptr().cast(), readable.len()) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = len as usize;
        self.retrieve(n);
        Ok(n)
    }

    /// Writes a gather-vector of `[readable buffer region, extra bytes]` to
    /// `fd` in one `writev`, for the connection's body-mapped-file path.
    /// Returns the number of bytes written across both slices. Does not
    /// itself advance any cursor; the caller tracks how much of each region
    /// was consumed (see `Connection::write_ready`).
    pub fn write_vectored_with(&self, fd: RawFd, extra: &[u8]) -> io::Result<usize> {
        let readable = self.peek();
        let iov = [
            libc::iovec { iov_base: readable.as_ptr() as *mut _, iov_len: readable.len() },
            libc::iovec { iov_base: extra.as_ptr() as *mut _, iov_len: extra.len() },
        ];

        // SAFETY: both iovec entries point at slices valid for the duration
        // of the call; the kernel only reads from them since this is a
        // write.
        let len = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(len as usize)
    }
}

impl Write for Buffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.peek()
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read..self.write]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_peek_round_trips() {
        let mut buf = Buffer::new(4);
        buf.append(b"hello");
        assert_eq!(buf.peek(), b"hello");
        assert_eq!(buf.readable_bytes(), 5);
    }

    #[test]
    fn retrieve_advances_read_cursor_only() {
        let mut buf = Buffer::new(16);
        buf.append(b"abcdef");
        buf.retrieve(3);
        assert_eq!(buf.peek(), b"def");
    }

    #[test]
    fn retrieve_all_zeros_and_resets() {
        let mut buf = Buffer::new(16);
        buf.append(b"abcdef");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), buf.buf.len());
        assert!(buf.buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn ensure_writable_grows_buffer() {
        let mut buf = Buffer::new(4);
        buf.ensure_writable(100);
        assert!(buf.writable_bytes() >= 100);
    }

    #[test]
    fn ensure_writable_compacts_before_reallocating() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789012345"); // fills capacity
        buf.retrieve(14); // free up prependable space
        let cap_before = buf.buf.len();
        buf.ensure_writable(10);
        // slack (prependable + writable) covers the request without growth
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.peek(), b"45");
    }

    #[test]
    fn deref_and_deref_mut_expose_the_readable_region() {
        let mut buf = Buffer::new(16);
        buf.append(b"abcdef");
        assert_eq!(&*buf, b"abcdef");
        buf[0] = b'z';
        assert_eq!(buf.peek(), b"zbcdef");
    }

    #[test]
    fn sequence_of_append_and_retrieve_preserves_bytes() {
        let mut buf = Buffer::new(4);
        let mut model: Vec<u8> = Vec::new();
        let ops: [(&[u8], usize); 4] =
            [(b"abc", 1), (b"defgh", 2), (b"", 3), (b"ij", 0)];

        for (data, retrieve) in ops {
            buf.append(data);
            model.extend_from_slice(data);

            let n = retrieve.min(model.len());
            assert_eq!(&model[..n], &buf.peek()[..n]);
            buf.retrieve(n);
            model.drain(..n);
        }

        assert_eq!(buf.peek(), model.as_slice());
    }
}
