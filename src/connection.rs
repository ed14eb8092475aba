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

//! Ties a socket to its read/write buffers, parser, and responder.
//!
//! The reactor owns every `Connection` through its `Slab`; a worker task
//! borrows one connection mutably for the duration of `process`/`write_ready`.
//! One-shot readiness means the OS will not redeliver events for this fd
//! until the reactor re-registers it, so this borrow is exclusive in
//! practice without any lock here.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use tracing::debug;

use crate::buffer::Buffer;
use crate::db::{DbHandle, DbHandlePool};
use crate::http::{Request, Response, Status};

/// Live connection count, incremented on `Connection::new` and decremented
/// on `close` (idempotent — only the first `close` call decrements).
pub static CONNECTION_COUNT: AtomicUsize = AtomicUsize::new(0);

const WRITE_WATERMARK: usize = 10240;
const READ_BUF_CAPACITY: usize = 4096;
const WRITE_BUF_CAPACITY: usize = 4096;

/// Outcome of a read-readiness notification.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read (or there was nothing to read on a level-triggered
    /// poll); the caller should submit a worker task to run `process`.
    Readable,
    /// The peer closed its write side (`read` returned `0`).
    PeerClosed,
}

/// Outcome of a write-readiness notification.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every queued byte (buffer + mapped file) was written.
    Done,
    /// The socket isn't ready for more writes yet; stay registered for
    /// `WRITE` and wait for the next readiness event.
    WouldBlock,
}

/// What the reactor should do with this connection's registered interest
/// after a worker task finishes.
#[derive(Debug, PartialEq, Eq)]
pub enum NextInterest {
    Read,
    Write,
    Close,
}

/// A single accepted connection: socket, buffers, and the parser/responder
/// pair that turns bytes into bytes.
pub struct Connection {
    stream: TcpStream,
    token: Token,
    peer_addr: SocketAddr,
    closed: bool,
    edge_triggered: bool,

    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,

    /// Offset into the mapped file already written, since `writev` may
    /// split a single gather-write across several calls.
    file_offset: usize,
    /// Keep-alive outcome of the most recently completed `process` call.
    keep_alive: bool,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        source_root: Arc<PathBuf>,
        edge_triggered: bool,
    ) -> Self {
        CONNECTION_COUNT.fetch_add(1, Ordering::SeqCst);
        Self {
            response: Response::new((*source_root).clone()),
            stream,
            token,
            peer_addr,
            closed: false,
            edge_triggered,
            read_buf: Buffer::new(READ_BUF_CAPACITY),
            write_buf: Buffer::new(WRITE_BUF_CAPACITY),
            request: Request::new(),
            file_offset: 0,
            keep_alive: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Idempotent: unmaps any mapped file and decrements the live-connection
    /// count exactly once, regardless of how many times this is called.
    pub fn close(&mut self) {
        self.response.unmap_file();
        if !self.closed {
            self.closed = true;
            CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Scatter-reads until `WouldBlock` (edge-triggered) or once
    /// (level-triggered). Returns `PeerClosed` on an orderly shutdown by
    /// the peer; other I/O errors propagate to the caller, which closes
    /// the connection.
    pub fn read_ready(&mut self) -> io::Result<ReadOutcome> {
        loop {
            match self.read_buf.read_from_fd(self.stream.as_raw_fd()) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(_) => {
                    if !self.edge_triggered {
                        return Ok(ReadOutcome::Readable);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Readable),
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses as much of a request as the read buffer currently holds and,
    /// if a full request is available, builds a response. Returns `true`
    /// if a response was built (the caller should re-arm for `WRITE`), or
    /// `false` if there wasn't enough data yet (stay on `READ`).
    ///
    /// Does not reset `request` itself: a request split across several
    /// read-readiness events must resume the state its previous `process`
    /// call left it in. Callers starting a fresh request (keep-alive
    /// pipelining, see `finish_write`) reset explicitly first.
    pub fn process<H: DbHandle>(&mut self, pool: &DbHandlePool<H>) -> bool {
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }

        match self.request.parse(&mut self.read_buf) {
            Ok(true) => {
                self.resolve_endpoint(pool);
                self.keep_alive = self.request.is_keep_alive();
                self.response.init(self.request.path().to_string(), self.keep_alive, Some(Status::Ok));
            }
            Ok(false) => return false,
            Err(e) => {
                debug!(token = self.token.0, error = %e, "malformed request line");
                self.keep_alive = false;
                self.response.init(self.request.path().to_string(), false, Some(Status::BadRequest));
            }
        }

        self.file_offset = 0;
        self.response.make_response(&mut self.write_buf);
        true
    }

    fn resolve_endpoint<H: DbHandle>(&mut self, pool: &DbHandlePool<H>) {
        let Some((tag, username, password)) = self.request.endpoint() else { return };
        if username.is_empty() || password.is_empty() {
            self.request.set_path("/error.html".to_string());
            return;
        }

        let username = username.to_string();
        let password = password.to_string();
        let mut handle = pool.get();

        use crate::http::EndpointTag;
        let verified = match tag {
            EndpointTag::Login => handle
                .query_user(&username)
                .map(|row| row.is_some_and(|u| u.password == password))
                .unwrap_or(false),
            EndpointTag::Register => handle.insert_user(&username, &password).unwrap_or(false),
        };

        self.request.set_path(if verified { "/welcome.html" } else { "/error.html" }.to_string());
    }

    fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + (self.response.file_len() - self.file_offset)
    }

    /// Gather-writes `[write buffer, mapped file]` until either everything
    /// queued has been sent or the socket blocks. Edge-triggered connections
    /// keep writing past a single `write_vectored_with` call as long as
    /// bytes remain; level-triggered connections also keep going while more
    /// than `WRITE_WATERMARK` bytes are still queued, to avoid needing a
    /// full extra readiness round trip for a response that's mostly done.
    pub fn write_ready(&mut self) -> io::Result<WriteOutcome> {
        loop {
            if self.to_write_bytes() == 0 {
                return Ok(WriteOutcome::Done);
            }

            let buf_len = self.write_buf.readable_bytes();
            let file_bytes = self.response.file_bytes().unwrap_or(&[]);
            let extra = &file_bytes[self.file_offset.min(file_bytes.len())..];

            match self.write_buf.write_vectored_with(self.stream.as_raw_fd(), extra) {
                Ok(n) => {
                    if n <= buf_len {
                        self.write_buf.retrieve(n);
                    } else {
                        self.write_buf.retrieve(buf_len);
                        self.file_offset += n - buf_len;
                    }
                    if self.to_write_bytes() == 0 {
                        return Ok(WriteOutcome::Done);
                    }
                    if !(self.edge_triggered || self.to_write_bytes() > WRITE_WATERMARK) {
                        return Ok(WriteOutcome::WouldBlock);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteOutcome::WouldBlock),
                Err(e) => return Err(e),
            }
        }
    }

    /// After a completed write: on keep-alive, resets parser state and
    /// either re-runs `process` against any already-buffered pipelined
    /// bytes or waits for the next read. On a non-keep-alive connection,
    /// tells the caller to close.
    pub fn finish_write<H: DbHandle>(&mut self, pool: &DbHandlePool<H>) -> NextInterest {
        if !self.keep_alive {
            return NextInterest::Close;
        }
        self.response.unmap_file();
        self.file_offset = 0;
        self.request.reset();
        if self.process(pool) {
            NextInterest::Write
        } else {
            NextInterest::Read
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
