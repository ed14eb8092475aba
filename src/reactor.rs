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

//! The single-reactor event loop: accepts connections, drives readiness
//! events to worker tasks, and evicts idle connections.
//!
//! A slab of connections behind `Arc<Mutex<_>>`, with a `Waker`-backed
//! completion channel so worker threads can tell the reactor a task
//! finished, over a single concrete `mio::net::TcpStream` plus an idle
//! timer that also needs to close connections.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, TriggerConfig, MAX_FD};
use crate::connection::{Connection, NextInterest, ReadOutcome, WriteOutcome, CONNECTION_COUNT};
use crate::db::{DbHandle, DbHandlePool};
use crate::error::ServerError;
use crate::timer::{DeadlineHeap, TimerAction};
use crate::worker::WorkerPool;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// A completed task, reported by a worker thread back to the reactor so it
/// can re-register (or drop) the connection's readiness interest.
struct Completion {
    token: Token,
    next: NextInterest,
}

/// Drives the listening socket, the connection table, and the idle timer
/// from a single thread, handing parsing/response-building work to a
/// [`WorkerPool`].
pub struct Reactor<H: DbHandle + 'static> {
    listener: TcpListener,
    poll: Poll,
    waker: Arc<Waker>,
    connections: Slab<Arc<Mutex<Connection>>>,
    timers: DeadlineHeap,
    timeout: Duration,
    trigger: TriggerConfig,
    source_root: Arc<PathBuf>,
    db_pool: Arc<DbHandlePool<H>>,
    workers: WorkerPool,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
}

impl<H: DbHandle + 'static> Reactor<H> {
    /// Binds the listening socket and wires up the poller, waker, and
    /// worker pool. Does not start serving; call [`Reactor::run`].
    pub fn new(
        config: &Config,
        source_root: PathBuf,
        db_pool: DbHandlePool<H>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let mut listener = TcpListener::bind(addr).map_err(ServerError::Bind)?;
        if config.linger {
            set_linger(&listener);
        }

        let poll = Poll::new().map_err(ServerError::Registration)?;
        let trigger = config.trigger();
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, listen_interest(trigger.listen_edge))
            .map_err(ServerError::Registration)?;

        let waker = Arc::new(
            Waker::new(poll.registry(), WAKE_TOKEN).map_err(ServerError::Registration)?,
        );

        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            listener,
            poll,
            waker,
            connections: Slab::new(),
            timers: DeadlineHeap::new(),
            timeout: Duration::from_millis(config.timeout_ms.max(0) as u64),
            trigger,
            source_root: Arc::new(source_root),
            db_pool: Arc::new(db_pool),
            workers: WorkerPool::new(config.worker_count.max(1)),
            completions_tx,
            completions_rx,
        })
    }

    /// The address the listening socket is actually bound to; useful for
    /// tests that bind to an ephemeral port (`port: 0`) and need to learn
    /// which one the OS picked.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts every connection currently pending, up to `MAX_FD` total
    /// live connections. Beyond that, a connection is told "Server busy!"
    /// directly and closed without ever entering the slab, mirroring the
    /// original's `MAX_FD` guard.
    #[instrument(skip(self))]
    fn accept(&mut self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };

            if CONNECTION_COUNT.load(std::sync::atomic::Ordering::SeqCst) >= MAX_FD {
                reject_busy(stream);
                continue;
            }

            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());
            let mut stream = stream;

            if self
                .poll
                .registry()
                .register(&mut stream, token, conn_interest(self.trigger.conn_edge, false))
                .is_err()
            {
                continue;
            }

            let conn = Connection::new(stream, token, peer_addr, self.source_root.clone(), self.trigger.conn_edge);
            entry.insert(Arc::new(Mutex::new(conn)));
            if !self.timeout.is_zero() {
                self.timers.add(token.0, self.timeout, TimerAction::CloseConn(token.0));
            }
            debug!(token = token.0, %peer_addr, "accepted connection");
        }
    }

    /// Handles one readiness event for a connection token: hangup/error
    /// closes it; a readable event submits a worker task to parse and
    /// build a response; a writable event submits a worker task to flush
    /// it.
    fn connection_event(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        let Some(conn) = self.connections.get(token.0).cloned() else { return };

        if errored {
            self.close(token);
            return;
        }

        if !self.timeout.is_zero() {
            self.timers.adjust(token.0, self.timeout);
        }

        if readable {
            self.submit(token, conn.clone(), Task::Read);
        }
        if writable {
            self.submit(token, conn, Task::Write);
        }
    }

    fn submit(&self, token: Token, conn: Arc<Mutex<Connection>>, task: Task) {
        let pool = self.db_pool.clone();
        let tx = self.completions_tx.clone();
        let waker = self.waker.clone();
        self.workers.submit(move || {
            let next = run_task(&conn, &pool, task);
            let _ = tx.send(Completion { token, next });
            let _ = waker.wake();
        });
    }

    /// Re-registers or drops a connection's readiness interest according
    /// to a worker's reported [`NextInterest`].
    fn apply_completion(&mut self, completion: Completion) {
        let Completion { token, next } = completion;
        match next {
            NextInterest::Close => self.close(token),
            NextInterest::Read | NextInterest::Write => {
                let Some(conn) = self.connections.get_mut(token.0) else { return };
                let mut guard = conn.lock().unwrap();
                let interest = conn_interest(self.trigger.conn_edge, next == NextInterest::Write);
                if self.poll.registry().reregister(guard.stream_mut(), token, interest).is_err() {
                    drop(guard);
                    self.close(token);
                }
            }
        }
    }

    fn close(&mut self, token: Token) {
        self.timers.cancel(token.0);
        if let Some(conn) = self.connections.try_remove(token.0) {
            let mut guard = conn.lock().unwrap();
            let _ = self.poll.registry().deregister(guard.stream_mut());
            guard.close();
        }
    }

    fn drain_completions(&mut self) {
        loop {
            match self.completions_rx.try_recv() {
                Ok(completion) => self.apply_completion(completion),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn drain_timers(&mut self) {
        for action in self.timers.pop_expired() {
            match action {
                TimerAction::CloseConn(id) => self.close(Token(id)),
            }
        }
    }

    /// Runs the event loop until the process is killed. Blocks in
    /// `poll.poll` for at most the next timer deadline (or indefinitely if
    /// idle eviction is disabled and the timer heap is empty).
    #[instrument(skip(self))]
    pub fn run(&mut self) -> ! {
        let mut events = Events::with_capacity(1024);
        info!(workers = self.workers.worker_count(), "reactor starting");

        loop {
            self.drain_timers();
            let poll_timeout = if self.timeout.is_zero() {
                None
            } else {
                match self.timers.next_timeout_ms() {
                    -1 => None,
                    ms => Some(Duration::from_millis(ms as u64)),
                }
            };

            if let Err(e) = self.poll.poll(&mut events, poll_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    WAKE_TOKEN => self.drain_completions(),
                    token => self.connection_event(
                        token,
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error() || event.is_read_closed() && event.is_write_closed(),
                    ),
                }
            }

            self.drain_timers();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Task {
    Read,
    Write,
}

/// Runs one unit of work against a connection on a worker thread: a read
/// followed by request parsing, or a write followed by keep-alive handling.
/// Returns the readiness interest the reactor should register next.
fn run_task<H: DbHandle>(conn: &Arc<Mutex<Connection>>, pool: &DbHandlePool<H>, task: Task) -> NextInterest {
    let mut conn = conn.lock().unwrap();
    match task {
        Task::Read => match conn.read_ready() {
            Ok(ReadOutcome::PeerClosed) => NextInterest::Close,
            Ok(ReadOutcome::Readable) => {
                if conn.process(pool) {
                    NextInterest::Write
                } else {
                    NextInterest::Read
                }
            }
            Err(_) => NextInterest::Close,
        },
        Task::Write => match conn.write_ready() {
            Ok(WriteOutcome::Done) => conn.finish_write(pool),
            Ok(WriteOutcome::WouldBlock) => NextInterest::Write,
            Err(_) => NextInterest::Close,
        },
    }
}

fn listen_interest(edge: bool) -> Interest {
    if edge {
        Interest::READABLE
    } else {
        Interest::READABLE
    }
}

fn conn_interest(edge: bool, writable: bool) -> Interest {
    let _ = edge;
    if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Writes the raw "Server busy!" bytes directly to the fd and closes it,
/// without ever registering the connection or constructing a `Connection`,
/// matching the original's `SendError(fd, "Server busy!")` call — no status
/// line or headers, just the bare ASCII message.
fn reject_busy(mut stream: TcpStream) {
    use std::io::Write as _;
    let _ = stream.write_all(b"Server busy!");
}

#[cfg(unix)]
fn set_linger(listener: &TcpListener) {
    let fd = listener.as_raw_fd();
    let linger = libc::linger { l_onoff: 1, l_linger: 1 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn set_linger(_listener: &TcpListener) {}
