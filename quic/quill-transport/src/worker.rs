// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Workers: single-threaded cooperative loops owning connections.
//!
//! A connection is pinned to one worker for its lifetime; every state
//! mutation happens on that thread. Other threads reach a connection
//! only by posting operations onto the worker's queue. The loop drains
//! operations with a per-connection budget so one busy connection
//! cannot starve the rest, runs expired timers from the wheel, and
//! flushes the send engine.

use crate::{
    connection::Connection,
    datapath::{Datagram, Tx},
    lookup::Lookup,
    timer_wheel::TimerWheel,
};
use hashbrown::HashMap;
use quill_core::time::{Clock, StdClock, Timestamp};
use std::{
    collections::VecDeque,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

/// Stable identifier of a connection on its worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// A queued unit of work on a connection
pub enum Operation {
    /// An inbound datagram routed by a binding
    Route(Datagram),
    /// Run the send engine
    FlushSend,
    /// Re-evaluate timers
    TimerExpired,
    /// An application call executed on the owning worker
    Api(Box<dyn FnOnce(&mut Connection) + Send>),
    /// Cross-thread shutdown request
    Shutdown {
        error: quill_core::transport::Error,
        is_application: bool,
        reason: Vec<u8>,
        silent: bool,
    },
}

enum Message {
    Register {
        handle: ConnectionHandle,
        connection: Box<Connection>,
        tx: Arc<dyn Tx>,
        lookup: Arc<Lookup>,
    },
    Op {
        handle: ConnectionHandle,
        op: Operation,
    },
    Stop,
}

struct Entry {
    connection: Box<Connection>,
    ops: VecDeque<Operation>,
    queued: bool,
    tx: Arc<dyn Tx>,
    lookup: Arc<Lookup>,
    unregistered: bool,
}

// per-connection drain budget; a connection with more work re-queues
// itself behind its peers
const OPS_PER_TURN: usize = 16;

/// Messages drained from the intake per loop iteration
const INTAKE_BATCH: usize = 64;

pub struct Worker {
    connections: HashMap<ConnectionHandle, Entry>,
    ready: VecDeque<ConnectionHandle>,
    wheel: TimerWheel,
    intake: mpsc::Receiver<Message>,
    clock: Arc<StdClock>,
}

/// The cross-thread face of a worker
#[derive(Clone)]
pub struct WorkerHandle {
    pub index: usize,
    sender: mpsc::Sender<Message>,
}

impl WorkerHandle {
    pub fn register(
        &self,
        handle: ConnectionHandle,
        connection: Box<Connection>,
        tx: Arc<dyn Tx>,
        lookup: Arc<Lookup>,
    ) {
        let _ = self.sender.send(Message::Register {
            handle,
            connection,
            tx,
            lookup,
        });
    }

    /// Posts an operation; returns immediately
    pub fn post(&self, handle: ConnectionHandle, op: Operation) {
        let _ = self.sender.send(Message::Op { handle, op });
    }

    /// Runs `f` on the connection's worker and waits for the result
    pub fn call<R, F>(&self, handle: ConnectionHandle, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        self.post(
            handle,
            Operation::Api(Box::new(move |connection| {
                let _ = result_tx.send(f(connection));
            })),
        );
        result_rx.recv().ok()
    }

    pub(crate) fn stop(&self) {
        let _ = self.sender.send(Message::Stop);
    }
}

/// Spawns a worker thread; the handle routes work to it
pub fn spawn(index: usize, clock: Arc<StdClock>) -> (WorkerHandle, thread::JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel();
    let worker = Worker {
        connections: HashMap::new(),
        ready: VecDeque::new(),
        wheel: TimerWheel::new(),
        intake: receiver,
        clock,
    };
    let join = thread::Builder::new()
        .name(format!("quill-worker-{index}"))
        .spawn(move || worker.run())
        .expect("worker thread spawn");
    (WorkerHandle { index, sender }, join)
}

impl Worker {
    fn run(mut self) {
        loop {
            let now = self.clock.now();
            let wait = if self.ready.is_empty() {
                self.wheel
                    .next_wait(now)
                    .unwrap_or(Duration::from_secs(3600))
            } else {
                Duration::ZERO
            };

            match self.intake.recv_timeout(wait) {
                Ok(Message::Stop) => return,
                Ok(message) => self.on_message(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }

            // batch the rest of the intake without blocking
            for _ in 0..INTAKE_BATCH {
                match self.intake.try_recv() {
                    Ok(Message::Stop) => return,
                    Ok(message) => self.on_message(message),
                    Err(_) => break,
                }
            }

            let now = self.clock.now();
            self.run_timers(now);
            self.run_ready(now);
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Register {
                handle,
                connection,
                tx,
                lookup,
            } => {
                let expiration = connection.next_expiration();
                self.wheel.update(handle, expiration);
                self.connections.insert(
                    handle,
                    Entry {
                        connection,
                        ops: VecDeque::new(),
                        queued: false,
                        tx,
                        lookup,
                        unregistered: false,
                    },
                );
                self.mark_ready(handle);
            }
            Message::Op { handle, op } => {
                if let Some(entry) = self.connections.get_mut(&handle) {
                    entry.ops.push_back(op);
                    self.mark_ready(handle);
                }
            }
            Message::Stop => unreachable!("handled by the caller"),
        }
    }

    fn mark_ready(&mut self, handle: ConnectionHandle) {
        if let Some(entry) = self.connections.get_mut(&handle) {
            if !entry.queued {
                entry.queued = true;
                self.ready.push_back(handle);
            }
        }
    }

    fn run_timers(&mut self, now: Timestamp) {
        for handle in self.wheel.get_expired(now) {
            if let Some(entry) = self.connections.get_mut(&handle) {
                entry.ops.push_back(Operation::TimerExpired);
                self.mark_ready(handle);
            }
        }
    }

    /// Services each ready connection once, with a bounded budget
    fn run_ready(&mut self, now: Timestamp) {
        let turn = self.ready.len();
        for _ in 0..turn {
            let Some(handle) = self.ready.pop_front() else {
                break;
            };
            let Some(entry) = self.connections.get_mut(&handle) else {
                continue;
            };
            entry.queued = false;

            for _ in 0..OPS_PER_TURN {
                let Some(op) = entry.ops.pop_front() else {
                    break;
                };
                let connection = &mut entry.connection;
                match op {
                    Operation::Route(mut datagram) => {
                        connection.on_datagram(&mut datagram.payload, datagram.remote, now);
                    }
                    Operation::FlushSend => {
                        connection.send.request_flush();
                    }
                    Operation::TimerExpired => connection.on_timer_expired(now),
                    Operation::Api(call) => call(connection),
                    Operation::Shutdown {
                        error,
                        is_application,
                        reason,
                        silent,
                    } => {
                        connection.close(error, is_application, &reason, silent, now);
                    }
                }
            }

            // one full send flush per turn
            if entry.connection.send.take_flush_request() {
                let datagrams = entry.connection.process_flush_send(now);
                if !datagrams.is_empty() {
                    entry.tx.send(datagrams);
                }
            }

            // retired source CIDs leave the lookup from here, the only
            // place allowed to touch shared state
            for cid in entry.connection.retired_local_cids.drain(..) {
                entry.lookup.remove(&cid);
            }

            if entry.connection.state().is_closed() && !entry.unregistered {
                entry.unregistered = true;
                for local in entry.connection.cids.local_cids() {
                    entry.lookup.remove(&local.cid);
                }
            }

            self.wheel
                .update(handle, entry.connection.next_expiration());

            if !entry.ops.is_empty() {
                self.mark_ready(handle);
            }
        }
    }
}
