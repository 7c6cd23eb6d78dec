// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The library context: an explicit value owning the worker fleet, the
//! binding list, the once-set retry key and the process randomness.
//! Nothing in the transport is process-global; everything hangs off a
//! `Library` built at startup.

use crate::{
    binding::Binding,
    config::Settings,
    connection::{Connection, Event},
    datapath::Tx,
    lookup::Route,
    retry::RetryKey,
    stream::{set::OpenStatus, ApiError},
    tls,
    worker::{self, ConnectionHandle, Operation, WorkerHandle},
};
use once_cell::sync::OnceCell;
use quill_core::{
    connection::ConnectionId,
    endpoint,
    event as core_event,
    stream::{StreamId, StreamType},
    time::{Clock, StdClock},
    transport,
    varint::VarInt,
};
use ring::rand::{SecureRandom, SystemRandom};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

/// State shared between the API surface, bindings and workers
pub struct Shared {
    pub settings: Arc<Settings>,
    pub subscriber: Arc<dyn core_event::Subscriber>,
    pub tls: Arc<dyn tls::Provider>,
    pub workers: Vec<WorkerHandle>,
    pub clock: Arc<StdClock>,

    bindings: Mutex<Vec<Arc<Binding>>>,
    retry_key: OnceCell<RetryKey>,
    rng: SystemRandom,
    hash_keys: (u64, u64),
    next_handle: AtomicU64,
    next_worker: AtomicUsize,
}

impl Shared {
    pub(crate) fn alloc_handle(&self) -> ConnectionHandle {
        ConnectionHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn pick_worker(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Generates a source CID whose partition byte pins the connection
    /// to `worker_index`
    pub(crate) fn generate_cid(&self, worker_index: usize) -> ConnectionId {
        let mut bytes = [0u8; quill_core::connection::id::MAX_LEN];
        let len = self.settings.local_cid_len;
        let _ = self.rng.fill(&mut bytes[..len]);
        bytes[quill_core::connection::id::PARTITION_INDEX] = worker_index as u8;
        ConnectionId::try_from_slice(&bytes[..len]).expect("configured length is valid")
    }

    pub(crate) fn fill_random(&self, out: &mut [u8]) {
        let _ = self.rng.fill(out);
    }

    pub(crate) fn random_secret(&self) -> [u8; 32] {
        let mut secret = [0u8; 32];
        let _ = self.rng.fill(&mut secret);
        secret
    }

    pub(crate) fn lookup_hash_keys(&self) -> (u64, u64) {
        self.hash_keys
    }

    /// A handle to the library's CSPRNG, threaded into connections for
    /// path-challenge data
    pub(crate) fn rng(&self) -> SystemRandom {
        self.rng.clone()
    }

    pub(crate) fn retry_key(&self) -> Option<RetryKey> {
        self.retry_key.get().cloned()
    }

    pub(crate) fn unpredictable_bits(&self) -> u8 {
        let mut byte = [0u8; 1];
        let _ = self.rng.fill(&mut byte);
        byte[0] & 0x7f
    }

    pub(crate) fn emit_endpoint(&self, event: core_event::Event) {
        let meta = core_event::Meta {
            connection: 0,
            timestamp: self.clock.now(),
        };
        self.subscriber.on_event(&meta, &event);
    }

    /// Finds a shareable binding for the tuple or creates one; the
    /// loser of a creation race adopts the winner.
    pub(crate) fn get_or_create_binding(
        self: &Arc<Self>,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        exclusive: bool,
        is_listener: bool,
        tx: Arc<dyn Tx>,
    ) -> Arc<Binding> {
        let mut bindings = self.bindings.lock().unwrap();
        if !exclusive {
            if let Some(existing) = bindings.iter().find(|b| b.is_shareable(local, remote)) {
                return existing.clone();
            }
        }
        let binding = Binding::new(
            local,
            remote,
            exclusive,
            is_listener,
            tx,
            self,
            self.random_secret(),
        );
        bindings.push(binding.clone());
        binding
    }
}

pub struct Builder {
    settings: Settings,
    subscriber: Arc<dyn core_event::Subscriber>,
    tls: Option<Arc<dyn tls::Provider>>,
    worker_count: usize,
}

impl Builder {
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn core_event::Subscriber>) -> Self {
        self.subscriber = subscriber;
        self
    }

    pub fn with_tls(mut self, tls: Arc<dyn tls::Provider>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn build(self) -> Library {
        let clock = Arc::new(StdClock::new());
        let mut workers = Vec::with_capacity(self.worker_count);
        let mut joins = Vec::with_capacity(self.worker_count);
        for index in 0..self.worker_count {
            let (handle, join) = worker::spawn(index, clock.clone());
            workers.push(handle);
            joins.push(join);
        }

        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; 16];
        let _ = rng.fill(&mut key_bytes);
        let hash_keys = (
            u64::from_be_bytes(key_bytes[..8].try_into().expect("fixed size")),
            u64::from_be_bytes(key_bytes[8..].try_into().expect("fixed size")),
        );

        let shared = Arc::new(Shared {
            settings: Arc::new(self.settings),
            subscriber: self.subscriber,
            tls: self
                .tls
                .unwrap_or_else(|| Arc::new(tls::testing::TestProvider { seed: 0 })),
            workers,
            clock,
            bindings: Mutex::new(Vec::new()),
            retry_key: OnceCell::new(),
            rng,
            hash_keys,
            next_handle: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
        });

        Library {
            shared,
            joins: Mutex::new(joins),
        }
    }
}

pub struct Library {
    shared: Arc<Shared>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Library {
    pub fn builder() -> Builder {
        Builder {
            settings: Settings::default(),
            subscriber: Arc::new(core_event::NoopSubscriber),
            tls: None,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Installs the process-wide stateless retry key; first caller
    /// wins
    pub fn set_retry_key(&self, secret: &[u8; 32]) {
        let _ = self.shared.retry_key.set(RetryKey::new(secret));
    }

    /// Creates a listening binding on `local`, accepting connections
    /// through `tx`
    pub fn listen(&self, local: SocketAddr, tx: Arc<dyn Tx>) -> Arc<Binding> {
        if self.shared.settings.retry_enabled && self.shared.retry_key.get().is_none() {
            self.set_retry_key(&self.shared.random_secret());
        }
        self.shared
            .get_or_create_binding(local, None, false, true, tx)
    }

    /// Opens a client connection through a (new or shared) connected
    /// binding
    pub fn connect(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        tx: Arc<dyn Tx>,
    ) -> Result<(Arc<Binding>, ConnectionApi), transport::Error> {
        let shared = &self.shared;
        let binding = shared.get_or_create_binding(local, Some(remote), false, false, tx);

        let worker_index = shared.pick_worker();
        let handle = shared.alloc_handle();
        let local_cid = shared.generate_cid(worker_index);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-7.2
        //# When an Initial packet is sent by a client that has not
        //# previously received an Initial or Retry packet from the
        //# server, the client populates the Destination Connection ID
        //# field with an unpredictable value ... at least 8 bytes
        let mut dcid_bytes = [0u8; 8];
        shared.fill_random(&mut dcid_bytes);
        let peer_cid =
            ConnectionId::try_from_slice(&dcid_bytes).expect("eight bytes is a valid cid");

        let session = shared.tls.new_session(
            endpoint::Type::Client,
            crate::connection::local_parameters(&shared.settings, local_cid),
        );

        let mut connection = Connection::client(
            handle,
            shared.settings.clone(),
            shared.subscriber.clone(),
            shared.rng(),
            session,
            local_cid,
            peer_cid,
            local,
            remote,
            shared.clock.now(),
        )?;

        let route = Route {
            worker: worker_index,
            handle,
        };
        binding
            .lookup
            .insert(local_cid, route)
            .map_err(|_| transport::Error::new(transport::Error::INTERNAL_ERROR))?;
        binding.set_primary_route(route);

        // a spare source CID (sequence 1) lets the peer migrate or
        // rotate without a round trip
        let spare = shared.generate_cid(worker_index);
        connection
            .cids
            .issue_local(spare, binding.stateless_reset_token(&spare));
        let _ = binding.lookup.insert(spare, route);

        shared.workers[worker_index].register(
            handle,
            Box::new(connection),
            binding.tx.clone(),
            binding.lookup.clone(),
        );
        shared.workers[worker_index].post(handle, Operation::FlushSend);

        Ok((
            binding.clone(),
            ConnectionApi {
                worker: shared.workers[worker_index].clone(),
                handle,
            },
        ))
    }

    /// Resolves an accepted server connection into an API handle
    pub fn api_for(&self, route: Route) -> ConnectionApi {
        ConnectionApi {
            worker: self.shared.workers[route.worker].clone(),
            handle: route.handle,
        }
    }

    pub fn shutdown(self) {
        for worker in &self.shared.workers {
            worker.stop();
        }
        for join in self.joins.lock().unwrap().drain(..) {
            let _ = join.join();
        }
    }
}

/// Thread-safe application handle to one connection.
///
/// Every call executes on the connection's worker; the caller blocks
/// on the completion the way a synchronous API would.
#[derive(Clone)]
pub struct ConnectionApi {
    worker: WorkerHandle,
    handle: ConnectionHandle,
}

impl ConnectionApi {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn open_stream(
        &self,
        stream_type: StreamType,
        fail_on_blocked: bool,
    ) -> Result<(StreamId, OpenStatus), ApiError> {
        self.worker
            .call(self.handle, move |connection| {
                connection.open_stream(stream_type, fail_on_blocked)
            })
            .unwrap_or(Err(ApiError::InvalidState))
    }

    pub fn write(&self, id: StreamId, data: &[u8], fin: bool) -> Result<(), ApiError> {
        let data = data.to_vec();
        self.worker
            .call(self.handle, move |connection| {
                connection.stream_write(id, &data, fin)
            })
            .unwrap_or(Err(ApiError::InvalidState))
    }

    pub fn read(&self, id: StreamId, max_len: usize) -> Result<(Vec<u8>, bool), ApiError> {
        self.worker
            .call(self.handle, move |connection| {
                let mut out = vec![0u8; max_len];
                let (len, fin) = connection.stream_read(id, &mut out)?;
                out.truncate(len);
                Ok((out, fin))
            })
            .unwrap_or(Err(ApiError::InvalidState))
    }

    pub fn reset_stream(&self, id: StreamId, code: VarInt) -> Result<(), ApiError> {
        self.worker
            .call(self.handle, move |connection| connection.stream_reset(id, code))
            .unwrap_or(Err(ApiError::InvalidState))
    }

    pub fn poll_event(&self) -> Option<Event> {
        self.worker
            .call(self.handle, |connection| connection.poll_event())
            .flatten()
    }

    pub fn close(&self, code: VarInt, reason: &[u8]) {
        self.worker.post(
            self.handle,
            Operation::Shutdown {
                error: transport::Error::new(code),
                is_application: true,
                reason: reason.to_vec(),
                silent: false,
            },
        );
    }

    pub fn state(&self) -> Option<crate::connection::State> {
        self.worker.call(self.handle, |connection| connection.state())
    }
}
