// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The UDP boundary.
//!
//! The engine never touches sockets directly: bindings hand inbound
//! datagrams in and push outbound batches through a [`Tx`]. Batches
//! aggregate up to the configured GSO-friendly count. An in-memory
//! pair backs the integration tests; a std-socket implementation backs
//! real endpoints.

use quill_core::inet::ExplicitCongestionNotification;
use std::{
    collections::VecDeque,
    net::{SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
};

#[derive(Clone, Debug)]
pub struct Datagram {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub ecn: ExplicitCongestionNotification,
    pub payload: Vec<u8>,
}

/// Transmit half of the datapath
pub trait Tx: Send + Sync + 'static {
    /// Sends a batch of datagrams; ordering within the batch is
    /// preserved
    fn send(&self, datagrams: Vec<Datagram>);
}

/// Std-socket transmitter
pub struct UdpTx {
    socket: Arc<UdpSocket>,
}

impl UdpTx {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Tx for UdpTx {
    fn send(&self, datagrams: Vec<Datagram>) {
        for datagram in datagrams {
            // best-effort: UDP loss is handled by the protocol
            let _ = self.socket.send_to(&datagram.payload, datagram.remote);
        }
    }
}

/// Binds a UDP socket configured the way the engine expects
pub fn bind_socket(local: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if local.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    Ok(socket.into())
}

pub mod testing {
    //! A deterministic in-memory datapath: two queues, no loss, no
    //! reordering unless a test introduces it

    use super::*;

    #[derive(Default)]
    pub struct Queue {
        datagrams: Mutex<VecDeque<Datagram>>,
    }

    impl Queue {
        pub fn pop(&self) -> Option<Datagram> {
            self.datagrams.lock().unwrap().pop_front()
        }

        pub fn drain(&self) -> Vec<Datagram> {
            self.datagrams.lock().unwrap().drain(..).collect()
        }

        pub fn len(&self) -> usize {
            self.datagrams.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    /// A [`Tx`] that appends into a shared queue
    pub struct QueueTx {
        pub queue: Arc<Queue>,
    }

    impl Tx for QueueTx {
        fn send(&self, datagrams: Vec<Datagram>) {
            let mut guard = self.queue.datagrams.lock().unwrap();
            guard.extend(datagrams);
        }
    }

    /// Two queues wired as a full-duplex link
    pub fn pair() -> (Arc<Queue>, Arc<Queue>) {
        (Arc::new(Queue::default()), Arc::new(Queue::default()))
    }
}
