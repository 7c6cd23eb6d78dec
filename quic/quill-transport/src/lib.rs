// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The quill QUIC transport: per-connection protocol state machines,
//! the packet send/receive pipeline, stream multiplexing, and the
//! connection-ID-keyed demultiplexing fabric that routes datagrams to
//! partitioned workers.
//!
//! Layering, bottom up:
//!
//! * wire primitives come from `quill-core`;
//! * [`space`], [`stream`], [`recovery`] and [`path`] hold the state
//!   the engines mutate;
//! * [`connection`] is the state machine, extended by the [`send`] and
//!   [`recv`] engines;
//! * [`lookup`], [`binding`], [`timer_wheel`] and [`worker`] form the
//!   fabric; a [`library::Library`] owns the fleet.

pub mod binding;
pub mod config;
pub mod connection;
pub mod datapath;
pub mod events;
pub mod library;
pub mod lookup;
pub mod path;
pub mod recovery;
pub mod recv;
pub mod retry;
pub mod send;
pub mod space;
pub mod stream;
pub mod timer_wheel;
pub mod tls;
pub mod worker;

pub use config::Settings;
pub use library::{ConnectionApi, Library};
