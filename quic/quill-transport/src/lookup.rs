// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CID-keyed routing of datagrams to connections.
//!
//! A binding serving a single connection uses a lock-cheap fast path.
//! Once a second connection attaches (or a listener requests it), the
//! lookup lazily switches to a partitioned hash table. Locally issued
//! connection IDs carry a partition byte, so in the common case every
//! lookup for a connection lands on one shard and one reader lock.
//!
//! Lock order: the outer structure lock is always taken before any
//! shard lock, and shard locks are never held two at a time.

use crate::worker::ConnectionHandle;
use hashbrown::HashMap;
use quill_core::connection::ConnectionId;
use siphasher::sip::SipHasher13;
use std::{
    hash::BuildHasher,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

/// Where a connection lives: its worker and its handle on that worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub worker: usize,
    pub handle: ConnectionHandle,
}

/// Keyed hashing so a peer cannot craft colliding connection IDs
#[derive(Clone, Copy, Debug)]
struct KeyedHasher {
    k0: u64,
    k1: u64,
}

impl BuildHasher for KeyedHasher {
    type Hasher = SipHasher13;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        SipHasher13::new_with_keys(self.k0, self.k1)
    }
}

type Shard = RwLock<HashMap<ConnectionId, Route, KeyedHasher>>;

enum Inner {
    Empty,
    /// One connection; no hashing, just a compare over its CIDs
    Single { route: Route, cids: Vec<ConnectionId> },
    Partitioned { shards: Box<[Shard]> },
}

pub struct Lookup {
    inner: RwLock<Inner>,
    hasher: KeyedHasher,
    partition_mask: u8,
    cid_count: AtomicUsize,
    /// Grow shards to the worker count instead of collapsing to one
    maximize_partitioning: AtomicUsize,
}

impl Lookup {
    pub fn new(partition_mask: u8, hash_keys: (u64, u64)) -> Self {
        Self {
            inner: RwLock::new(Inner::Empty),
            hasher: KeyedHasher {
                k0: hash_keys.0,
                k1: hash_keys.1,
            },
            partition_mask,
            cid_count: AtomicUsize::new(0),
            maximize_partitioning: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, cid: &ConnectionId, shard_count: usize) -> usize {
        let byte = cid.partition_byte().unwrap_or(0);
        (byte & self.partition_mask) as usize % shard_count
    }

    pub fn cid_count(&self) -> usize {
        self.cid_count.load(Ordering::Relaxed)
    }

    /// Finds the connection owning `cid`
    pub fn lookup(&self, cid: &ConnectionId) -> Option<Route> {
        let inner = self.inner.read().unwrap();
        match &*inner {
            Inner::Empty => None,
            Inner::Single { route, cids } => cids.contains(cid).then_some(*route),
            Inner::Partitioned { shards } => {
                let shard = &shards[self.shard_index(cid, shards.len())];
                shard.read().unwrap().get(cid).copied()
            }
        }
    }

    /// Requests that the table keep one shard per worker; used by
    /// bindings that serve listeners
    pub fn maximize_partitioning(&self, worker_count: usize) {
        self.maximize_partitioning
            .store(worker_count.max(1), Ordering::Relaxed);
        let mut inner = self.inner.write().unwrap();
        self.rebalance(&mut inner);
    }

    fn target_shards(&self, inner: &Inner) -> usize {
        let maximized = self.maximize_partitioning.load(Ordering::Relaxed);
        match inner {
            _ if maximized > 0 => maximized,
            Inner::Partitioned { .. } | Inner::Single { .. } => 1,
            Inner::Empty => 0,
        }
    }

    fn new_shards(&self, count: usize) -> Box<[Shard]> {
        (0..count)
            .map(|_| RwLock::new(HashMap::with_hasher(self.hasher)))
            .collect()
    }

    /// Grows the shard table when the target increased. Requires the
    /// structure lock held exclusively.
    fn rebalance(&self, inner: &mut Inner) {
        let target = self.target_shards(inner);

        let current = match &*inner {
            Inner::Partitioned { shards } => shards.len(),
            _ => 0,
        };
        if target <= current || target == 0 {
            return;
        }

        let shards = self.new_shards(target);
        let previous = core::mem::replace(inner, Inner::Empty);

        match previous {
            Inner::Empty => {}
            Inner::Single { route, cids } => {
                for cid in cids {
                    let index = self.shard_index(&cid, target);
                    shards[index].write().unwrap().insert(cid, route);
                }
            }
            Inner::Partitioned { shards: old } => {
                for shard in old.iter() {
                    for (cid, route) in shard.write().unwrap().drain() {
                        let index = self.shard_index(&cid, target);
                        shards[index].write().unwrap().insert(cid, route);
                    }
                }
            }
        }

        *inner = Inner::Partitioned { shards };
    }

    /// Registers `cid` as routing to `route`.
    ///
    /// On collision the existing owner wins and is returned, so racing
    /// inserts of the same CID resolve deterministically.
    pub fn insert(&self, cid: ConnectionId, route: Route) -> Result<(), Route> {
        // fast path: structure already partitioned, only a shard lock
        {
            let inner = self.inner.read().unwrap();
            if let Inner::Partitioned { shards } = &*inner {
                return self.insert_into_shard(shards, cid, route);
            }
        }

        let mut inner = self.inner.write().unwrap();
        loop {
            match &mut *inner {
                Inner::Empty => {
                    *inner = Inner::Single {
                        route,
                        cids: vec![cid],
                    };
                    self.cid_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Inner::Single { route: existing, cids } => {
                    if *existing == route {
                        if !cids.contains(&cid) {
                            cids.push(cid);
                            self.cid_count.fetch_add(1, Ordering::Relaxed);
                        }
                        return Ok(());
                    }
                    if cids.contains(&cid) {
                        return Err(*existing);
                    }
                    // a second connection arrived; switch to the table
                    // and retry the insert on the new shape
                }
                Inner::Partitioned { shards } => {
                    return self.insert_into_shard(shards, cid, route);
                }
            }

            self.rebalance_to_at_least(&mut inner);
        }
    }

    fn rebalance_to_at_least(&self, inner: &mut Inner) {
        if self.maximize_partitioning.load(Ordering::Relaxed) == 0 {
            self.maximize_partitioning.store(1, Ordering::Relaxed);
            self.rebalance(inner);
            self.maximize_partitioning.store(0, Ordering::Relaxed);
        } else {
            self.rebalance(inner);
        }
    }

    fn insert_into_shard(&self, shards: &[Shard], cid: ConnectionId, route: Route) -> Result<(), Route> {
        let shard = &shards[self.shard_index(&cid, shards.len())];
        let mut map = shard.write().unwrap();
        match map.entry(cid) {
            hashbrown::hash_map::Entry::Occupied(entry) => {
                let winner = *entry.get();
                if winner == route {
                    Ok(())
                } else {
                    Err(winner)
                }
            }
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(route);
                self.cid_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Unregisters `cid`; returns true if it was present
    pub fn remove(&self, cid: &ConnectionId) -> bool {
        {
            let inner = self.inner.read().unwrap();
            match &*inner {
                Inner::Empty => return false,
                Inner::Partitioned { shards } => {
                    let shard = &shards[self.shard_index(cid, shards.len())];
                    let removed = shard.write().unwrap().remove(cid).is_some();
                    if removed {
                        self.cid_count.fetch_sub(1, Ordering::Relaxed);
                    }
                    return removed;
                }
                Inner::Single { .. } => {}
            }
        }

        // the single-connection shape needs the structure lock
        let mut inner = self.inner.write().unwrap();
        match &mut *inner {
            Inner::Empty => false,
            Inner::Single { cids, .. } => {
                let Some(index) = cids.iter().position(|c| c == cid) else {
                    return false;
                };
                cids.swap_remove(index);
                if cids.is_empty() {
                    *inner = Inner::Empty;
                }
                self.cid_count.fetch_sub(1, Ordering::Relaxed);
                true
            }
            Inner::Partitioned { shards } => {
                let shard = &shards[self.shard_index(cid, shards.len())];
                let removed = shard.write().unwrap().remove(cid).is_some();
                if removed {
                    self.cid_count.fetch_sub(1, Ordering::Relaxed);
                }
                removed
            }
        }
    }

    /// Every distinct connection currently registered
    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = Vec::new();
        let inner = self.inner.read().unwrap();
        match &*inner {
            Inner::Empty => {}
            Inner::Single { route, .. } => routes.push(*route),
            Inner::Partitioned { shards } => {
                for shard in shards.iter() {
                    for route in shard.read().unwrap().values() {
                        if !routes.contains(route) {
                            routes.push(*route);
                        }
                    }
                }
            }
        }
        routes
    }

    /// Removes every CID routing to `route`, returning them; used when
    /// a connection migrates to another binding
    pub fn take_routes(&self, route: Route) -> Vec<ConnectionId> {
        let mut taken = Vec::new();
        let mut inner = self.inner.write().unwrap();
        match &mut *inner {
            Inner::Empty => {}
            Inner::Single { route: existing, cids } => {
                if *existing == route {
                    taken = core::mem::take(cids);
                    *inner = Inner::Empty;
                }
            }
            Inner::Partitioned { shards } => {
                for shard in shards.iter() {
                    let mut map = shard.write().unwrap();
                    map.retain(|cid, existing| {
                        if *existing == route {
                            taken.push(*cid);
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
        self.cid_count.fetch_sub(taken.len(), Ordering::Relaxed);
        taken
    }

    /// Moves every CID of `route` from `self` into `target`
    pub fn move_all(&self, route: Route, target: &Lookup) -> Result<(), Route> {
        for cid in self.take_routes(route) {
            target.insert(cid, route)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ConnectionHandle;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_slice(bytes).unwrap()
    }

    fn route(worker: usize, id: u64) -> Route {
        Route {
            worker,
            handle: ConnectionHandle::from_raw(id),
        }
    }

    fn lookup() -> Lookup {
        Lookup::new(0x03, (0x1234, 0x5678))
    }

    #[test]
    fn single_connection_fast_path() {
        let lookup = lookup();
        let a = route(0, 1);

        assert!(lookup.insert(cid(&[1, 1, 1, 1]), a).is_ok());
        assert!(lookup.insert(cid(&[2, 2, 2, 2]), a).is_ok());
        assert_eq!(lookup.cid_count(), 2);

        assert_eq!(lookup.lookup(&cid(&[1, 1, 1, 1])), Some(a));
        assert_eq!(lookup.lookup(&cid(&[2, 2, 2, 2])), Some(a));
        assert_eq!(lookup.lookup(&cid(&[3, 3, 3, 3])), None);

        assert!(lookup.remove(&cid(&[1, 1, 1, 1])));
        assert!(!lookup.remove(&cid(&[1, 1, 1, 1])));
        assert_eq!(lookup.cid_count(), 1);
    }

    #[test]
    fn second_connection_builds_table() {
        let lookup = lookup();
        let a = route(0, 1);
        let b = route(1, 2);

        lookup.insert(cid(&[1]), a).unwrap();
        lookup.insert(cid(&[2]), b).unwrap();

        assert_eq!(lookup.lookup(&cid(&[1])), Some(a));
        assert_eq!(lookup.lookup(&cid(&[2])), Some(b));
        assert_eq!(lookup.cid_count(), 2);
    }

    #[test]
    fn collision_reports_winner() {
        let lookup = lookup();
        let a = route(0, 1);
        let b = route(1, 2);
        lookup.insert(cid(&[9]), a).unwrap();
        lookup.insert(cid(&[8]), b).unwrap();

        // the same CID for a different connection loses to the holder
        assert_eq!(lookup.insert(cid(&[9]), b), Err(a));
        // re-inserting an owned CID is idempotent
        assert!(lookup.insert(cid(&[9]), a).is_ok());
        assert_eq!(lookup.cid_count(), 2);
    }

    #[test]
    fn partition_byte_selects_shard() {
        // PartitionCount=4, PartitionMask=0x03, partition byte 0x05:
        // 0x05 & 0x03 = 1
        let lookup = lookup();
        lookup.maximize_partitioning(4);

        let a = route(1, 7);
        lookup.insert(cid(&[0x05, 0xff, 0xee]), a).unwrap();

        let inner = lookup.inner.read().unwrap();
        let Inner::Partitioned { shards } = &*inner else {
            panic!("expected a partitioned table");
        };
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[1].read().unwrap().len(), 1);
        for index in [0, 2, 3] {
            assert!(shards[index].read().unwrap().is_empty());
        }
        drop(inner);

        assert_eq!(lookup.lookup(&cid(&[0x05, 0xff, 0xee])), Some(a));
    }

    #[test]
    fn concurrent_insert_one_winner() {
        use std::sync::Arc;

        let lookup = Arc::new(self::lookup());
        // force the table shape so both threads race on one shard
        lookup.maximize_partitioning(2);

        let contested = cid(&[0x07, 1, 2, 3]);
        let mut handles = Vec::new();
        for id in 0..2u64 {
            let lookup = lookup.clone();
            handles.push(std::thread::spawn(move || {
                lookup.insert(contested, route(id as usize, id + 1))
            }));
        }

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(winners, 1);

        let loser = outcomes.iter().find(|o| o.is_err()).unwrap();
        let winner_route = lookup.lookup(&contested).unwrap();
        assert_eq!(loser.unwrap_err(), winner_route);
        assert_eq!(lookup.cid_count(), 1);
    }

    #[test]
    fn migrate_between_lookups() {
        let from = lookup();
        let to = lookup();
        let a = route(0, 1);
        let b = route(1, 2);

        from.insert(cid(&[1]), a).unwrap();
        from.insert(cid(&[5]), a).unwrap();
        from.insert(cid(&[2]), b).unwrap();

        from.move_all(a, &to).unwrap();
        assert_eq!(from.cid_count(), 1);
        assert_eq!(to.cid_count(), 2);
        assert_eq!(from.lookup(&cid(&[1])), None);
        assert_eq!(to.lookup(&cid(&[1])), Some(a));
        assert_eq!(to.lookup(&cid(&[5])), Some(a));
        assert_eq!(from.lookup(&cid(&[2])), Some(b));
    }
}
