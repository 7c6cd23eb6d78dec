// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-worker timer wheel.
//!
//! Connections are hashed into millisecond slots by their next
//! expiration time; each slot keeps its entries sorted ascending. The
//! wheel caches the overall next expiration so the common
//! "when do I wake up" query is O(1). The slot count doubles whenever
//! the wheel holds more than 32 connections per slot, up to a cap.

use crate::worker::ConnectionHandle;
use hashbrown::HashMap;
use quill_core::time::Timestamp;
use std::collections::VecDeque;

const INITIAL_SLOT_COUNT: usize = 32;
const MAX_SLOT_COUNT: usize = 8_388_480;
const MAX_LOAD_FACTOR: usize = 32;

pub struct TimerWheel {
    slots: Vec<VecDeque<(Timestamp, ConnectionHandle)>>,
    /// Current expiration per connection, for removal and reinsertion
    deadlines: HashMap<ConnectionHandle, Timestamp>,
    /// Cached earliest (expiration, connection), if any
    next: Option<(Timestamp, ConnectionHandle)>,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            slots: vec![VecDeque::new(); INITIAL_SLOT_COUNT],
            deadlines: HashMap::new(),
            next: None,
        }
    }

    #[inline]
    fn slot_index(&self, time: Timestamp) -> usize {
        (time.as_millis() as usize) % self.slots.len()
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Re-registers `connection` with its newly computed expiration;
    /// `None` removes it from the wheel.
    pub fn update(&mut self, connection: ConnectionHandle, expiration: Option<Timestamp>) {
        if let Some(previous) = self.deadlines.remove(&connection) {
            let index = self.slot_index(previous);
            if let Some(pos) = self.slots[index]
                .iter()
                .position(|(_, handle)| *handle == connection)
            {
                self.slots[index].remove(pos);
            }

            // invalidate the cache when its connection moved
            if let Some((_, cached)) = self.next {
                if cached == connection {
                    self.next = None;
                }
            }
        }

        if let Some(expiration) = expiration {
            self.deadlines.insert(connection, expiration);

            let index = self.slot_index(expiration);
            let slot = &mut self.slots[index];
            let pos = slot.partition_point(|(time, _)| *time <= expiration);
            slot.insert(pos, (expiration, connection));

            match self.next {
                Some((cached_time, _)) if cached_time <= expiration => {}
                _ if self.next.is_none() && self.deadlines.len() > 1 => {
                    // cache was invalidated; leave it for a rescan
                }
                _ => self.next = Some((expiration, connection)),
            }

            if self.deadlines.len() > self.slots.len() * MAX_LOAD_FACTOR {
                self.resize();
            }
        }
    }

    /// Doubles the slot count and rehashes every entry
    fn resize(&mut self) {
        let new_count = (self.slots.len() * 2).min(MAX_SLOT_COUNT);
        if new_count == self.slots.len() {
            return;
        }

        let old = core::mem::replace(&mut self.slots, vec![VecDeque::new(); new_count]);
        for slot in old {
            for (time, connection) in slot {
                let index = (time.as_millis() as usize) % new_count;
                let new_slot = &mut self.slots[index];
                let pos = new_slot.partition_point(|(t, _)| *t <= time);
                new_slot.insert(pos, (time, connection));
            }
        }
    }

    /// Recomputes the cached next expiration by scanning slot heads
    fn refresh_next(&mut self) {
        self.next = None;
        if self.deadlines.is_empty() {
            return;
        }
        for slot in &self.slots {
            if let Some(&(time, connection)) = slot.front() {
                match self.next {
                    Some((cached, _)) if cached <= time => {}
                    _ => self.next = Some((time, connection)),
                }
            }
        }
    }

    /// The earliest expiration over all registered connections
    pub fn next_expiration(&mut self) -> Option<Timestamp> {
        if self.next.is_none() {
            self.refresh_next();
        }
        self.next.map(|(time, _)| time)
    }

    /// How long until the next expiration; `None` when the wheel is
    /// empty
    pub fn next_wait(&mut self, now: Timestamp) -> Option<core::time::Duration> {
        self.next_expiration()
            .map(|time| time.saturating_duration_since(now))
    }

    /// Removes and returns every connection whose expiration is at or
    /// before `now`
    pub fn get_expired(&mut self, now: Timestamp) -> Vec<ConnectionHandle> {
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            while let Some(&(time, connection)) = slot.front() {
                if time > now {
                    break;
                }
                slot.pop_front();
                self.deadlines.remove(&connection);
                expired.push(connection);
            }
        }
        if !expired.is_empty() {
            self.next = None;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn handle(id: u64) -> ConnectionHandle {
        ConnectionHandle::from_raw(id)
    }

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_micros(ms * 1_000)
    }

    #[test]
    fn single_connection() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_expiration(), None);

        wheel.update(handle(1), Some(at(50)));
        assert_eq!(wheel.next_expiration(), Some(at(50)));
        assert_eq!(wheel.next_wait(at(20)), Some(Duration::from_millis(30)));

        // earlier reschedule moves the cache
        wheel.update(handle(1), Some(at(10)));
        assert_eq!(wheel.next_expiration(), Some(at(10)));

        assert!(wheel.get_expired(at(9)).is_empty());
        assert_eq!(wheel.get_expired(at(10)), vec![handle(1)]);
        assert_eq!(wheel.next_expiration(), None);
        assert_eq!(wheel.connection_count(), 0);
    }

    #[test]
    fn removal_invalidates_cache() {
        let mut wheel = TimerWheel::new();
        wheel.update(handle(1), Some(at(10)));
        wheel.update(handle(2), Some(at(20)));
        assert_eq!(wheel.next_expiration(), Some(at(10)));

        wheel.update(handle(1), None);
        assert_eq!(wheel.next_expiration(), Some(at(20)));
        assert_eq!(wheel.connection_count(), 1);
    }

    #[test]
    fn expirations_in_order() {
        let mut wheel = TimerWheel::new();
        // two deadlines hashing to the same slot (32 ms apart)
        wheel.update(handle(1), Some(at(5 + 32)));
        wheel.update(handle(2), Some(at(5)));

        let expired = wheel.get_expired(at(5));
        assert_eq!(expired, vec![handle(2)]);
        let expired = wheel.get_expired(at(100));
        assert_eq!(expired, vec![handle(1)]);
    }

    #[test]
    fn growth_across_load_factor() {
        // 32 slots * load factor 32 = 1024 connections before a resize
        for count in [1usize, 32, 33, 1024, 1025, 4096] {
            let mut wheel = TimerWheel::new();
            for id in 0..count {
                wheel.update(handle(id as u64), Some(at(id as u64)));
            }

            let expected_slots = match count {
                0..=1024 => 32,
                0..=2048 => 64,
                _ => 128,
            };
            assert_eq!(wheel.slots.len(), expected_slots, "count={count}");
            assert_eq!(wheel.connection_count(), count);

            let expired = wheel.get_expired(at(count as u64));
            assert_eq!(expired.len(), count);
            assert_eq!(wheel.connection_count(), 0);
        }
    }
}
