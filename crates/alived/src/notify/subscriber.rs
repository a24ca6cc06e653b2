// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscribers and the events queued for them.

use super::protocol;
use crate::registry::event::EventKind;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

/// Attempts granted on subscription and after every useful acknowledgment.
pub const MAX_ATTEMPTS: u8 = 10;

/// Serialized event shared by every subscriber queue that references it.
///
/// The number of queues holding an event is its reference count; the journal
/// keeps one extra handle and frees the event when it is the last one.
#[derive(Debug)]
pub struct Event {
    pub id: u32,
    pub kind: EventKind,
    pub name: String,
    /// Full datagram, incarnation field zeroed.
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Subscriber {
    pub addr: SocketAddr,
    pub incarnation: u32,
    pub attempts: u8,
    /// Last time the subscriber was heard from; 0 until confirmed.
    pub last_contact: u32,
    queue: VecDeque<Arc<Event>>,
}

impl Subscriber {
    pub fn new(addr: SocketAddr, incarnation: u32) -> Self {
        Self {
            addr,
            incarnation,
            attempts: MAX_ATTEMPTS,
            last_contact: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, event: Arc<Event>) {
        self.queue.push_back(event);
    }

    /// Drop the queued reference to `event_id`; returns whether it was queued.
    pub fn release(&mut self, event_id: u32) -> bool {
        match self.queue.iter().position(|e| e.id == event_id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_ids(&self) -> Vec<u32> {
        self.queue.iter().map(|e| e.id).collect()
    }

    /// Every queued event stamped with this subscriber's incarnation.
    pub fn stamped(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.queue.iter().map(move |event| {
            let mut payload = event.payload.clone();
            protocol::stamp(&mut payload, self.incarnation);
            payload
        })
    }
}
