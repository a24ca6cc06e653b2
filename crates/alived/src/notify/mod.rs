// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event distribution to subscribers.
//!
//! Subscribers live in two maps keyed by socket address: `waiting` until they
//! confirm, then `confirmed`. Events reported by the registry sit in a pending
//! queue until the next [`tick`](NotificationEngine::tick), which moves them
//! into the journal and references them from every confirmed subscriber.
//! Delivery is at-least-once: each tick resends a subscriber's whole queue
//! until the events are acknowledged or the subscriber is evicted.
//!
//! The engine does no I/O. Handlers and ticks return the datagrams to send.

pub mod protocol;
pub mod subscriber;

use crate::ordmap::OrderedMap;
use crate::registry::event::{EventSink, UnitEvent};
use parking_lot::Mutex;
use protocol::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use subscriber::{Event, Subscriber, MAX_ATTEMPTS};
use tracing::{debug, info, warn};

/// Default silence after which a confirmed subscriber is dropped.
pub const DEFAULT_STALE_SECS: u32 = 300;

/// A datagram to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

pub struct NotificationEngine {
    waiting: OrderedMap<SocketAddr, Subscriber>,
    confirmed: OrderedMap<SocketAddr, Subscriber>,
    pending: Mutex<Vec<Arc<Event>>>,
    journal: Mutex<Vec<Arc<Event>>>,
    next_id: Mutex<u32>,
    stale_secs: u32,
}

impl NotificationEngine {
    pub fn new(stale_secs: u32) -> Self {
        Self {
            waiting: OrderedMap::new(),
            confirmed: OrderedMap::new(),
            pending: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            stale_secs,
        }
    }

    fn allocate_id(&self) -> u32 {
        let mut next = self.next_id.lock();
        let id = *next;
        *next = match next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Apply one request from `from`; returns the reply, if any.
    pub fn handle(&self, request: Request, from: SocketAddr, now: u32) -> Option<Vec<u8>> {
        match request {
            Request::Subscribe { incarnation } => self.subscribe(from, incarnation),
            Request::Confirm { incarnation } => {
                self.confirm(from, incarnation, now);
                None
            }
            Request::EventAck {
                incarnation,
                event_id,
            } => self.event_ack(from, incarnation, event_id),
            Request::HeartbeatAck { incarnation } => self.heartbeat_ack(from, incarnation, now),
        }
    }

    fn subscribe(&self, from: SocketAddr, incarnation: u32) -> Option<Vec<u8>> {
        let ack = protocol::subscribe_ack(incarnation);
        if let Some(same) = self.confirmed.find(&from, |s| s.incarnation == incarnation) {
            if !same {
                debug!("subscribe from {} rejected: confirmed under another incarnation", from);
            }
            return same.then_some(ack);
        }
        let accepted = self.waiting.insert_or_update(
            &from,
            || Some((Subscriber::new(from, incarnation), true)),
            |s| s.incarnation == incarnation,
        );
        match accepted {
            Ok(true) => {
                debug!("subscriber {} waiting (incarnation {})", from, incarnation);
                Some(ack)
            }
            Ok(false) => {
                debug!("subscribe from {} rejected: waiting under another incarnation", from);
                None
            }
            Err(e) => {
                warn!("subscribe from {}: {}", from, e);
                None
            }
        }
    }

    /// Promote a waiting subscriber. Returns whether `from` is now confirmed
    /// under `incarnation`.
    fn confirm(&self, from: SocketAddr, incarnation: u32, now: u32) -> bool {
        match self.waiting.delete(&from, |s| s.incarnation == incarnation) {
            Some(mut sub) => {
                sub.attempts = MAX_ATTEMPTS;
                sub.last_contact = now;
                self.confirmed.insert(&from, sub);
                info!("subscriber {} confirmed", from);
                true
            }
            None => self
                .confirmed
                .find(&from, |s| s.incarnation == incarnation)
                .unwrap_or(false),
        }
    }

    /// The reply is sent whenever the subscriber is known, even if the event
    /// was already released, since earlier replies may have been lost.
    fn event_ack(&self, from: SocketAddr, incarnation: u32, event_id: u32) -> Option<Vec<u8>> {
        self.confirmed.find(&from, |s| {
            if s.incarnation == incarnation && s.release(event_id) {
                s.attempts = MAX_ATTEMPTS;
            }
        })?;
        Some(protocol::event_ack_reply(incarnation, event_id))
    }

    fn heartbeat_ack(&self, from: SocketAddr, incarnation: u32, now: u32) -> Option<Vec<u8>> {
        let known = self
            .confirmed
            .find(&from, |s| {
                if s.incarnation == incarnation {
                    s.last_contact = now;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        known.then(|| protocol::heartbeat_ack_reply(incarnation))
    }

    /// Drop a confirmed subscriber, releasing its queued events.
    pub fn evict(&self, addr: SocketAddr, incarnation: u32) -> bool {
        let gone = self
            .confirmed
            .delete(&addr, |s| s.incarnation == incarnation)
            .is_some();
        if gone {
            info!("subscriber {} evicted", addr);
        }
        gone
    }

    /// One distribution pass.
    pub fn tick(&self, now: u32) -> Vec<Outbound> {
        let mut out = Vec::new();

        // Waiting subscribers get their ack again until attempts run out.
        let expired = self.waiting.walk_and_delete(|addr, sub| {
            if sub.attempts == 0 {
                return true;
            }
            sub.attempts -= 1;
            out.push(Outbound {
                to: *addr,
                payload: protocol::subscribe_ack(sub.incarnation),
            });
            false
        });
        for (addr, _) in expired {
            debug!("waiting subscriber {} never confirmed", addr);
        }

        // Pending events go to whoever is confirmed right now.
        let fresh = std::mem::take(&mut *self.pending.lock());
        if !fresh.is_empty() {
            self.confirmed.walk(|_, sub| {
                for event in &fresh {
                    sub.enqueue(Arc::clone(event));
                }
            });
            self.journal.lock().extend(fresh);
        }

        let stale_secs = self.stale_secs;
        let dropped = self.confirmed.walk_and_delete(|addr, sub| {
            if sub.attempts == 0 || now.saturating_sub(sub.last_contact) > stale_secs {
                return true;
            }
            if sub.queued() > 0 {
                sub.attempts -= 1;
                out.extend(sub.stamped().map(|payload| Outbound { to: *addr, payload }));
            }
            false
        });
        for (addr, sub) in dropped {
            info!(
                "subscriber {} dropped ({} attempts left, {} events queued)",
                addr,
                sub.attempts,
                sub.queued()
            );
        }

        // Only the journal's own handle left: nobody needs the event.
        self.journal.lock().retain(|e| Arc::strong_count(e) > 1);

        out
    }

    /// Confirmed subscriber addresses, in address order.
    pub fn subscribers(&self) -> Vec<SocketAddr> {
        self.confirmed.keys()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.count()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Events still referenced by at least one subscriber.
    pub fn journal_len(&self) -> usize {
        self.journal.lock().len()
    }

    /// Number of subscriber queues holding `event_id`, if it is journalled.
    pub fn event_references(&self, event_id: u32) -> Option<usize> {
        self.journal
            .lock()
            .iter()
            .find(|e| e.id == event_id)
            .map(|e| Arc::strong_count(e) - 1)
    }

    /// Queued event ids of a confirmed subscriber.
    pub fn queued_for(&self, addr: SocketAddr) -> Option<Vec<u32>> {
        self.confirmed.find(&addr, |s| s.queued_ids())
    }
}

impl EventSink for NotificationEngine {
    fn report(&self, event: &UnitEvent) {
        let id = self.allocate_id();
        match protocol::encode_event(id, event) {
            Ok(payload) => {
                self.pending.lock().push(Arc::new(Event {
                    id,
                    kind: event.kind,
                    name: event.name.clone(),
                    payload,
                }));
            }
            Err(e) => warn!("cannot encode {} event for {}: {}", event.kind, event.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::event::EventKind;
    use crate::registry::unit::Ping;
    use protocol::{Envelope, EventNotice, CODE_SUBSCRIBE_ACK};
    use std::net::Ipv4Addr;

    const T0: u32 = 1_800_000_000;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn unit_event(name: &str, kind: EventKind) -> UnitEvent {
        UnitEvent {
            name: name.into(),
            kind,
            ping: Ping {
                address: Ipv4Addr::new(10, 0, 0, 1),
                origin_port: 1,
                version: 5,
                heartbeat: 1,
                period: 15,
                incarnation: 1,
                boot_time: 1,
                timestamp: 1,
                reply_port: 0,
                user_msg: 0,
            },
            env: None,
            time: T0,
        }
    }

    fn confirmed(engine: &NotificationEngine, port: u16, incarnation: u32) {
        assert!(engine
            .handle(Request::Subscribe { incarnation }, addr(port), T0)
            .is_some());
        engine.handle(Request::Confirm { incarnation }, addr(port), T0);
        assert!(engine.subscribers().contains(&addr(port)));
    }

    #[test]
    fn test_subscribe_then_confirm() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        let reply = engine
            .handle(Request::Subscribe { incarnation: 7 }, addr(9000), T0)
            .unwrap();
        let (env, _) = Envelope::decode(&reply).unwrap();
        assert_eq!(env.code, CODE_SUBSCRIBE_ACK);
        assert_eq!(env.incarnation, 7);
        assert_eq!(engine.waiting_count(), 1);

        // Re-subscribe with the same incarnation is acknowledged again.
        assert!(engine
            .handle(Request::Subscribe { incarnation: 7 }, addr(9000), T0)
            .is_some());
        // A different incarnation is turned away.
        assert!(engine
            .handle(Request::Subscribe { incarnation: 8 }, addr(9000), T0)
            .is_none());

        // Confirm with the wrong incarnation leaves it waiting.
        engine.handle(Request::Confirm { incarnation: 8 }, addr(9000), T0);
        assert_eq!(engine.waiting_count(), 1);

        engine.handle(Request::Confirm { incarnation: 7 }, addr(9000), T0);
        assert_eq!(engine.waiting_count(), 0);
        assert_eq!(engine.subscribers(), vec![addr(9000)]);

        // Idempotent re-confirm and re-subscribe.
        assert!(engine.confirm(addr(9000), 7, T0 + 1));
        assert!(!engine.confirm(addr(9000), 8, T0 + 1));
        assert!(engine
            .handle(Request::Subscribe { incarnation: 7 }, addr(9000), T0)
            .is_some());
        assert!(engine
            .handle(Request::Subscribe { incarnation: 9 }, addr(9000), T0)
            .is_none());
    }

    #[test]
    fn test_unconfirmed_subscriber_expires_after_ten_ticks() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        engine.handle(Request::Subscribe { incarnation: 1 }, addr(9001), T0);

        for i in 0..10 {
            let out = engine.tick(T0 + i);
            assert_eq!(out.len(), 1, "tick {}", i);
            assert_eq!(out[0].to, addr(9001));
        }
        assert_eq!(engine.waiting_count(), 1);
        assert!(engine.tick(T0 + 10).is_empty());
        assert_eq!(engine.waiting_count(), 0);
    }

    #[test]
    fn test_event_delivery_and_ack() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        confirmed(&engine, 9000, 11);
        confirmed(&engine, 9001, 22);

        engine.report(&unit_event("ioc1", EventKind::Boot));
        assert_eq!(engine.pending_count(), 1);

        let out = engine.tick(T0 + 1);
        assert_eq!(out.len(), 2);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.event_references(1), Some(2));

        let to_first = out.iter().find(|o| o.to == addr(9000)).unwrap();
        let notice = EventNotice::decode(&to_first.payload).unwrap();
        assert_eq!(notice.incarnation, 11);
        assert_eq!(notice.event_id, 1);
        assert_eq!(notice.kind, EventKind::Boot);
        assert_eq!(notice.name, "ioc1");

        let reply = engine
            .handle(
                Request::EventAck {
                    incarnation: 11,
                    event_id: 1,
                },
                addr(9000),
                T0 + 2,
            )
            .unwrap();
        assert_eq!(reply.len(), 16);
        assert_eq!(engine.event_references(1), Some(1));

        // Only the subscriber that has not acknowledged gets the resend.
        let out = engine.tick(T0 + 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, addr(9001));

        engine.handle(
            Request::EventAck {
                incarnation: 22,
                event_id: 1,
            },
            addr(9001),
            T0 + 3,
        );
        assert_eq!(engine.event_references(1), Some(0));
        assert!(engine.tick(T0 + 3).is_empty());
        assert_eq!(engine.journal_len(), 0);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        confirmed(&engine, 9000, 1);
        engine.report(&unit_event("a", EventKind::Fail));
        engine.tick(T0);

        confirmed(&engine, 9001, 2);
        engine.report(&unit_event("b", EventKind::Boot));
        engine.tick(T0 + 1);

        assert_eq!(engine.queued_for(addr(9000)).unwrap(), vec![1, 2]);
        assert_eq!(engine.queued_for(addr(9001)).unwrap(), vec![2]);
        assert_eq!(engine.event_references(1), Some(1));
        assert_eq!(engine.event_references(2), Some(2));
    }

    #[test]
    fn test_unacknowledged_subscriber_is_evicted() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        confirmed(&engine, 9000, 1);
        engine.report(&unit_event("a", EventKind::Message));

        for i in 0..10 {
            assert_eq!(engine.tick(T0 + i).len(), 1);
        }
        assert_eq!(engine.confirmed_count(), 1);
        assert!(engine.tick(T0 + 10).is_empty());
        assert_eq!(engine.confirmed_count(), 0);
        assert_eq!(engine.journal_len(), 0);
    }

    #[test]
    fn test_ack_resets_attempts_only_when_releasing() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        confirmed(&engine, 9000, 1);
        engine.report(&unit_event("a", EventKind::Boot));
        engine.report(&unit_event("b", EventKind::Boot));
        for i in 0..5 {
            engine.tick(T0 + i);
        }
        let attempts = || engine.confirmed.find(&addr(9000), |s| s.attempts).unwrap();
        assert_eq!(attempts(), 5);

        // Acking an unknown id still gets a reply but does not help.
        let ack = |id| Request::EventAck {
            incarnation: 1,
            event_id: id,
        };
        assert!(engine.handle(ack(99), addr(9000), T0).is_some());
        assert_eq!(attempts(), 5);

        engine.handle(ack(1), addr(9000), T0);
        assert_eq!(attempts(), MAX_ATTEMPTS);

        // Unknown subscribers get no reply at all.
        assert!(engine.handle(ack(2), addr(9999), T0).is_none());
    }

    #[test]
    fn test_silent_subscriber_goes_stale() {
        let engine = NotificationEngine::new(60);
        confirmed(&engine, 9000, 1);

        assert!(engine
            .handle(Request::HeartbeatAck { incarnation: 1 }, addr(9000), T0 + 50)
            .is_some());
        assert!(engine
            .handle(Request::HeartbeatAck { incarnation: 2 }, addr(9000), T0 + 50)
            .is_none());

        engine.tick(T0 + 110);
        assert_eq!(engine.confirmed_count(), 1);
        engine.tick(T0 + 111);
        assert_eq!(engine.confirmed_count(), 0);
    }

    #[test]
    fn test_evict_releases_references() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        confirmed(&engine, 9000, 1);
        engine.report(&unit_event("a", EventKind::Boot));
        engine.tick(T0);
        assert_eq!(engine.event_references(1), Some(1));

        assert!(!engine.evict(addr(9000), 2));
        assert!(engine.evict(addr(9000), 1));
        assert_eq!(engine.event_references(1), Some(0));
        engine.tick(T0 + 1);
        assert_eq!(engine.journal_len(), 0);
    }

    #[test]
    fn test_event_ids_wrap_past_zero() {
        let engine = NotificationEngine::new(DEFAULT_STALE_SECS);
        *engine.next_id.lock() = u32::MAX;
        assert_eq!(engine.allocate_id(), u32::MAX);
        assert_eq!(engine.allocate_id(), 1);
        assert_eq!(engine.allocate_id(), 2);
    }
}
