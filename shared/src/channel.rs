//! Reliable-ordered delivery on top of UDP datagrams.
//!
//! One channel instance exists per connection on each side. Outgoing
//! envelopes are numbered from 1 and kept until cumulatively acknowledged;
//! incoming ones are released strictly in sequence order.

use crate::protocol::{Envelope, Packet};
use log::debug;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const RESEND_INTERVAL: Duration = Duration::from_millis(200);

/// Out-of-order packets further ahead than this are dropped and left to the
/// sender's resend.
const RECEIVE_WINDOW: u32 = 256;

#[derive(Debug)]
pub struct ReliableChannel {
    next_send_sequence: u32,
    unacked: BTreeMap<u32, (Instant, Envelope)>,
    next_expected: u32,
    out_of_order: BTreeMap<u32, Envelope>,
    resend_interval: Duration,
}

impl Default for ReliableChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self::with_resend_interval(RESEND_INTERVAL)
    }

    pub fn with_resend_interval(resend_interval: Duration) -> Self {
        Self {
            next_send_sequence: 1,
            unacked: BTreeMap::new(),
            next_expected: 1,
            out_of_order: BTreeMap::new(),
            resend_interval,
        }
    }

    /// Assigns the next sequence number and returns the packet to transmit.
    pub fn send(&mut self, envelope: Envelope, now: Instant) -> Packet {
        let sequence = self.next_send_sequence;
        self.next_send_sequence += 1;
        self.unacked.insert(sequence, (now, envelope.clone()));
        Packet::Reliable { sequence, envelope }
    }

    pub fn on_ack(&mut self, sequence: u32) {
        self.unacked.retain(|seq, _| *seq > sequence);
    }

    /// Accepts one reliable packet. Returns the envelopes that became
    /// deliverable, in order, plus the cumulative ack to send back.
    pub fn receive(&mut self, sequence: u32, envelope: Envelope) -> (Vec<Envelope>, Packet) {
        let mut delivered = Vec::new();

        if sequence == self.next_expected {
            delivered.push(envelope);
            self.next_expected += 1;

            while let Some(next) = self.out_of_order.remove(&self.next_expected) {
                delivered.push(next);
                self.next_expected += 1;
            }
        } else if sequence > self.next_expected {
            if sequence - self.next_expected < RECEIVE_WINDOW {
                self.out_of_order.entry(sequence).or_insert(envelope);
            } else {
                debug!("Dropping reliable packet {} outside receive window", sequence);
            }
        }
        // Anything older is a duplicate; re-acking below covers a lost ack.

        let ack = Packet::Ack {
            sequence: self.next_expected - 1,
        };
        (delivered, ack)
    }

    /// Packets whose last transmission is older than the resend interval.
    pub fn resend_due(&mut self, now: Instant) -> Vec<Packet> {
        let interval = self.resend_interval;
        self.unacked
            .iter_mut()
            .filter(|(_, (sent_at, _))| now.duration_since(*sent_at) >= interval)
            .map(|(sequence, (sent_at, envelope))| {
                *sent_at = now;
                Packet::Reliable {
                    sequence: *sequence,
                    envelope: envelope.clone(),
                }
            })
            .collect()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }
}
