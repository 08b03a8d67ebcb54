//! Protocol state of one blob pipe, free of I/O.
//!
//! Every method takes the current state plus an input and returns what must
//! happen next (packets to write, payloads to deliver, futures to resolve).
//! The caller applies those effects after releasing the pipe lock.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use tether_core::wire::{AckQuad, MessageId, Packet, PacketKind, PacketReader};

use super::PipeError;

pub(crate) type Completion = oneshot::Sender<Result<(), PipeError>>;

/// A sent message awaiting its final acknowledgement.
struct Outbound {
    seq: u64,
    /// Cleared once the peer confirms receipt.
    body: Option<Bytes>,
    done: Completion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InboundState {
    /// Stored and queued for the receiver.
    Received,
    Delivered,
    Failed(String),
}

/// Side effects produced while handling input.
#[derive(Default)]
pub(crate) struct Effects {
    pub packets: Vec<Packet>,
    pub deliveries: Vec<(MessageId, Bytes)>,
    pub completions: Vec<(Completion, Result<(), PipeError>)>,
}

impl Effects {
    pub fn resolve(self) -> (Vec<Packet>, Vec<(MessageId, Bytes)>) {
        for (done, result) in self.completions {
            let _ = done.send(result);
        }
        (self.packets, self.deliveries)
    }
}

pub(crate) struct PipeState {
    next_id: MessageId,
    next_seq: u64,
    outbound: HashMap<MessageId, Outbound>,
    inbound: HashMap<MessageId, InboundState>,
    pub reader: PacketReader,
}

impl PipeState {
    pub fn new(max_packet_bytes: usize) -> Self {
        Self {
            next_id: MessageId::ZERO,
            next_seq: 0,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            reader: PacketReader::new(max_packet_bytes),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Record a new outbound message and return its id.
    pub fn enqueue(
        &mut self,
        body: Bytes,
        done: Completion,
        limit: usize,
    ) -> Result<MessageId, (Completion, PipeError)> {
        if self.outbound.len() >= limit {
            return Err((done, PipeError::TooManyInFlight(limit)));
        }
        // Bounded in-flight count guarantees a free id within `limit + 1` steps.
        let mut id = self.next_id;
        while self.outbound.contains_key(&id) {
            id = id.next();
        }
        self.next_id = id.next();

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbound.insert(
            id,
            Outbound {
                seq,
                body: Some(body),
                done,
            },
        );
        Ok(id)
    }

    /// Drop every outbound message, handing back the futures to fail.
    pub fn drain_outbound(&mut self) -> Vec<Completion> {
        self.inbound.clear();
        self.outbound.drain().map(|(_, o)| o.done).collect()
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// The receiver finished with `id`. Returns the acknowledgement to send.
    pub fn delivered(&mut self, id: MessageId, outcome: Result<(), String>) -> Option<Packet> {
        let state = self.inbound.get_mut(&id)?;
        if *state != InboundState::Received {
            return None;
        }
        match outcome {
            Ok(()) => {
                *state = InboundState::Delivered;
                Some(Packet::AckDelivered(id))
            }
            Err(reason) => {
                *state = InboundState::Failed(reason.clone());
                Some(Packet::Nack { id, reason })
            }
        }
    }

    // ── Packet handling ───────────────────────────────────────────────────────

    pub fn handle(&mut self, packet: Packet, fx: &mut Effects) {
        match packet {
            Packet::Data { id, payload } => self.on_data(id, payload, fx),
            Packet::AckReceived(id) => self.on_ack_received(id),
            Packet::AckDelivered(id) => self.retire(id, Ok(()), fx),
            Packet::Nack { id, reason } => self.retire(id, Err(PipeError::Rejected { id, reason }), fx),
            Packet::AckOfNack(id) => {
                if matches!(
                    self.inbound.get(&id),
                    Some(InboundState::Delivered | InboundState::Failed(_))
                ) {
                    self.inbound.remove(&id);
                }
            }
            Packet::Sync(quads) => {
                for quad in quads {
                    match quad.kind {
                        PacketKind::AckReceived => self.on_ack_received(quad.id),
                        _ => self.retire(quad.id, Ok(()), fx),
                    }
                }
            }
        }
    }

    fn on_data(&mut self, id: MessageId, payload: Bytes, fx: &mut Effects) {
        match self.inbound.get(&id) {
            None => {
                self.inbound.insert(id, InboundState::Received);
                fx.packets.push(Packet::AckReceived(id));
                fx.deliveries.push((id, payload));
            }
            Some(InboundState::Received) => fx.packets.push(Packet::AckReceived(id)),
            Some(InboundState::Delivered) => fx.packets.push(Packet::AckDelivered(id)),
            Some(InboundState::Failed(reason)) => fx.packets.push(Packet::Nack {
                id,
                reason: reason.clone(),
            }),
        }
    }

    fn on_ack_received(&mut self, id: MessageId) {
        if let Some(out) = self.outbound.get_mut(&id) {
            out.body = None;
        }
    }

    /// Final acknowledgement for `id`. Unknown ids are answered too, so the
    /// peer can drop a stale inbound entry.
    fn retire(&mut self, id: MessageId, result: Result<(), PipeError>, fx: &mut Effects) {
        if let Some(out) = self.outbound.remove(&id) {
            fx.completions.push((out.done, result));
        }
        fx.packets.push(Packet::AckOfNack(id));
    }

    // ── Resync ────────────────────────────────────────────────────────────────

    /// Packets announcing our state to a freshly attached stream: one SYNC
    /// with the inbound ack states, NACKs for failed inbound messages, then
    /// every outbound body not yet receipt-acknowledged, in send order.
    pub fn resync(&self) -> Vec<Packet> {
        let mut quads = Vec::new();
        let mut nacks = Vec::new();
        for (&id, state) in &self.inbound {
            match state {
                InboundState::Received => quads.push(AckQuad {
                    kind: PacketKind::AckReceived,
                    id,
                }),
                InboundState::Delivered => quads.push(AckQuad {
                    kind: PacketKind::AckDelivered,
                    id,
                }),
                InboundState::Failed(reason) => nacks.push(Packet::Nack {
                    id,
                    reason: reason.clone(),
                }),
            }
        }
        quads.sort_by_key(|q| q.id);
        nacks.sort_by_key(Packet::id);

        let mut resend: Vec<_> = self
            .outbound
            .iter()
            .filter_map(|(&id, out)| out.body.clone().map(|payload| (out.seq, id, payload)))
            .collect();
        resend.sort_by_key(|(seq, _, _)| *seq);

        let mut packets = vec![Packet::Sync(quads)];
        packets.extend(nacks);
        packets.extend(
            resend
                .into_iter()
                .map(|(_, id, payload)| Packet::Data { id, payload }),
        );
        packets
    }
}
