//! Per-connection state: sequencing, duplicate detection, the reliable
//! retransmission queue, ack bookkeeping and RTT smoothing.
//!
//! A [`RemotePeer`] is the delicate half of the protocol. It tracks send and
//! receive sequences across 16-bit wrap-around by tagging every received
//! sequence with a *round*: a counter that increments each time the inbound
//! sequence wraps. A sequence recorded just before a wrap belongs to
//! `round - 1` of a sequence recorded just after it, which is what lets
//! duplicates be recognized on both sides of the boundary.

use std::{collections::VecDeque, net::SocketAddr};

use ahash::AHashMap;
use tracing::trace;

use crate::{
    msg::Envelope,
    packet::Acknowledge,
    peer::PeerState,
    seq::Seq,
};

/// State for one remote end of a connection, owned by the local
/// [`Peer`](crate::peer::Peer).
#[derive(Debug)]
pub struct RemotePeer {
    /// ID this peer is keyed under in the peer table; `0xFF` until assigned.
    pub assigned_id: u8,
    state: PeerState,
    address: SocketAddr,
    /// One-way latency estimate, half of the last RTT sample.
    ping: u32,
    /// Exponentially smoothed round-trip time.
    rtt: u32,
    /// Highest sequence received so far.
    seq_in: Seq,
    /// Next outbound sequence to stamp; starts at 1, never 0.
    seq_out: Seq,
    /// Incremented every time `seq_in` wraps.
    seq_round: u32,
    /// Received sequences, tagged with the round they were received in.
    recv_seqs: AHashMap<u16, u32>,
    /// Send timestamps of reliable sequences still awaiting an ack.
    sent_at: AHashMap<u16, u64>,
    /// Messages awaiting their first send.
    pending: VecDeque<Envelope>,
    /// Reliable messages sent and awaiting acknowledgment.
    reliable: VecDeque<Envelope>,
    last_ack: u64,
    last_recv: u64,
    last_send: u64,
}

impl RemotePeer {
    /// Creates state for a remote at `address`, with both liveness timers
    /// starting at `now_ms`.
    #[must_use]
    pub fn new(address: SocketAddr, now_ms: u64) -> Self {
        Self {
            assigned_id: crate::peer::UNASSIGNED_ID,
            state: PeerState::Disconnected,
            address,
            ping: 0,
            rtt: 0,
            seq_in: Seq::ZERO,
            seq_out: Seq(1),
            seq_round: 0,
            recv_seqs: AHashMap::new(),
            sent_at: AHashMap::new(),
            pending: VecDeque::new(),
            reliable: VecDeque::new(),
            last_ack: now_ms,
            last_recv: now_ms,
            last_send: 0,
        }
    }

    /// Address of the remote end.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Connection state of this remote.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Sets the connection state of this remote.
    pub fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }

    /// One-way latency estimate in milliseconds.
    #[must_use]
    pub fn ping(&self) -> u32 {
        self.ping
    }

    /// Smoothed round-trip time in milliseconds.
    #[must_use]
    pub fn rtt(&self) -> u32 {
        self.rtt
    }

    /// Highest sequence received from this remote so far.
    #[must_use]
    pub fn seq_in(&self) -> Seq {
        self.seq_in
    }

    /// Stamps and returns the next outbound sequence, wrapping `0xFFFF → 1`.
    pub fn next_seq_out(&mut self) -> Seq {
        self.seq_out.get_inc()
    }

    /// Queues a message for its first send.
    pub fn enqueue(&mut self, env: Envelope) {
        self.pending.push_back(env);
    }

    /// Takes the oldest message awaiting its first send.
    pub fn dequeue(&mut self) -> Option<Envelope> {
        self.pending.pop_front()
    }

    /// Puts back a message that did not fit in the current packet, keeping
    /// its place at the front of the queue.
    pub fn requeue_front(&mut self, env: Envelope) {
        self.pending.push_front(env);
    }

    /// Takes the oldest ack-pending reliable for retransmission.
    pub fn dequeue_reliable(&mut self) -> Option<Envelope> {
        self.reliable.pop_front()
    }

    /// Returns a just-sent reliable to the ack-pending queue, stamping its
    /// send time.
    ///
    /// Non-reliable envelopes are dropped. The envelope goes to the *back* of
    /// the queue so retransmissions rotate through all outstanding reliables
    /// at one per packet.
    pub fn requeue_reliable(&mut self, env: Envelope, now_ms: u64) {
        if !env.header.is_reliable() {
            return;
        }
        self.sent_at.insert(env.header.seq.0, now_ms);
        self.reliable.push_back(env);
    }

    /// Whether any message awaits its first send.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether any sent reliable still awaits acknowledgment.
    #[must_use]
    pub fn has_reliable_pending(&self) -> bool {
        !self.reliable.is_empty()
    }

    /// Records that `seq` arrived and is newer than everything seen so far,
    /// advancing `seq_in` and the wrap round if it wrapped.
    pub fn set_seq_in(&mut self, seq: Seq) {
        if seq.0 < self.seq_in.0 {
            // newer but numerically smaller: the sequence space wrapped
            self.seq_round += 1;
        }
        self.seq_in = seq;
    }

    /// Records `seq` in the received-sequence map.
    ///
    /// `newer` is whether `seq` just advanced `seq_in`; an older sequence
    /// that is numerically above `seq_in` was sent before the last wrap and
    /// is tagged with the previous round.
    pub fn save_received_seq(&mut self, seq: Seq, newer: bool) {
        let mut round = self.seq_round;
        if !newer && seq.0 > self.seq_in.0 {
            round = round.wrapping_sub(1);
        }
        trace!("saving received sequence {seq} on round {round}");
        self.recv_seqs.insert(seq.0, round);
    }

    /// Whether `seq` was already received in its own round, i.e. this copy is
    /// a duplicate.
    #[must_use]
    pub fn is_duplicate(&self, seq: Seq) -> bool {
        let Some(&recorded) = self.recv_seqs.get(&seq.0) else {
            return false;
        };
        // sequences above seq_in date from before the last wrap
        let round = if seq.0 > self.seq_in.0 {
            self.seq_round.wrapping_sub(1)
        } else {
            self.seq_round
        };
        recorded == round
    }

    /// Builds the ack bitfield reporting the 32 sequences before `seq_in`.
    ///
    /// Bit `i` is set iff sequence `seq_in - 1 - i` was received in the round
    /// it belongs to: the current round in general, or the round before for
    /// sequences that sit numerically above `seq_in - 1` (from before a
    /// wrap).
    #[must_use]
    pub fn ack_bits(&self) -> u32 {
        let mut bits = 0u32;
        let first = self.seq_in - 1;
        for i in 0u16..32 {
            let current = first - i;
            let mut round = self.seq_round;
            if current.0 > first.0 {
                round = round.wrapping_sub(1);
            }
            if self.recv_seqs.get(&current.0) == Some(&round) {
                bits |= 1 << i;
            }
        }
        bits
    }

    /// Applies an incoming ack report: drops every covered reliable from the
    /// retransmission queue, sampling RTT from its recorded send time, and
    /// touches the ack liveness timer.
    pub fn process_acks(&mut self, acks: Acknowledge, now_ms: u64) {
        self.ack_one(acks.last_recv, now_ms);
        for seq in acks.seqs() {
            self.ack_one(seq, now_ms);
        }
        self.last_ack = now_ms;
    }

    fn ack_one(&mut self, seq: Seq, now_ms: u64) {
        let Some(at) = self.reliable.iter().position(|env| env.header.seq == seq) else {
            return;
        };
        trace!("reliable sequence {seq} acked");
        if let Some(sent) = self.sent_at.remove(&seq.0) {
            self.update_rtt((now_ms - sent) as u32);
        }
        self.reliable.remove(at);
    }

    /// Feeds one RTT sample into the smoothed estimate.
    ///
    /// The first sample is taken as-is; later samples blend in at one tenth
    /// weight.
    pub fn update_rtt(&mut self, sample_ms: u32) {
        self.ping = sample_ms / 2;
        self.rtt = if self.rtt == 0 {
            sample_ms
        } else {
            (self.rtt * 90 + sample_ms * 10) / 100
        };
        trace!(
            "peer {} rtt now {}ms (ping {}ms)",
            self.assigned_id,
            self.rtt,
            self.ping
        );
    }

    /// Milliseconds since the last message arrived from this remote.
    #[must_use]
    pub fn ms_since_last_recv(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_recv)
    }

    /// Notes that a message arrived from this remote.
    pub fn touch_recv(&mut self, now_ms: u64) {
        self.last_recv = now_ms;
    }

    /// Milliseconds since the last ack report arrived from this remote.
    #[must_use]
    pub fn ms_since_last_ack(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_ack)
    }

    /// Resets the ack liveness timer, deferring the next keep-alive.
    pub fn touch_ack(&mut self, now_ms: u64) {
        self.last_ack = now_ms;
    }

    /// Milliseconds since a packet was last sent to this remote.
    #[must_use]
    pub fn ms_since_last_send(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_send)
    }

    /// Notes that a packet was sent to this remote.
    pub fn touch_send(&mut self, now_ms: u64) {
        self.last_send = now_ms;
    }
}
