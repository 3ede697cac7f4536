//! Artificial latency injection for received messages.
//!
//! **This is for testing purposes only!** You should never enable a latency
//! faker in the release build of your game.
//!
//! A useful strategy for testing networking code is to induce artificial
//! packet loss and delays and see how the game copes. Packet loss is rolled
//! directly in the [`Peer`] send and receive paths; delays go through
//! [`LatencyFaker`]: instead of being processed on arrival, a received
//! message is parked here and released once the configured latency has
//! elapsed.
//!
//! [`Peer`]: crate::peer::Peer

use std::{collections::VecDeque, net::SocketAddr};

use crate::msg::Envelope;

/// Queue of received messages being held back to simulate latency.
///
/// Release order is strictly FIFO of enqueue time. Retention is unbounded;
/// don't enable a latency with an unbounded enqueue rate.
///
/// Known limitation: the faker does not distinguish retransmits whose
/// sequence has already been acknowledged from other messages, so under fake
/// latency a reliable message can be delivered to the duplicate check more
/// often than it would be on a real link. Filtering those would require the
/// faker to see the receive-side duplicate state, which it deliberately
/// doesn't.
#[derive(Debug, Default)]
pub struct LatencyFaker {
    latency_ms: u32,
    entries: VecDeque<DelayedMessage>,
}

#[derive(Debug)]
struct DelayedMessage {
    env: Envelope,
    from: SocketAddr,
    queued_at: u64,
}

impl LatencyFaker {
    /// Creates a faker with latency disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the artificial latency; `0` disables holding messages back.
    pub fn set_latency(&mut self, milliseconds: u32) {
        self.latency_ms = milliseconds;
    }

    /// Currently configured artificial latency in milliseconds.
    #[must_use]
    pub fn latency(&self) -> u32 {
        self.latency_ms
    }

    /// Whether the faker is currently holding messages back.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.latency_ms > 0
    }

    /// Parks a received message until its latency elapses.
    pub fn push(&mut self, env: Envelope, from: SocketAddr, now_ms: u64) {
        self.entries.push_back(DelayedMessage {
            env,
            from,
            queued_at: now_ms,
        });
    }

    /// Releases the oldest parked message if its latency has elapsed.
    ///
    /// With latency set to `0`, the front is released unconditionally, so a
    /// faker disabled mid-flight still drains.
    pub fn pop_ready(&mut self, now_ms: u64) -> Option<(Envelope, SocketAddr)> {
        let front = self.entries.front()?;
        let elapsed = now_ms.saturating_sub(front.queued_at);
        if self.latency_ms > 0 && elapsed < u64::from(self.latency_ms) {
            return None;
        }
        self.entries
            .pop_front()
            .map(|entry| (entry.env, entry.from))
    }
}

#[cfg(test)]
mod tests {
    use crate::msg::Message;

    use super::*;

    fn env(value: u8) -> Envelope {
        Envelope::new(Message::Test { value })
    }

    fn addr() -> SocketAddr {
        ([127, 0, 0, 1], 9000).into()
    }

    #[test]
    fn zero_latency_releases_immediately() {
        let mut faker = LatencyFaker::new();
        faker.push(env(1), addr(), 100);
        assert!(faker.pop_ready(100).is_some());
        assert!(faker.pop_ready(100).is_none());
    }

    #[test]
    fn messages_wait_out_the_latency() {
        let mut faker = LatencyFaker::new();
        faker.set_latency(50);
        faker.push(env(1), addr(), 100);

        assert!(faker.pop_ready(100).is_none());
        assert!(faker.pop_ready(149).is_none());
        let (released, from) = faker.pop_ready(150).expect("latency elapsed");
        assert_eq!(Message::Test { value: 1 }, released.body);
        assert_eq!(addr(), from);
    }

    #[test]
    fn release_order_is_fifo() {
        let mut faker = LatencyFaker::new();
        faker.set_latency(10);
        faker.push(env(1), addr(), 0);
        faker.push(env(2), addr(), 5);

        let (first, _) = faker.pop_ready(20).expect("both are ready");
        let (second, _) = faker.pop_ready(20).expect("both are ready");
        assert_eq!(Message::Test { value: 1 }, first.body);
        assert_eq!(Message::Test { value: 2 }, second.body);
    }

    #[test]
    fn disabling_mid_flight_drains_the_queue() {
        let mut faker = LatencyFaker::new();
        faker.set_latency(1000);
        faker.push(env(1), addr(), 0);
        assert!(faker.pop_ready(10).is_none());

        faker.set_latency(0);
        assert!(faker.pop_ready(10).is_some());
    }
}
