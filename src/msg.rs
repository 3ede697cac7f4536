//! Definitions of the messages sent by the protocol, and their wire headers.
//!
//! This module only contains the message catalog itself, to make it easy to
//! understand the whole protocol at a glance. The sequencing and delivery
//! logic lives in [`remote`] and [`peer`].
//!
//! Each message travels as a [`MessageHeader`] followed by its body. The
//! catalog is a tagged union ([`Message`]): the header's `id` discriminates
//! the variant, and [`Message::body`] is the single (de)serialization routine
//! per variant, dispatched on the [`Stream`] mode.
//!
//! [`remote`]: crate::remote
//! [`peer`]: crate::peer
//! [`Stream`]: crate::stream::Stream

use bitflags::bitflags;

use crate::{
    seq::Seq,
    stream::{Stream, StreamError},
};

bitflags! {
    /// Delivery-mode flags carried in a [`MessageHeader`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// Consumed by the protocol itself rather than the application.
        const SYSTEM = 1 << 0;
        /// Retransmitted until the remote acknowledges its sequence.
        const RELIABLE = 1 << 1;
        /// Dropped on receive if its sequence is older than the latest.
        const ORDERED = 1 << 2;
        /// Bypasses sequence tracking entirely (used for discovery).
        const UNSEQUENCED = 1 << 3;
    }
}

/// Wire header preceding every message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Body size in bytes, excluding this header.
    pub size: u16,
    /// Per-peer outbound sequence, stamped at send time; [`Seq::ZERO`] means
    /// "never assigned".
    pub seq: Seq,
    /// Delivery-mode flags.
    pub flags: MessageFlags,
    /// Discriminator into the message catalog.
    pub id: u8,
}

impl MessageHeader {
    /// Wire size of a message header.
    pub const WIRE_LEN: usize = 6;

    /// Builds the header describing `msg`, with the sequence left unstamped.
    #[must_use]
    pub fn describe(msg: &Message) -> Self {
        Self {
            size: msg.body_len(),
            seq: Seq::ZERO,
            flags: msg.flags(),
            id: msg.id(),
        }
    }

    /// Reads or writes this header through `stream` according to its mode.
    pub fn transfer(&mut self, stream: &mut Stream) -> Result<(), StreamError> {
        stream.value_u16(&mut self.size)?;
        stream.value_u16(&mut self.seq.0)?;
        let mut bits = self.flags.bits();
        stream.value_u8(&mut bits)?;
        self.flags = MessageFlags::from_bits_retain(bits);
        stream.value_u8(&mut self.id)?;
        Ok(())
    }

    /// Whether this message bypasses sequence tracking.
    #[must_use]
    pub fn is_unsequenced(&self) -> bool {
        self.flags.contains(MessageFlags::UNSEQUENCED)
    }

    /// Whether this message is retransmitted until acknowledged.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(MessageFlags::RELIABLE)
    }

    /// Whether old sequences of this message are dropped on receive.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.flags.contains(MessageFlags::ORDERED)
    }

    /// Whether this message is handled by the protocol itself.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.flags.contains(MessageFlags::SYSTEM)
    }
}

/// One message of the protocol catalog.
///
/// System variants drive discovery, the connection handshake and liveness;
/// the rest are application messages delivered through
/// [`PeerHandler::on_game_message`].
///
/// [`PeerHandler::on_game_message`]: crate::peer::PeerHandler::on_game_message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Diagnostic value, logged on receive.
    Test {
        /// Arbitrary test payload.
        value: u8,
    },
    /// Broadcast probe looking for servers of the same game.
    DiscoveryRequest {
        /// Identifier separating this game's traffic from others on the LAN.
        game_id: u32,
    },
    /// Server reply to a matching [`Message::DiscoveryRequest`].
    DiscoveryAnswer {
        /// Identifier of the answering server's game.
        game_id: u32,
        /// How many peer slots are still free.
        free_slots: u8,
        /// Total peer slots on the server.
        total_slots: u8,
    },
    /// First handshake step, client to server.
    ConnectionRequest {
        /// Must match the server's game for the request to be considered.
        game_id: u32,
    },
    /// Second and third handshake steps, in both directions.
    ConnectionAnswer {
        /// ID the server assigned to the client; `0xFF` means "server full".
        assigned_id: u8,
        /// Challenge value (server to client), or its response
        /// (client to server).
        challenge: u32,
    },
    /// Final handshake step, server to client.
    ConnectionSuccess {
        /// Identifier of the game both ends now agree on.
        game_id: u32,
    },
    /// Liveness probe; the receiver echoes it back with the flag inverted.
    KeepAlive {
        /// `1` if a server sent this message, `0` if a client did.
        server_sent: u8,
        /// Sender clock at send time, echoed back verbatim so the original
        /// sender can sample its RTT.
        timestamp: u64,
    },
    /// Best-effort notice that the sender is leaving the session.
    DisconnectionRequest {
        /// Identifier kept for parity with [`Message::ConnectionRequest`].
        game_id: u32,
    },
    /// A player joined the session.
    PlayerJoined {
        /// ID of the joining player.
        player_id: u8,
    },
    /// A player left the session.
    PlayerLeft {
        /// ID of the leaving player.
        player_id: u8,
    },
}

impl Message {
    /// Catalog discriminator of this message.
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::Test { .. } => 1,
            Self::DiscoveryRequest { .. } => 2,
            Self::DiscoveryAnswer { .. } => 3,
            Self::ConnectionRequest { .. } => 4,
            Self::ConnectionAnswer { .. } => 5,
            Self::ConnectionSuccess { .. } => 6,
            Self::KeepAlive { .. } => 7,
            Self::DisconnectionRequest { .. } => 8,
            Self::PlayerJoined { .. } => 9,
            Self::PlayerLeft { .. } => 10,
        }
    }

    /// Delivery-mode flags of this message.
    #[must_use]
    pub fn flags(&self) -> MessageFlags {
        match self {
            Self::Test { .. } | Self::KeepAlive { .. } | Self::DisconnectionRequest { .. } => {
                MessageFlags::SYSTEM
            }
            Self::DiscoveryRequest { .. } | Self::DiscoveryAnswer { .. } => {
                MessageFlags::SYSTEM | MessageFlags::UNSEQUENCED
            }
            Self::ConnectionRequest { .. }
            | Self::ConnectionAnswer { .. }
            | Self::ConnectionSuccess { .. } => MessageFlags::SYSTEM | MessageFlags::RELIABLE,
            Self::PlayerJoined { .. } | Self::PlayerLeft { .. } => MessageFlags::RELIABLE,
        }
    }

    /// Body size of this message on the wire, excluding the header.
    #[must_use]
    pub fn body_len(&self) -> u16 {
        match self {
            Self::Test { .. } | Self::PlayerJoined { .. } | Self::PlayerLeft { .. } => 1,
            Self::DiscoveryRequest { .. }
            | Self::ConnectionRequest { .. }
            | Self::ConnectionSuccess { .. }
            | Self::DisconnectionRequest { .. } => 4,
            Self::ConnectionAnswer { .. } => 5,
            Self::DiscoveryAnswer { .. } => 6,
            Self::KeepAlive { .. } => 9,
        }
    }

    /// Human-readable variant name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Test { .. } => "Test",
            Self::DiscoveryRequest { .. } => "DiscoveryRequest",
            Self::DiscoveryAnswer { .. } => "DiscoveryAnswer",
            Self::ConnectionRequest { .. } => "ConnectionRequest",
            Self::ConnectionAnswer { .. } => "ConnectionAnswer",
            Self::ConnectionSuccess { .. } => "ConnectionSuccess",
            Self::KeepAlive { .. } => "KeepAlive",
            Self::DisconnectionRequest { .. } => "DisconnectionRequest",
            Self::PlayerJoined { .. } => "PlayerJoined",
            Self::PlayerLeft { .. } => "PlayerLeft",
        }
    }

    /// Builds a zeroed message of the catalog variant with the given
    /// discriminator, as a target to decode a received body into.
    ///
    /// Returns [`None`] for discriminators outside the catalog.
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            1 => Self::Test { value: 0 },
            2 => Self::DiscoveryRequest { game_id: 0 },
            3 => Self::DiscoveryAnswer {
                game_id: 0,
                free_slots: 0,
                total_slots: 0,
            },
            4 => Self::ConnectionRequest { game_id: 0 },
            5 => Self::ConnectionAnswer {
                assigned_id: 0,
                challenge: 0,
            },
            6 => Self::ConnectionSuccess { game_id: 0 },
            7 => Self::KeepAlive {
                server_sent: 0,
                timestamp: 0,
            },
            8 => Self::DisconnectionRequest { game_id: 0 },
            9 => Self::PlayerJoined { player_id: 0 },
            10 => Self::PlayerLeft { player_id: 0 },
            _ => return None,
        })
    }

    /// Reads or writes this message's body through `stream` according to its
    /// mode.
    pub fn body(&mut self, stream: &mut Stream) -> Result<(), StreamError> {
        match self {
            Self::Test { value } => stream.value_u8(value),
            Self::DiscoveryRequest { game_id }
            | Self::ConnectionRequest { game_id }
            | Self::ConnectionSuccess { game_id }
            | Self::DisconnectionRequest { game_id } => stream.value_u32(game_id),
            Self::DiscoveryAnswer {
                game_id,
                free_slots,
                total_slots,
            } => {
                stream.value_u32(game_id)?;
                stream.value_u8(free_slots)?;
                stream.value_u8(total_slots)
            }
            Self::ConnectionAnswer {
                assigned_id,
                challenge,
            } => {
                stream.value_u8(assigned_id)?;
                stream.value_u32(challenge)
            }
            Self::KeepAlive {
                server_sent,
                timestamp,
            } => {
                stream.value_u8(server_sent)?;
                stream.value_u64(timestamp)
            }
            Self::PlayerJoined { player_id } | Self::PlayerLeft { player_id } => {
                stream.value_u8(player_id)
            }
        }
    }
}

/// A message body plus the wire header it travels with.
///
/// This is the owned unit moved across a remote peer's queues: ownership
/// transfers on enqueue and dequeue, and a reliable envelope keeps its
/// stamped sequence across retransmits.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Wire header; `seq` stays [`Seq::ZERO`] until the first send.
    pub header: MessageHeader,
    /// The message body.
    pub body: Message,
}

impl Envelope {
    /// Wraps a message with its describing header, sequence unstamped.
    #[must_use]
    pub fn new(body: Message) -> Self {
        Self {
            header: MessageHeader::describe(&body),
            body,
        }
    }

    /// Header plus body size of this envelope on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        MessageHeader::WIRE_LEN + usize::from(self.header.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Message> {
        vec![
            Message::Test { value: 42 },
            Message::DiscoveryRequest {
                game_id: 0xDEAD_CAFE,
            },
            Message::DiscoveryAnswer {
                game_id: 0xDEAD_CAFE,
                free_slots: 3,
                total_slots: 4,
            },
            Message::ConnectionRequest {
                game_id: 0xDEAD_CAFE,
            },
            Message::ConnectionAnswer {
                assigned_id: 1,
                challenge: 0x0012_3456,
            },
            Message::ConnectionSuccess {
                game_id: 0xDEAD_CAFE,
            },
            Message::KeepAlive {
                server_sent: 1,
                timestamp: 123_456_789,
            },
            Message::DisconnectionRequest {
                game_id: 0xDEAD_CAFE,
            },
            Message::PlayerJoined { player_id: 2 },
            Message::PlayerLeft { player_id: 2 },
        ]
    }

    #[test]
    fn body_round_trip_every_variant() {
        for mut msg in catalog() {
            let mut buf = [0; 16];
            let mut s = Stream::writer(&mut buf);
            msg.body(&mut s).unwrap();
            assert_eq!(usize::from(msg.body_len()), s.position(), "{}", msg.name());

            let mut decoded = Message::from_id(msg.id()).unwrap();
            let mut s = Stream::reader(&mut buf);
            decoded.body(&mut s).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn ids_are_the_catalog_order() {
        for (i, msg) in catalog().into_iter().enumerate() {
            assert_eq!(i as u8 + 1, msg.id());
            assert_eq!(msg.id(), Message::from_id(msg.id()).unwrap().id());
        }
        assert_eq!(None, Message::from_id(0));
        assert_eq!(None, Message::from_id(11));
    }

    #[test]
    fn flags_table() {
        use MessageFlags as F;
        let msgs = catalog();
        assert_eq!(F::SYSTEM, msgs[0].flags());
        assert_eq!(F::SYSTEM | F::UNSEQUENCED, msgs[1].flags());
        assert_eq!(F::SYSTEM | F::UNSEQUENCED, msgs[2].flags());
        assert_eq!(F::SYSTEM | F::RELIABLE, msgs[3].flags());
        assert_eq!(F::SYSTEM | F::RELIABLE, msgs[4].flags());
        assert_eq!(F::SYSTEM | F::RELIABLE, msgs[5].flags());
        assert_eq!(F::SYSTEM, msgs[6].flags());
        assert_eq!(F::SYSTEM, msgs[7].flags());
        assert_eq!(F::RELIABLE, msgs[8].flags());
        assert_eq!(F::RELIABLE, msgs[9].flags());
    }

    #[test]
    fn header_round_trip() {
        let mut header = MessageHeader {
            size: 9,
            seq: Seq(4321),
            flags: MessageFlags::SYSTEM | MessageFlags::RELIABLE,
            id: 7,
        };
        let mut buf = [0; MessageHeader::WIRE_LEN];
        let mut s = Stream::writer(&mut buf);
        header.transfer(&mut s).unwrap();
        assert_eq!(MessageHeader::WIRE_LEN, s.position());

        let mut decoded = MessageHeader::default();
        let mut s = Stream::reader(&mut buf);
        decoded.transfer(&mut s).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn describe_leaves_seq_unstamped() {
        let env = Envelope::new(Message::PlayerJoined { player_id: 7 });
        assert_eq!(Seq::ZERO, env.header.seq);
        assert_eq!(1, env.header.size);
        assert_eq!(9, env.header.id);
        assert_eq!(MessageHeader::WIRE_LEN + 1, env.wire_len());
    }
}
