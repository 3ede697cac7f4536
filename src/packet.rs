//! Framing of messages into checksummed datagrams with piggy-backed acks.
//!
//! A packet is one [`PacketHeader`] followed by zero or more
//! ([`MessageHeader`], body) pairs, never exceeding [`MAX_PACKET_LEN`] bytes
//! in total. The header carries a CRC-16 over everything after the checksum
//! field, plus an [`Acknowledge`] reporting what the sender has received so
//! far.

use crate::{
    msg::Envelope,
    seq::Seq,
    stream::{Stream, StreamError},
};

/// Maximum datagram length in bytes.
///
/// Chosen conservatively below the typical 1500-byte Ethernet MTU to leave
/// room for the UDP and IP headers.
pub const MAX_PACKET_LEN: usize = 1400;

/// Tracks which sequences, that a remote has sent, this side has received.
///
/// This uses the strategy described in
/// [*Gaffer On Games*, Packet Level Acks](https://gafferongames.com/post/reliable_ordered_messages/#packet-levelacks),
/// storing two pieces of info:
/// * the latest received sequence number (`last_recv`)
/// * a bitfield of which sequences before `last_recv` have been received
///   (`bits`)
///
/// If a bit at index `i` is set in `bits`, then the sequence
/// `last_recv - 1 - i` has been received. For example,
///
/// ```text
/// last_recv: 40
///      bits: 0b0000..00001001
///                    ^   ^  ^
///                    |   |  +- seq 39 (40 - 1 - 0) has been received
///                    |   +---- seq 36 (40 - 1 - 3) has been received
///                    +-------- seq 32 has NOT been received
/// ```
///
/// This info rides on every packet, re-reporting the last 32 sequences each
/// time, which gives a lot of redundancy for acks on a lossy link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Acknowledge {
    /// Latest received sequence number.
    pub last_recv: Seq,
    /// Bitfield of which sequences before `last_recv` have been received.
    pub bits: u32,
}

impl Acknowledge {
    /// Wire size of the ack fields.
    pub const WIRE_LEN: usize = 6;

    /// Iterates over the sequences before `last_recv` that this value
    /// acknowledges.
    ///
    /// `last_recv` itself is not yielded; it is acknowledged unconditionally
    /// by its own field.
    ///
    /// # Example
    ///
    /// ```
    /// # use quicknet::{packet::Acknowledge, seq::Seq};
    /// let acks = Acknowledge {
    ///     last_recv: Seq(50),
    ///     bits: 0b0010010,
    /// };
    /// let mut iter = acks.seqs();
    /// assert_eq!(Some(Seq(48)), iter.next());
    /// assert_eq!(Some(Seq(45)), iter.next());
    /// assert_eq!(None, iter.next());
    /// ```
    pub fn seqs(self) -> impl Iterator<Item = Seq> {
        (0u16..32).filter_map(move |i| {
            if self.bits & (1 << i) == 0 {
                None
            } else {
                Some(self.last_recv - 1 - i)
            }
        })
    }
}

/// Header at the front of every datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// CRC-16 over every packet byte after this field.
    pub checksum: u16,
    /// What the sender of this packet has received so far.
    pub acks: Acknowledge,
}

impl PacketHeader {
    /// Wire size of a packet header.
    pub const WIRE_LEN: usize = 2 + Acknowledge::WIRE_LEN;

    /// Reads or writes this header through `stream` according to its mode.
    pub fn transfer(&mut self, stream: &mut Stream) -> Result<(), StreamError> {
        stream.value_u16(&mut self.checksum)?;
        stream.value_u16(&mut self.acks.last_recv.0)?;
        stream.value_u32(&mut self.acks.bits)?;
        Ok(())
    }

    /// Whether `checksum` matches the contents of the serialized packet in
    /// `data`.
    #[must_use]
    pub fn is_checksum_valid(&self, data: &[u8]) -> bool {
        crc16(&data[2..]) == self.checksum
    }
}

/// Computes the protocol's CRC-16 over `data`.
///
/// The seed doubles as a protocol key: packets from unrelated protocols that
/// happen to share the port fail the check with high probability.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xDEAD;
    for &byte in data {
        let x = (crc >> 8) ^ u16::from(byte);
        let x = x ^ (x >> 4);
        crc = (crc << 8) ^ (x << 12) ^ (x << 5) ^ x;
    }
    crc
}

/// One datagram being assembled for a single remote: a [`PacketHeader`] plus
/// the envelopes riding in it, in insertion order.
#[derive(Debug, Default)]
pub struct Packet {
    /// Header; the checksum is computed during [`Packet::serialize`].
    pub header: PacketHeader,
    messages: Vec<Envelope>,
}

impl Packet {
    /// Creates an empty packet acknowledging `acks`.
    #[must_use]
    pub fn new(acks: Acknowledge) -> Self {
        Self {
            header: PacketHeader {
                checksum: 0,
                acks,
            },
            messages: Vec::new(),
        }
    }

    /// Appends an envelope to this packet.
    pub fn push(&mut self, env: Envelope) {
        self.messages.push(env);
    }

    /// How many envelopes ride in this packet.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Total serialized size of this packet in bytes.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        PacketHeader::WIRE_LEN + self.messages.iter().map(Envelope::wire_len).sum::<usize>()
    }

    /// Serializes the packet into `buf` and patches the checksum in, leaving
    /// the wire image in `buf[..self.wire_len()]`.
    pub fn serialize(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut stream = Stream::writer(buf);
        self.header.checksum = 0;
        self.header.transfer(&mut stream)?;
        for env in &mut self.messages {
            env.header.transfer(&mut stream)?;
            env.body.body(&mut stream)?;
        }

        let len = stream.position();
        self.header.checksum = crc16(&buf[2..len]);
        let mut stream = Stream::writer(buf);
        stream.write_u16(self.header.checksum)?;
        Ok(len)
    }

    /// Consumes the packet, yielding back the envelopes it carried so that
    /// reliable ones can be requeued for acknowledgment tracking.
    pub fn into_messages(self) -> impl Iterator<Item = Envelope> {
        self.messages.into_iter()
    }
}
