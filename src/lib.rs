#![doc = include_str!("../README.md")]

pub mod condition;
pub mod msg;
pub mod packet;
pub mod peer;
pub mod remote;
pub mod seq;
pub mod socket;
pub mod stream;

pub use {
    msg::{Envelope, Message, MessageFlags, MessageHeader},
    packet::{Acknowledge, PacketHeader, MAX_PACKET_LEN},
    peer::{Peer, PeerConfig, PeerHandler, PeerState},
    seq::Seq,
};
