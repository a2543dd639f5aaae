//! Gossip transport: wire messages and the length-prefixed codec.

pub mod protocol;

pub use protocol::{
    decode_message, encode_message, read_message, write_message, Message, NetworkError,
};
