//! Packet framing layer
//!
//! Pure data transformation: the envelope codec, the checksum installed
//! on transports, and the typed packet dispatch. No I/O happens here.

pub mod codec;
pub mod crc;
pub mod packet;
pub mod types;

// Re-export commonly used types
pub use codec::{PacketReader, PacketWriter};
pub use crc::{checksum, verify};
pub use packet::{Packet, PacketDispatcher};
