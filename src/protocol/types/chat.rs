//! CHAT packet type
//!
//! Text message relayed between peers. Servers typically stamp the
//! sender id before rebroadcasting, so clients see who wrote what.
//!
//! # Wire format
//! - Tag: 0x00
//! - `i32` sender peer id (big-endian)
//! - `u32` text byte length + UTF-8 bytes

use crate::error::Result;
use crate::protocol::codec::{PacketReader, PacketWriter};
use crate::protocol::packet::Packet;

/// Chat text sent by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Peer id of the author; the server fills this in on relay
    pub sender: i32,
    /// The text content
    pub text: String,
}

impl ChatMessage {
    /// Create a chat message.
    pub fn new(sender: i32, text: impl Into<String>) -> Self {
        ChatMessage {
            sender,
            text: text.into(),
        }
    }
}

impl Packet for ChatMessage {
    const TAG: u8 = 0x00;

    fn serialize(&self, writer: &mut PacketWriter) -> Result<usize> {
        writer.write_u8(Self::TAG)?;
        writer.write_i32(self.sender)?;
        writer.write_str(&self.text)?;
        Ok(writer.position())
    }

    fn deserialize(reader: &mut PacketReader) -> Result<Self> {
        let sender = reader.read_i32()?;
        let text = reader.read_string()?;
        Ok(ChatMessage { sender, text })
    }
}
