//! Packet trait and tag-based dispatch
//!
//! Application payloads implement [`Packet`]: `serialize` writes the
//! leading one-byte type tag followed by the fields and reports the
//! total encoded length, `deserialize` reads the fields back. The tag
//! has already been consumed by the dispatch layer.
//!
//! [`PacketDispatcher`] is the receiving half: a handler table indexed
//! by the tag byte. Tags at or beyond the table length, or without a
//! registered handler, are counted and ignored, so a misbehaving peer
//! cannot error the receive path.

use tracing::trace;

use crate::error::Result;
use crate::protocol::codec::{PacketReader, PacketWriter};

/// A typed application payload that can be framed by the envelope codec.
///
/// # Examples
///
/// ```
/// use packetlink::protocol::codec::{PacketReader, PacketWriter};
/// use packetlink::protocol::packet::Packet;
///
/// struct Ping {
///     nonce: u32,
/// }
///
/// impl Packet for Ping {
///     const TAG: u8 = 7;
///
///     fn serialize(&self, writer: &mut PacketWriter) -> packetlink::Result<usize> {
///         writer.write_u8(Self::TAG)?;
///         writer.write_u32(self.nonce)?;
///         Ok(writer.position())
///     }
///
///     fn deserialize(reader: &mut PacketReader) -> packetlink::Result<Self> {
///         Ok(Ping { nonce: reader.read_u32()? })
///     }
/// }
/// ```
pub trait Packet: Sized {
    /// Leading type tag identifying this packet on the wire.
    const TAG: u8;

    /// Encode the tag and all fields, returning total bytes written.
    fn serialize(&self, writer: &mut PacketWriter) -> Result<usize>;

    /// Decode the fields; the tag byte has already been consumed.
    fn deserialize(reader: &mut PacketReader) -> Result<Self>;
}

type Handler<Ctx> = Box<dyn FnMut(&mut Ctx, &mut PacketReader) -> Result<()>>;

/// Handler table indexed by the leading packet type tag.
///
/// `Ctx` is whatever the handlers need to see: the session itself, a
/// `(server, peer)` pair, game state. Handlers run synchronously on the
/// thread that calls [`dispatch`](Self::dispatch), usually from inside
/// a `PacketReceived` listener.
pub struct PacketDispatcher<Ctx> {
    handlers: Vec<Option<Handler<Ctx>>>,
    unknown: u64,
}

impl<Ctx> PacketDispatcher<Ctx> {
    /// Create a dispatcher accepting tags `0..tag_count`.
    pub fn new(tag_count: usize) -> Self {
        let mut handlers = Vec::with_capacity(tag_count);
        handlers.resize_with(tag_count, || None);
        PacketDispatcher {
            handlers,
            unknown: 0,
        }
    }

    /// Register the handler for `tag`, replacing any previous one.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is outside the table chosen at construction.
    pub fn register<F>(&mut self, tag: u8, handler: F)
    where
        F: FnMut(&mut Ctx, &mut PacketReader) -> Result<()> + 'static,
    {
        self.handlers[tag as usize] = Some(Box::new(handler));
    }

    /// Decode the tag byte of `data` and invoke the matching handler on
    /// the remaining stream.
    ///
    /// Empty payloads and unrecognized tags are ignored (and counted);
    /// handler errors propagate to the caller.
    pub fn dispatch(&mut self, ctx: &mut Ctx, data: &[u8]) -> Result<()> {
        let mut reader = PacketReader::new(data);
        let Ok(tag) = reader.read_u8() else {
            trace!("ignoring empty payload");
            self.unknown += 1;
            return Ok(());
        };

        match self.handlers.get_mut(tag as usize) {
            Some(Some(handler)) => handler(ctx, &mut reader),
            _ => {
                trace!(tag, "ignoring packet with unregistered type tag");
                self.unknown += 1;
                Ok(())
            }
        }
    }

    /// Payloads ignored so far because their tag had no handler.
    pub fn unknown_count(&self) -> u64 {
        self.unknown
    }
}
