//! Chat relay server
//!
//! Accepts clients over UDP, stamps every chat message with the sending
//! peer's id and rebroadcasts it to everyone, sender included.
//!
//! Run with: `cargo run --example chat_server`

use std::sync::Arc;
use std::time::Duration;

use packetlink::config::ServerConfig;
use packetlink::io::NetServer;
use packetlink::protocol::packet::{Packet, PacketDispatcher};
use packetlink::protocol::types::ChatMessage;
use packetlink::transport::udp::UdpListener;
use packetlink::transport::{Delivery, PeerId};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::new(7777, 100)
        .with_bind_all_interfaces(true)
        .with_max_channels(2);
    let mut server = NetServer::new(config, Arc::new(UdpListener));

    server.on_client_connected(|_, peer, addr| {
        tracing::info!(peer, %addr, "client connected");
    });
    server.on_client_disconnected(|_, peer| {
        tracing::info!(peer, "client disconnected");
    });
    server.on_packet(|server, peer, data, channel| {
        let mut dispatcher = build_dispatcher();
        let mut ctx = (server, peer, channel);
        if let Err(e) = dispatcher.dispatch(&mut ctx, data) {
            tracing::warn!(peer, error = %e, "malformed packet");
        }
    });

    server.start();

    loop {
        // queued events only reach the handlers through update
        server.update();
        std::thread::sleep(Duration::from_millis(10));
    }
}

type HandlerCtx<'a> = (&'a mut NetServer, PeerId, u8);

fn build_dispatcher<'a>() -> PacketDispatcher<HandlerCtx<'a>> {
    let mut dispatcher = PacketDispatcher::new(1);
    dispatcher.register(ChatMessage::TAG, |(server, peer, channel): &mut HandlerCtx, reader| {
        let mut chat = ChatMessage::deserialize(reader)?;
        tracing::info!(peer = *peer, text = %chat.text, "chat");

        // relay to everyone, including the sender
        chat.sender = *peer as i32;
        server.broadcast(&chat, *channel, Delivery::Reliable)?;
        Ok(())
    });
    dispatcher
}
