//! Chat client
//!
//! Connects to the chat relay server, greets it, and prints every chat
//! message the server broadcasts.
//!
//! Run with: `cargo run --example chat_client`

use std::sync::Arc;
use std::time::Duration;

use packetlink::config::ClientConfig;
use packetlink::io::NetClient;
use packetlink::protocol::packet::{Packet, PacketDispatcher};
use packetlink::protocol::types::ChatMessage;
use packetlink::transport::udp::UdpConnector;
use packetlink::transport::Delivery;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ClientConfig::new("127.0.0.1", 7777).with_max_channels(2);
    let mut client = NetClient::new(config, Arc::new(UdpConnector));

    client.on_connected(|client| {
        tracing::info!("connected to server");
        let chat = ChatMessage::new(0, "Hello server from client");
        if let Err(e) = client.send(&chat, 0, Delivery::Reliable) {
            tracing::warn!(error = %e, "could not send greeting");
        }
    });
    client.on_disconnected(|_| {
        tracing::info!("disconnected from server");
    });
    client.on_packet(|_, data, _| {
        let mut dispatcher: PacketDispatcher<()> = build_dispatcher();
        if let Err(e) = dispatcher.dispatch(&mut (), data) {
            tracing::warn!(error = %e, "malformed packet");
        }
    });

    client.start();

    loop {
        // queued events only reach the handlers through update
        client.update();
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn build_dispatcher() -> PacketDispatcher<()> {
    let mut dispatcher = PacketDispatcher::new(1);
    dispatcher.register(ChatMessage::TAG, |_, reader| {
        let chat = ChatMessage::deserialize(reader)?;
        tracing::info!(sender = chat.sender, text = %chat.text, "chat");
        Ok(())
    });
    dispatcher
}
