//! Client session
//!
//! One connection to one remote server. The application thread calls
//! [`NetClient::send`] and [`NetClient::update`]; a dedicated network
//! thread owns the transport and moves events across the bounded
//! queues.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::io::{restore_listeners, IncomingPacket, EVENT_QUEUE_CAPACITY, SERVICE_TIMEOUT};
use crate::protocol::codec::PacketWriter;
use crate::protocol::crc;
use crate::protocol::packet::Packet;
use crate::queue::EventQueue;
use crate::stats::{SessionStats, StatsSnapshot};
use crate::transport::{ClientConnector, ClientTransport, Delivery, TransportEvent};

type ConnectionFn = Box<dyn FnMut(&mut NetClient)>;
type PacketFn = Box<dyn FnMut(&mut NetClient, &[u8], u8)>;

struct OutgoingPacket {
    channel: u8,
    delivery: Delivery,
    payload: Bytes,
}

struct ClientQueues {
    connections: EventQueue<()>,
    disconnections: EventQueue<()>,
    incoming: EventQueue<IncomingPacket>,
    outgoing: EventQueue<OutgoingPacket>,
}

impl ClientQueues {
    fn drain_all(&self) {
        self.connections.drain();
        self.disconnections.drain();
        self.incoming.drain();
        self.outgoing.drain();
    }
}

/// Client endpoint session.
///
/// # Threading
///
/// `send*`, `update`, `start` and `stop` take `&mut self`: drive the
/// session from one consistent thread. `update` must not be called
/// from inside one of its own listeners.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use packetlink::config::ClientConfig;
/// use packetlink::io::NetClient;
/// use packetlink::transport::udp::UdpConnector;
/// use packetlink::transport::Delivery;
///
/// let mut client = NetClient::new(
///     ClientConfig::new("127.0.0.1", 7777).with_max_channels(2),
///     Arc::new(UdpConnector),
/// );
/// client.on_connected(|client| {
///     client.send_bytes(b"hello", 0, Delivery::Reliable);
/// });
/// client.start();
/// loop {
///     client.update();
///     std::thread::sleep(std::time::Duration::from_millis(10));
/// }
/// ```
pub struct NetClient {
    config: ClientConfig,
    connector: Arc<dyn ClientConnector>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    queues: Arc<ClientQueues>,
    stats: Arc<SessionStats>,
    incoming_buffer: Vec<u8>,
    outgoing_buffer: Vec<u8>,
    on_connected: Vec<ConnectionFn>,
    on_disconnected: Vec<ConnectionFn>,
    on_packet: Vec<PacketFn>,
}

impl NetClient {
    /// Create a stopped client session. Out-of-range configuration
    /// values are clamped here.
    pub fn new(config: ClientConfig, connector: Arc<dyn ClientConnector>) -> Self {
        let config = config.clamped();
        let queues = ClientQueues {
            connections: EventQueue::new(EVENT_QUEUE_CAPACITY),
            disconnections: EventQueue::new(EVENT_QUEUE_CAPACITY),
            incoming: EventQueue::new(config.incoming_capacity),
            outgoing: EventQueue::new(config.outgoing_capacity),
        };
        NetClient {
            incoming_buffer: vec![0u8; config.buffer_size],
            outgoing_buffer: vec![0u8; config.buffer_size],
            config,
            connector,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            queues: Arc::new(queues),
            stats: Arc::new(SessionStats::default()),
            on_connected: Vec::new(),
            on_disconnected: Vec::new(),
            on_packet: Vec::new(),
        }
    }

    /// Whether the network thread is running.
    ///
    /// Goes false asynchronously when the transport could not be
    /// opened; a failed `start` is observed here, not as an error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Session drop and rejection counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a listener invoked by `update` after the connection is
    /// established. Listeners run in registration order.
    pub fn on_connected(&mut self, listener: impl FnMut(&mut NetClient) + 'static) {
        self.on_connected.push(Box::new(listener));
    }

    /// Register a listener invoked by `update` after a disconnect or
    /// timeout.
    pub fn on_disconnected(&mut self, listener: impl FnMut(&mut NetClient) + 'static) {
        self.on_disconnected.push(Box::new(listener));
    }

    /// Register a listener invoked by `update` for every received
    /// payload, with the payload bytes and the channel it arrived on.
    ///
    /// The slice borrows the session's reusable incoming buffer; copy
    /// out anything that must outlive the callback.
    pub fn on_packet(&mut self, listener: impl FnMut(&mut NetClient, &[u8], u8) + 'static) {
        self.on_packet.push(Box::new(listener));
    }

    /// Spawn the network thread. No-op while already running.
    ///
    /// All four queues are drained first so a restarted session never
    /// sees stale entries from a previous run.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        // reap a thread that already exited after a startup failure
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }

        self.queues.drain_all();
        self.running.store(true, Ordering::Release);
        info!(host = %self.config.host, port = self.config.port, "starting client");

        let config = self.config.clone();
        let connector = Arc::clone(&self.connector);
        let running = Arc::clone(&self.running);
        let queues = Arc::clone(&self.queues);
        let stats = Arc::clone(&self.stats);

        let spawned = std::thread::Builder::new()
            .name("packetlink-client".into())
            .spawn(move || network_loop(config, connector, running, queues, stats));
        match spawned {
            Ok(handle) => self.thread = Some(handle),
            Err(e) => {
                error!(error = %e, "could not spawn client network thread");
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Clear the running flag and block until the network thread has
    /// exited. No-op while already stopped.
    pub fn stop(&mut self) {
        if !self.is_running() {
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            return;
        }
        info!("stopping client");
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Queue raw bytes for sending. Fire-and-forget: a full outgoing
    /// queue or an oversized payload drops the send and bumps a
    /// counter; delivery is the transport's business.
    pub fn send_bytes(&mut self, data: &[u8], channel: u8, delivery: Delivery) {
        self.enqueue_outgoing(Bytes::copy_from_slice(data), channel, delivery);
    }

    /// Serialize a packet into the outgoing scratch buffer and queue
    /// the encoded bytes for sending.
    pub fn send<P: Packet>(&mut self, packet: &P, channel: u8, delivery: Delivery) -> Result<()> {
        self.outgoing_buffer.fill(0);
        let mut writer = PacketWriter::new(&mut self.outgoing_buffer);
        let length = packet.serialize(&mut writer)?;
        let payload = Bytes::copy_from_slice(&self.outgoing_buffer[..length]);
        self.enqueue_outgoing(payload, channel, delivery);
        Ok(())
    }

    fn enqueue_outgoing(&self, payload: Bytes, channel: u8, delivery: Delivery) {
        let packet = OutgoingPacket {
            channel,
            delivery,
            payload,
        };
        if self.queues.outgoing.push(packet).is_err() {
            SessionStats::count(&self.stats.queue_rejections);
            warn!(
                capacity = self.queues.outgoing.capacity(),
                "outgoing queue full, dropping send"
            );
        }
    }

    /// Drain queued events and invoke listeners synchronously, on the
    /// calling thread: connections first, then disconnections, then
    /// received packets in arrival order.
    ///
    /// Call this regularly from one consistent thread. Received
    /// payloads larger than `max_packet_size` are released without a
    /// callback.
    pub fn update(&mut self) {
        while self.queues.connections.try_pop().is_some() {
            let mut listeners = mem::take(&mut self.on_connected);
            for listener in listeners.iter_mut() {
                listener(self);
            }
            restore_listeners(&mut self.on_connected, listeners);
        }

        while self.queues.disconnections.try_pop().is_some() {
            let mut listeners = mem::take(&mut self.on_disconnected);
            for listener in listeners.iter_mut() {
                listener(self);
            }
            restore_listeners(&mut self.on_disconnected, listeners);
        }

        while let Some(packet) = self.queues.incoming.try_pop() {
            let length = packet.payload.len();
            if length > self.config.max_packet_size {
                SessionStats::count(&self.stats.oversized_incoming);
                trace!(length, "releasing oversized incoming packet");
                continue;
            }

            let mut buffer = mem::take(&mut self.incoming_buffer);
            buffer.fill(0);
            buffer[..length].copy_from_slice(&packet.payload);
            let channel = packet.channel;
            drop(packet);

            let mut listeners = mem::take(&mut self.on_packet);
            for listener in listeners.iter_mut() {
                listener(self, &buffer[..length], channel);
            }
            restore_listeners(&mut self.on_packet, listeners);
            self.incoming_buffer = buffer;
        }
    }

    #[cfg(test)]
    fn queued_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.queues.connections.len(),
            self.queues.disconnections.len(),
            self.queues.incoming.len(),
            self.queues.outgoing.len(),
        )
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn network_loop(
    config: ClientConfig,
    connector: Arc<dyn ClientConnector>,
    running: Arc<AtomicBool>,
    queues: Arc<ClientQueues>,
    stats: Arc<SessionStats>,
) {
    let mut transport = match connector.connect(&config) {
        Ok(transport) => transport,
        Err(e) => {
            error!(host = %config.host, port = config.port, error = %e, "could not open client transport");
            running.store(false, Ordering::Release);
            return;
        }
    };
    transport.set_checksum(Some(crc::checksum));
    info!(host = %config.host, port = config.port, "client connecting");

    while running.load(Ordering::Acquire) {
        flush_outgoing(transport.as_mut(), &config, &queues, &stats);

        let mut polled = false;
        while !polled {
            let event = match transport.check_event() {
                Some(event) => event,
                None => match transport.service(SERVICE_TIMEOUT) {
                    Ok(Some(event)) => {
                        polled = true;
                        event
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "transport service failed");
                        std::thread::sleep(SERVICE_TIMEOUT);
                        break;
                    }
                },
            };
            translate(event, &queues, &stats);
        }
    }

    transport.flush();
    transport.disconnect();
    info!("client stopped");
}

fn flush_outgoing(
    transport: &mut dyn ClientTransport,
    config: &ClientConfig,
    queues: &ClientQueues,
    stats: &SessionStats,
) {
    while let Some(packet) = queues.outgoing.try_pop() {
        if packet.payload.len() > config.max_packet_size {
            SessionStats::count(&stats.oversized_outgoing);
            trace!(
                length = packet.payload.len(),
                max = config.max_packet_size,
                "releasing oversized outgoing packet"
            );
            continue;
        }
        if let Err(e) = transport.send(packet.channel, &packet.payload, packet.delivery) {
            debug!(error = %e, "transport send failed");
        }
    }
}

fn translate(event: TransportEvent, queues: &ClientQueues, stats: &SessionStats) {
    match event {
        TransportEvent::Connect { .. } => {
            if queues.connections.push(()).is_err() {
                SessionStats::count(&stats.queue_rejections);
                warn!("connection queue full, dropping event");
            }
        }
        TransportEvent::Disconnect { .. } | TransportEvent::Timeout { .. } => {
            if queues.disconnections.push(()).is_err() {
                SessionStats::count(&stats.queue_rejections);
                warn!("disconnection queue full, dropping event");
            }
        }
        TransportEvent::Receive {
            peer,
            channel,
            payload,
        } => {
            let packet = IncomingPacket {
                peer,
                channel,
                payload,
            };
            if queues.incoming.push(packet).is_err() {
                SessionStats::count(&stats.queue_rejections);
                warn!("incoming queue full, releasing packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::rc::Rc;
    use std::cell::RefCell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct ScriptedTransport {
        events: VecDeque<TransportEvent>,
        sent: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
    }

    impl ClientTransport for ScriptedTransport {
        fn check_event(&mut self) -> Option<TransportEvent> {
            self.events.pop_front()
        }

        fn service(&mut self, timeout: Duration) -> crate::error::Result<Option<TransportEvent>> {
            std::thread::sleep(timeout);
            Ok(self.events.pop_front())
        }

        fn send(
            &mut self,
            channel: u8,
            payload: &[u8],
            _delivery: Delivery,
        ) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push((channel, payload.to_vec()));
            Ok(())
        }

        fn set_checksum(&mut self, _checksum: Option<crate::transport::ChecksumFn>) {}
        fn flush(&mut self) {}
        fn disconnect(&mut self) {}
    }

    struct ScriptedConnector {
        events: Mutex<Vec<TransportEvent>>,
        sent: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(events: Vec<TransportEvent>) -> Arc<Self> {
            Arc::new(ScriptedConnector {
                events: Mutex::new(events),
                sent: Arc::new(Mutex::new(Vec::new())),
                connects: AtomicUsize::new(0),
            })
        }
    }

    impl ClientConnector for ScriptedConnector {
        fn connect(&self, _config: &ClientConfig) -> crate::error::Result<Box<dyn ClientTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedTransport {
                events: self.events.lock().unwrap().drain(..).collect(),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    struct FailingConnector;

    impl ClientConnector for FailingConnector {
        fn connect(&self, _config: &ClientConfig) -> crate::error::Result<Box<dyn ClientTransport>> {
            Err(LinkError::ConnectionRefused("scripted failure".into()))
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached within 3s");
    }

    fn receive(peer: u32, channel: u8, payload: &[u8]) -> TransportEvent {
        TransportEvent::Receive {
            peer,
            channel,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn connect_event() -> TransportEvent {
        TransportEvent::Connect {
            peer: 0,
            addr: "127.0.0.1:7777".parse::<SocketAddr>().unwrap(),
        }
    }

    #[test]
    fn test_startup_failure_clears_running() {
        let mut client =
            NetClient::new(ClientConfig::new("127.0.0.1", 7777), Arc::new(FailingConnector));
        client.start();
        wait_for(|| !client.is_running());
        // a second attempt is allowed and fails the same way
        client.start();
        wait_for(|| !client.is_running());
    }

    #[test]
    fn test_start_twice_opens_one_transport() {
        let connector = ScriptedConnector::new(vec![connect_event()]);
        let mut client =
            NetClient::new(ClientConfig::new("127.0.0.1", 7777), connector.clone());

        client.start();
        assert!(client.is_running());
        client.start();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        client.stop();
        assert!(!client.is_running());
        // second stop is a no-op
        client.stop();
    }

    #[test]
    fn test_update_dispatch_order() {
        // three packets, one connect and one disconnect already queued:
        // listeners must fire connect, disconnect, then packets in
        // arrival order
        let connector = ScriptedConnector::new(vec![
            receive(0, 0, &[1]),
            receive(0, 0, &[2]),
            receive(0, 0, &[3]),
            connect_event(),
            TransportEvent::Disconnect { peer: 0 },
        ]);
        let mut client =
            NetClient::new(ClientConfig::new("127.0.0.1", 7777), connector);

        let log = Rc::new(RefCell::new(Vec::new()));
        let connected_log = Rc::clone(&log);
        client.on_connected(move |_| connected_log.borrow_mut().push("connected".to_string()));
        let disconnected_log = Rc::clone(&log);
        client
            .on_disconnected(move |_| disconnected_log.borrow_mut().push("disconnected".to_string()));
        let packet_log = Rc::clone(&log);
        client.on_packet(move |_, data, _| packet_log.borrow_mut().push(format!("packet {}", data[0])));

        client.start();
        wait_for(|| client.queued_counts() == (1, 1, 3, 0));
        client.update();

        assert_eq!(
            log.borrow().as_slice(),
            [
                "connected",
                "disconnected",
                "packet 1",
                "packet 2",
                "packet 3"
            ]
        );
        client.stop();
    }

    #[test]
    fn test_oversized_outgoing_dropped_at_flush() {
        let connector = ScriptedConnector::new(vec![connect_event()]);
        let sent = Arc::clone(&connector.sent);
        let mut client = NetClient::new(
            ClientConfig::new("127.0.0.1", 7777).with_max_packet_size(8),
            connector,
        );

        client.start();
        wait_for(|| client.queued_counts().0 == 1);

        // accepted into the queue, dropped when the network thread flushes
        client.send_bytes(&[0u8; 64], 0, Delivery::Reliable);
        wait_for(|| client.stats().oversized_outgoing == 1);
        assert_eq!(client.queued_counts().3, 0);
        assert!(sent.lock().unwrap().is_empty());
        client.stop();
    }

    #[test]
    fn test_oversized_incoming_released_without_callback() {
        let connector = ScriptedConnector::new(vec![
            connect_event(),
            receive(0, 0, &[0u8; 64]),
            receive(0, 0, &[7]),
        ]);
        let mut client = NetClient::new(
            ClientConfig::new("127.0.0.1", 7777).with_max_packet_size(8),
            connector,
        );

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_cb = Rc::clone(&seen);
        client.on_packet(move |_, data, _| seen_in_cb.borrow_mut().push(data.to_vec()));

        client.start();
        wait_for(|| client.queued_counts().2 == 2);
        client.update();

        assert_eq!(seen.borrow().as_slice(), [vec![7u8]]);
        assert_eq!(client.stats().oversized_incoming, 1);
        client.stop();
    }

    #[test]
    fn test_send_from_within_callback() {
        let connector = ScriptedConnector::new(vec![connect_event()]);
        let sent = Arc::clone(&connector.sent);
        let mut client =
            NetClient::new(ClientConfig::new("127.0.0.1", 7777), connector);

        client.on_connected(|client| {
            client.send_bytes(b"greetings", 1, Delivery::Reliable);
        });

        client.start();
        wait_for(|| client.queued_counts().0 == 1);
        client.update();
        wait_for(|| !sent.lock().unwrap().is_empty());
        assert_eq!(sent.lock().unwrap()[0], (1, b"greetings".to_vec()));
        client.stop();
    }

    #[test]
    fn test_listener_registered_in_callback_keeps_order() {
        let connector = ScriptedConnector::new(vec![connect_event(), connect_event()]);
        let mut client =
            NetClient::new(ClientConfig::new("127.0.0.1", 7777), connector);

        let log = Rc::new(RefCell::new(Vec::new()));
        let outer_log = Rc::clone(&log);
        let registered = Rc::new(RefCell::new(false));
        let registered_flag = Rc::clone(&registered);
        client.on_connected(move |client| {
            outer_log.borrow_mut().push("first");
            if !*registered_flag.borrow() {
                *registered_flag.borrow_mut() = true;
                let inner_log = Rc::clone(&outer_log);
                client.on_connected(move |_| inner_log.borrow_mut().push("second"));
            }
        });

        client.start();
        wait_for(|| client.queued_counts().0 == 2);
        client.update();

        // first connect fires only the pre-registered listener; the
        // second fires both, in registration order
        assert_eq!(log.borrow().as_slice(), ["first", "first", "second"]);
        client.stop();
    }
}
