//! Session configuration
//!
//! Built once before a session starts and immutable afterwards. Values
//! that would break invariants are clamped when the session is
//! constructed: at least one channel, at least one client slot, and a
//! maximum packet size no larger than the scratch buffers it must fit
//! in.

/// Configuration for a [`NetClient`](crate::io::NetClient).
///
/// # Examples
///
/// ```
/// use packetlink::config::ClientConfig;
///
/// let config = ClientConfig::new("127.0.0.1", 7777)
///     .with_max_channels(2)
///     .with_max_packet_size(512);
/// assert_eq!(config.buffer_size, 4096);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote host to connect to
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Number of transport channels to open
    pub max_channels: u32,
    /// Largest payload accepted for send or delivery, in bytes
    pub max_packet_size: usize,
    /// Size of the incoming and outgoing scratch buffers, in bytes
    pub buffer_size: usize,
    /// Capacity of the incoming packet queue, in items
    pub incoming_capacity: usize,
    /// Capacity of the outgoing packet queue, in items
    pub outgoing_capacity: usize,
}

impl ClientConfig {
    /// Create a configuration with default sizing: 4 KiB buffers, 1 KiB
    /// maximum packet, 4096-item packet queues, one channel.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            max_channels: 1,
            max_packet_size: 1024,
            buffer_size: 4096,
            incoming_capacity: 4096,
            outgoing_capacity: 4096,
        }
    }

    /// Set the number of transport channels.
    pub fn with_max_channels(mut self, max_channels: u32) -> Self {
        self.max_channels = max_channels;
        self
    }

    /// Set the largest accepted payload size in bytes.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Set the scratch buffer size in bytes.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the packet queue capacities in items.
    pub fn with_queue_capacities(mut self, incoming: usize, outgoing: usize) -> Self {
        self.incoming_capacity = incoming;
        self.outgoing_capacity = outgoing;
        self
    }

    pub(crate) fn clamped(mut self) -> Self {
        if self.max_channels < 1 {
            self.max_channels = 1;
        }
        if self.max_packet_size > self.buffer_size {
            self.max_packet_size = self.buffer_size;
        }
        self
    }
}

/// Configuration for a [`NetServer`](crate::io::NetServer).
///
/// # Examples
///
/// ```
/// use packetlink::config::ServerConfig;
///
/// let config = ServerConfig::new(7777, 100)
///     .with_bind_address("0.0.0.0")
///     .with_max_channels(2);
/// assert!(!config.bind_all_interfaces);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Address to bind; ignored when `bind_all_interfaces` is set
    pub bind_address: String,
    /// Bind the wildcard address instead of `bind_address`
    pub bind_all_interfaces: bool,
    /// Maximum number of simultaneously connected peers
    pub max_clients: u16,
    /// Number of transport channels to open
    pub max_channels: u32,
    /// Largest payload accepted for send or delivery, in bytes
    pub max_packet_size: usize,
    /// Size of the incoming and outgoing scratch buffers, in bytes
    pub buffer_size: usize,
    /// Capacity of the incoming packet queue, in items
    pub incoming_capacity: usize,
    /// Capacity of the outgoing packet queue, in items
    pub outgoing_capacity: usize,
}

impl ServerConfig {
    /// Create a configuration with the same default sizing as
    /// [`ClientConfig::new`], binding `127.0.0.1`.
    pub fn new(port: u16, max_clients: u16) -> Self {
        ServerConfig {
            port,
            bind_address: "127.0.0.1".to_string(),
            bind_all_interfaces: false,
            max_clients,
            max_channels: 1,
            max_packet_size: 1024,
            buffer_size: 4096,
            incoming_capacity: 4096,
            outgoing_capacity: 4096,
        }
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Bind every interface instead of a specific address.
    pub fn with_bind_all_interfaces(mut self, bind_all: bool) -> Self {
        self.bind_all_interfaces = bind_all;
        self
    }

    /// Set the number of transport channels.
    pub fn with_max_channels(mut self, max_channels: u32) -> Self {
        self.max_channels = max_channels;
        self
    }

    /// Set the largest accepted payload size in bytes.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Set the scratch buffer size in bytes.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the packet queue capacities in items.
    pub fn with_queue_capacities(mut self, incoming: usize, outgoing: usize) -> Self {
        self.incoming_capacity = incoming;
        self.outgoing_capacity = outgoing;
        self
    }

    /// Address string the server should bind, honoring
    /// `bind_all_interfaces`.
    pub fn effective_bind_address(&self) -> &str {
        if self.bind_all_interfaces {
            "::"
        } else {
            &self.bind_address
        }
    }

    pub(crate) fn clamped(mut self) -> Self {
        if self.max_channels < 1 {
            self.max_channels = 1;
        }
        if self.max_packet_size > self.buffer_size {
            self.max_packet_size = self.buffer_size;
        }
        if self.max_clients < 1 {
            self.max_clients = 1;
        }
        self
    }
}
