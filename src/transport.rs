//! Transport layer: port multiplexing over the data-link.
//!
//! Splits the single reliable channel into up to 32 numbered ports.
//! Each message carries the port id, a 2-bit segmentation marker, and
//! 16 bits of opaque port data packed into the link's 24-bit metadata.
//! The transport neither buffers nor reassembles segments; the markers
//! travel end to end for the layer above to interpret.

use log::{debug, trace, warn};

use crate::interface::Hal;
use crate::link::{Config, ConnectionState, DataLink, LinkEvent, Stats};
use crate::Error;

/// Number of ports per instance.
pub const PORT_COUNT: usize = 32;
/// Largest valid port id. Port 0 is reserved for management traffic.
pub const PORT_MAX: u8 = 0x1f;

/// Segmentation marker carried with every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seq {
    Middle = 0,
    Stop = 1,
    Start = 2,
    Single = 3,
}

impl Seq {
    fn from_bits(bits: u8) -> Seq {
        match bits & 0x03 {
            0 => Seq::Middle,
            1 => Seq::Stop,
            2 => Seq::Start,
            _ => Seq::Single,
        }
    }
}

/// Pack `(port_data, seq, port_id)` into 24-bit link metadata.
pub fn encode_metadata(port_id: u8, seq: Seq, port_data: u16) -> u32 {
    ((port_data as u32) << 8) | ((seq as u32) << 6) | (port_id & PORT_MAX) as u32
}

/// Inverse of [`encode_metadata`].
pub fn decode_metadata(metadata: u32) -> (u8, Seq, u16) {
    let port_id = (metadata & PORT_MAX as u32) as u8;
    let seq = Seq::from_bits((metadata >> 6) as u8);
    let port_data = (metadata >> 8) as u16;
    (port_id, seq, port_data)
}

/// A bound port. The handler object owns whatever state it needs.
pub trait PortHandler {
    /// Connection lifecycle and delivery-failure notifications, fanned
    /// out to every registered port.
    fn on_event(&mut self, event: LinkEvent);

    /// One in-order message for this port.
    fn on_recv(&mut self, port_id: u8, seq: Seq, port_data: u16, payload: &[u8]);
}

struct PortEntry<'p> {
    meta: Option<String>,
    handler: Option<Box<dyn PortHandler + 'p>>,
}

/// Port multiplexer owning its data-link.
pub struct Transport<'a, H: Hal> {
    link: DataLink<'a, H>,
    ports: Vec<PortEntry<'a>>,
    last_event: Option<LinkEvent>,
    unhandled_message_count: u32,
}

impl<'a, H: Hal> Transport<'a, H> {
    pub fn new(name: &str, hal: &'a H, config: Config) -> Result<Self, Error> {
        let link = DataLink::new(name, hal, config)?;
        Ok(Transport {
            link,
            ports: (0..PORT_COUNT)
                .map(|_| PortEntry {
                    meta: None,
                    handler: None,
                })
                .collect(),
            last_event: None,
            unhandled_message_count: 0,
        })
    }

    /// Bind `handler` to `port_id`, replacing any previous handler.
    ///
    /// The port's metadata string is set on first registration and
    /// immutable afterwards. The most recent connection event is
    /// delivered to the new handler at once, so a late binder observes
    /// the current link state.
    pub fn port_register(
        &mut self,
        port_id: u8,
        meta: Option<&str>,
        mut handler: Box<dyn PortHandler + 'a>,
    ) -> Result<(), Error> {
        if port_id > PORT_MAX {
            return Err(Error::ParameterInvalid);
        }
        if let Some(event) = self.last_event {
            handler.on_event(event);
        }
        let entry = &mut self.ports[port_id as usize];
        if entry.meta.is_none() {
            entry.meta = meta.map(|m| m.to_string());
        }
        entry.handler = Some(handler);
        debug!(target: self.link.name(), "port {} registered", port_id);
        Ok(())
    }

    /// Metadata string registered for `port_id`.
    pub fn port_meta(&self, port_id: u8) -> Result<&str, Error> {
        if port_id > PORT_MAX {
            return Err(Error::ParameterInvalid);
        }
        self.ports[port_id as usize]
            .meta
            .as_deref()
            .ok_or(Error::NotFound)
    }

    /// Queue one message on `port_id` for reliable delivery.
    pub fn send(&mut self, port_id: u8, seq: Seq, port_data: u16, msg: &[u8]) -> Result<(), Error> {
        if port_id > PORT_MAX {
            return Err(Error::ParameterInvalid);
        }
        trace!(
            target: self.link.name(),
            "tx port={} seq={:?} len={}", port_id, seq, msg.len()
        );
        self.link.send(encode_metadata(port_id, seq, port_data), msg)
    }

    /// Feed received octets and dispatch whatever completes.
    pub fn recv_bytes(&mut self, bytes: &[u8]) {
        self.link.recv_bytes(bytes);
        self.dispatch();
    }

    /// Service call: drives the link, then dispatches pending events
    /// and messages to the registered ports.
    pub fn poll(&mut self) {
        self.link.process();
        self.dispatch();
    }

    /// Reinitialize the underlying link.
    pub fn reset(&mut self) {
        self.link.reset();
        self.dispatch();
    }

    pub fn service_interval_ms(&self) -> u32 {
        self.link.service_interval_ms()
    }

    pub fn status(&self) -> Stats {
        self.link.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.connection_state()
    }

    /// Messages that arrived for ports with no registered handler.
    pub fn unhandled_message_count(&self) -> u32 {
        self.unhandled_message_count
    }

    fn dispatch(&mut self) {
        while let Some(event) = self.link.next_event() {
            match event {
                LinkEvent::ConnectionEstablished | LinkEvent::ConnectionLost => {
                    self.last_event = Some(event);
                }
                LinkEvent::MessageTimeout { .. } => {}
            }
            for entry in &mut self.ports {
                if let Some(handler) = entry.handler.as_mut() {
                    handler.on_event(event);
                }
            }
        }
        while let Some(msg) = self.link.recv() {
            let (port_id, seq, port_data) = decode_metadata(msg.metadata);
            match self.ports[port_id as usize].handler.as_mut() {
                Some(handler) => handler.on_recv(port_id, seq, port_data, &msg.payload),
                None => {
                    self.unhandled_message_count = self.unhandled_message_count.wrapping_add(1);
                    warn!(
                        target: self.link.name(),
                        "dropping message for unbound port {}", port_id
                    );
                }
            }
        }
    }
}
