//! # relink
//!
//! Reliable, in-order, multiplexed message delivery over an unreliable
//! byte-oriented transport (UART, USB-CDC, TCP stream), for embedded
//! point-to-point links between a microcontroller and a host or between
//! two microcontrollers.
//!
//! The stack has three layers:
//!
//! * [`framer`] — locates, validates, and classifies frames in the raw
//!   byte stream, and builds frames for transmission.
//! * [`link`] — a Selective-Repeat ARQ data-link that turns the framed
//!   transport into a reliable, in-order stream of metadata-tagged
//!   messages, with a transmit window, retransmission on timeout or
//!   nack, and receive reordering.
//! * [`transport`] — a thin multiplexer that splits the reliable channel
//!   into up to 32 numbered ports carrying segmented messages.
//!
//! The byte-stream device underneath is abstracted by the [`Hal`] trait;
//! the host loop drives progress by interleaving
//! [`DataLink::recv_bytes`], [`DataLink::process`], and application
//! work. A single instance is single-threaded cooperative: no entry
//! point blocks, and sends fail fast when the window or buffers fill.
//!
//! ## Example
//! ```
//! use std::cell::{Cell, RefCell};
//! use relink::{Config, DataLink, Hal};
//!
//! /// A UART whose TX pin is wired straight back to its RX pin.
//! struct LoopbackUart {
//!     clock: Cell<u32>,
//!     wire: RefCell<Vec<u8>>,
//! }
//!
//! impl Hal for LoopbackUart {
//!     fn time_ms(&self) -> u32 {
//!         self.clock.get()
//!     }
//!     fn send(&self, bytes: &[u8]) {
//!         self.wire.borrow_mut().extend_from_slice(bytes);
//!     }
//!     fn send_available(&self) -> u32 {
//!         4096
//!     }
//! }
//!
//! let uart = LoopbackUart {
//!     clock: Cell::new(0),
//!     wire: RefCell::new(Vec::new()),
//! };
//! let mut link = DataLink::new("loop", &uart, Config::default()).unwrap();
//!
//! // The link opens with a reset handshake; looping its own request
//! // back completes it.
//! let bytes: Vec<u8> = uart.wire.borrow_mut().drain(..).collect();
//! link.recv_bytes(&bytes);
//!
//! link.send(0x41, &[1, 2, 3, 4]).unwrap();
//! let bytes: Vec<u8> = uart.wire.borrow_mut().drain(..).collect();
//! link.recv_bytes(&bytes);
//!
//! let msg = link.recv().expect("delivered in order");
//! assert_eq!(msg.metadata, 0x41);
//! assert_eq!(msg.payload, vec![1, 2, 3, 4]);
//! ```

use thiserror::Error;

pub mod codec;
pub mod crc;
pub mod event;
pub mod framer;
pub mod lfsr;
pub mod link;
pub mod ring;
pub mod transport;

mod interface;

pub use interface::Hal;
pub use link::{Config, ConnectionState, DataLink, LinkEvent, Msg, Stats};
pub use transport::{PortHandler, Seq, Transport, PORT_COUNT, PORT_MAX};

/// Crate-wide error taxonomy.
///
/// Only the synchronous entry points return errors; recoverable wire
/// conditions (CRC failures, duplicates, window overruns) surface as
/// counters in [`Stats`], and connection lifecycle changes surface as
/// [`LinkEvent`]s.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Port id out of range, misconfigured sizes, or malformed input.
    #[error("invalid parameter")]
    ParameterInvalid,
    /// Send buffer full or no free transmit slot.
    #[error("not enough memory")]
    NotEnoughMemory,
    /// Query for an absent port, metadata, or event.
    #[error("not found")]
    NotFound,
    /// A message exhausted its retransmission budget.
    #[error("timed out")]
    Timeout,
    /// Frame integrity check failed.
    #[error("message integrity check failed")]
    MessageIntegrity,
    /// Byte-stream synchronization was lost.
    #[error("synchronization lost")]
    Synchronization,
    /// The operation was refused because the link is down.
    #[error("aborted")]
    Aborted,
}
