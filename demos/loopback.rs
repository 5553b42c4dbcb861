//! Single-process demo: a stack whose TX pin is wired to its own RX pin.
//!
//! Run with `RUST_LOG=trace cargo run --example loopback` to watch the
//! handshake and the frame bytes go by.

use std::cell::{Cell, RefCell};
use std::time::Instant;

use log::info;
use relink::{Config, DataLink, Hal};

struct LoopbackUart {
    started: Instant,
    wire: RefCell<Vec<u8>>,
    tx_bytes: Cell<usize>,
}

impl LoopbackUart {
    fn new() -> Self {
        LoopbackUart {
            started: Instant::now(),
            wire: RefCell::new(Vec::new()),
            tx_bytes: Cell::new(0),
        }
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.wire.borrow_mut())
    }
}

impl Hal for LoopbackUart {
    fn time_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
    fn send(&self, bytes: &[u8]) {
        self.tx_bytes.set(self.tx_bytes.get() + bytes.len());
        self.wire.borrow_mut().extend_from_slice(bytes);
    }
    fn send_available(&self) -> u32 {
        4096
    }
}

fn main() {
    env_logger::init();

    let uart = LoopbackUart::new();
    let mut link = DataLink::new("loop", &uart, Config::default()).unwrap();

    // Complete the reset handshake against ourselves.
    let bytes = uart.take();
    link.recv_bytes(&bytes);
    info!("connection state: {:?}", link.connection_state());

    let payload = [0xaa, 0xaa, 0xaa, 0x00, 0x00, 0x00, 0x00, 0x01];
    info!("sending {:02x?}", payload);
    link.send(0x41, &payload).unwrap();

    let bytes = uart.take();
    info!("frame bytes: {:02x?}", bytes);
    link.recv_bytes(&bytes);

    let msg = link.recv().expect("loopback delivery");
    info!("received metadata={:#x} payload={:02x?}", msg.metadata, msg.payload);
    info!(
        "stats: {:?}, {} bytes on the wire",
        link.status(),
        uart.tx_bytes.get()
    );
}
