//! Two stacks in separate threads joined by an emulated serial cable.
//!
//! Each thread owns one end: it drains its receive channel into the
//! stack, services the protocol, and stops once it has both delivered
//! its greeting and heard the peer's. Run with
//! `RUST_LOG=debug cargo run --example pair`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::info;
use relink::{Config, ConnectionState, Hal, LinkEvent, PortHandler, Seq, Transport};

const GREETING_PORT: u8 = 1;

struct Uart {
    started: Instant,
    tx: Sender<Vec<u8>>,
    rx: RefCell<Receiver<Vec<u8>>>,
}

impl Uart {
    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Uart {
            started: Instant::now(),
            tx,
            rx: RefCell::new(rx),
        }
    }

    fn drain(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for chunk in self.rx.borrow_mut().try_iter() {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }
}

impl Hal for Uart {
    fn time_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
    fn send(&self, bytes: &[u8]) {
        // A dropped peer just ends the demo.
        let _ = self.tx.send(bytes.to_vec());
    }
    fn send_available(&self) -> u32 {
        4096
    }
}

struct Greeter {
    name: &'static str,
    heard: Rc<Cell<bool>>,
}

impl PortHandler for Greeter {
    fn on_event(&mut self, event: LinkEvent) {
        info!(target: self.name, "port event: {:?}", event);
    }
    fn on_recv(&mut self, _port_id: u8, _seq: Seq, port_data: u16, payload: &[u8]) {
        info!(
            target: self.name,
            "peer says {:?} (port_data={:#06x})",
            String::from_utf8_lossy(payload),
            port_data
        );
        self.heard.set(true);
    }
}

fn run_end(name: &'static str, tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>, greeting: &'static str) {
    let uart = Uart::new(tx, rx);
    let mut transport = Transport::new(name, &uart, Config::default()).unwrap();
    let heard = Rc::new(Cell::new(false));
    transport
        .port_register(
            GREETING_PORT,
            Some("demo/greeting"),
            Box::new(Greeter { name, heard: Rc::clone(&heard) }),
        )
        .unwrap();

    let mut sent = false;
    loop {
        let bytes = uart.drain();
        if !bytes.is_empty() {
            transport.recv_bytes(&bytes);
        }
        transport.poll();
        if !sent && transport.connection_state() == ConnectionState::Connected {
            transport
                .send(GREETING_PORT, Seq::Single, 0x2211, greeting.as_bytes())
                .unwrap();
            sent = true;
        }
        if sent && heard.get() && transport.service_interval_ms() > 0 {
            info!(target: name, "done: {:?}", transport.status());
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn main() {
    env_logger::init();

    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();

    let a = thread::Builder::new()
        .name("end-a".into())
        .spawn(move || run_end("end-a", tx_a, rx_a, "hello from a"))
        .unwrap();
    let b = thread::Builder::new()
        .name("end-b".into())
        .spawn(move || run_end("end-b", tx_b, rx_b, "hello from b"))
        .unwrap();

    a.join().unwrap();
    b.join().unwrap();
}
