//! Data-link layer: Selective-Repeat ARQ over the frame layer.
//!
//! Turns the lossy framed byte stream into reliable, in-order delivery
//! of metadata-tagged messages. The transmit side holds up to
//! `tx_window_size` frames in flight, each in a slot indexed by
//! `frame_id % window`; a per-frame timer drives retransmission until
//! the frame is acknowledged or its retry budget is exhausted. The
//! receive side buffers out-of-order frames in a mirror window and
//! releases the contiguous prefix upward.
//!
//! All slot, ring, and queue storage is allocated by [`DataLink::new`];
//! the steady state performs no allocation beyond the payload copies
//! handed to the application.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::event::EventManager;
use crate::framer::{
    self, AckKind, FrameHandler, Framer, LinkFrameType, NackCause, FRAME_MAX, METADATA_MAX,
    PAYLOAD_MAX,
};
use crate::interface::Hal;
use crate::ring::RingBuffer;
use crate::Error;

pub use crate::framer::FRAME_ID_MAX;

/// Largest legal window: half the frame-id range minus the ambiguity slot.
pub const WINDOW_MAX: u16 = 1023;

/// Reset handshake discriminators carried in the link frame id field.
const RESET_REQUEST: u16 = 0;
const RESET_ACK: u16 = 1;

/// Data-link tunables. All buffers are sized from these at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Frames simultaneously in flight, 1..=1023.
    pub tx_window_size: u16,
    /// Out-of-order frames buffered at the receiver, 1..=1023.
    pub rx_window_size: u16,
    /// Octets of transmit staging, must exceed one maximum frame.
    pub tx_buffer_size: usize,
    /// Delay before an unacknowledged frame is retransmitted.
    pub retry_timeout_ms: u32,
    /// Transmissions per frame before the message is failed.
    pub max_retries: u8,
    /// Delay before an unanswered reset request is repeated.
    pub reset_timeout_ms: u32,
    /// Reset attempts (and consecutive message failures) tolerated
    /// before the connection is declared lost.
    pub max_reset_retries: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tx_window_size: 16,
            rx_window_size: 16,
            tx_buffer_size: 4096,
            retry_timeout_ms: 250,
            max_retries: 8,
            reset_timeout_ms: 1000,
            max_reset_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Negotiating,
    Connected,
}

/// Events surfaced to the layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionEstablished,
    ConnectionLost,
    /// A message exhausted its retry budget or was dropped by a reset.
    MessageTimeout { metadata: u32 },
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub metadata: u32,
    pub payload: Vec<u8>,
}

/// Cumulative counters, including the framer's receive-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub tx_count: u32,
    pub tx_retransmit_count: u32,
    pub tx_timeout_count: u32,
    pub rx_count: u32,
    pub rx_synchronization_errors: u32,
    pub rx_mic_errors: u32,
    pub rx_frame_id_errors: u32,
    pub rx_deduplicate_count: u32,
    pub spurious_acks: u32,
    pub resets_received: u32,
    pub reset_count: u32,
}

/// Signed distance from `from` to `to` modulo 2048, in [-1024, 1023].
fn frame_id_delta(from: u16, to: u16) -> i16 {
    let d = to.wrapping_sub(from) & (FRAME_ID_MAX - 1);
    if d > WINDOW_MAX {
        d as i16 - FRAME_ID_MAX as i16
    } else {
        d as i16
    }
}

fn frame_id_inc(id: u16) -> u16 {
    id.wrapping_add(1) & (FRAME_ID_MAX - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxSlotState {
    Free,
    Queued,
    Sent,
    Acked,
}

struct TxSlot {
    state: TxSlotState,
    frame_id: u16,
    send_count: u8,
    last_send_time_ms: u32,
    metadata: u32,
    /// Built wire bytes; retransmissions replay them unchanged.
    bytes: Vec<u8>,
    timer_id: u32,
    /// A nack-driven retransmission is outstanding; further nacks for
    /// this frame are ignored until the timer path takes over.
    nacked: bool,
}

impl TxSlot {
    fn new() -> Self {
        TxSlot {
            state: TxSlotState::Free,
            frame_id: 0,
            send_count: 0,
            last_send_time_ms: 0,
            metadata: 0,
            bytes: Vec::with_capacity(FRAME_MAX),
            timer_id: 0,
            nacked: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxSlotState {
    Empty,
    Received,
}

struct RxSlot {
    state: RxSlotState,
    frame_id: u16,
    metadata: u32,
    payload: Vec<u8>,
}

impl RxSlot {
    fn new() -> Self {
        RxSlot {
            state: RxSlotState::Empty,
            frame_id: 0,
            metadata: 0,
            payload: Vec::with_capacity(PAYLOAD_MAX),
        }
    }
}

enum LinkTimer {
    Retransmit(u16),
    Reset,
}

#[derive(Debug, Clone, Copy, Default)]
struct LinkCounters {
    tx_count: u32,
    tx_retransmit_count: u32,
    tx_timeout_count: u32,
    rx_frame_id_errors: u32,
    rx_deduplicate_count: u32,
    spurious_acks: u32,
    resets_received: u32,
    reset_count: u32,
}

/// Everything except the framer, split out so the framer can call back
/// into the protocol engine while both are borrowed from [`DataLink`].
struct LinkCore<'a, H: Hal> {
    name: String,
    hal: &'a H,
    config: Config,
    state: ConnectionState,
    tx_slots: Vec<TxSlot>,
    rx_slots: Vec<RxSlot>,
    tx_ring: RingBuffer,
    scratch: Vec<u8>,
    events: EventManager<LinkTimer>,
    tx_frame_id_next: u16,
    tx_frame_id_min: u16,
    rx_frame_id_next: u16,
    queued_count: u16,
    reset_timer_id: u32,
    reset_retry_count: u8,
    consecutive_send_failures: u8,
    /// A framing-error nack is outstanding; repeats are suppressed until
    /// a valid frame arrives.
    nacked_framing_error: bool,
    rx_queue: VecDeque<Msg>,
    event_queue: VecDeque<LinkEvent>,
    counters: LinkCounters,
}

/// The data-link protocol instance.
pub struct DataLink<'a, H: Hal> {
    framer: Framer,
    core: LinkCore<'a, H>,
}

impl<'a, H: Hal> DataLink<'a, H> {
    /// Validate `config`, allocate every buffer, and start the reset
    /// handshake. The link reports [`LinkEvent::ConnectionEstablished`]
    /// once the peer answers.
    pub fn new(name: &str, hal: &'a H, config: Config) -> Result<Self, Error> {
        if config.tx_window_size == 0
            || config.tx_window_size > WINDOW_MAX
            || config.rx_window_size == 0
            || config.rx_window_size > WINDOW_MAX
            || config.retry_timeout_ms == 0
            || config.tx_buffer_size <= FRAME_MAX
        {
            return Err(Error::ParameterInvalid);
        }
        let mut core = LinkCore {
            name: name.to_string(),
            hal,
            config,
            state: ConnectionState::Disconnected,
            tx_slots: (0..config.tx_window_size).map(|_| TxSlot::new()).collect(),
            rx_slots: (0..config.rx_window_size).map(|_| RxSlot::new()).collect(),
            tx_ring: RingBuffer::new(config.tx_buffer_size),
            scratch: vec![0; FRAME_MAX],
            events: EventManager::new(),
            tx_frame_id_next: 0,
            tx_frame_id_min: 0,
            rx_frame_id_next: 0,
            queued_count: 0,
            reset_timer_id: 0,
            reset_retry_count: 0,
            consecutive_send_failures: 0,
            nacked_framing_error: false,
            rx_queue: VecDeque::with_capacity(config.rx_window_size as usize + 4),
            event_queue: VecDeque::with_capacity(8),
            counters: LinkCounters::default(),
        };
        core.start_negotiation(false);
        Ok(DataLink {
            framer: Framer::new(name),
            core,
        })
    }

    /// Queue one message for reliable delivery.
    ///
    /// Fails fast: [`Error::NotEnoughMemory`] when the window is full,
    /// [`Error::Aborted`] when the connection is down.
    pub fn send(&mut self, metadata: u32, msg: &[u8]) -> Result<(), Error> {
        self.core.send(metadata, msg)
    }

    /// Feed received octets into the stack.
    pub fn recv_bytes(&mut self, bytes: &[u8]) {
        self.framer.recv(bytes, &mut self.core);
        self.core.service_tx();
    }

    pub fn recv_byte(&mut self, byte: u8) {
        self.recv_bytes(&[byte]);
    }

    /// Service call: runs due timers, then moves staged bytes toward the
    /// adapter. Idempotent; call at least every
    /// [`DataLink::service_interval_ms`] milliseconds.
    pub fn process(&mut self) {
        self.core.process();
    }

    /// Reinitialize the link: both windows clear and a fresh handshake
    /// starts. Pending messages are failed with
    /// [`LinkEvent::MessageTimeout`].
    pub fn reset(&mut self) {
        self.core.start_negotiation(true);
    }

    /// Milliseconds until [`DataLink::process`] next has work to do.
    pub fn service_interval_ms(&self) -> u32 {
        self.core.service_interval_ms()
    }

    /// Next in-order message, if one is ready.
    pub fn recv(&mut self) -> Option<Msg> {
        self.core.rx_queue.pop_front()
    }

    /// Next pending link event, if any.
    pub fn next_event(&mut self) -> Option<LinkEvent> {
        self.core.event_queue.pop_front()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.state
    }

    pub fn status(&self) -> Stats {
        let f = self.framer.stats();
        let c = self.core.counters;
        Stats {
            tx_count: c.tx_count,
            tx_retransmit_count: c.tx_retransmit_count,
            tx_timeout_count: c.tx_timeout_count,
            rx_count: f.rx_count,
            rx_synchronization_errors: f.rx_synchronization_errors,
            rx_mic_errors: f.rx_mic_errors,
            rx_frame_id_errors: c.rx_frame_id_errors,
            rx_deduplicate_count: c.rx_deduplicate_count,
            spurious_acks: c.spurious_acks,
            resets_received: c.resets_received,
            reset_count: c.reset_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }
}

impl<'a, H: Hal> LinkCore<'a, H> {
    fn send(&mut self, metadata: u32, msg: &[u8]) -> Result<(), Error> {
        if msg.is_empty() || msg.len() > PAYLOAD_MAX || metadata >= METADATA_MAX {
            return Err(Error::ParameterInvalid);
        }
        if self.state == ConnectionState::Disconnected {
            return Err(Error::Aborted);
        }
        let window = self.config.tx_window_size;
        let inflight = frame_id_delta(self.tx_frame_id_min, self.tx_frame_id_next);
        if inflight >= window as i16 {
            return Err(Error::NotEnoughMemory);
        }
        let frame_id = self.tx_frame_id_next;
        let idx = (frame_id % window) as usize;
        if self.tx_slots[idx].state != TxSlotState::Free {
            return Err(Error::NotEnoughMemory);
        }
        {
            let slot = &mut self.tx_slots[idx];
            framer::build_data_frame(frame_id, metadata, msg, &mut slot.bytes)?;
            slot.frame_id = frame_id;
            slot.metadata = metadata;
            slot.send_count = 0;
            slot.timer_id = 0;
            slot.nacked = false;
        }
        self.tx_frame_id_next = frame_id_inc(frame_id);
        let now = self.hal.time_ms();
        // Older queued frames go out first to keep the wire in id order.
        self.flush_queued(now);
        let sent = self.state == ConnectionState::Connected
            && self.queued_count == 0
            && self.tx_ring.append(&self.tx_slots[idx].bytes);
        if sent {
            let slot = &mut self.tx_slots[idx];
            slot.state = TxSlotState::Sent;
            slot.send_count = 1;
            slot.last_send_time_ms = now;
            self.counters.tx_count = self.counters.tx_count.wrapping_add(1);
            trace!(target: self.name.as_str(), "tx frame id={} len={}", frame_id, msg.len());
            self.arm_retransmit(idx, now);
        } else {
            self.tx_slots[idx].state = TxSlotState::Queued;
            self.queued_count += 1;
            trace!(target: self.name.as_str(), "queued frame id={}", frame_id);
        }
        self.flush_ring();
        Ok(())
    }

    fn process(&mut self) {
        let now = self.hal.time_ms();
        while let Some((_, timer)) = self.events.pop_due(now) {
            match timer {
                LinkTimer::Retransmit(frame_id) => self.on_retransmit_timer(frame_id, now),
                LinkTimer::Reset => self.on_reset_timer(now),
            }
        }
        self.service_tx();
    }

    fn service_tx(&mut self) {
        let now = self.hal.time_ms();
        self.flush_queued(now);
        self.flush_ring();
    }

    fn service_interval_ms(&self) -> u32 {
        if self.queued_count > 0 || self.tx_ring.size() > 0 {
            return 0;
        }
        self.events
            .next_interval(self.hal.time_ms())
            .unwrap_or(u32::MAX)
    }

    /// Move every in-order queued frame that fits into the ring.
    fn flush_queued(&mut self, now: u32) {
        if self.state != ConnectionState::Connected || self.queued_count == 0 {
            return;
        }
        let window = self.config.tx_window_size;
        let mut frame_id = self.tx_frame_id_min;
        while frame_id != self.tx_frame_id_next {
            let idx = (frame_id % window) as usize;
            if self.tx_slots[idx].state == TxSlotState::Queued
                && self.tx_slots[idx].frame_id == frame_id
            {
                if !self.tx_ring.append(&self.tx_slots[idx].bytes) {
                    break;
                }
                let slot = &mut self.tx_slots[idx];
                slot.state = TxSlotState::Sent;
                slot.send_count = 1;
                slot.last_send_time_ms = now;
                self.queued_count -= 1;
                self.counters.tx_count = self.counters.tx_count.wrapping_add(1);
                trace!(target: self.name.as_str(), "tx queued frame id={}", frame_id);
                self.arm_retransmit(idx, now);
            }
            frame_id = frame_id_inc(frame_id);
        }
    }

    /// Drain staged bytes into the adapter, bounded by its free room.
    fn flush_ring(&mut self) {
        loop {
            let room = self.hal.send_available() as usize;
            let take = room.min(self.tx_ring.size()).min(self.scratch.len());
            if take == 0 {
                return;
            }
            let got = self.tx_ring.pop_into(&mut self.scratch[..take]);
            self.hal.send(&self.scratch[..got]);
        }
    }

    fn enqueue_link_frame(&mut self, frame_type: LinkFrameType, frame_id: u16) {
        let bytes = framer::build_link_frame(frame_type, frame_id);
        if !self.tx_ring.append(&bytes) {
            // The peer's retry machinery covers a lost ack or nack.
            warn!(
                target: self.name.as_str(),
                "tx ring full, dropped {:?} id={}", frame_type, frame_id
            );
        }
    }

    fn arm_retransmit(&mut self, idx: usize, now: u32) {
        let frame_id = self.tx_slots[idx].frame_id;
        let deadline = now.wrapping_add(self.config.retry_timeout_ms);
        let _ = self.events.cancel(self.tx_slots[idx].timer_id);
        self.tx_slots[idx].timer_id = self.events.schedule(deadline, LinkTimer::Retransmit(frame_id));
    }

    fn free_tx_slot(&mut self, idx: usize) {
        let _ = self.events.cancel(self.tx_slots[idx].timer_id);
        let slot = &mut self.tx_slots[idx];
        slot.timer_id = 0;
        slot.state = TxSlotState::Free;
        slot.nacked = false;
        slot.bytes.clear();
    }

    /// Advance the window lower edge over acknowledged and failed slots.
    fn advance_tx_min(&mut self) {
        let window = self.config.tx_window_size;
        while self.tx_frame_id_min != self.tx_frame_id_next {
            let idx = (self.tx_frame_id_min % window) as usize;
            match self.tx_slots[idx].state {
                TxSlotState::Free => {}
                TxSlotState::Acked if self.tx_slots[idx].frame_id == self.tx_frame_id_min => {
                    self.free_tx_slot(idx);
                }
                _ => break,
            }
            self.tx_frame_id_min = frame_id_inc(self.tx_frame_id_min);
        }
    }

    fn retransmit_slot(&mut self, idx: usize, now: u32, from_nack: bool) {
        let appended = self.tx_ring.append(&self.tx_slots[idx].bytes);
        if appended {
            let slot = &mut self.tx_slots[idx];
            slot.send_count = slot.send_count.saturating_add(1);
            slot.last_send_time_ms = now;
            slot.nacked = from_nack;
            self.counters.tx_retransmit_count = self.counters.tx_retransmit_count.wrapping_add(1);
            debug!(
                target: self.name.as_str(),
                "retransmit frame id={} attempt={}", self.tx_slots[idx].frame_id,
                self.tx_slots[idx].send_count
            );
        }
        // With no ring room the rearmed timer retries later.
        self.arm_retransmit(idx, now);
    }

    fn on_retransmit_timer(&mut self, frame_id: u16, now: u32) {
        let window = self.config.tx_window_size;
        let idx = (frame_id % window) as usize;
        if self.tx_slots[idx].frame_id != frame_id || self.tx_slots[idx].state != TxSlotState::Sent
        {
            return;
        }
        self.tx_slots[idx].timer_id = 0;
        self.tx_slots[idx].nacked = false;
        if self.tx_slots[idx].send_count >= self.config.max_retries {
            let metadata = self.tx_slots[idx].metadata;
            warn!(
                target: self.name.as_str(),
                "frame id={} failed after {} transmissions", frame_id,
                self.tx_slots[idx].send_count
            );
            self.free_tx_slot(idx);
            self.advance_tx_min();
            self.counters.tx_timeout_count = self.counters.tx_timeout_count.wrapping_add(1);
            self.event_queue
                .push_back(LinkEvent::MessageTimeout { metadata });
            self.consecutive_send_failures += 1;
            if self.consecutive_send_failures >= self.config.max_reset_retries {
                warn!(target: self.name.as_str(), "too many delivery failures, renegotiating");
                self.event_queue.push_back(LinkEvent::ConnectionLost);
                self.start_negotiation(true);
            }
        } else {
            self.retransmit_slot(idx, now, false);
        }
    }

    fn on_reset_timer(&mut self, now: u32) {
        self.reset_timer_id = 0;
        if self.state != ConnectionState::Negotiating {
            return;
        }
        self.reset_retry_count += 1;
        if self.reset_retry_count > self.config.max_reset_retries {
            warn!(target: self.name.as_str(), "reset handshake failed, giving up");
            self.state = ConnectionState::Disconnected;
            self.event_queue.push_back(LinkEvent::ConnectionLost);
            return;
        }
        debug!(
            target: self.name.as_str(),
            "reset request unanswered, retry {}", self.reset_retry_count
        );
        self.enqueue_link_frame(LinkFrameType::Reset, RESET_REQUEST);
        self.reset_timer_id = self
            .events
            .schedule(now.wrapping_add(self.config.reset_timeout_ms), LinkTimer::Reset);
        self.flush_ring();
    }

    /// Fail every occupied TX slot, clear both windows and the staging
    /// ring, and rewind all three window edges to 0.
    fn clear_windows(&mut self, report: bool) {
        for idx in 0..self.tx_slots.len() {
            if self.tx_slots[idx].state != TxSlotState::Free {
                if report {
                    let metadata = self.tx_slots[idx].metadata;
                    self.event_queue
                        .push_back(LinkEvent::MessageTimeout { metadata });
                }
                self.free_tx_slot(idx);
            }
        }
        for slot in &mut self.rx_slots {
            slot.state = RxSlotState::Empty;
            slot.payload.clear();
        }
        self.tx_ring.clear();
        self.queued_count = 0;
        self.tx_frame_id_next = 0;
        self.tx_frame_id_min = 0;
        self.rx_frame_id_next = 0;
        self.nacked_framing_error = false;
    }

    fn start_negotiation(&mut self, count_reset: bool) {
        self.clear_windows(true);
        self.state = ConnectionState::Negotiating;
        self.reset_retry_count = 0;
        self.consecutive_send_failures = 0;
        if count_reset {
            self.counters.reset_count = self.counters.reset_count.wrapping_add(1);
        }
        debug!(target: self.name.as_str(), "reset: negotiating");
        self.enqueue_link_frame(LinkFrameType::Reset, RESET_REQUEST);
        let now = self.hal.time_ms();
        let _ = self.events.cancel(self.reset_timer_id);
        self.reset_timer_id = self
            .events
            .schedule(now.wrapping_add(self.config.reset_timeout_ms), LinkTimer::Reset);
        self.flush_ring();
    }

    fn establish(&mut self) {
        self.state = ConnectionState::Connected;
        let _ = self.events.cancel(self.reset_timer_id);
        self.reset_timer_id = 0;
        self.reset_retry_count = 0;
        self.consecutive_send_failures = 0;
        debug!(target: self.name.as_str(), "connection established");
        self.event_queue.push_back(LinkEvent::ConnectionEstablished);
    }

    fn rx_slot_received(&self, frame_id: u16) -> bool {
        let idx = (frame_id % self.config.rx_window_size) as usize;
        self.rx_slots[idx].state == RxSlotState::Received && self.rx_slots[idx].frame_id == frame_id
    }

    /// Deliver `rx_frame_id_next` and every contiguous buffered
    /// successor; returns the id of the last frame delivered.
    fn deliver_in_order(&mut self, metadata: u32, payload: &[u8]) -> u16 {
        let mut last = self.rx_frame_id_next;
        self.rx_queue.push_back(Msg {
            metadata,
            payload: payload.to_vec(),
        });
        self.rx_frame_id_next = frame_id_inc(self.rx_frame_id_next);
        loop {
            let idx = (self.rx_frame_id_next % self.config.rx_window_size) as usize;
            if self.rx_slots[idx].state != RxSlotState::Received
                || self.rx_slots[idx].frame_id != self.rx_frame_id_next
            {
                break;
            }
            let slot = &mut self.rx_slots[idx];
            let msg = Msg {
                metadata: slot.metadata,
                payload: slot.payload.clone(),
            };
            slot.state = RxSlotState::Empty;
            slot.payload.clear();
            self.rx_queue.push_back(msg);
            last = self.rx_frame_id_next;
            self.rx_frame_id_next = frame_id_inc(self.rx_frame_id_next);
        }
        last
    }
}

impl<'a, H: Hal> FrameHandler for LinkCore<'a, H> {
    fn on_frame(&mut self, frame_id: u16, metadata: u32, payload: &[u8]) {
        self.nacked_framing_error = false;
        if self.state != ConnectionState::Connected {
            trace!(
                target: self.name.as_str(),
                "dropping data frame id={} while {:?}", frame_id, self.state
            );
            return;
        }
        let window = self.config.rx_window_size;
        let d = frame_id_delta(self.rx_frame_id_next, frame_id);
        if d < 0 {
            // Already delivered; the ack must have been lost.
            self.counters.rx_deduplicate_count =
                self.counters.rx_deduplicate_count.wrapping_add(1);
            self.enqueue_link_frame(LinkFrameType::AckOne, frame_id);
        } else if d == 0 {
            let last = self.deliver_in_order(metadata, payload);
            self.enqueue_link_frame(LinkFrameType::AckAll, last);
        } else if d < window as i16 {
            let idx = (frame_id % window) as usize;
            if self.rx_slots[idx].state == RxSlotState::Received
                && self.rx_slots[idx].frame_id == frame_id
            {
                self.counters.rx_deduplicate_count =
                    self.counters.rx_deduplicate_count.wrapping_add(1);
                self.enqueue_link_frame(LinkFrameType::AckOne, frame_id);
                return;
            }
            {
                let slot = &mut self.rx_slots[idx];
                slot.state = RxSlotState::Received;
                slot.frame_id = frame_id;
                slot.metadata = metadata;
                slot.payload.clear();
                slot.payload.extend_from_slice(payload);
            }
            self.enqueue_link_frame(LinkFrameType::AckOne, frame_id);
            // Chase the gap: one nack per frame still missing below it.
            let mut missing = self.rx_frame_id_next;
            while missing != frame_id {
                if !self.rx_slot_received(missing) {
                    self.enqueue_link_frame(LinkFrameType::NackFrameId, missing);
                }
                missing = frame_id_inc(missing);
            }
        } else {
            self.counters.rx_frame_id_errors = self.counters.rx_frame_id_errors.wrapping_add(1);
            warn!(
                target: self.name.as_str(),
                "frame id={} overruns window (expecting {})", frame_id, self.rx_frame_id_next
            );
            self.enqueue_link_frame(LinkFrameType::NackFrameId, self.rx_frame_id_next);
        }
    }

    fn on_ack(&mut self, kind: AckKind, frame_id: u16) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let window = self.config.tx_window_size;
        let inflight = frame_id_delta(self.tx_frame_id_min, self.tx_frame_id_next);
        let diff = frame_id_delta(self.tx_frame_id_min, frame_id);
        if diff < 0 || diff >= inflight {
            self.counters.spurious_acks = self.counters.spurious_acks.wrapping_add(1);
            trace!(target: self.name.as_str(), "spurious {:?} id={}", kind, frame_id);
            return;
        }
        match kind {
            AckKind::All => {
                let mut fid = self.tx_frame_id_min;
                loop {
                    let idx = (fid % window) as usize;
                    if self.tx_slots[idx].state != TxSlotState::Free
                        && self.tx_slots[idx].frame_id == fid
                    {
                        self.free_tx_slot(idx);
                    }
                    if fid == frame_id {
                        break;
                    }
                    fid = frame_id_inc(fid);
                }
                self.tx_frame_id_min = frame_id_inc(frame_id);
            }
            AckKind::One => {
                let idx = (frame_id % window) as usize;
                if self.tx_slots[idx].state == TxSlotState::Sent
                    && self.tx_slots[idx].frame_id == frame_id
                {
                    let _ = self.events.cancel(self.tx_slots[idx].timer_id);
                    self.tx_slots[idx].timer_id = 0;
                    self.tx_slots[idx].state = TxSlotState::Acked;
                }
            }
        }
        self.advance_tx_min();
        self.consecutive_send_failures = 0;
    }

    fn on_nack(&mut self, cause: NackCause, frame_id: u16) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let window = self.config.tx_window_size;
        let inflight = frame_id_delta(self.tx_frame_id_min, self.tx_frame_id_next);
        let diff = frame_id_delta(self.tx_frame_id_min, frame_id);
        if diff < 0 || diff >= inflight {
            trace!(
                target: self.name.as_str(),
                "ignoring {:?} for id={} outside window", cause, frame_id
            );
            return;
        }
        let idx = (frame_id % window) as usize;
        if self.tx_slots[idx].state != TxSlotState::Sent
            || self.tx_slots[idx].frame_id != frame_id
        {
            return;
        }
        if self.tx_slots[idx].nacked {
            // A retransmission for this id is already in flight.
            trace!(target: self.name.as_str(), "duplicate nack for id={}", frame_id);
            return;
        }
        debug!(target: self.name.as_str(), "{:?} for id={}", cause, frame_id);
        let now = self.hal.time_ms();
        self.retransmit_slot(idx, now, true);
    }

    fn on_reset(&mut self, frame_id: u16) {
        match frame_id {
            RESET_REQUEST => {
                debug!(target: self.name.as_str(), "reset request from peer");
                self.counters.resets_received = self.counters.resets_received.wrapping_add(1);
                self.clear_windows(true);
                self.enqueue_link_frame(LinkFrameType::Reset, RESET_ACK);
                self.establish();
            }
            RESET_ACK => {
                if self.state == ConnectionState::Negotiating {
                    debug!(target: self.name.as_str(), "reset acknowledged by peer");
                    self.establish();
                } else {
                    trace!(target: self.name.as_str(), "stale reset ack ignored");
                }
            }
            other => {
                trace!(target: self.name.as_str(), "reset with unknown discriminator {}", other);
            }
        }
    }

    fn on_frame_error(&mut self) {
        if self.nacked_framing_error {
            return;
        }
        self.nacked_framing_error = true;
        self.enqueue_link_frame(LinkFrameType::NackFramingError, self.rx_frame_id_next);
    }
}
