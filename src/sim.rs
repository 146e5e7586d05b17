//! Simulated USB controllers
//!
//! [`SimDevice`] and [`SimHost`] implement the hardware capability traits
//! in software, so the transfer engine runs on a workstation. Each one plays
//! both sides of the wire: the controller that the engine drives, and a
//! scripted partner (a host for `SimDevice`, a peripheral for `SimHost`).
//!
//! The frame counter advances each time it's read while the bus is running.
//! Poll loops observe a new frame on every iteration, so software timeouts
//! expire after a bounded number of polls.

mod device;
mod host;
mod memory;
pub(crate) mod registers;

pub use device::{ControlStage, SimDevice, ENDPOINT_COUNT};
pub use host::{Behavior, SimHost, PIPE_COUNT};
pub use memory::BANK_MEMORY_SIZE;

/// Largest max packet size supported by the simulated controllers.
pub const MAX_PACKET_SIZE: usize = 64;

/// A packet that crossed the simulated wire.
pub type Packet = heapless::Vec<u8, MAX_PACKET_SIZE>;

/// Frame numbers are eleven bits wide.
const FRAME_MASK: u16 = 0x7FF;

fn packet(bytes: &[u8]) -> Packet {
    let mut packet = Packet::new();
    let len = bytes.len().min(MAX_PACKET_SIZE);
    packet.extend_from_slice(&bytes[..len]).ok();
    packet
}

/// Queue a packet for the other side of the wire.
///
/// # Panics
///
/// Panics if the queue is full. The simulation never drops packets.
fn enqueue<T, const N: usize>(queue: &mut heapless::Deque<T, N>, item: T) {
    if queue.push_back(item).is_err() {
        panic!("simulated queue full ({} entries)", N);
    }
}

/// Append to a simulation log.
///
/// # Panics
///
/// Panics if the log is full.
fn record<T, const N: usize>(log: &mut heapless::Vec<T, N>, item: T) {
    if log.push(item).is_err() {
        panic!("simulated log full ({} entries)", N);
    }
}

fn next_frame(frame: &core::cell::Cell<u16>) -> u16 {
    let next = frame.get().wrapping_add(1) & FRAME_MASK;
    frame.set(next);
    next
}
