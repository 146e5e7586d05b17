//! Bank stream engine
//!
//! Moves byte buffers of any length through a configured endpoint or pipe.
//! The engine fills (or drains) the selected bank, hands it to the hardware
//! whenever it's full (or empty), and waits for the next bank. Callers never
//! see packet boundaries or double banking.
//!
//! Streams do not finalize transfers. After [`write_stream`], the last bank
//! may still hold data; call [`finish_write`] to send it, and a zero-length
//! packet if the transfer ended on a packet boundary. After [`read_stream`],
//! call [`finish_read`] to release the last bank.
//!
//! The engine polls. Each wait re-checks stall and disconnect conditions,
//! and a [`SoftwareTimeout`], so every call terminates. Errors are terminal;
//! the engine never retries.

use crate::{hw::Bank, timeout::SoftwareTimeout};

/// Default time to wait for a bank to become ready, in milliseconds.
pub const DEFAULT_STREAM_TIMEOUT_MS: u16 = 100;

/// Bank stream errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum StreamError {
    /// The endpoint was halted, or the device responded with a STALL.
    Stalled,
    /// The device or host went away during the transfer.
    Disconnected,
    /// The bus was suspended during the transfer.
    BusSuspended,
    /// The bank did not become ready before the timeout expired.
    Timeout,
    /// The blocked callback asked to abort the transfer.
    CallbackAborted,
    /// The host started a new control request during a control data stage.
    HostAborted,
}

/// Returned by a blocked callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamCallback {
    /// Keep waiting for the bank.
    Continue,
    /// Stop the transfer with [`StreamError::CallbackAborted`].
    Abort,
}

/// Invoked each time the engine hands off a bank and must wait for the next one.
pub type OnBlocked<'a> = Option<&'a mut dyn FnMut() -> StreamCallback>;

/// The state of the selected bank, as seen by a waiting stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The bank may be read or written.
    Ready,
    /// Keep polling.
    Busy,
    Stalled,
    Disconnected,
    Suspended,
}

/// A bank that a stream can wait on.
///
/// Implemented by the device [`Endpoint`](crate::device::Endpoint) and
/// the host [`Pipe`](crate::host::Pipe) adapters.
pub trait StreamPort: Bank {
    /// Poll the hardware once.
    fn readiness(&self) -> Readiness;

    /// Hand a bank full of written data to the hardware.
    ///
    /// Sends a zero-length packet if the bank is empty.
    fn release_written(&mut self);

    /// Return a drained (or partially drained) bank to the hardware.
    fn release_read(&mut self);

    /// Returns how long to wait for a bank, in milliseconds.
    fn timeout_ms(&self) -> u16 {
        DEFAULT_STREAM_TIMEOUT_MS
    }
}

/// Spin until the selected bank is ready.
pub fn wait_until_ready<P: StreamPort + ?Sized>(port: &mut P) -> Result<(), StreamError> {
    let mut timeout = SoftwareTimeout::start(port.timeout_ms(), port.frame_number());
    loop {
        match port.readiness() {
            Readiness::Ready => return Ok(()),
            Readiness::Stalled => return Err(StreamError::Stalled),
            Readiness::Disconnected => return Err(StreamError::Disconnected),
            Readiness::Suspended => return Err(StreamError::BusSuspended),
            Readiness::Busy => {}
        }
        if timeout.poll(port.frame_number()).is_err() {
            warn!("STREAM TIMEOUT");
            return Err(StreamError::Timeout);
        }
        core::hint::spin_loop();
    }
}

/// Release the current bank with `release`, consult the callback, then
/// wait for the next bank.
fn next_bank<P: StreamPort + ?Sized>(
    port: &mut P,
    release: fn(&mut P),
    on_blocked: &mut OnBlocked<'_>,
) -> Result<(), StreamError> {
    release(port);
    if let Some(callback) = on_blocked.as_mut() {
        if callback() == StreamCallback::Abort {
            return Err(StreamError::CallbackAborted);
        }
    }
    wait_until_ready(port)
}

fn write_bytes<P, I>(port: &mut P, bytes: I, mut on_blocked: OnBlocked<'_>) -> Result<(), StreamError>
where
    P: StreamPort + ?Sized,
    I: Iterator<Item = u8>,
{
    wait_until_ready(port)?;
    for byte in bytes {
        while !port.is_read_write_allowed() {
            next_bank(port, P::release_written, &mut on_blocked)?;
        }
        port.write_byte(byte);
    }
    Ok(())
}

fn read_bytes<'b, P, I>(port: &mut P, slots: I, mut on_blocked: OnBlocked<'_>) -> Result<(), StreamError>
where
    P: StreamPort + ?Sized,
    I: Iterator<Item = &'b mut u8>,
{
    wait_until_ready(port)?;
    for slot in slots {
        while !port.is_read_write_allowed() {
            next_bank(port, P::release_read, &mut on_blocked)?;
        }
        *slot = port.read_byte();
    }
    Ok(())
}

/// Write `buffer` to the selected IN endpoint or OUT pipe.
///
/// Each time the bank fills, it's sent as a packet. The final bank is left
/// unsent; see [`finish_write`].
pub fn write_stream<P: StreamPort + ?Sized>(
    port: &mut P,
    buffer: &[u8],
    on_blocked: OnBlocked<'_>,
) -> Result<(), StreamError> {
    write_bytes(port, buffer.iter().copied(), on_blocked)
}

/// Write `buffer` in reverse byte order.
pub fn write_stream_be<P: StreamPort + ?Sized>(
    port: &mut P,
    buffer: &[u8],
    on_blocked: OnBlocked<'_>,
) -> Result<(), StreamError> {
    write_bytes(port, buffer.iter().rev().copied(), on_blocked)
}

/// Fill `buffer` from the selected OUT endpoint or IN pipe.
///
/// Consumes packets as they arrive. Bytes beyond `buffer` in the final bank
/// are left in place; [`finish_read`] discards them.
pub fn read_stream<P: StreamPort + ?Sized>(
    port: &mut P,
    buffer: &mut [u8],
    on_blocked: OnBlocked<'_>,
) -> Result<(), StreamError> {
    read_bytes(port, buffer.iter_mut(), on_blocked)
}

/// Fill `buffer` in reverse byte order.
pub fn read_stream_be<P: StreamPort + ?Sized>(
    port: &mut P,
    buffer: &mut [u8],
    on_blocked: OnBlocked<'_>,
) -> Result<(), StreamError> {
    read_bytes(port, buffer.iter_mut().rev(), on_blocked)
}

/// Read and drop `length` bytes.
pub fn discard_stream<P: StreamPort + ?Sized>(
    port: &mut P,
    length: usize,
    mut on_blocked: OnBlocked<'_>,
) -> Result<(), StreamError> {
    wait_until_ready(port)?;
    for _ in 0..length {
        while !port.is_read_write_allowed() {
            next_bank(port, P::release_read, &mut on_blocked)?;
        }
        port.read_byte();
    }
    Ok(())
}

/// Terminate a transfer of `length` bytes written with [`write_stream`].
///
/// Sends whatever remains in the bank. When `length` is a non-zero multiple
/// of the max packet size, also sends a zero-length packet so the receiver
/// can tell the transfer ended.
pub fn finish_write<P: StreamPort + ?Sized>(port: &mut P, length: usize) -> Result<(), StreamError> {
    if port.bytes_in_bank() > 0 {
        port.release_written();
    }
    let packet = usize::from(port.max_packet_size());
    if length > 0 && packet > 0 && length % packet == 0 {
        wait_until_ready(port)?;
        port.release_written();
    }
    Ok(())
}

/// Release the final bank of a read, discarding any unread bytes.
pub fn finish_read<P: StreamPort + ?Sized>(port: &mut P) {
    port.release_read();
}

/// Single-access primitives over the selected bank.
///
/// These perform no framing; the caller must know that the bank holds (or
/// has room for) the bytes.
pub trait BankExt: Bank {
    fn discard_byte(&mut self) {
        self.read_byte();
    }

    fn read_u16_le(&mut self) -> u16 {
        u16::from_le_bytes([self.read_byte(), self.read_byte()])
    }

    fn read_u16_be(&mut self) -> u16 {
        u16::from_be_bytes([self.read_byte(), self.read_byte()])
    }

    fn read_u32_le(&mut self) -> u32 {
        let mut bytes = [0; 4];
        bytes.iter_mut().for_each(|b| *b = self.read_byte());
        u32::from_le_bytes(bytes)
    }

    fn read_u32_be(&mut self) -> u32 {
        let mut bytes = [0; 4];
        bytes.iter_mut().for_each(|b| *b = self.read_byte());
        u32::from_be_bytes(bytes)
    }

    fn write_u16_le(&mut self, value: u16) {
        value.to_le_bytes().into_iter().for_each(|b| self.write_byte(b));
    }

    fn write_u16_be(&mut self, value: u16) {
        value.to_be_bytes().into_iter().for_each(|b| self.write_byte(b));
    }

    fn write_u32_le(&mut self, value: u32) {
        value.to_le_bytes().into_iter().for_each(|b| self.write_byte(b));
    }

    fn write_u32_be(&mut self, value: u32) {
        value.to_be_bytes().into_iter().for_each(|b| self.write_byte(b));
    }
}

impl<B: Bank + ?Sized> BankExt for B {}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;
    use crate::{
        context::{Options, UsbContext},
        device::Endpoint,
        hw::{BankCount, DeviceHardware, TransferDescriptor},
        sim::SimDevice,
    };
    use usb_device::{endpoint::EndpointAddress, UsbDirection};

    fn bulk_in() -> EndpointAddress {
        EndpointAddress::from_parts(1, UsbDirection::In)
    }

    fn bulk_out() -> EndpointAddress {
        EndpointAddress::from_parts(2, UsbDirection::Out)
    }

    fn device(packet: u16, banks: BankCount) -> (SimDevice, UsbContext) {
        let mut sim = SimDevice::new();
        let mut ctx = UsbContext::new(Options::new());
        ctx.init_device(&mut sim);
        assert!(sim.configure_endpoint(
            bulk_in(),
            &TransferDescriptor::bulk(UsbDirection::In, packet).with_banks(banks)
        ));
        assert!(sim.configure_endpoint(
            bulk_out(),
            &TransferDescriptor::bulk(UsbDirection::Out, packet).with_banks(banks)
        ));
        (sim, ctx)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn write_130_bytes_in_64_byte_packets() {
        let (mut sim, ctx) = device(64, BankCount::Single);
        let data = pattern(130);

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        write_stream(&mut ep, &data, None).unwrap();
        assert_eq!(ep.bytes_in_bank(), 2);
        drop(ep);

        let sizes: Vec<usize> = sim.in_packets(1).iter().map(|p| p.len()).collect();
        assert_eq!(sizes, [64, 64]);

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        finish_write(&mut ep, data.len()).unwrap();
        drop(ep);

        let sizes: Vec<usize> = sim.in_packets(1).iter().map(|p| p.len()).collect();
        assert_eq!(sizes, [64, 64, 2]);
        let sent: Vec<u8> = sim.in_packets(1).iter().flatten().copied().collect();
        assert_eq!(sent, data);
    }

    #[test]
    fn zero_length_packet_only_on_packet_boundary() {
        for packet in [8u16, 16, 64] {
            for len in 0..=(3 * packet as usize + 1) {
                let (mut sim, ctx) = device(packet, BankCount::Single);
                let data = pattern(len);
                let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
                write_stream(&mut ep, &data, None).unwrap();
                finish_write(&mut ep, len).unwrap();
                drop(ep);

                let packets = sim.in_packets(1);
                let zlps = packets.iter().filter(|p| p.is_empty()).count();
                let expect_zlp = len > 0 && len % packet as usize == 0;
                assert_eq!(zlps, expect_zlp as usize, "len {len} packet {packet}");
                if expect_zlp {
                    assert!(packets.last().unwrap().is_empty());
                }
                let sent: Vec<u8> = packets.iter().flatten().copied().collect();
                assert_eq!(sent, data);
            }
        }
    }

    #[test]
    fn framing_round_trip() {
        for packet in [8u16, 64] {
            for len in [1usize, 7, 8, 9, 63, 64, 65, 128, 200] {
                let (mut writer, ctx) = device(packet, BankCount::Double);
                let data = pattern(len);
                let mut ep = Endpoint::select(&mut writer, &ctx, bulk_in());
                write_stream(&mut ep, &data, None).unwrap();
                finish_write(&mut ep, len).unwrap();
                drop(ep);

                let (mut reader, ctx) = device(packet, BankCount::Double);
                for p in writer.in_packets(1) {
                    reader.host_out(2, p);
                }
                let mut received = std::vec![0; len];
                let mut ep = Endpoint::select(&mut reader, &ctx, bulk_out());
                read_stream(&mut ep, &mut received, None).unwrap();
                finish_read(&mut ep);
                assert_eq!(received, data, "len {len} packet {packet}");
            }
        }
    }

    #[test]
    fn big_endian_streams_reverse() {
        let (mut sim, ctx) = device(64, BankCount::Single);
        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        write_stream_be(&mut ep, &[1, 2, 3, 4], None).unwrap();
        finish_write(&mut ep, 4).unwrap();
        drop(ep);
        assert_eq!(&sim.in_packets(1)[0][..], &[4, 3, 2, 1]);

        sim.host_out(2, &[9, 8, 7]);
        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_out());
        let mut buffer = [0; 3];
        read_stream_be(&mut ep, &mut buffer, None).unwrap();
        assert_eq!(buffer, [7, 8, 9]);
    }

    #[test]
    fn short_read_leaves_remainder_until_finished() {
        let (mut sim, ctx) = device(64, BankCount::Single);
        sim.host_out(2, &pattern(10));
        sim.host_out(2, &[0xAA]);

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_out());
        let mut buffer = [0; 4];
        read_stream(&mut ep, &mut buffer, None).unwrap();
        assert_eq!(&buffer[..], &pattern(10)[..4]);
        assert_eq!(ep.bytes_in_bank(), 6);

        finish_read(&mut ep);
        let mut next = [0; 1];
        read_stream(&mut ep, &mut next, None).unwrap();
        assert_eq!(next, [0xAA]);
    }

    #[test]
    fn discard_spans_packets() {
        let (mut sim, ctx) = device(8, BankCount::Single);
        sim.host_out(2, &[0; 8]);
        sim.host_out(2, &[0, 0, 0x55, 0x66]);

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_out());
        discard_stream(&mut ep, 10, None).unwrap();
        assert_eq!(ep.read_u16_le(), 0x6655);
    }

    #[test]
    fn timeout_when_host_stops_reading() {
        let (mut sim, ctx) = device(8, BankCount::Single);
        sim.hold_in(1, true);

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        let result = write_stream(&mut ep, &pattern(20), None);
        assert_eq!(result, Err(StreamError::Timeout));
    }

    #[test]
    fn read_times_out_without_data() {
        let (mut sim, ctx) = device(8, BankCount::Single);
        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_out());
        let mut buffer = [0; 1];
        assert_eq!(read_stream(&mut ep, &mut buffer, None), Err(StreamError::Timeout));
    }

    #[test]
    fn callback_aborts_between_packets() {
        let (mut sim, ctx) = device(8, BankCount::Single);
        let mut calls = 0;
        let mut abort_second = || {
            calls += 1;
            if calls == 2 {
                StreamCallback::Abort
            } else {
                StreamCallback::Continue
            }
        };
        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        let result = write_stream(&mut ep, &pattern(40), Some(&mut abort_second));
        assert_eq!(result, Err(StreamError::CallbackAborted));
        drop(ep);
        assert_eq!(calls, 2);
        assert_eq!(sim.in_packets(1).len(), 2);
    }

    #[test]
    fn halted_endpoint_reports_stall() {
        let (mut sim, ctx) = device(8, BankCount::Single);
        sim.hold_in(1, true);
        sim.select_endpoint(bulk_in());
        sim.stall_transaction();

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        let result = write_stream(&mut ep, &pattern(20), None);
        assert_eq!(result, Err(StreamError::Stalled));
    }

    #[test]
    fn vbus_loss_reports_disconnect() {
        let (mut sim, ctx) = device(8, BankCount::Single);
        sim.set_vbus(false);

        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_out());
        let mut buffer = [0; 4];
        assert_eq!(
            read_stream(&mut ep, &mut buffer, None),
            Err(StreamError::Disconnected)
        );
    }

    #[test]
    fn word_primitives() {
        let (mut sim, ctx) = device(64, BankCount::Single);
        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_in());
        ep.write_u16_le(0x1234);
        ep.write_u16_be(0x1234);
        ep.write_u32_le(0xAABBCCDD);
        ep.write_u32_be(0xAABBCCDD);
        finish_write(&mut ep, 12).unwrap();
        drop(ep);
        assert_eq!(
            &sim.in_packets(1)[0][..],
            &[0x34, 0x12, 0x12, 0x34, 0xDD, 0xCC, 0xBB, 0xAA, 0xAA, 0xBB, 0xCC, 0xDD]
        );

        sim.host_out(2, &[0x34, 0x12, 0x12, 0x34, 0xDD, 0xCC, 0xBB, 0xAA, 0xAA, 0xBB, 0xCC, 0xDD]);
        let mut ep = Endpoint::select(&mut sim, &ctx, bulk_out());
        wait_until_ready(&mut ep).unwrap();
        assert_eq!(ep.read_u16_le(), 0x1234);
        assert_eq!(ep.read_u16_be(), 0x1234);
        assert_eq!(ep.read_u32_le(), 0xAABBCCDD);
        assert_eq!(ep.read_u32_be(), 0xAABBCCDD);
    }
}
