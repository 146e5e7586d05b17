//! Control endpoint data and status stages

use usb_device::UsbDirection;

use crate::{
    context::UsbContext,
    hw::DeviceHardware,
    request::ControlRequestHeader,
    stream::StreamError,
    timeout::SoftwareTimeout,
};

/// The control endpoint, during one control request.
///
/// Created by the standard request responder once it has read the SETUP
/// packet. The SETUP packet stays in the bank until [`accept`](Self::accept)
/// acknowledges it; acknowledge it before running the data stage.
///
/// Every wait fails with [`StreamError::HostAborted`] if the host sends a
/// new SETUP packet, and with [`StreamError::Disconnected`] or
/// [`StreamError::BusSuspended`] if the bus goes away.
pub struct ControlEndpoint<'a, D> {
    hw: &'a mut D,
    request: ControlRequestHeader,
    timeout_ms: u16,
}

impl<'a, D: DeviceHardware> ControlEndpoint<'a, D> {
    /// `hw` must have the control endpoint selected.
    pub(crate) fn new(hw: &'a mut D, ctx: &UsbContext, request: ControlRequestHeader) -> Self {
        ControlEndpoint {
            hw,
            request,
            timeout_ms: ctx.options().stream_timeout_ms,
        }
    }

    /// The request being answered.
    pub fn request(&self) -> &ControlRequestHeader {
        &self.request
    }

    /// Access the controller.
    ///
    /// Reselect the control endpoint before calling any other method if you
    /// select a different endpoint.
    pub fn hardware(&mut self) -> &mut D {
        &mut *self.hw
    }

    /// Acknowledge the SETUP packet.
    pub fn accept(&mut self) {
        self.hw.clear_setup();
    }

    /// Reject the request with a STALL.
    pub fn stall(&mut self) {
        self.hw.clear_setup();
        self.hw.stall_transaction();
    }

    fn check_bus(&self) -> Result<(), StreamError> {
        if !self.hw.is_vbus_present() {
            Err(StreamError::Disconnected)
        } else if self.hw.is_bus_suspended() {
            Err(StreamError::BusSuspended)
        } else if self.hw.is_setup_received() {
            Err(StreamError::HostAborted)
        } else {
            Ok(())
        }
    }

    fn start_timeout(&self) -> SoftwareTimeout {
        SoftwareTimeout::start(self.timeout_ms, self.hw.frame_number())
    }

    fn tick(&self, timeout: &mut SoftwareTimeout) -> Result<(), StreamError> {
        timeout
            .poll(self.hw.frame_number())
            .map_err(|_| StreamError::Timeout)
    }

    /// Spin until `condition` holds.
    pub(super) fn wait_for(&mut self, condition: fn(&D) -> bool) -> Result<(), StreamError> {
        let mut timeout = self.start_timeout();
        loop {
            if condition(&*self.hw) {
                return Ok(());
            }
            self.check_bus()?;
            self.tick(&mut timeout)?;
            core::hint::spin_loop();
        }
    }

    fn write_bytes(&mut self, bytes: impl Iterator<Item = u8>, len: usize) -> Result<(), StreamError> {
        let packet_size = self.hw.max_packet_size();
        let mut remaining = len.min(usize::from(self.request.length));
        let mut bytes = bytes.take(remaining);
        if remaining == 0 {
            self.hw.clear_in();
        }

        let mut last_packet_full = false;
        let mut timeout = self.start_timeout();
        while remaining > 0 || last_packet_full {
            self.check_bus()?;
            if self.hw.is_out_received() {
                trace!("CONTROL IN ENDED BY HOST");
                break;
            }
            if self.hw.is_in_ready() {
                let mut in_bank = self.hw.bytes_in_bank();
                while in_bank < packet_size {
                    match bytes.next() {
                        Some(byte) => self.hw.write_byte(byte),
                        None => break,
                    }
                    remaining -= 1;
                    in_bank += 1;
                }
                last_packet_full = in_bank == packet_size;
                self.hw.clear_in();
                timeout = self.start_timeout();
            } else {
                self.tick(&mut timeout)?;
            }
        }

        self.wait_for(D::is_out_received)
    }

    fn read_bytes<'b>(
        &mut self,
        mut slots: impl Iterator<Item = &'b mut u8>,
        len: usize,
    ) -> Result<(), StreamError> {
        let mut remaining = len.min(usize::from(self.request.length));
        if remaining == 0 {
            self.hw.clear_out();
        }
        let mut timeout = self.start_timeout();
        while remaining > 0 {
            self.check_bus()?;
            if self.hw.is_out_received() {
                while remaining > 0 && self.hw.bytes_in_bank() > 0 {
                    let byte = self.hw.read_byte();
                    if let Some(slot) = slots.next() {
                        *slot = byte;
                    }
                    remaining -= 1;
                }
                self.hw.clear_out();
                timeout = self.start_timeout();
            } else {
                self.tick(&mut timeout)?;
            }
        }

        self.wait_for(D::is_in_ready)
    }

    /// Send `data` as the IN data stage.
    ///
    /// `data` is truncated to the request's `wLength`. Ends with a
    /// zero-length packet when the last packet was full and the host may
    /// expect more, and ends early if the host starts the status stage.
    /// Returns once the host's status packet arrives; complete the request
    /// with [`clear_status_stage`](Self::clear_status_stage).
    pub fn write_control_stream(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_bytes(data.iter().copied(), data.len())
    }

    /// [`write_control_stream`](Self::write_control_stream), in reverse byte order.
    pub fn write_control_stream_be(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_bytes(data.iter().rev().copied(), data.len())
    }

    /// Receive the OUT data stage into `buffer`.
    ///
    /// Reads at most `wLength` bytes. An empty `buffer` releases the next
    /// OUT packet unread. Returns once the control endpoint is
    /// ready for the status stage; complete the request with
    /// [`clear_status_stage`](Self::clear_status_stage).
    pub fn read_control_stream(&mut self, buffer: &mut [u8]) -> Result<(), StreamError> {
        let len = buffer.len();
        self.read_bytes(buffer.iter_mut(), len)
    }

    /// [`read_control_stream`](Self::read_control_stream), in reverse byte order.
    pub fn read_control_stream_be(&mut self, buffer: &mut [u8]) -> Result<(), StreamError> {
        let len = buffer.len();
        self.read_bytes(buffer.iter_mut().rev(), len)
    }

    /// Complete the status stage, opposite to the data stage.
    ///
    /// After an IN data stage, acknowledges the host's zero-length OUT
    /// packet. Otherwise, sends a zero-length IN packet.
    pub fn clear_status_stage(&mut self) -> Result<(), StreamError> {
        match self.request.status_stage() {
            UsbDirection::Out => {
                self.wait_for(D::is_out_received)?;
                self.hw.clear_out();
            }
            UsbDirection::In => {
                self.wait_for(D::is_in_ready)?;
                self.hw.clear_in();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;
    use crate::{
        context::{control_endpoint, Options},
        hw::Bank,
        sim::{ControlStage, SimDevice},
    };

    fn setup(header: ControlRequestHeader, data: &[u8]) -> (SimDevice, UsbContext) {
        let mut hw = SimDevice::new();
        let mut ctx = UsbContext::new(Options::new());
        ctx.init_device(&mut hw);
        hw.select_endpoint(control_endpoint());
        hw.host_setup(header, data);
        for _ in 0..ControlRequestHeader::SIZE {
            hw.read_byte();
        }
        (hw, ctx)
    }

    fn descriptor(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn write_clamps_to_length() {
        let (mut hw, ctx) = setup(ControlRequestHeader::get_device_descriptor(8), &[]);
        let request = ControlRequestHeader::get_device_descriptor(8);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        control.write_control_stream(&descriptor(18)).unwrap();
        control.clear_status_stage().unwrap();

        assert_eq!(hw.control_in_data(), &descriptor(8)[..]);
        assert_eq!(hw.control_in_packets(), &[8]);
        assert_eq!(hw.control_stage(), ControlStage::Complete);
    }

    #[test]
    fn zero_length_packet_when_shorter_than_requested() {
        let request = ControlRequestHeader::get_device_descriptor(64);
        let (mut hw, ctx) = setup(request, &[]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        control.write_control_stream(&descriptor(16)).unwrap();
        control.clear_status_stage().unwrap();

        assert_eq!(hw.control_in_packets(), &[8, 8, 0]);
        assert_eq!(hw.control_stage(), ControlStage::Complete);
    }

    #[test]
    fn no_zero_length_packet_when_length_satisfied() {
        let request = ControlRequestHeader::get_device_descriptor(16);
        let (mut hw, ctx) = setup(request, &[]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        control.write_control_stream(&descriptor(16)).unwrap();
        control.clear_status_stage().unwrap();

        assert_eq!(hw.control_in_packets(), &[8, 8]);
    }

    #[test]
    fn big_endian_write() {
        let request = ControlRequestHeader::get_device_descriptor(4);
        let (mut hw, ctx) = setup(request, &[]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        control.write_control_stream_be(&[1, 2, 3, 4]).unwrap();
        control.clear_status_stage().unwrap();
        assert_eq!(hw.control_in_data(), &[4, 3, 2, 1]);
    }

    #[test]
    fn host_abort_during_data_stage() {
        let request = ControlRequestHeader::get_device_descriptor(64);
        let (mut hw, ctx) = setup(request, &[]);
        hw.abort_control_after(1);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        assert_eq!(
            control.write_control_stream(&descriptor(40)),
            Err(StreamError::HostAborted)
        );
        assert!(hw.is_setup_received());
    }

    #[test]
    fn read_out_data_stage() {
        let request = ControlRequestHeader::new(0x21, 0x09, 0x0200, 0, 10);
        let payload = descriptor(10);
        let (mut hw, ctx) = setup(request, &payload);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        let mut buffer = [0; 10];
        control.read_control_stream(&mut buffer).unwrap();
        control.clear_status_stage().unwrap();

        assert_eq!(&buffer[..], &payload[..]);
        assert_eq!(hw.control_stage(), ControlStage::Complete);
        assert_eq!(hw.control_in_packets(), &[0]);
    }

    #[test]
    fn read_never_exceeds_length() {
        let request = ControlRequestHeader::new(0x21, 0x09, 0, 0, 3);
        let (mut hw, ctx) = setup(request, &[7, 8, 9]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        let mut buffer = [0; 6];
        control.read_control_stream_be(&mut buffer).unwrap();
        assert_eq!(buffer, [0, 0, 0, 9, 8, 7]);
    }

    #[test]
    fn empty_read_releases_packet() {
        let request = ControlRequestHeader::new(0x21, 0x09, 0, 0, 4);
        let (mut hw, ctx) = setup(request, &[1, 2, 3, 4]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        control.read_control_stream(&mut []).unwrap();
        assert!(!control.hardware().is_out_received());
        control.clear_status_stage().unwrap();
        assert_eq!(hw.control_stage(), ControlStage::Complete);
    }

    #[test]
    fn status_stage_without_data() {
        let request = ControlRequestHeader::set_configuration(1);
        let (mut hw, ctx) = setup(request, &[]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        control.clear_status_stage().unwrap();
        assert_eq!(hw.control_stage(), ControlStage::Complete);
    }

    #[test]
    fn read_times_out_without_data() {
        let request = ControlRequestHeader::new(0x21, 0x09, 0, 0, 8);
        let (mut hw, ctx) = setup(request, &[]);
        let mut control = ControlEndpoint::new(&mut hw, &ctx, request);
        control.accept();
        let mut buffer = [0; 8];
        assert_eq!(
            control.read_control_stream(&mut buffer),
            Err(StreamError::Timeout)
        );
    }
}
