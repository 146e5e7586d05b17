//! Control transactions on the default control pipe

use usb_device::UsbDirection;

use super::{check_pipe, ControlError};
use crate::{
    context::{UsbContext, UsbMode},
    hw::{HostHardware, PipeAddress, PipeToken},
    request::ControlRequestHeader,
    timeout::SoftwareTimeout,
};

/// One control transaction in progress.
///
/// Owns the controller for the transaction. Dropping it freezes and flushes
/// the control pipe, and restores the bus suspend state, whichever way the
/// transaction ended.
struct Transaction<'a, H: HostHardware> {
    hw: &'a mut H,
    bus_suspended: bool,
    timeout: SoftwareTimeout,
}

impl<'a, H: HostHardware> Transaction<'a, H> {
    fn begin(hw: &'a mut H, ctx: &UsbContext) -> Self {
        let bus_suspended = hw.is_bus_suspended();
        hw.resume_bus();
        hw.select_pipe(PipeAddress::CONTROL);
        let timeout = SoftwareTimeout::start(ctx.options().control_timeout_ms, hw.frame_number());
        Transaction {
            hw,
            bus_suspended,
            timeout,
        }
    }

    fn tick(&mut self) -> Result<(), ControlError> {
        self.timeout.poll(self.hw.frame_number()).map_err(|_| {
            warn!("CONTROL TIMEOUT");
            ControlError::SoftwareTimeout
        })
    }

    /// Spin until `condition` holds, the pipe fails, or the transaction
    /// times out.
    fn wait_for(&mut self, condition: fn(&H) -> bool) -> Result<(), ControlError> {
        loop {
            if condition(&*self.hw) {
                return Ok(());
            }
            check_pipe(self.hw)?;
            self.tick()?;
            core::hint::spin_loop();
        }
    }

    /// Wait for the start of the next frame.
    fn wait_frame(&mut self) -> Result<(), ControlError> {
        let remaining = self.timeout.remaining_ms();
        while self.timeout.remaining_ms() == remaining {
            if !self.hw.is_device_connected() {
                return Err(ControlError::DeviceDisconnected);
            }
            self.tick()?;
        }
        Ok(())
    }

    fn send_setup(&mut self, request: &ControlRequestHeader) -> Result<(), ControlError> {
        self.hw.set_token(PipeToken::Setup);
        self.hw.clear_error();
        self.hw.clear_setup_sent();
        self.hw.unfreeze();
        for byte in request.to_bytes() {
            self.hw.write_byte(byte);
        }
        self.hw.clear_out();

        self.wait_for(H::is_setup_sent)?;
        self.hw.clear_setup_sent();
        self.hw.freeze();
        self.wait_frame()
    }

    /// Receive up to `length` bytes, storing what fits in `buffer`.
    ///
    /// Ends on a short packet, or once `length` bytes arrived. Returns the
    /// number of bytes stored.
    fn receive(&mut self, buffer: &mut [u8], length: usize) -> Result<usize, ControlError> {
        let packet_size = usize::from(self.hw.max_packet_size());
        let mut received = 0;
        let mut stored = 0;
        self.hw.set_token(PipeToken::In);
        loop {
            self.hw.unfreeze();
            self.wait_for(H::is_in_received)?;
            let packet = usize::from(self.hw.bytes_in_bank());
            for _ in 0..packet {
                let byte = self.hw.read_byte();
                if let Some(slot) = buffer.get_mut(stored) {
                    *slot = byte;
                    stored += 1;
                }
            }
            received += packet;
            self.hw.freeze();
            self.hw.clear_in();
            if packet < packet_size || received >= length {
                return Ok(stored);
            }
        }
    }

    /// Send `data`, split into packets of the pipe's size.
    fn send(&mut self, data: &[u8]) -> Result<(), ControlError> {
        let packet_size = usize::from(self.hw.max_packet_size()).max(1);
        self.hw.set_token(PipeToken::Out);
        self.hw.unfreeze();
        for packet in data.chunks(packet_size) {
            self.wait_for(H::is_out_ready)?;
            for &byte in packet {
                self.hw.write_byte(byte);
            }
            self.hw.clear_out();
        }
        self.wait_for(H::is_out_ready)?;
        self.hw.freeze();
        Ok(())
    }

    /// The status stage runs opposite to the data stage, and carries no data.
    fn status(&mut self, direction: UsbDirection) -> Result<(), ControlError> {
        match direction {
            UsbDirection::Out => {
                self.hw.set_token(PipeToken::Out);
                self.hw.unfreeze();
                self.wait_for(H::is_out_ready)?;
                self.hw.clear_out();
                self.wait_for(H::is_out_ready)?;
            }
            UsbDirection::In => {
                self.hw.set_token(PipeToken::In);
                self.hw.unfreeze();
                self.wait_for(H::is_in_received)?;
                self.hw.clear_in();
            }
        }
        Ok(())
    }
}

impl<H: HostHardware> Drop for Transaction<'_, H> {
    fn drop(&mut self) {
        self.hw.select_pipe(PipeAddress::CONTROL);
        self.hw.freeze();
        if self.bus_suspended {
            self.hw.suspend_bus();
        }
        self.hw.reset_pipe(PipeAddress::CONTROL);
    }
}

/// Send `request` on the control pipe, and run its data and status stages.
///
/// For requests with an IN data stage, the response is stored in `buffer`;
/// bytes beyond the buffer are consumed and dropped. For requests with an
/// OUT data stage, `buffer` holds the data to send. Either way, the data
/// stage moves at most `wLength` bytes, and is skipped without a buffer.
///
/// Returns the number of data bytes moved. The whole transaction must
/// complete within the control timeout. Leaves the control pipe selected
/// and frozen.
pub fn send_control_request<H: HostHardware>(
    ctx: &UsbContext,
    hw: &mut H,
    request: &ControlRequestHeader,
    buffer: Option<&mut [u8]>,
) -> Result<usize, ControlError> {
    if ctx.mode() != UsbMode::Host {
        return Err(ControlError::DeviceDisconnected);
    }
    debug!(
        "CONTROL REQUEST {:#04x} {:#04x} {:#06x} {:#06x} {}",
        request.request_type, request.request, request.value, request.index, request.length
    );

    let mut transaction = Transaction::begin(hw, ctx);
    transaction.wait_frame()?;
    transaction.send_setup(request)?;

    let length = usize::from(request.length);
    let data_stage = request.data_stage().zip(buffer);
    let moved = match data_stage {
        Some((UsbDirection::In, buffer)) => transaction.receive(buffer, length)?,
        Some((UsbDirection::Out, buffer)) => {
            let data = &buffer[..buffer.len().min(length)];
            transaction.send(data)?;
            data.len()
        }
        None => 0,
    };

    transaction.status(request.status_stage())?;
    Ok(moved)
}
