//! Hardware endpoint and pipe capability
//!
//! The transfer engine never touches registers. Instead, it drives an
//! implementation of these traits: [`DeviceHardware`] for the device role,
//! and [`HostHardware`] for the host role. Both build on [`Bank`], the
//! byte-level view of whichever endpoint or pipe is currently selected.
//!
//! An implementation exists per controller architecture (AVR8 `UEDATX`
//! style data registers, AVR32 FIFO windows, ...). The [`sim`](crate::sim)
//! module provides a software controller for both roles.

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::context::Speed;

/// USB transfer type of an endpoint or pipe.
///
/// cf §9.6.6 of USB 2.0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Number of hardware banks backing an endpoint or pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum BankCount {
    /// One bank. The application and the controller take turns.
    #[default]
    Single = 1,
    /// Two banks. The application fills one while the controller
    /// transmits the other.
    Double = 2,
}

/// Describes how an endpoint or pipe should be configured.
///
/// Created by the application or class driver. Once handed to
/// [`DeviceHardware::configure_endpoint`] or [`HostHardware::configure_pipe`],
/// the hardware owns the configuration until the endpoint is reconfigured,
/// or until the controller is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct TransferDescriptor {
    pub transfer_type: TransferType,
    pub direction: UsbDirection,
    pub max_packet_size: u16,
    pub banks: BankCount,
}

impl TransferDescriptor {
    /// A single-bank control descriptor.
    ///
    /// Control endpoints are bidirectional; the direction is nominally OUT.
    pub const fn control(max_packet_size: u16) -> Self {
        Self::new(TransferType::Control, UsbDirection::Out, max_packet_size)
    }

    /// A single-bank bulk descriptor.
    pub const fn bulk(direction: UsbDirection, max_packet_size: u16) -> Self {
        Self::new(TransferType::Bulk, direction, max_packet_size)
    }

    /// A single-bank interrupt descriptor.
    pub const fn interrupt(direction: UsbDirection, max_packet_size: u16) -> Self {
        Self::new(TransferType::Interrupt, direction, max_packet_size)
    }

    /// A single-bank isochronous descriptor.
    pub const fn isochronous(direction: UsbDirection, max_packet_size: u16) -> Self {
        Self::new(TransferType::Isochronous, direction, max_packet_size)
    }

    const fn new(transfer_type: TransferType, direction: UsbDirection, max_packet_size: u16) -> Self {
        TransferDescriptor {
            transfer_type,
            direction,
            max_packet_size,
            banks: BankCount::Single,
        }
    }

    /// Use `banks` for this endpoint or pipe.
    pub const fn with_banks(mut self, banks: BankCount) -> Self {
        self.banks = banks;
        self
    }

    /// Returns the number of bytes of bank memory this configuration needs.
    pub const fn bank_memory(&self) -> usize {
        self.max_packet_size as usize * self.banks as usize
    }
}

/// Address of a host pipe.
///
/// Pipes are numbered independently of device endpoints. Pipe 0 is the
/// default control pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PipeAddress(u8);

impl PipeAddress {
    /// The default control pipe.
    pub const CONTROL: PipeAddress = PipeAddress(0);

    /// Construct a pipe address from a pipe number (0 - 15) and a direction.
    ///
    /// The number is masked to four bits.
    pub const fn from_parts(index: u8, direction: UsbDirection) -> Self {
        PipeAddress((index & 0x0F) | direction as u8)
    }

    /// Returns the pipe number.
    pub const fn index(self) -> usize {
        (self.0 & 0x0F) as usize
    }

    /// Returns the direction bit of this pipe.
    pub fn direction(self) -> UsbDirection {
        UsbDirection::from(self.0)
    }
}

impl From<PipeAddress> for u8 {
    fn from(pipe: PipeAddress) -> u8 {
        pipe.0
    }
}

/// Token issued by the selected pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum PipeToken {
    Setup,
    In,
    Out,
}

/// Byte-level access to the currently selected endpoint or pipe bank.
///
/// Every method acts on the endpoint or pipe chosen by the most recent
/// `select_*` call.
pub trait Bank {
    /// Returns the configured max packet size of the selected bank.
    fn max_packet_size(&self) -> u16;

    /// Returns the number of bytes currently held in the selected bank.
    ///
    /// For an OUT endpoint or IN pipe, this is the number of unread bytes.
    /// For an IN endpoint or OUT pipe, this is the number of bytes written
    /// and not yet sent.
    fn bytes_in_bank(&self) -> u16;

    /// Indicates if the application may read from (full bank) or write to
    /// (bank not yet full) the selected bank.
    fn is_read_write_allowed(&self) -> bool;

    /// Read the next byte from the selected bank.
    fn read_byte(&mut self) -> u8;

    /// Append a byte to the selected bank.
    fn write_byte(&mut self, byte: u8);

    /// Indicates if the selected endpoint is halted, or if the selected pipe
    /// received a STALL handshake.
    fn is_stalled(&self) -> bool;

    /// Clear the stall condition on the selected endpoint or pipe.
    fn clear_stall(&mut self);

    /// Returns the current USB frame number.
    ///
    /// The frame number advances once per millisecond while the bus is
    /// active. Software timeouts count frame changes.
    fn frame_number(&self) -> u16;
}

/// Device-role controller capability.
///
/// Endpoint 0 is the control endpoint. Selecting either direction of
/// endpoint 0 selects the same control bank; `is_in_ready`,
/// `is_out_received` and `is_setup_received` all report on it.
pub trait DeviceHardware: Bank {
    /// Select an endpoint. Subsequent bank operations apply to it.
    fn select_endpoint(&mut self, address: EndpointAddress);

    /// Returns the currently selected endpoint.
    fn selected_endpoint(&self) -> EndpointAddress;

    /// Configure the endpoint at `address`.
    ///
    /// Returns `false` if the hardware could not satisfy the descriptor
    /// (bad size, or out of bank memory). Leaves the endpoint selected.
    fn configure_endpoint(&mut self, address: EndpointAddress, descriptor: &TransferDescriptor)
        -> bool;

    /// Indicates if the selected endpoint is configured.
    fn is_endpoint_configured(&self) -> bool;

    /// Disable and deallocate every endpoint.
    fn disable_endpoints(&mut self);

    /// Flush the banks of the endpoint at `address`.
    fn reset_endpoint(&mut self, address: EndpointAddress);

    /// Indicates if the selected IN endpoint can accept data.
    fn is_in_ready(&self) -> bool;

    /// Indicates if the selected OUT endpoint holds a received packet.
    fn is_out_received(&self) -> bool;

    /// Indicates if the control endpoint holds a SETUP packet.
    fn is_setup_received(&self) -> bool;

    /// Send the selected IN bank as a packet (zero-length if empty).
    fn clear_in(&mut self);

    /// Release the selected OUT bank, discarding unread bytes.
    fn clear_out(&mut self);

    /// Acknowledge the SETUP packet on the control endpoint.
    fn clear_setup(&mut self);

    /// Respond to the next transaction on the selected endpoint with STALL.
    fn stall_transaction(&mut self);

    /// Reset the data toggle of the selected endpoint to DATA0.
    fn reset_data_toggle(&mut self);

    /// Apply a new device address.
    fn set_device_address(&mut self, address: u8);

    /// Select the signalling speed. Applies from the next attach.
    fn set_speed(&mut self, speed: Speed);

    /// Connect the device to the bus (enable the pull-up).
    fn attach(&mut self);

    /// Disconnect the device from the bus.
    fn detach(&mut self);

    /// Indicates if VBUS is present.
    fn is_vbus_present(&self) -> bool;

    /// Indicates if the bus is currently suspended.
    fn is_bus_suspended(&self) -> bool;

    /// Freeze (`true`) or unfreeze (`false`) the USB clock.
    fn set_clock_frozen(&mut self, frozen: bool);

    /// Signal resume on the suspended bus, and return once the signalling
    /// finished. The clock is running when this is called.
    fn send_remote_wakeup(&mut self);

    /// Start or stop the USB PLL.
    ///
    /// Not called when the application manages the PLL. The default does
    /// nothing, for controllers without a dedicated PLL.
    fn set_pll(&mut self, on: bool) {
        let _ = on;
    }
}

/// Host-role controller capability.
pub trait HostHardware: Bank {
    /// Number of pipes, including the control pipe.
    const PIPE_COUNT: u8;

    /// Select a pipe. Subsequent bank operations apply to it.
    fn select_pipe(&mut self, pipe: PipeAddress);

    /// Returns the currently selected pipe.
    fn selected_pipe(&self) -> PipeAddress;

    /// Configure `pipe` to talk to `endpoint` of the attached device.
    ///
    /// Returns `false` if the hardware could not satisfy the descriptor.
    /// Leaves the pipe selected.
    fn configure_pipe(
        &mut self,
        pipe: PipeAddress,
        descriptor: &TransferDescriptor,
        endpoint: EndpointAddress,
    ) -> bool;

    /// Indicates if the selected pipe is configured.
    fn is_pipe_configured(&self) -> bool;

    /// Returns the device endpoint the selected pipe is bound to.
    fn bound_endpoint(&self) -> EndpointAddress;

    /// Disable and deallocate every pipe.
    fn disable_pipes(&mut self);

    /// Flush the banks and error state of `pipe`.
    ///
    /// Does not change the pipe's frozen state.
    fn reset_pipe(&mut self, pipe: PipeAddress);

    /// Set the token issued by the selected pipe.
    fn set_token(&mut self, token: PipeToken);

    /// Returns the token issued by the selected pipe.
    fn token(&self) -> PipeToken;

    /// Stop the selected pipe from issuing tokens.
    fn freeze(&mut self);

    /// Allow the selected pipe to issue tokens.
    fn unfreeze(&mut self);

    /// Indicates if the selected pipe is frozen.
    fn is_frozen(&self) -> bool;

    /// Indicates if the device acknowledged the SETUP packet.
    fn is_setup_sent(&self) -> bool;

    /// Acknowledge the SETUP-sent condition.
    fn clear_setup_sent(&mut self);

    /// Indicates if the selected IN pipe holds a received packet.
    fn is_in_received(&self) -> bool;

    /// Indicates if the selected OUT pipe can accept data.
    fn is_out_ready(&self) -> bool;

    /// Release the selected IN bank, discarding unread bytes.
    fn clear_in(&mut self);

    /// Send the selected OUT (or SETUP) bank as a packet.
    fn clear_out(&mut self);

    /// Indicates if the selected pipe detected a transfer error
    /// (CRC, timeout, data toggle, ...).
    fn is_error(&self) -> bool;

    /// Clear the selected pipe's error flags.
    fn clear_error(&mut self);

    /// Begin signaling a bus reset.
    fn reset_bus(&mut self);

    /// Indicates that the bus reset started by `reset_bus` completed.
    fn is_bus_reset_complete(&self) -> bool;

    /// Stop generating start of frame packets.
    fn suspend_bus(&mut self);

    /// Resume generating start of frame packets.
    fn resume_bus(&mut self);

    /// Indicates if start of frame generation is stopped.
    fn is_bus_suspended(&self) -> bool;

    /// Address all pipes to the device at `address`.
    fn set_device_address(&mut self, address: u8);

    /// Indicates if a device is electrically attached to the bus.
    fn is_device_connected(&self) -> bool;

    /// Drive (`true`) or stop driving (`false`) VBUS.
    fn set_vbus(&mut self, on: bool);

    /// Block for `ms` milliseconds, without relying on bus frames.
    fn delay_ms(&mut self, ms: u16);
}
