//! Device role
//!
//! The device side of the engine: connection state, the [`Endpoint`]
//! adapter that lets streams run on a device endpoint, the control endpoint
//! streams, and the standard request responder. Call [`device_task`] from
//! your main loop to answer control requests.
//!
//! ```
//! # #[cfg(feature = "sim")] {
//! use usb_xfer::{
//!     context::{Options, UsbContext},
//!     device::{device_task, Endpoint},
//!     hw::{DeviceHardware, TransferDescriptor},
//!     sim::SimDevice,
//!     stream,
//! };
//! use usb_device::{endpoint::EndpointAddress, UsbDirection};
//!
//! fn bulk_in() -> EndpointAddress {
//!     EndpointAddress::from_parts(1, UsbDirection::In)
//! }
//!
//! let mut hw = SimDevice::new();
//! let mut ctx = UsbContext::new(Options::new());
//! ctx.init_device(&mut hw);
//! assert!(hw.configure_endpoint(bulk_in(), &TransferDescriptor::bulk(UsbDirection::In, 64)));
//!
//! device_task(&mut ctx, &mut hw, &mut ());
//!
//! let mut ep = Endpoint::select(&mut hw, &ctx, bulk_in());
//! stream::write_stream(&mut ep, b"hello", None).unwrap();
//! stream::finish_write(&mut ep, 5).unwrap();
//! # }
//! ```

mod control;
mod standard;

pub use control::ControlEndpoint;

use usb_device::endpoint::EndpointAddress;

use crate::{
    context::{control_endpoint, UsbContext, UsbMode},
    events::DeviceClass,
    hw::{Bank, DeviceHardware},
    stream::{Readiness, StreamPort},
};

/// USB device states.
///
/// cf §9.1 of USB 2.0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DeviceState {
    /// Not connected to a host.
    Unattached,
    /// VBUS is present, and the host hasn't reset the bus.
    Powered,
    /// Reset, and using address 0.
    Default,
    /// The host assigned an address.
    Addressed,
    /// The host selected a configuration.
    Configured,
    /// The host suspended the bus.
    Suspended,
}

/// Connection state shared by the dispatcher and the control responder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DeviceConnectionState {
    pub is_connected: bool,
    pub is_suspended: bool,
    /// Active configuration; 0 when unconfigured.
    pub current_configuration: u8,
    pub state: DeviceState,
    /// The state to return to on wake up.
    pub state_before_suspend: DeviceState,
    /// The host enabled remote wake up.
    pub remote_wakeup_enabled: bool,
}

impl DeviceConnectionState {
    pub const fn new() -> Self {
        DeviceConnectionState {
            is_connected: false,
            is_suspended: false,
            current_configuration: 0,
            state: DeviceState::Unattached,
            state_before_suspend: DeviceState::Unattached,
            remote_wakeup_enabled: false,
        }
    }
}

impl Default for DeviceConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// A selected device endpoint that streams can use.
///
/// Selecting the endpoint happens when the adapter is created. Streams on an
/// IN endpoint write, and streams on an OUT endpoint read.
pub struct Endpoint<'a, D> {
    hw: &'a mut D,
    address: EndpointAddress,
    timeout_ms: u16,
}

impl<'a, D: DeviceHardware> Endpoint<'a, D> {
    /// Select the endpoint at `address`.
    pub fn select(hw: &'a mut D, ctx: &UsbContext, address: EndpointAddress) -> Self {
        hw.select_endpoint(address);
        Endpoint {
            hw,
            address,
            timeout_ms: ctx.options().stream_timeout_ms,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    /// Access the controller, with this endpoint selected.
    pub fn hardware(&mut self) -> &mut D {
        &mut *self.hw
    }

    /// Halt the endpoint. The host must clear the halt.
    pub fn stall(&mut self) {
        self.hw.stall_transaction();
    }

    /// Clear a halt, and reset the endpoint's data toggle.
    pub fn clear_stall(&mut self) {
        self.hw.clear_stall();
        self.hw.reset_data_toggle();
    }
}

impl<D: DeviceHardware> Bank for Endpoint<'_, D> {
    fn max_packet_size(&self) -> u16 {
        self.hw.max_packet_size()
    }
    fn bytes_in_bank(&self) -> u16 {
        self.hw.bytes_in_bank()
    }
    fn is_read_write_allowed(&self) -> bool {
        self.hw.is_read_write_allowed()
    }
    fn read_byte(&mut self) -> u8 {
        self.hw.read_byte()
    }
    fn write_byte(&mut self, byte: u8) {
        self.hw.write_byte(byte)
    }
    fn is_stalled(&self) -> bool {
        self.hw.is_stalled()
    }
    fn clear_stall(&mut self) {
        self.hw.clear_stall()
    }
    fn frame_number(&self) -> u16 {
        self.hw.frame_number()
    }
}

impl<D: DeviceHardware> StreamPort for Endpoint<'_, D> {
    fn readiness(&self) -> Readiness {
        let ready = if self.address.is_in() {
            self.hw.is_in_ready()
        } else {
            self.hw.is_out_received()
        };
        if ready {
            Readiness::Ready
        } else if self.hw.is_stalled() {
            Readiness::Stalled
        } else if !self.hw.is_vbus_present() {
            Readiness::Disconnected
        } else if self.hw.is_bus_suspended() {
            Readiness::Suspended
        } else {
            Readiness::Busy
        }
    }

    fn release_written(&mut self) {
        self.hw.clear_in();
    }

    fn release_read(&mut self) {
        self.hw.clear_out();
    }

    fn timeout_ms(&self) -> u16 {
        self.timeout_ms
    }
}

/// Answer a pending control request, if there is one.
///
/// Does nothing unless the device role is active and connected. Restores
/// the previously selected endpoint before returning.
pub fn device_task<D, C>(ctx: &mut UsbContext, hw: &mut D, class: &mut C)
where
    D: DeviceHardware,
    C: DeviceClass,
{
    if ctx.mode() != UsbMode::Device || !ctx.is_connected() {
        return;
    }
    let previous = hw.selected_endpoint();
    hw.select_endpoint(control_endpoint());
    if hw.is_setup_received() {
        standard::process_control_request(ctx, hw, class);
    }
    hw.select_endpoint(previous);
}

/// Ask the host to resume a suspended bus.
///
/// Only signals if the host enabled remote wake up, and the device is
/// suspended; otherwise returns `false`. Restarts the PLL (unless the
/// application manages it) and unfreezes the clock before signalling. The
/// host answers by resuming the bus, which raises the wake up interrupt.
pub fn send_remote_wakeup<D: DeviceHardware>(ctx: &UsbContext, hw: &mut D) -> bool {
    if ctx.mode() != UsbMode::Device
        || !ctx.connection().remote_wakeup_enabled
        || !ctx.is_suspended()
    {
        return false;
    }
    if !ctx.options().manual_pll {
        hw.set_pll(true);
    }
    hw.set_clock_frozen(false);
    hw.send_remote_wakeup();
    debug!("REMOTE WAKEUP");
    true
}
