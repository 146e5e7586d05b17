//! Host role
//!
//! The host side of the engine: the attached-device lifecycle
//! ([`HostState`]), the [`Pipe`] adapter that lets streams run on a pipe,
//! control transactions on the default control pipe, and the enumeration
//! state machine. Call [`host_task`] from your main loop; each call advances
//! enumeration by at most one step.
//!
//! ```
//! # #[cfg(feature = "sim")] {
//! use usb_xfer::{
//!     context::{Options, UsbContext},
//!     dispatch::{dispatch_host, InterruptFlags, InterruptSource},
//!     host::{host_task, HostState},
//!     sim::SimHost,
//! };
//!
//! static USB_IRQ: InterruptSource = InterruptSource::new();
//!
//! let mut hw = SimHost::default();
//! let mut ctx = UsbContext::new(Options::new().with_device_settle_delay_ms(10));
//! ctx.init_host(&mut hw);
//!
//! hw.plug();
//! USB_IRQ.raise(InterruptFlags::SRP);
//! dispatch_host(&mut ctx, &mut hw, &USB_IRQ, &mut ());
//!
//! while ctx.host_state() != HostState::Addressed {
//!     host_task(&mut ctx, &mut hw, &mut ());
//! }
//! # }
//! ```

mod control;
mod enumeration;
pub mod requests;

pub use control::send_control_request;
pub use enumeration::host_task;

use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::{
    context::UsbContext,
    hw::{Bank, HostHardware, PipeAddress, PipeToken},
    stream::{Readiness, StreamPort},
};

/// A state that [`HostState::WaitingFor`] moves to once its wait elapses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum NextState {
    PoweredDoReset,
    PoweredConfigPipe,
    DefaultPostReset,
    DefaultPostAddressSet,
}

impl From<NextState> for HostState {
    fn from(next: NextState) -> Self {
        match next {
            NextState::PoweredDoReset => HostState::PoweredDoReset,
            NextState::PoweredConfigPipe => HostState::PoweredConfigPipe,
            NextState::DefaultPostReset => HostState::DefaultPostReset,
            NextState::DefaultPostAddressSet => HostState::DefaultPostAddressSet,
        }
    }
}

/// Lifecycle of the attached device.
///
/// Enumeration moves through these states in declaration order, from
/// `Unattached` to `Addressed`. `Configured` and `Suspended` belong to the
/// application. Any state may fall back to `WaitForDeviceRemoval` or
/// `Unattached`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum HostState {
    /// Enumeration failed. Waiting for the device to go away.
    WaitForDeviceRemoval,
    /// A non-blocking wait, counted in bus frames.
    WaitingFor { next: NextState, remaining_ms: u16 },
    /// No device attached.
    Unattached,
    /// A device was attached.
    Powered,
    /// Letting the newly attached device settle.
    PoweredWaitForDeviceSettle { remaining_ms: u16 },
    /// VBUS is on; waiting for the device to connect.
    PoweredWaitForConnect,
    PoweredDoReset,
    /// Configure the control pipe at the default size.
    PoweredConfigPipe,
    /// Read the device's control endpoint size.
    Default,
    /// Reconfigure the control pipe, and assign an address.
    DefaultPostReset,
    /// Switch to the assigned address.
    DefaultPostAddressSet,
    /// Enumerated. The application takes over.
    Addressed,
    Configured,
    Suspended,
}

impl HostState {
    /// Indicates if the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: HostState) -> bool {
        use HostState::*;
        match (self, to) {
            (_, WaitForDeviceRemoval | Unattached) => true,
            (WaitingFor { next, .. }, WaitingFor { next: after, .. }) => next == after,
            (WaitingFor { next, .. }, to) => HostState::from(next) == to,
            (from, WaitingFor { next, .. }) => from.can_transition_to(next.into()),
            (Unattached, Powered)
            | (Powered, PoweredWaitForDeviceSettle { .. })
            | (PoweredWaitForDeviceSettle { .. }, PoweredWaitForDeviceSettle { .. })
            | (PoweredWaitForDeviceSettle { .. }, PoweredWaitForConnect)
            | (PoweredWaitForConnect, PoweredDoReset)
            | (PoweredDoReset, PoweredConfigPipe)
            | (PoweredConfigPipe, Default)
            | (Default, DefaultPostReset)
            | (DefaultPostReset, DefaultPostAddressSet)
            | (DefaultPostAddressSet, Addressed)
            | (Addressed, Configured)
            | (Configured, Addressed | Suspended)
            | (Suspended, Configured) => true,
            _ => false,
        }
    }
}

/// A host state change that the state machine doesn't allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct InvalidTransition {
    pub from: HostState,
    pub to: HostState,
}

/// Control transaction errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ControlError {
    /// The device went away.
    DeviceDisconnected,
    /// The control pipe reported a transfer error.
    PipeError,
    /// The device stalled the request.
    SetupStalled,
    /// The transaction did not complete within the control timeout.
    SoftwareTimeout,
}

impl ControlError {
    /// Returns the numeric code of this error. Success is code 0.
    pub const fn code(self) -> u8 {
        match self {
            ControlError::DeviceDisconnected => 1,
            ControlError::PipeError => 2,
            ControlError::SetupStalled => 3,
            ControlError::SoftwareTimeout => 4,
        }
    }
}

/// Why enumeration stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum EnumerationError {
    /// A settle wait failed.
    WaitStage(ControlError),
    /// The controller reported a bus connection error.
    NoDeviceDetected,
    /// A control request failed.
    ControlError(ControlError),
    /// The control pipe could not be configured.
    PipeConfigError,
}

impl EnumerationError {
    /// Returns the numeric code of this error.
    pub const fn code(self) -> u8 {
        match self {
            EnumerationError::WaitStage(_) => 1,
            EnumerationError::NoDeviceDetected => 2,
            EnumerationError::ControlError(_) => 3,
            EnumerationError::PipeConfigError => 4,
        }
    }

    /// Returns the code of the underlying error, or 0.
    pub const fn sub_code(self) -> u8 {
        match self {
            EnumerationError::WaitStage(err) | EnumerationError::ControlError(err) => err.code(),
            EnumerationError::NoDeviceDetected | EnumerationError::PipeConfigError => 0,
        }
    }
}

/// Host controller faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum HostError {
    /// VBUS dropped below its valid level.
    VbusVoltageDip,
}

impl HostError {
    pub const fn code(self) -> u8 {
        match self {
            HostError::VbusVoltageDip => 0,
        }
    }
}

/// Check the selected pipe for conditions that end any wait.
///
/// Error and stall flags are cleared once reported.
fn check_pipe<H: HostHardware>(hw: &mut H) -> Result<(), ControlError> {
    if !hw.is_device_connected() {
        Err(ControlError::DeviceDisconnected)
    } else if hw.is_error() {
        hw.clear_error();
        Err(ControlError::PipeError)
    } else if hw.is_stalled() {
        hw.clear_stall();
        Err(ControlError::SetupStalled)
    } else {
        Ok(())
    }
}

/// Wait for `ms` bus frames.
///
/// Resumes the bus for the duration of the wait, and suspends it again if it
/// was suspended. Fails early if the device disconnects, or if the selected
/// pipe reports an error or a stall.
pub fn wait_ms<H: HostHardware>(hw: &mut H, ms: u16) -> Result<(), ControlError> {
    let bus_suspended = hw.is_bus_suspended();
    hw.resume_bus();

    let mut result = Ok(());
    let mut remaining = ms;
    let mut frame = hw.frame_number();
    while remaining > 0 {
        if let Err(err) = check_pipe(hw) {
            result = Err(err);
            break;
        }
        let now = hw.frame_number();
        if now != frame {
            frame = now;
            remaining -= 1;
        }
    }

    if bus_suspended {
        hw.suspend_bus();
    }
    result
}

/// Reset the attached device with a bus reset.
///
/// Blocks until the reset completes, then looks for bus frames for up to
/// 10ms. Leaves the bus suspended if it was suspended.
pub fn reset_device<H: HostHardware>(hw: &mut H) {
    let bus_suspended = hw.is_bus_suspended();
    hw.reset_bus();
    while !hw.is_bus_reset_complete() {}
    hw.resume_bus();

    let frame = hw.frame_number();
    for _ in 0..10 {
        if hw.frame_number() != frame {
            break;
        }
        hw.delay_ms(1);
    }

    if bus_suspended {
        hw.suspend_bus();
    }
    trace!("DEVICE RESET");
}

/// Indicates if a configured pipe is bound to `endpoint`.
///
/// Restores the selected pipe before returning.
pub fn is_endpoint_bound<H: HostHardware>(hw: &mut H, endpoint: EndpointAddress) -> bool {
    let previous = hw.selected_pipe();
    let bound = (0..H::PIPE_COUNT).any(|index| {
        hw.select_pipe(PipeAddress::from_parts(index, UsbDirection::Out));
        let bound = hw.bound_endpoint();
        hw.is_pipe_configured()
            && bound.index() == endpoint.index()
            && (endpoint.index() == 0 || bound.direction() == endpoint.direction())
    });
    hw.select_pipe(previous);
    bound
}

/// A selected host pipe that streams can use.
///
/// Selecting the pipe happens when the adapter is created. Streams on an IN
/// pipe read, and streams on an OUT pipe write. The pipe must be unfrozen to
/// issue tokens.
pub struct Pipe<'a, H> {
    hw: &'a mut H,
    pipe: PipeAddress,
    timeout_ms: u16,
}

impl<'a, H: HostHardware> Pipe<'a, H> {
    /// Select `pipe`.
    pub fn select(hw: &'a mut H, ctx: &UsbContext, pipe: PipeAddress) -> Self {
        hw.select_pipe(pipe);
        Pipe {
            hw,
            pipe,
            timeout_ms: ctx.options().stream_timeout_ms,
        }
    }

    pub fn address(&self) -> PipeAddress {
        self.pipe
    }

    /// Access the controller, with this pipe selected.
    pub fn hardware(&mut self) -> &mut H {
        &mut *self.hw
    }

    pub fn freeze(&mut self) {
        self.hw.freeze();
    }

    pub fn unfreeze(&mut self) {
        self.hw.unfreeze();
    }
}

impl<H: HostHardware> Bank for Pipe<'_, H> {
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

impl<H: HostHardware> StreamPort for Pipe<'_, H> {
    fn readiness(&self) -> Readiness {
        let ready = match self.hw.token() {
            PipeToken::In => self.hw.is_in_received(),
            PipeToken::Out | PipeToken::Setup => self.hw.is_out_ready(),
        };
        if ready {
            Readiness::Ready
        } else if self.hw.is_stalled() {
            Readiness::Stalled
        } else if !self.hw.is_device_connected() {
            Readiness::Disconnected
        } else if self.hw.is_bus_suspended() {
            Readiness::Suspended
        } else {
            Readiness::Busy
        }
    }

    fn release_written(&mut self) {
        self.hw.clear_out();
    }

    fn release_read(&mut self) {
        self.hw.clear_in();
    }

    fn timeout_ms(&self) -> u16 {
        self.timeout_ms
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec::Vec;

    use super::*;
    use crate::{
        context::Options,
        hw::TransferDescriptor,
        sim::{Behavior, SimHost},
        stream::{self, StreamError},
    };

    fn bulk_in() -> EndpointAddress {
        EndpointAddress::from_parts(1, UsbDirection::In)
    }

    fn bulk_out() -> EndpointAddress {
        EndpointAddress::from_parts(2, UsbDirection::Out)
    }
    const PIPE_IN: PipeAddress = PipeAddress::from_parts(1, UsbDirection::In);
    const PIPE_OUT: PipeAddress = PipeAddress::from_parts(2, UsbDirection::Out);

    fn connected() -> (SimHost, UsbContext) {
        let mut hw = SimHost::new(Behavior::Responsive);
        let mut ctx = UsbContext::new(Options::new());
        ctx.init_host(&mut hw);
        hw.plug();
        hw.resume_bus();
        (hw, ctx)
    }

    #[test]
    fn transitions_follow_the_enumeration_order() {
        let path = [
            HostState::Unattached,
            HostState::Powered,
            HostState::PoweredWaitForDeviceSettle { remaining_ms: 2 },
            HostState::PoweredWaitForDeviceSettle { remaining_ms: 1 },
            HostState::PoweredWaitForConnect,
            HostState::WaitingFor {
                next: NextState::PoweredDoReset,
                remaining_ms: 100,
            },
            HostState::WaitingFor {
                next: NextState::PoweredDoReset,
                remaining_ms: 99,
            },
            HostState::PoweredDoReset,
            HostState::PoweredConfigPipe,
            HostState::Default,
            HostState::DefaultPostReset,
            HostState::DefaultPostAddressSet,
            HostState::Addressed,
            HostState::Configured,
            HostState::Suspended,
            HostState::Configured,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!HostState::Unattached.can_transition_to(HostState::Addressed));
        assert!(!HostState::Powered.can_transition_to(HostState::Default));
        assert!(!HostState::WaitingFor {
            next: NextState::PoweredConfigPipe,
            remaining_ms: 1
        }
        .can_transition_to(HostState::Default));
        assert!(!HostState::PoweredWaitForConnect.can_transition_to(HostState::WaitingFor {
            next: NextState::DefaultPostReset,
            remaining_ms: 10
        }));
        for from in [HostState::Default, HostState::Configured, HostState::Powered] {
            assert!(from.can_transition_to(HostState::WaitForDeviceRemoval));
            assert!(from.can_transition_to(HostState::Unattached));
        }
    }

    #[test]
    fn error_codes() {
        let err = EnumerationError::ControlError(ControlError::SoftwareTimeout);
        assert_eq!((err.code(), err.sub_code()), (3, 4));
        let err = EnumerationError::WaitStage(ControlError::DeviceDisconnected);
        assert_eq!((err.code(), err.sub_code()), (1, 1));
        assert_eq!(EnumerationError::PipeConfigError.sub_code(), 0);
    }

    #[test]
    fn wait_restores_suspended_bus() {
        let (mut hw, _ctx) = connected();
        hw.suspend_bus();
        assert_eq!(wait_ms(&mut hw, 5), Ok(()));
        assert!(hw.is_bus_suspended());
    }

    #[test]
    fn wait_reports_disconnect() {
        let (mut hw, _ctx) = connected();
        hw.unplug();
        assert_eq!(wait_ms(&mut hw, 5), Err(ControlError::DeviceDisconnected));
    }

    #[test]
    fn wait_reports_pipe_error_once() {
        let (mut hw, _ctx) = connected();
        hw.inject_error(0);
        hw.select_pipe(PipeAddress::CONTROL);
        assert_eq!(wait_ms(&mut hw, 5), Err(ControlError::PipeError));
        assert_eq!(wait_ms(&mut hw, 5), Ok(()));
    }

    #[test]
    fn reset_keeps_bus_state() {
        let (mut hw, _ctx) = connected();
        hw.suspend_bus();
        reset_device(&mut hw);
        assert_eq!(hw.bus_resets(), 1);
        assert!(hw.is_bus_suspended());
    }

    #[test]
    fn bound_endpoints() {
        let (mut hw, _ctx) = connected();
        assert!(hw.configure_pipe(PIPE_IN, &TransferDescriptor::bulk(UsbDirection::In, 64), bulk_in()));
        hw.select_pipe(PipeAddress::CONTROL);

        assert!(is_endpoint_bound(&mut hw, bulk_in()));
        assert!(!is_endpoint_bound(&mut hw, bulk_out()));
        assert!(!is_endpoint_bound(&mut hw, EndpointAddress::from_parts(1, UsbDirection::Out)));
        assert_eq!(hw.selected_pipe(), PipeAddress::CONTROL);
    }

    #[test]
    fn stream_from_in_pipe() {
        let (mut hw, ctx) = connected();
        assert!(hw.configure_pipe(PIPE_IN, &TransferDescriptor::bulk(UsbDirection::In, 8), bulk_in()));
        hw.device_in(1, &[1, 2, 3, 4, 5, 6, 7, 8]);
        hw.device_in(1, &[9, 10]);

        let mut pipe = Pipe::select(&mut hw, &ctx, PIPE_IN);
        pipe.unfreeze();
        let mut buffer = [0; 10];
        stream::read_stream(&mut pipe, &mut buffer, None).unwrap();
        stream::finish_read(&mut pipe);
        pipe.freeze();
        assert_eq!(buffer, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn stream_to_out_pipe() {
        let (mut hw, ctx) = connected();
        assert!(hw.configure_pipe(PIPE_OUT, &TransferDescriptor::bulk(UsbDirection::Out, 8), bulk_out()));

        let data: Vec<u8> = (0..16).collect();
        let mut pipe = Pipe::select(&mut hw, &ctx, PIPE_OUT);
        pipe.unfreeze();
        stream::write_stream(&mut pipe, &data, None).unwrap();
        stream::finish_write(&mut pipe, data.len()).unwrap();
        drop(pipe);

        let sizes: Vec<usize> = hw.out_packets(2).iter().map(|p| p.len()).collect();
        assert_eq!(sizes, [8, 8, 0]);
    }

    #[test]
    fn stalled_pipe_stream() {
        let (mut hw, ctx) = connected();
        assert!(hw.configure_pipe(PIPE_IN, &TransferDescriptor::bulk(UsbDirection::In, 8), bulk_in()));
        let mut pipe = Pipe::select(&mut hw, &ctx, PIPE_IN);
        pipe.unfreeze();
        pipe.hardware().stall_pipe(1);
        let mut buffer = [0; 4];
        assert_eq!(
            stream::read_stream(&mut pipe, &mut buffer, None),
            Err(StreamError::Stalled)
        );
    }

    #[test]
    fn frozen_pipe_times_out() {
        let (mut hw, ctx) = connected();
        assert!(hw.configure_pipe(PIPE_IN, &TransferDescriptor::bulk(UsbDirection::In, 8), bulk_in()));
        hw.device_in(1, &[1]);
        let mut pipe = Pipe::select(&mut hw, &ctx, PIPE_IN);
        let mut buffer = [0; 1];
        assert_eq!(
            stream::read_stream(&mut pipe, &mut buffer, None),
            Err(StreamError::Timeout)
        );
    }
}
