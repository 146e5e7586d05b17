//! USB context and configuration
//!
//! A [`UsbContext`] holds all of the engine's state for one controller: the
//! active role, connection state, the host state machine, and the set of
//! interrupt sources that the dispatcher acts on. The foreground owns it.
//! If an interrupt handler must look at it too, wrap it in a
//! [`SharedContext`].

use core::cell::RefCell;

use critical_section::Mutex;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::{
    device::{DeviceConnectionState, DeviceState},
    dispatch::InterruptFlags,
    host::{HostState, InvalidTransition},
    hw::{DeviceHardware, HostHardware, TransferDescriptor},
};

/// Bus speed of the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Speed {
    #[default]
    Full,
    Low,
}

/// Engine configuration.
///
/// Use [`Options::new`] for the defaults, then adjust with the `with_*`
/// methods.
///
/// ```
/// use usb_xfer::context::{Options, Speed};
///
/// const OPTIONS: Options = Options::new()
///     .with_control_endpoint_size(64)
///     .with_speed(Speed::Full)
///     .with_stream_timeout_ms(50);
/// assert_eq!(OPTIONS.control_timeout_ms, 1000);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Options {
    /// How long a stream waits for each bank, in milliseconds.
    pub stream_timeout_ms: u16,
    /// Deadline of a whole host control transaction, in milliseconds.
    pub control_timeout_ms: u16,
    /// Host: time to let a newly powered device settle before driving VBUS.
    pub device_settle_delay_ms: u16,
    /// Host: wait after a device connects, before resetting it.
    pub post_connect_delay_ms: u16,
    /// Host: wait after each bus reset.
    pub reset_settle_ms: u16,
    /// Host: wait after `SET_ADDRESS`, before using the new address.
    pub post_address_delay_ms: u16,
    /// Device: size of the control endpoint.
    pub control_endpoint_size: u16,
    /// Host: address assigned to the attached device.
    pub host_device_address: u8,
    /// Device: signalling speed.
    pub speed: Speed,
    /// The application manages the PLL; the engine only gates the USB clock.
    pub manual_pll: bool,
    /// Device: report self-powered in `GET_STATUS`.
    pub self_powered: bool,
    /// Device: number of configurations the device offers.
    pub configuration_count: u8,
}

impl Options {
    pub const fn new() -> Self {
        Options {
            stream_timeout_ms: crate::stream::DEFAULT_STREAM_TIMEOUT_MS,
            control_timeout_ms: 1000,
            device_settle_delay_ms: 1000,
            post_connect_delay_ms: 100,
            reset_settle_ms: 200,
            post_address_delay_ms: 100,
            control_endpoint_size: 8,
            host_device_address: 1,
            speed: Speed::Full,
            manual_pll: false,
            self_powered: false,
            configuration_count: 1,
        }
    }

    pub const fn with_stream_timeout_ms(mut self, ms: u16) -> Self {
        self.stream_timeout_ms = ms;
        self
    }

    pub const fn with_control_timeout_ms(mut self, ms: u16) -> Self {
        self.control_timeout_ms = ms;
        self
    }

    pub const fn with_device_settle_delay_ms(mut self, ms: u16) -> Self {
        self.device_settle_delay_ms = ms;
        self
    }

    pub const fn with_post_connect_delay_ms(mut self, ms: u16) -> Self {
        self.post_connect_delay_ms = ms;
        self
    }

    pub const fn with_reset_settle_ms(mut self, ms: u16) -> Self {
        self.reset_settle_ms = ms;
        self
    }

    pub const fn with_post_address_delay_ms(mut self, ms: u16) -> Self {
        self.post_address_delay_ms = ms;
        self
    }

    /// Control endpoint sizes are 8, 16, 32 or 64 bytes.
    pub const fn with_control_endpoint_size(mut self, size: u16) -> Self {
        self.control_endpoint_size = size;
        self
    }

    /// The address is masked to seven bits. Address 0 is reserved, and
    /// becomes 1.
    pub const fn with_host_device_address(mut self, address: u8) -> Self {
        self.host_device_address = match address & 0x7F {
            0 => 1,
            address => address,
        };
        self
    }

    pub const fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub const fn with_manual_pll(mut self, manual: bool) -> Self {
        self.manual_pll = manual;
        self
    }

    pub const fn with_self_powered(mut self, self_powered: bool) -> Self {
        self.self_powered = self_powered;
        self
    }

    pub const fn with_configuration_count(mut self, count: u8) -> Self {
        self.configuration_count = count;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// The role the controller is playing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum UsbMode {
    /// Not initialized.
    Disabled,
    Device,
    Host,
}

/// Default size of the host control pipe, before the device reports its
/// control endpoint size.
pub const DEFAULT_CONTROL_PIPE_SIZE: u16 = 8;

/// Address of the device control endpoint.
pub(crate) fn control_endpoint() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Process-wide USB state.
///
/// Create one per controller, and initialize it for a role with
/// [`init_device`](UsbContext::init_device) or
/// [`init_host`](UsbContext::init_host).
#[derive(Debug)]
pub struct UsbContext {
    options: Options,
    mode: UsbMode,
    connection: DeviceConnectionState,
    host_state: HostState,
    control_pipe_size: u16,
    armed: InterruptFlags,
    sof_events: bool,
}

impl UsbContext {
    pub const fn new(options: Options) -> Self {
        UsbContext {
            options,
            mode: UsbMode::Disabled,
            connection: DeviceConnectionState::new(),
            host_state: HostState::Unattached,
            control_pipe_size: DEFAULT_CONTROL_PIPE_SIZE,
            armed: InterruptFlags::empty(),
            sof_events: false,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn mode(&self) -> UsbMode {
        self.mode
    }

    pub fn connection(&self) -> &DeviceConnectionState {
        &self.connection
    }

    pub(crate) fn connection_mut(&mut self) -> &mut DeviceConnectionState {
        &mut self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected
    }

    pub fn is_suspended(&self) -> bool {
        self.connection.is_suspended
    }

    /// Returns the active configuration (0 when unconfigured).
    pub fn configuration(&self) -> u8 {
        self.connection.current_configuration
    }

    pub fn device_state(&self) -> DeviceState {
        self.connection.state
    }

    pub fn host_state(&self) -> HostState {
        self.host_state
    }

    /// Move the host state machine to `state`.
    ///
    /// Applications use this after enumeration: to mark the device
    /// configured, or to suspend it. The transition must be one that the
    /// state machine allows.
    pub fn set_host_state(&mut self, state: HostState) -> Result<(), InvalidTransition> {
        if self.host_state.can_transition_to(state) {
            self.enter(state);
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.host_state,
                to: state,
            })
        }
    }

    pub(crate) fn enter(&mut self, state: HostState) {
        debug_assert!(
            self.host_state.can_transition_to(state),
            "{:?} -> {:?}",
            self.host_state,
            state
        );
        trace!("HOST STATE {:?} -> {:?}", self.host_state, state);
        self.host_state = state;
    }

    /// Returns the host control pipe size.
    pub fn control_pipe_size(&self) -> u16 {
        self.control_pipe_size
    }

    pub(crate) fn set_control_pipe_size(&mut self, size: u16) {
        self.control_pipe_size = size;
    }

    /// Returns the interrupt sources that the dispatcher acts on.
    pub fn armed(&self) -> InterruptFlags {
        self.armed
    }

    pub(crate) fn arm(&mut self, flags: InterruptFlags) {
        self.armed.insert(flags);
    }

    pub(crate) fn disarm(&mut self, flags: InterruptFlags) {
        self.armed.remove(flags);
    }

    /// Enable or disable [`Event::StartOfFrame`](crate::events::Event::StartOfFrame).
    pub fn set_sof_events(&mut self, enabled: bool) {
        self.sof_events = enabled;
        let flag = match self.mode {
            UsbMode::Host => InterruptFlags::HOST_START_OF_FRAME,
            UsbMode::Device | UsbMode::Disabled => InterruptFlags::START_OF_FRAME,
        };
        self.armed.set(flag, enabled);
    }

    pub fn sof_events(&self) -> bool {
        self.sof_events
    }

    /// Start the device role.
    ///
    /// Resets all device state, configures the control endpoint and
    /// attaches to the bus. If VBUS is already present, the device starts
    /// out connected.
    pub fn init_device<D: DeviceHardware>(&mut self, hw: &mut D) {
        self.mode = UsbMode::Device;
        self.reset_device_interface(hw);
        if hw.is_vbus_present() {
            self.connection.is_connected = true;
            self.connection.state = DeviceState::Powered;
        }
        debug!("DEVICE INIT");
    }

    /// Reset the device role, as after a role change or a fault.
    pub fn reset_device_interface<D: DeviceHardware>(&mut self, hw: &mut D) {
        self.connection = DeviceConnectionState::new();
        self.sof_events = false;
        hw.set_clock_frozen(false);
        hw.disable_endpoints();
        hw.set_device_address(0);
        hw.set_speed(self.options.speed);
        self.configure_control_endpoint(hw);
        self.armed = InterruptFlags::VBUS_CHANGE
            | InterruptFlags::SUSPEND
            | InterruptFlags::END_OF_RESET
            | InterruptFlags::ID_CHANGE;
        hw.attach();
    }

    pub(crate) fn configure_control_endpoint<D: DeviceHardware>(&self, hw: &mut D) -> bool {
        let descriptor = TransferDescriptor::control(self.options.control_endpoint_size);
        let configured = hw.configure_endpoint(control_endpoint(), &descriptor);
        if !configured {
            warn!("CONTROL ENDPOINT CONFIGURATION FAILED");
        }
        configured
    }

    /// Start the host role.
    ///
    /// The state machine waits in [`HostState::Unattached`] until the
    /// dispatcher reports an attached device.
    pub fn init_host<H: HostHardware>(&mut self, hw: &mut H) {
        self.mode = UsbMode::Host;
        self.reset_host_interface(hw);
        debug!("HOST INIT");
    }

    /// Reset the host role: release every pipe, forget the attached device,
    /// and power VBUS, ready for the next device.
    pub fn reset_host_interface<H: HostHardware>(&mut self, hw: &mut H) {
        self.connection = DeviceConnectionState::new();
        self.host_state = HostState::Unattached;
        self.control_pipe_size = DEFAULT_CONTROL_PIPE_SIZE;
        self.sof_events = false;
        hw.disable_pipes();
        hw.set_device_address(0);
        hw.suspend_bus();
        hw.set_vbus(true);
        self.armed = InterruptFlags::VBUS_ERROR
            | InterruptFlags::SRP
            | InterruptFlags::BUS_CONNECTION_ERROR
            | InterruptFlags::ID_CHANGE;
    }
}

impl Default for UsbContext {
    fn default() -> Self {
        Self::new(Options::new())
    }
}

/// A [`UsbContext`] that can live in a `static`, and be shared with
/// interrupt handlers.
///
/// Every access runs in a critical section.
///
/// ```
/// use usb_xfer::context::{Options, SharedContext};
///
/// static USB: SharedContext = SharedContext::new(Options::new());
///
/// let connected = USB.with(|ctx| ctx.is_connected());
/// assert!(!connected);
/// ```
pub struct SharedContext {
    ctx: Mutex<RefCell<UsbContext>>,
}

impl SharedContext {
    pub const fn new(options: Options) -> Self {
        SharedContext {
            ctx: Mutex::new(RefCell::new(UsbContext::new(options))),
        }
    }

    /// Interrupt-safe access to the context
    pub fn with<R>(&self, func: impl FnOnce(&UsbContext) -> R) -> R {
        critical_section::with(|cs| {
            let ctx = self.ctx.borrow(cs);
            let ctx = ctx.borrow();
            func(&ctx)
        })
    }

    /// Interrupt-safe, mutable access to the context
    pub fn with_mut<R>(&self, func: impl FnOnce(&mut UsbContext) -> R) -> R {
        critical_section::with(|cs| {
            let ctx = self.ctx.borrow(cs);
            let mut ctx = ctx.borrow_mut();
            func(&mut ctx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimHost};

    #[test]
    fn default_options() {
        let options = Options::default();
        assert_eq!(options.stream_timeout_ms, 100);
        assert_eq!(options.control_timeout_ms, 1000);
        assert_eq!(options.device_settle_delay_ms, 1000);
        assert_eq!(options.control_endpoint_size, 8);
        assert_eq!(options.host_device_address, 1);
        assert_eq!(options.speed, Speed::Full);
    }

    #[test]
    fn host_address_zero_is_reserved() {
        assert_eq!(Options::new().with_host_device_address(0).host_device_address, 1);
        assert_eq!(Options::new().with_host_device_address(0x85).host_device_address, 5);
    }

    #[test]
    fn device_init_configures_control_endpoint() {
        let mut sim = SimDevice::new();
        let mut ctx = UsbContext::new(Options::new().with_control_endpoint_size(64));
        ctx.init_device(&mut sim);

        assert_eq!(ctx.mode(), UsbMode::Device);
        assert!(ctx.is_connected());
        assert_eq!(ctx.device_state(), DeviceState::Powered);
        assert!(sim.is_attached());
        assert_eq!(
            sim.endpoint_descriptor(0),
            Some(TransferDescriptor::control(64))
        );
        assert!(ctx.armed().contains(InterruptFlags::SUSPEND));
        assert!(!ctx.armed().contains(InterruptFlags::WAKEUP));
    }

    #[test]
    fn device_reset_applies_speed() {
        let mut sim = SimDevice::new();
        assert_eq!(sim.speed(), Speed::Full);
        let mut ctx = UsbContext::new(Options::new().with_speed(Speed::Low));
        ctx.init_device(&mut sim);
        assert_eq!(sim.speed(), Speed::Low);
        assert!(sim.is_attached());
    }

    #[test]
    fn device_init_without_vbus() {
        let mut sim = SimDevice::new();
        sim.set_vbus(false);
        let mut ctx = UsbContext::default();
        ctx.init_device(&mut sim);
        assert!(!ctx.is_connected());
        assert_eq!(ctx.device_state(), DeviceState::Unattached);
    }

    #[test]
    fn host_init_powers_vbus() {
        let mut sim = SimHost::default();
        let mut ctx = UsbContext::default();
        ctx.init_host(&mut sim);
        assert_eq!(ctx.mode(), UsbMode::Host);
        assert_eq!(ctx.host_state(), HostState::Unattached);
        assert!(sim.is_vbus_on());
        assert_eq!(ctx.control_pipe_size(), DEFAULT_CONTROL_PIPE_SIZE);
    }

    #[test]
    fn application_transitions_are_checked() {
        let mut ctx = UsbContext::default();
        assert_eq!(
            ctx.set_host_state(HostState::Configured),
            Err(InvalidTransition {
                from: HostState::Unattached,
                to: HostState::Configured
            })
        );
        assert_eq!(ctx.host_state(), HostState::Unattached);
    }

    #[test]
    fn sof_events_arm_the_role_flag() {
        let mut sim = SimHost::default();
        let mut ctx = UsbContext::default();
        ctx.init_host(&mut sim);
        ctx.set_sof_events(true);
        assert!(ctx.armed().contains(InterruptFlags::HOST_START_OF_FRAME));
        ctx.set_sof_events(false);
        assert!(!ctx.armed().contains(InterruptFlags::HOST_START_OF_FRAME));
    }

    #[test]
    fn shared_context() {
        static USB: SharedContext = SharedContext::new(Options::new());
        USB.with_mut(|ctx| ctx.set_sof_events(true));
        assert!(USB.with(|ctx| ctx.sof_events()));
    }
}
