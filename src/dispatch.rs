//! Interrupt event dispatcher
//!
//! Interrupt handlers do as little as possible: they read the controller's
//! interrupt status, and [`raise`](InterruptSource::raise) the matching
//! [`InterruptFlags`]. The foreground then calls [`dispatch_device`] or
//! [`dispatch_host`], which consumes the pending flags, updates the
//! context, and raises [`Event`]s.
//!
//! Each flag is consumed once. Flags that the context hasn't armed are
//! discarded. The context is updated before each event is raised.
//!
//! ```
//! # #[cfg(feature = "sim")] {
//! use usb_xfer::{
//!     context::{Options, UsbContext},
//!     dispatch::{dispatch_device, InterruptFlags, InterruptSource},
//!     device::DeviceState,
//!     sim::SimDevice,
//! };
//!
//! static USB_IRQ: InterruptSource = InterruptSource::new();
//!
//! let mut hw = SimDevice::new();
//! let mut ctx = UsbContext::new(Options::new());
//! ctx.init_device(&mut hw);
//!
//! // From the USB interrupt handler:
//! USB_IRQ.raise(InterruptFlags::END_OF_RESET);
//!
//! // From the main loop:
//! dispatch_device(&mut ctx, &mut hw, &USB_IRQ, &mut ());
//! assert_eq!(ctx.device_state(), DeviceState::Default);
//! # }
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    context::{UsbContext, UsbMode},
    device::DeviceState,
    events::{Event, Events},
    host::{EnumerationError, HostError, HostState},
    hw::{DeviceHardware, HostHardware},
};

bitflags::bitflags! {
    /// Interrupt sources known to the dispatcher.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct InterruptFlags : u32 {
        /// Device: VBUS appeared or went away.
        const VBUS_CHANGE = 1 << 0;
        /// Device: the host suspended the bus.
        const SUSPEND = 1 << 1;
        /// Device: bus activity after a suspend.
        const WAKEUP = 1 << 2;
        /// Device: the host finished a bus reset.
        const END_OF_RESET = 1 << 3;
        /// Device: start of frame.
        const START_OF_FRAME = 1 << 4;
        /// Host: the attached device went away.
        const DEVICE_DISCONNECT = 1 << 5;
        /// Host: VBUS dropped below its valid level.
        const VBUS_ERROR = 1 << 6;
        /// Host: session request from a newly attached device.
        const SRP = 1 << 7;
        /// Host: the device failed to connect.
        const BUS_CONNECTION_ERROR = 1 << 8;
        /// Host: start of frame.
        const HOST_START_OF_FRAME = 1 << 9;
        /// The USB ID pin changed.
        const ID_CHANGE = 1 << 10;
    }
}

/// Pending interrupt flags, shared by an interrupt handler and the
/// foreground.
///
/// Allocate a `static`, raise flags from the interrupt handler, and
/// dispatch them from the foreground.
pub struct InterruptSource {
    pending: AtomicU32,
}

impl InterruptSource {
    pub const fn new() -> Self {
        InterruptSource {
            pending: AtomicU32::new(0),
        }
    }

    /// Mark `flags` as pending. Safe to call from an interrupt handler.
    pub fn raise(&self, flags: InterruptFlags) {
        self.pending.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Returns the pending flags, without consuming them.
    pub fn pending(&self) -> InterruptFlags {
        InterruptFlags::from_bits_truncate(self.pending.load(Ordering::SeqCst))
    }

    /// Consume every pending flag.
    pub fn take(&self) -> InterruptFlags {
        InterruptFlags::from_bits_truncate(self.pending.swap(0, Ordering::SeqCst))
    }
}

impl Default for InterruptSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle pending device role interrupts.
///
/// Does nothing unless the device role is active. Pending flags are
/// consumed even then.
pub fn dispatch_device<D, E>(ctx: &mut UsbContext, hw: &mut D, source: &InterruptSource, events: &mut E)
where
    D: DeviceHardware,
    E: Events,
{
    let flags = source.take() & ctx.armed();
    if ctx.mode() != UsbMode::Device || flags.is_empty() {
        return;
    }
    trace!("DEVICE INTERRUPTS {:?}", flags);

    if flags.contains(InterruptFlags::ID_CHANGE) {
        let was_connected = ctx.is_connected();
        ctx.reset_device_interface(hw);
        id_changed(ctx, events, was_connected);
        return;
    }

    let manual_pll = ctx.options().manual_pll;

    if flags.contains(InterruptFlags::VBUS_CHANGE) {
        if hw.is_vbus_present() {
            if !ctx.is_connected() {
                if !manual_pll {
                    hw.set_pll(true);
                }
                hw.set_clock_frozen(false);
                let connection = ctx.connection_mut();
                connection.is_connected = true;
                connection.state = DeviceState::Powered;
                debug!("VBUS ON");
                events.on_event(ctx, Event::Connect);
            }
        } else if ctx.is_connected() {
            hw.set_clock_frozen(true);
            if !manual_pll {
                hw.set_pll(false);
            }
            let connection = ctx.connection_mut();
            connection.is_connected = false;
            connection.is_suspended = false;
            connection.current_configuration = 0;
            connection.state = DeviceState::Unattached;
            debug!("VBUS OFF");
            events.on_event(ctx, Event::Disconnect);
        }
    }

    if flags.contains(InterruptFlags::SUSPEND) {
        ctx.disarm(InterruptFlags::SUSPEND);
        ctx.arm(InterruptFlags::WAKEUP);
        hw.set_clock_frozen(true);
        if !manual_pll {
            hw.set_pll(false);
        }
        let connection = ctx.connection_mut();
        connection.state_before_suspend = connection.state;
        connection.state = DeviceState::Suspended;
        connection.is_suspended = true;
        debug!("SUSPEND");
        events.on_event(ctx, Event::Suspend);
    }

    if flags.contains(InterruptFlags::WAKEUP) {
        if !manual_pll {
            hw.set_pll(true);
        }
        hw.set_clock_frozen(false);
        ctx.disarm(InterruptFlags::WAKEUP);
        ctx.arm(InterruptFlags::SUSPEND);
        let connection = ctx.connection_mut();
        if connection.is_suspended {
            connection.state = connection.state_before_suspend;
            connection.is_suspended = false;
        }
        debug!("WAKE UP");
        events.on_event(ctx, Event::WakeUp);
    }

    if flags.contains(InterruptFlags::END_OF_RESET) {
        let connection = ctx.connection_mut();
        connection.current_configuration = 0;
        connection.remote_wakeup_enabled = false;
        connection.is_suspended = false;
        connection.state = DeviceState::Default;
        ctx.disarm(InterruptFlags::SUSPEND);
        ctx.arm(InterruptFlags::WAKEUP);
        hw.set_device_address(0);
        ctx.configure_control_endpoint(hw);
        debug!("BUS RESET");
        events.on_event(ctx, Event::Reset);
    }

    if flags.contains(InterruptFlags::START_OF_FRAME) && ctx.sof_events() {
        events.on_event(ctx, Event::StartOfFrame);
    }
}

/// Handle pending host role interrupts.
///
/// Does nothing unless the host role is active. Pending flags are consumed
/// even then.
pub fn dispatch_host<H, E>(ctx: &mut UsbContext, hw: &mut H, source: &InterruptSource, events: &mut E)
where
    H: HostHardware,
    E: Events,
{
    let flags = source.take() & ctx.armed();
    if ctx.mode() != UsbMode::Host || flags.is_empty() {
        return;
    }
    trace!("HOST INTERRUPTS {:?}", flags);

    if flags.contains(InterruptFlags::ID_CHANGE) {
        let was_connected = ctx.is_connected();
        ctx.reset_host_interface(hw);
        id_changed(ctx, events, was_connected);
        return;
    }

    if flags.contains(InterruptFlags::DEVICE_DISCONNECT) {
        let was_attached = ctx.host_state() != HostState::Unattached;
        let was_connected = ctx.is_connected();
        ctx.reset_host_interface(hw);
        debug!("DEVICE DISCONNECTED");
        if was_attached {
            events.on_event(ctx, Event::DeviceUnattached);
        }
        if was_connected {
            events.on_event(ctx, Event::Disconnect);
        }
    }

    if flags.contains(InterruptFlags::VBUS_ERROR) {
        let was_connected = ctx.is_connected();
        ctx.reset_host_interface(hw);
        hw.set_vbus(false);
        warn!("VBUS VOLTAGE DIP");
        events.on_event(ctx, Event::HostError(HostError::VbusVoltageDip));
        events.on_event(ctx, Event::DeviceUnattached);
        if was_connected {
            events.on_event(ctx, Event::Disconnect);
        }
    }

    if flags.contains(InterruptFlags::SRP) && ctx.host_state() == HostState::Unattached {
        ctx.disarm(InterruptFlags::SRP);
        ctx.arm(InterruptFlags::DEVICE_DISCONNECT);
        hw.set_vbus(true);
        ctx.enter(HostState::Powered);
        debug!("DEVICE ATTACHED");
        events.on_event(ctx, Event::DeviceAttached);
    }

    if flags.contains(InterruptFlags::BUS_CONNECTION_ERROR) {
        let was_connected = ctx.is_connected();
        ctx.reset_host_interface(hw);
        warn!("BUS CONNECTION ERROR");
        events.on_event(
            ctx,
            Event::EnumerationFailed(EnumerationError::NoDeviceDetected),
        );
        events.on_event(ctx, Event::DeviceUnattached);
        if was_connected {
            events.on_event(ctx, Event::Disconnect);
        }
    }

    if flags.contains(InterruptFlags::HOST_START_OF_FRAME) && ctx.sof_events() {
        events.on_event(ctx, Event::StartOfFrame);
    }
}

/// The interface is already reset.
fn id_changed<E: Events>(ctx: &UsbContext, events: &mut E, was_connected: bool) {
    debug!("ID CHANGE");
    if was_connected {
        events.on_event(ctx, Event::Disconnect);
    }
    events.on_event(ctx, Event::UidChange);
}
