//! Lifecycle events and application hooks
//!
//! The dispatcher and the host state machine report what happened on the
//! bus by raising [`Event`]s. The context is already updated when an event is
//! raised; handlers observe the new state. Handlers run in the foreground,
//! from whichever task raised the event, and may call back into the engine
//! (for instance, to configure endpoints after [`Event::ConfigurationChanged`]).

use crate::{
    context::UsbContext,
    device::ControlEndpoint,
    host::{EnumerationError, HostError},
    hw::DeviceHardware,
    request::ControlRequestHeader,
};

/// Something happened on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Event {
    /// Device role: VBUS appeared, and the device attached to the bus.
    /// Host role: a device connected, and enumeration began.
    Connect,
    /// Device role: VBUS went away. Host role: the attached device went away.
    Disconnect,
    /// The host suspended the bus.
    Suspend,
    /// The host resumed the bus.
    WakeUp,
    /// The host reset the bus. The control endpoint is reconfigured.
    Reset,
    /// A start of frame. Only raised while start of frame events are enabled.
    StartOfFrame,
    /// The host selected a configuration. Read it from the context.
    ConfigurationChanged,
    /// Host role: a device was attached, and VBUS is powering it.
    DeviceAttached,
    /// Host role: the device was removed, or enumeration gave up on it.
    DeviceUnattached,
    /// Host role: the device is addressed and ready for the application.
    EnumerationComplete,
    /// Host role: enumeration stopped.
    EnumerationFailed(EnumerationError),
    /// Host role: a hardware fault.
    HostError(HostError),
    /// The USB ID pin changed. The current role was reset; switching roles
    /// is up to the application.
    UidChange,
}

/// Receives lifecycle events.
///
/// Every method has a default implementation, so implement only what you
/// need. The unit type ignores every event.
pub trait Events {
    fn on_event(&mut self, ctx: &UsbContext, event: Event) {
        let _ = (ctx, event);
    }
}

impl Events for () {}

/// Result of an application control-request hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RequestOutcome {
    /// The hook ran the request, including the status stage.
    Handled,
    /// The hook doesn't know this request.
    Passthrough,
}

/// A device-role application or class driver.
pub trait DeviceClass: Events {
    /// Returns the descriptor identified by `value` (type in the high byte,
    /// index in the low byte) and `index` (language or interface).
    ///
    /// `None` stalls the request.
    fn descriptor(&self, value: u16, index: u16) -> Option<&[u8]> {
        let _ = (value, index);
        None
    }

    /// Handle a control request that isn't a standard request, or that the
    /// standard responder doesn't know.
    ///
    /// The SETUP packet is still in the control bank. A handler that takes the
    /// request acknowledges it with [`ControlEndpoint::accept`], runs the data
    /// and status stages, and returns [`RequestOutcome::Handled`]. Requests
    /// that are passed through are stalled.
    fn control_request<D: DeviceHardware>(
        &mut self,
        ctx: &UsbContext,
        request: &ControlRequestHeader,
        control: &mut ControlEndpoint<'_, D>,
    ) -> RequestOutcome {
        let _ = (ctx, request, control);
        RequestOutcome::Passthrough
    }
}

impl DeviceClass for () {}
