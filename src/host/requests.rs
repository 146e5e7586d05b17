//! Standard requests, from the host
//!
//! Thin wrappers over [`send_control_request`] for the requests every
//! driver needs.

use usb_device::{descriptor::descriptor_type, endpoint::EndpointAddress};

use super::{send_control_request, ControlError, HostState};
use crate::{context::UsbContext, hw::HostHardware, request::ControlRequestHeader};

/// Size of a device descriptor.
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// Read a descriptor of type `kind` into `buffer`.
///
/// Requests at most `buffer.len()` bytes, and returns the number of bytes
/// the device sent.
pub fn get_descriptor<H: HostHardware>(
    ctx: &UsbContext,
    hw: &mut H,
    kind: u8,
    index: u8,
    buffer: &mut [u8],
) -> Result<usize, ControlError> {
    let length = u16::try_from(buffer.len()).unwrap_or(u16::MAX);
    let request = ControlRequestHeader::get_descriptor(kind, index, 0, length);
    send_control_request(ctx, hw, &request, Some(buffer))
}

/// Read the whole device descriptor.
pub fn get_device_descriptor<H: HostHardware>(
    ctx: &UsbContext,
    hw: &mut H,
    buffer: &mut [u8; DEVICE_DESCRIPTOR_SIZE],
) -> Result<usize, ControlError> {
    get_descriptor(ctx, hw, descriptor_type::DEVICE, 0, buffer)
}

/// Read configuration descriptor `index`, with as much of its interface and
/// endpoint descriptors as `buffer` holds.
pub fn get_configuration_descriptor<H: HostHardware>(
    ctx: &UsbContext,
    hw: &mut H,
    index: u8,
    buffer: &mut [u8],
) -> Result<usize, ControlError> {
    get_descriptor(ctx, hw, descriptor_type::CONFIGURATION, index, buffer)
}

/// Select a configuration of the attached device.
///
/// On success, records the configuration, and moves the host state to
/// [`HostState::Configured`] (or back to [`HostState::Addressed`] for
/// configuration 0) when the state machine allows it.
pub fn set_configuration<H: HostHardware>(
    ctx: &mut UsbContext,
    hw: &mut H,
    configuration: u8,
) -> Result<(), ControlError> {
    send_control_request(ctx, hw, &ControlRequestHeader::set_configuration(configuration), None)?;
    ctx.connection_mut().current_configuration = configuration;
    let state = if configuration == 0 {
        HostState::Addressed
    } else {
        HostState::Configured
    };
    if ctx.host_state() != state && ctx.host_state().can_transition_to(state) {
        ctx.enter(state);
    }
    Ok(())
}

/// Returns the active configuration of the attached device.
pub fn get_configuration<H: HostHardware>(ctx: &UsbContext, hw: &mut H) -> Result<u8, ControlError> {
    let mut configuration = [0];
    send_control_request(
        ctx,
        hw,
        &ControlRequestHeader::get_configuration(),
        Some(&mut configuration),
    )?;
    Ok(configuration[0])
}

/// Select an alternate setting of an interface.
pub fn set_interface<H: HostHardware>(
    ctx: &UsbContext,
    hw: &mut H,
    interface: u8,
    alternate_setting: u8,
) -> Result<(), ControlError> {
    let request = ControlRequestHeader::set_interface(interface, alternate_setting);
    send_control_request(ctx, hw, &request, None).map(|_| ())
}

/// Clear a halt on a device endpoint.
///
/// Reset the data toggle of the pipe bound to `endpoint` afterwards.
pub fn clear_endpoint_stall<H: HostHardware>(
    ctx: &UsbContext,
    hw: &mut H,
    endpoint: EndpointAddress,
) -> Result<(), ControlError> {
    let request = ControlRequestHeader::clear_endpoint_halt(endpoint.into());
    send_control_request(ctx, hw, &request, None).map(|_| ())
}

#[cfg(test)]
mod tests {
    use usb_device::UsbDirection;

    use super::*;
    use crate::{
        context::Options,
        hw::{PipeAddress, TransferDescriptor},
        sim::{Behavior, SimHost},
    };

    fn ep0() -> EndpointAddress {
        EndpointAddress::from_parts(0, UsbDirection::Out)
    }

    fn attached() -> (SimHost, UsbContext) {
        let mut hw = SimHost::new(Behavior::Responsive);
        let mut ctx = UsbContext::new(Options::new());
        ctx.init_host(&mut hw);
        hw.plug();
        assert!(hw.configure_pipe(PipeAddress::CONTROL, &TransferDescriptor::control(64), ep0()));
        (hw, ctx)
    }

    #[test]
    fn whole_device_descriptor() {
        let (mut hw, ctx) = attached();
        let mut descriptor = [0; DEVICE_DESCRIPTOR_SIZE];
        assert_eq!(get_device_descriptor(&ctx, &mut hw, &mut descriptor), Ok(18));
        assert_eq!(&descriptor[8..12], &[0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn configuration_descriptor() {
        let (mut hw, ctx) = attached();
        let mut header = [0; 9];
        assert_eq!(get_configuration_descriptor(&ctx, &mut hw, 0, &mut header), Ok(9));
        assert_eq!(header[1], descriptor_type::CONFIGURATION);
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));

        let mut full = [0; 64];
        assert_eq!(
            get_configuration_descriptor(&ctx, &mut hw, 0, &mut full[..total]),
            Ok(total)
        );
        assert_eq!(full[10], 0x04);
    }

    #[test]
    fn unknown_descriptor_stalls() {
        let (mut hw, ctx) = attached();
        let mut buffer = [0; 4];
        assert_eq!(
            get_descriptor(&ctx, &mut hw, descriptor_type::STRING, 1, &mut buffer),
            Err(ControlError::SetupStalled)
        );
    }

    #[test]
    fn configuration_round_trip() {
        let (mut hw, mut ctx) = attached();
        ctx.set_host_state(HostState::Powered).unwrap();
        assert_eq!(set_configuration(&mut ctx, &mut hw, 1), Ok(()));
        assert_eq!(hw.peripheral_configuration(), 1);
        assert_eq!(ctx.configuration(), 1);
        assert_eq!(ctx.host_state(), HostState::Powered);
        assert_eq!(get_configuration(&ctx, &mut hw), Ok(1));
    }

    #[test]
    fn configuring_an_addressed_device() {
        let (mut hw, mut ctx) = attached();
        for state in [
            HostState::Powered,
            HostState::PoweredWaitForDeviceSettle { remaining_ms: 0 },
            HostState::PoweredWaitForConnect,
            HostState::PoweredDoReset,
            HostState::PoweredConfigPipe,
            HostState::Default,
            HostState::DefaultPostReset,
            HostState::DefaultPostAddressSet,
            HostState::Addressed,
        ] {
            ctx.set_host_state(state).unwrap();
        }
        set_configuration(&mut ctx, &mut hw, 1).unwrap();
        assert_eq!(ctx.host_state(), HostState::Configured);
        set_configuration(&mut ctx, &mut hw, 0).unwrap();
        assert_eq!(ctx.host_state(), HostState::Addressed);
    }

    #[test]
    fn interface_and_halt() {
        let (mut hw, ctx) = attached();
        assert_eq!(set_interface(&ctx, &mut hw, 0, 2), Ok(()));
        assert_eq!(hw.peripheral_alternate_setting(), 2);

        let endpoint = EndpointAddress::from_parts(1, UsbDirection::In);
        assert_eq!(clear_endpoint_stall(&ctx, &mut hw, endpoint), Ok(()));
        assert_eq!(
            hw.requests().last(),
            Some(&ControlRequestHeader::clear_endpoint_halt(0x81))
        );
    }
}
