//! Standard request responder
//!
//! cf §9.4 of USB 2.0

use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

use super::{ControlEndpoint, DeviceState};
use crate::{
    context::{control_endpoint, UsbContext},
    events::{DeviceClass, Event, RequestOutcome},
    hw::DeviceHardware,
    request::ControlRequestHeader,
    stream::StreamError,
};

/// Read the SETUP packet from the selected control endpoint, and answer it.
pub(super) fn process_control_request<D, C>(ctx: &mut UsbContext, hw: &mut D, class: &mut C)
where
    D: DeviceHardware,
    C: DeviceClass,
{
    let mut bytes = [0; ControlRequestHeader::SIZE];
    bytes.iter_mut().for_each(|b| *b = hw.read_byte());
    let request = ControlRequestHeader::parse(&bytes);
    debug!(
        "SETUP {:#04x} {:#04x} {:#06x} {:#06x} {}",
        request.request_type, request.request, request.value, request.index, request.length
    );

    let mut control = ControlEndpoint::new(hw, ctx, request);
    let outcome = match standard_request(ctx, &mut control, class) {
        Some(result) => {
            if let Err(err) = result {
                warn!("STANDARD REQUEST {:#04x} FAILED {:?}", request.request, err);
            }
            RequestOutcome::Handled
        }
        None => class.control_request(ctx, &request, &mut control),
    };

    if outcome == RequestOutcome::Passthrough {
        debug!("STALL {:#04x}", request.request);
        control.stall();
    }
}

/// Returns `None` if `control` doesn't hold a standard request that this
/// module answers.
fn standard_request<D, C>(
    ctx: &mut UsbContext,
    control: &mut ControlEndpoint<'_, D>,
    class: &mut C,
) -> Option<Result<(), StreamError>>
where
    D: DeviceHardware,
    C: DeviceClass,
{
    let request = *control.request();
    if request.kind() != RequestType::Standard {
        return None;
    }

    let result = match (request.request, request.direction(), request.recipient()) {
        (Request::GET_STATUS, UsbDirection::In, _) => get_status(ctx, control),
        (Request::CLEAR_FEATURE | Request::SET_FEATURE, UsbDirection::Out, recipient)
            if recipient == Recipient::Device || recipient == Recipient::Endpoint =>
        {
            feature(ctx, control)
        }
        (Request::SET_ADDRESS, UsbDirection::Out, Recipient::Device) => set_address(ctx, control),
        (Request::GET_DESCRIPTOR, UsbDirection::In, recipient)
            if recipient == Recipient::Device || recipient == Recipient::Interface =>
        {
            get_descriptor(control, class)
        }
        (Request::GET_CONFIGURATION, UsbDirection::In, Recipient::Device) => {
            get_configuration(ctx, control)
        }
        (Request::SET_CONFIGURATION, UsbDirection::Out, Recipient::Device) => {
            set_configuration(ctx, control, class)
        }
        _ => return None,
    };
    Some(result)
}

/// Select the endpoint named in `wIndex`, if it's configured. Returns `None`,
/// with the control endpoint reselected, if it isn't.
fn select_target<D: DeviceHardware>(
    control: &mut ControlEndpoint<'_, D>,
) -> Option<EndpointAddress> {
    let endpoint = EndpointAddress::from(control.request().index as u8);
    let hw = control.hardware();
    hw.select_endpoint(endpoint);
    if hw.is_endpoint_configured() {
        Some(endpoint)
    } else {
        hw.select_endpoint(control_endpoint());
        None
    }
}

fn get_status<D: DeviceHardware>(
    ctx: &UsbContext,
    control: &mut ControlEndpoint<'_, D>,
) -> Result<(), StreamError> {
    let status: u16 = match control.request().recipient() {
        Recipient::Device => {
            u16::from(ctx.options().self_powered)
                | u16::from(ctx.connection().remote_wakeup_enabled) << 1
        }
        Recipient::Endpoint => {
            if select_target(control).is_none() {
                control.stall();
                return Ok(());
            }
            let hw = control.hardware();
            let halted = hw.is_stalled();
            hw.select_endpoint(control_endpoint());
            u16::from(halted)
        }
        _ => 0,
    };

    control.accept();
    control.write_control_stream(&status.to_le_bytes())?;
    control.clear_status_stage()
}

fn feature<D: DeviceHardware>(
    ctx: &mut UsbContext,
    control: &mut ControlEndpoint<'_, D>,
) -> Result<(), StreamError> {
    let request = *control.request();
    let set = request.request == Request::SET_FEATURE;

    match (request.recipient(), request.value) {
        (Recipient::Device, Request::FEATURE_DEVICE_REMOTE_WAKEUP) => {
            ctx.connection_mut().remote_wakeup_enabled = set;
        }
        (Recipient::Endpoint, Request::FEATURE_ENDPOINT_HALT)
            if EndpointAddress::from(request.index as u8).index() != 0 =>
        {
            let Some(endpoint) = select_target(control) else {
                control.stall();
                return Ok(());
            };
            let hw = control.hardware();
            if set {
                hw.stall_transaction();
            } else {
                hw.clear_stall();
                hw.reset_endpoint(endpoint);
                hw.reset_data_toggle();
            }
            hw.select_endpoint(control_endpoint());
        }
        _ => {
            control.stall();
            return Ok(());
        }
    }

    control.accept();
    control.clear_status_stage()
}

fn set_address<D: DeviceHardware>(
    ctx: &mut UsbContext,
    control: &mut ControlEndpoint<'_, D>,
) -> Result<(), StreamError> {
    let address = (control.request().value & 0x7F) as u8;

    control.accept();
    control.clear_status_stage()?;
    control.wait_for(D::is_in_ready)?;
    control.hardware().set_device_address(address);

    ctx.connection_mut().state = if address != 0 {
        DeviceState::Addressed
    } else {
        DeviceState::Default
    };
    debug!("ADDRESS {}", address);
    Ok(())
}

fn get_descriptor<D, C>(control: &mut ControlEndpoint<'_, D>, class: &mut C) -> Result<(), StreamError>
where
    D: DeviceHardware,
    C: DeviceClass,
{
    let request = *control.request();
    let Some(descriptor) = class.descriptor(request.value, request.index) else {
        debug!("NO DESCRIPTOR {:#06x}", request.value);
        control.stall();
        return Ok(());
    };

    control.accept();
    control.write_control_stream(descriptor)?;
    control.clear_status_stage()
}

fn get_configuration<D: DeviceHardware>(
    ctx: &UsbContext,
    control: &mut ControlEndpoint<'_, D>,
) -> Result<(), StreamError> {
    control.accept();
    control.write_control_stream(&[ctx.configuration()])?;
    control.clear_status_stage()
}

fn set_configuration<D, C>(
    ctx: &mut UsbContext,
    control: &mut ControlEndpoint<'_, D>,
    class: &mut C,
) -> Result<(), StreamError>
where
    D: DeviceHardware,
    C: DeviceClass,
{
    let configuration = control.request().value as u8;
    if configuration > ctx.options().configuration_count {
        control.stall();
        return Ok(());
    }

    control.accept();
    let connection = ctx.connection_mut();
    connection.current_configuration = configuration;
    connection.state = if configuration != 0 {
        DeviceState::Configured
    } else {
        DeviceState::Addressed
    };
    control.clear_status_stage()?;

    debug!("CONFIGURATION {}", configuration);
    class.on_event(ctx, Event::ConfigurationChanged);
    Ok(())
}

#[cfg(test)]
mod tests {
    use usb_device::{descriptor::descriptor_type, endpoint::EndpointAddress, UsbDirection};

    use crate::{
        context::{Options, UsbContext},
        device::{device_task, ControlEndpoint, DeviceState},
        events::{DeviceClass, Event, Events, RequestOutcome},
        hw::{Bank, DeviceHardware, TransferDescriptor},
        request::{request_type, ControlRequestHeader},
        sim::{ControlStage, SimDevice},
    };
    use usb_device::control::{Recipient, Request, RequestType};

    const DEVICE_DESCRIPTOR: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 8, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0, 0, 0, 1,
    ];
    fn bulk_in() -> EndpointAddress {
        EndpointAddress::from_parts(1, UsbDirection::In)
    }
    const VENDOR_REQUEST: u8 = 0x42;

    #[derive(Default)]
    struct Class {
        events: heapless::Vec<Event, 8>,
        configuration_seen: Option<u8>,
        vendor_data: [u8; 4],
    }

    impl Events for Class {
        fn on_event(&mut self, ctx: &UsbContext, event: Event) {
            if event == Event::ConfigurationChanged {
                self.configuration_seen = Some(ctx.configuration());
            }
            self.events.push(event).ok();
        }
    }

    impl DeviceClass for Class {
        fn descriptor(&self, value: u16, _: u16) -> Option<&[u8]> {
            match (value >> 8) as u8 {
                descriptor_type::DEVICE => Some(&DEVICE_DESCRIPTOR),
                _ => None,
            }
        }

        fn control_request<D: DeviceHardware>(
            &mut self,
            _: &UsbContext,
            request: &ControlRequestHeader,
            control: &mut ControlEndpoint<'_, D>,
        ) -> RequestOutcome {
            if request.kind() != RequestType::Vendor || request.request != VENDOR_REQUEST {
                return RequestOutcome::Passthrough;
            }
            control.accept();
            control.read_control_stream(&mut self.vendor_data).unwrap();
            control.clear_status_stage().unwrap();
            RequestOutcome::Handled
        }
    }

    fn device() -> (SimDevice, UsbContext, Class) {
        let mut hw = SimDevice::new();
        let mut ctx = UsbContext::new(Options::new().with_self_powered(true));
        ctx.init_device(&mut hw);
        assert!(hw.configure_endpoint(bulk_in(), &TransferDescriptor::bulk(UsbDirection::In, 8)));
        (hw, ctx, Class::default())
    }

    fn run(
        hw: &mut SimDevice,
        ctx: &mut UsbContext,
        class: &mut Class,
        request: ControlRequestHeader,
        data: &[u8],
    ) -> ControlStage {
        hw.host_setup(request, data);
        device_task(ctx, hw, class);
        hw.control_stage()
    }

    #[test]
    fn get_device_descriptor() {
        let (mut hw, mut ctx, mut class) = device();
        let request = ControlRequestHeader::get_device_descriptor(64);
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Complete);
        assert_eq!(hw.control_in_data(), &DEVICE_DESCRIPTOR);
        assert_eq!(hw.control_in_packets(), &[8, 8, 2]);
    }

    #[test]
    fn unknown_descriptor_stalls() {
        let (mut hw, mut ctx, mut class) = device();
        let request = ControlRequestHeader::get_descriptor(descriptor_type::STRING, 4, 0x0409, 255);
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Stalled);
    }

    #[test]
    fn set_address_after_status_stage() {
        let (mut hw, mut ctx, mut class) = device();
        let request = ControlRequestHeader::set_address(9);
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Complete);
        assert_eq!(hw.address(), 9);
        assert_eq!(ctx.device_state(), DeviceState::Addressed);
        assert_eq!(hw.control_in_packets(), &[0]);
    }

    #[test]
    fn set_configuration_raises_event() {
        let (mut hw, mut ctx, mut class) = device();
        let request = ControlRequestHeader::set_configuration(1);
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Complete);
        assert_eq!(ctx.configuration(), 1);
        assert_eq!(ctx.device_state(), DeviceState::Configured);
        assert_eq!(class.configuration_seen, Some(1));

        let request = ControlRequestHeader::get_configuration();
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Complete);
        assert_eq!(hw.control_in_data(), &[1]);

        let request = ControlRequestHeader::set_configuration(2);
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Stalled);
        assert_eq!(ctx.configuration(), 1);
    }

    #[test]
    fn device_status_reports_power_and_wakeup() {
        let (mut hw, mut ctx, mut class) = device();
        let get_status = ControlRequestHeader::new(
            request_type(UsbDirection::In, RequestType::Standard, Recipient::Device),
            Request::GET_STATUS,
            0,
            0,
            2,
        );
        run(&mut hw, &mut ctx, &mut class, get_status, &[]);
        assert_eq!(hw.control_in_data(), &[0b01, 0]);

        let set_wakeup = ControlRequestHeader::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Device),
            Request::SET_FEATURE,
            Request::FEATURE_DEVICE_REMOTE_WAKEUP,
            0,
            0,
        );
        assert_eq!(run(&mut hw, &mut ctx, &mut class, set_wakeup, &[]), ControlStage::Complete);
        run(&mut hw, &mut ctx, &mut class, get_status, &[]);
        assert_eq!(hw.control_in_data(), &[0b11, 0]);
    }

    #[test]
    fn endpoint_halt_feature() {
        let (mut hw, mut ctx, mut class) = device();
        let halt = ControlRequestHeader::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Endpoint),
            Request::SET_FEATURE,
            Request::FEATURE_ENDPOINT_HALT,
            u16::from(u8::from(bulk_in())),
            0,
        );
        assert_eq!(run(&mut hw, &mut ctx, &mut class, halt, &[]), ControlStage::Complete);
        hw.select_endpoint(bulk_in());
        assert!(hw.is_stalled());

        let get_status = ControlRequestHeader::new(
            request_type(UsbDirection::In, RequestType::Standard, Recipient::Endpoint),
            Request::GET_STATUS,
            0,
            u16::from(u8::from(bulk_in())),
            2,
        );
        run(&mut hw, &mut ctx, &mut class, get_status, &[]);
        assert_eq!(hw.control_in_data(), &[1, 0]);

        let clear = ControlRequestHeader::clear_endpoint_halt(u8::from(bulk_in()));
        assert_eq!(run(&mut hw, &mut ctx, &mut class, clear, &[]), ControlStage::Complete);
        hw.select_endpoint(bulk_in());
        assert!(!hw.is_stalled());
        assert_eq!(hw.data_toggle_resets(1), 1);
    }

    #[test]
    fn control_endpoint_halt_is_rejected() {
        let (mut hw, mut ctx, mut class) = device();
        let halt = ControlRequestHeader::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Endpoint),
            Request::SET_FEATURE,
            Request::FEATURE_ENDPOINT_HALT,
            0x80,
            0,
        );
        assert_eq!(run(&mut hw, &mut ctx, &mut class, halt, &[]), ControlStage::Stalled);
    }

    #[test]
    fn class_request_hook() {
        let (mut hw, mut ctx, mut class) = device();
        let request = ControlRequestHeader::new(
            request_type(UsbDirection::Out, RequestType::Vendor, Recipient::Device),
            VENDOR_REQUEST,
            0,
            0,
            4,
        );
        assert_eq!(
            run(&mut hw, &mut ctx, &mut class, request, &[1, 2, 3, 4]),
            ControlStage::Complete
        );
        assert_eq!(class.vendor_data, [1, 2, 3, 4]);
    }

    #[test]
    fn unhandled_request_stalls() {
        let (mut hw, mut ctx, mut class) = device();
        let request = ControlRequestHeader::new(
            request_type(UsbDirection::In, RequestType::Class, Recipient::Interface),
            0x01,
            0,
            0,
            8,
        );
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Stalled);

        hw.select_endpoint(crate::context::control_endpoint());
        assert!(hw.is_stalled());
        let request = ControlRequestHeader::get_configuration();
        assert_eq!(run(&mut hw, &mut ctx, &mut class, request, &[]), ControlStage::Complete);
    }
}
