//! Enumeration state machine

use usb_device::descriptor::descriptor_type;

use super::{
    reset_device, send_control_request, wait_ms, ControlError, EnumerationError, HostState, NextState,
};
use crate::{
    context::{control_endpoint, UsbContext, UsbMode, DEFAULT_CONTROL_PIPE_SIZE},
    events::{Event, Events},
    hw::{HostHardware, PipeAddress, TransferDescriptor},
    request::ControlRequestHeader,
};

/// Offset of `bMaxPacketSize0` in the device descriptor.
const MAX_PACKET_SIZE_OFFSET: usize = 7;

/// Advance enumeration by one step.
///
/// Does nothing unless the host role is active. Waits longer than a frame
/// are split into one step per frame, so the caller's loop keeps running.
/// If a step fails, VBUS turns off and the state machine waits in
/// [`HostState::WaitForDeviceRemoval`]; the failure is reported with
/// [`Event::EnumerationFailed`]. Restores the previously selected pipe
/// before returning.
pub fn host_task<H, E>(ctx: &mut UsbContext, hw: &mut H, events: &mut E)
where
    H: HostHardware,
    E: Events,
{
    if ctx.mode() != UsbMode::Host {
        return;
    }
    let previous = hw.selected_pipe();
    hw.select_pipe(PipeAddress::CONTROL);
    if let Err(err) = step(ctx, hw, events) {
        abort(ctx, hw, events, err);
    }
    hw.select_pipe(previous);
}

/// Wait `ms` frames, then move to `next`.
fn waiting(ms: u16, next: NextState) -> HostState {
    match ms {
        0 => next.into(),
        remaining_ms => HostState::WaitingFor { next, remaining_ms },
    }
}

fn configure_control_pipe<H: HostHardware>(hw: &mut H, size: u16) -> Result<(), EnumerationError> {
    let descriptor = TransferDescriptor::control(size);
    if hw.configure_pipe(PipeAddress::CONTROL, &descriptor, control_endpoint()) {
        Ok(())
    } else {
        Err(EnumerationError::PipeConfigError)
    }
}

fn step<H, E>(ctx: &mut UsbContext, hw: &mut H, events: &mut E) -> Result<(), EnumerationError>
where
    H: HostHardware,
    E: Events,
{
    let options = *ctx.options();
    match ctx.host_state() {
        HostState::WaitForDeviceRemoval => {
            if !hw.is_device_connected() {
                ctx.reset_host_interface(hw);
            }
        }
        HostState::WaitingFor { next, remaining_ms } => {
            match remaining_ms.checked_sub(1) {
                Some(remaining_ms) => {
                    wait_ms(hw, 1).map_err(EnumerationError::WaitStage)?;
                    ctx.enter(waiting(remaining_ms, next));
                }
                None => ctx.enter(next.into()),
            }
        }
        HostState::Powered => {
            ctx.enter(HostState::PoweredWaitForDeviceSettle {
                remaining_ms: options.device_settle_delay_ms,
            });
        }
        HostState::PoweredWaitForDeviceSettle { remaining_ms } => {
            if remaining_ms > 0 {
                hw.delay_ms(1);
                ctx.enter(HostState::PoweredWaitForDeviceSettle {
                    remaining_ms: remaining_ms - 1,
                });
            } else {
                hw.set_vbus(true);
                ctx.enter(HostState::PoweredWaitForConnect);
            }
        }
        HostState::PoweredWaitForConnect => {
            if hw.is_device_connected() {
                ctx.connection_mut().is_connected = true;
                hw.resume_bus();
                hw.disable_pipes();
                ctx.enter(waiting(options.post_connect_delay_ms, NextState::PoweredDoReset));
                debug!("DEVICE CONNECTED");
                events.on_event(ctx, Event::Connect);
            }
        }
        HostState::PoweredDoReset => {
            reset_device(hw);
            ctx.enter(waiting(options.reset_settle_ms, NextState::PoweredConfigPipe));
        }
        HostState::PoweredConfigPipe => {
            configure_control_pipe(hw, DEFAULT_CONTROL_PIPE_SIZE)?;
            ctx.enter(HostState::Default);
        }
        HostState::Default => {
            let mut prefix = [0; 8];
            let request = ControlRequestHeader::get_descriptor(descriptor_type::DEVICE, 0, 0, 8);
            let read = send_control_request(ctx, hw, &request, Some(&mut prefix))
                .map_err(EnumerationError::ControlError)?;
            if read < prefix.len() {
                warn!("SHORT DEVICE DESCRIPTOR ({} BYTES)", read);
                return Err(EnumerationError::ControlError(ControlError::PipeError));
            }
            let size = u16::from(prefix[MAX_PACKET_SIZE_OFFSET]);
            if !matches!(size, 8 | 16 | 32 | 64) {
                warn!("INVALID CONTROL ENDPOINT SIZE {}", size);
                return Err(EnumerationError::PipeConfigError);
            }
            debug!("CONTROL ENDPOINT SIZE {}", size);
            ctx.set_control_pipe_size(size);
            reset_device(hw);
            ctx.enter(waiting(options.reset_settle_ms, NextState::DefaultPostReset));
        }
        HostState::DefaultPostReset => {
            configure_control_pipe(hw, ctx.control_pipe_size())?;
            let request = ControlRequestHeader::set_address(options.host_device_address);
            send_control_request(ctx, hw, &request, None).map_err(EnumerationError::ControlError)?;
            ctx.enter(waiting(options.post_address_delay_ms, NextState::DefaultPostAddressSet));
        }
        HostState::DefaultPostAddressSet => {
            hw.set_device_address(options.host_device_address);
            ctx.enter(HostState::Addressed);
            debug!("DEVICE ADDRESSED {}", options.host_device_address);
            events.on_event(ctx, Event::EnumerationComplete);
        }
        HostState::Unattached
        | HostState::Addressed
        | HostState::Configured
        | HostState::Suspended => {}
    }
    Ok(())
}

/// Give up on the attached device.
fn abort<H, E>(ctx: &mut UsbContext, hw: &mut H, events: &mut E, err: EnumerationError)
where
    H: HostHardware,
    E: Events,
{
    warn!(
        "ENUMERATION FAILED IN {:?}: {:?}",
        ctx.host_state(),
        err
    );
    hw.set_vbus(false);
    hw.disable_pipes();
    let was_connected = ctx.is_connected();
    ctx.connection_mut().is_connected = false;
    ctx.set_control_pipe_size(DEFAULT_CONTROL_PIPE_SIZE);
    ctx.enter(HostState::WaitForDeviceRemoval);

    events.on_event(ctx, Event::EnumerationFailed(err));
    events.on_event(ctx, Event::DeviceUnattached);
    if was_connected {
        events.on_event(ctx, Event::Disconnect);
    }
}
