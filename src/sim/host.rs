//! Simulated host controller, wired to a scripted peripheral

use core::{
    cell::Cell,
    ops::Range,
};

use heapless::{Deque, Vec};
use usb_device::{control::{Request, RequestType}, descriptor::descriptor_type, endpoint::EndpointAddress, UsbDirection};

use super::{
    enqueue,
    memory::BankMemory,
    next_frame, packet, record,
    registers::{modify_reg, read_reg, write_reg, PipeRegisters},
    Packet, MAX_PACKET_SIZE,
};
use crate::{
    hw::{Bank, HostHardware, PipeAddress, PipeToken, TransferDescriptor},
    request::ControlRequestHeader,
};

/// Number of simulated pipes, including the control pipe.
pub const PIPE_COUNT: usize = 7;

const QUEUE_DEPTH: usize = 32;
const LOG_DEPTH: usize = 64;
const CONTROL_DATA: usize = 256;

/// How the scripted peripheral answers the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Answers every standard request it understands, and accepts vendor
    /// requests without data.
    Responsive,
    /// Acknowledges SETUP packets, then NAKs every data and status token.
    NakForever,
    /// Acknowledges SETUP packets, then STALLs every data and status token.
    Stall,
}

/// What the peripheral sends back for one IN token.
enum InResponse {
    Data(Packet),
    Nak,
    Stall,
}

/// What the peripheral sends back for one OUT token.
enum OutResponse {
    Ack,
    Nak,
    Stall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    DataIn,
    DataOut,
    StatusIn,
}

/// Device descriptor of the default peripheral: USB 2.0, 64 byte control
/// endpoint, one configuration.
const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1,
];

/// Configuration descriptor of the default peripheral: one vendor interface.
const CONFIGURATION_DESCRIPTOR: [u8; 18] = [
    9, 0x02, 18, 0, 1, 1, 0, 0x80, 50, //
    9, 0x04, 0, 0, 0, 0xFF, 0, 0, 0,
];

/// The device at the other end of the bus.
struct Peripheral {
    behavior: Behavior,
    device_descriptor: [u8; 18],
    address: u8,
    pending_address: Option<u8>,
    configuration: u8,
    alternate_setting: u8,
    stage: Stage,
    stalled: bool,
    expected: usize,
    response: Vec<u8, CONTROL_DATA>,
    sent: usize,
    data_done: bool,
    received: Vec<u8, CONTROL_DATA>,
    requests: Vec<ControlRequestHeader, LOG_DEPTH>,
}

impl Peripheral {
    const fn new(behavior: Behavior) -> Self {
        Peripheral {
            behavior,
            device_descriptor: DEVICE_DESCRIPTOR,
            address: 0,
            pending_address: None,
            configuration: 0,
            alternate_setting: 0,
            stage: Stage::Idle,
            stalled: false,
            expected: 0,
            response: Vec::new(),
            sent: 0,
            data_done: false,
            received: Vec::new(),
            requests: Vec::new(),
        }
    }

    fn bus_reset(&mut self) {
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.stage = Stage::Idle;
        self.stalled = false;
    }

    fn control_packet_size(&self) -> usize {
        usize::from(self.device_descriptor[7]).max(8)
    }

    fn respond(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.expected);
        self.response.extend_from_slice(&bytes[..len]).ok();
    }

    fn setup(&mut self, header: ControlRequestHeader) {
        record(&mut self.requests, header);
        self.response.clear();
        self.received.clear();
        self.sent = 0;
        self.data_done = false;
        self.expected = usize::from(header.length);
        self.stalled = self.behavior == Behavior::Stall;
        self.stage = match header.data_stage() {
            Some(UsbDirection::In) => Stage::DataIn,
            Some(UsbDirection::Out) => Stage::DataOut,
            None => Stage::StatusIn,
        };

        if header.kind() == RequestType::Vendor {
            return;
        }
        match header.request {
            Request::GET_DESCRIPTOR => match header.descriptor_type() {
                descriptor_type::DEVICE => {
                    let descriptor = self.device_descriptor;
                    let len = usize::from(descriptor[0]).min(descriptor.len());
                    self.respond(&descriptor[..len]);
                }
                descriptor_type::CONFIGURATION => self.respond(&CONFIGURATION_DESCRIPTOR),
                _ => self.stalled = true,
            },
            Request::SET_ADDRESS => self.pending_address = Some((header.value & 0x7F) as u8),
            Request::SET_CONFIGURATION => self.configuration = header.value as u8,
            Request::GET_CONFIGURATION => {
                let configuration = self.configuration;
                self.respond(&[configuration]);
            }
            Request::SET_INTERFACE => self.alternate_setting = header.value as u8,
            Request::CLEAR_FEATURE => {}
            _ => self.stalled = true,
        }
    }

    fn in_token(&mut self, packet_size: usize) -> InResponse {
        if self.stalled {
            return InResponse::Stall;
        }
        if self.behavior == Behavior::NakForever {
            return InResponse::Nak;
        }
        match self.stage {
            Stage::DataIn if !self.data_done => {
                let size = packet_size.min(self.control_packet_size());
                let end = (self.sent + size).min(self.response.len());
                let data = packet(&self.response[self.sent..end]);
                self.sent = end;
                if data.len() < size || self.sent >= self.expected {
                    self.data_done = true;
                }
                InResponse::Data(data)
            }
            Stage::StatusIn => {
                self.stage = Stage::Idle;
                if let Some(address) = self.pending_address.take() {
                    self.address = address;
                }
                InResponse::Data(Packet::new())
            }
            _ => InResponse::Nak,
        }
    }

    fn out_token(&mut self, data: &[u8]) -> OutResponse {
        if self.stalled {
            return OutResponse::Stall;
        }
        if self.behavior == Behavior::NakForever {
            return OutResponse::Nak;
        }
        match self.stage {
            Stage::DataOut => {
                self.received.extend_from_slice(data).ok();
                if self.received.len() >= self.expected {
                    self.stage = Stage::StatusIn;
                }
            }
            Stage::DataIn => self.stage = Stage::Idle,
            _ => {}
        }
        OutResponse::Ack
    }
}

struct PipeSlot {
    regs: PipeRegisters,
    descriptor: Option<TransferDescriptor>,
    endpoint: EndpointAddress,
    memory: Range<usize>,
    fill: usize,
    cursor: usize,
    /// A written bank waiting for its token.
    queued: Option<Packet>,
    incoming: Deque<Packet, QUEUE_DEPTH>,
    outgoing: Vec<Packet, LOG_DEPTH>,
    stall_next: bool,
}

impl PipeSlot {
    fn new() -> Self {
        PipeSlot {
            regs: PipeRegisters::new(),
            descriptor: None,
            endpoint: EndpointAddress::from_parts(0, UsbDirection::Out),
            memory: 0..0,
            fill: 0,
            cursor: 0,
            queued: None,
            incoming: Deque::new(),
            outgoing: Vec::new(),
            stall_next: false,
        }
    }

    fn max_packet_size(&self) -> usize {
        self.descriptor
            .map_or(0, |descriptor| usize::from(descriptor.max_packet_size))
    }

    fn token(&self) -> PipeToken {
        match read_reg!(super::registers, &self.regs, UPCFG0X, PTOKEN) {
            0b01 => PipeToken::In,
            0b10 => PipeToken::Out,
            _ => PipeToken::Setup,
        }
    }

    fn is_frozen(&self) -> bool {
        read_reg!(super::registers, &self.regs, UPCONX, PFREEZE == 1)
    }
}

/// A host controller, with a scripted peripheral on the other side of the bus.
///
/// Pipe 0 talks to the peripheral's control endpoint, which answers standard
/// requests according to its [`Behavior`]. The peripheral only answers
/// requests addressed to its current address. Other pipes exchange packets
/// with queues: [`device_in`](SimHost::device_in) provides the packets an IN
/// pipe receives, and [`out_packets`](SimHost::out_packets) logs the packets
/// an OUT pipe sends.
pub struct SimHost {
    memory: BankMemory,
    pipes: [PipeSlot; PIPE_COUNT],
    selected: PipeAddress,
    vbus: bool,
    plugged: bool,
    bus_suspended: bool,
    reset_polls: Cell<u8>,
    bus_resets: usize,
    address: u8,
    frame: Cell<u16>,
    delayed_ms: u32,
    peripheral: Peripheral,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new(Behavior::Responsive)
    }
}

impl SimHost {
    /// A host with VBUS off, a suspended bus, and no device plugged in.
    pub fn new(behavior: Behavior) -> Self {
        SimHost {
            memory: BankMemory::new(),
            pipes: core::array::from_fn(|_| PipeSlot::new()),
            selected: PipeAddress::CONTROL,
            vbus: false,
            plugged: false,
            bus_suspended: true,
            reset_polls: Cell::new(0),
            bus_resets: 0,
            address: 0,
            frame: Cell::new(0),
            delayed_ms: 0,
            peripheral: Peripheral::new(behavior),
        }
    }

    fn pipe(&self) -> &PipeSlot {
        &self.pipes[self.selected.index() % PIPE_COUNT]
    }

    fn pipe_mut(&mut self) -> &mut PipeSlot {
        &mut self.pipes[self.selected.index() % PIPE_COUNT]
    }

    /// Plug the peripheral into the bus.
    pub fn plug(&mut self) {
        self.plugged = true;
    }

    /// Unplug the peripheral.
    pub fn unplug(&mut self) {
        self.plugged = false;
        self.peripheral.bus_reset();
    }

    /// Replace the peripheral's device descriptor.
    ///
    /// The peripheral answers with the first `bLength` bytes.
    pub fn set_device_descriptor(&mut self, descriptor: [u8; 18]) {
        self.peripheral.device_descriptor = descriptor;
    }

    /// Every SETUP packet the peripheral acknowledged.
    pub fn requests(&self) -> &[ControlRequestHeader] {
        &self.peripheral.requests
    }

    /// Data stage bytes the peripheral received in the current request.
    pub fn received_control_data(&self) -> &[u8] {
        &self.peripheral.received
    }

    pub fn peripheral_address(&self) -> u8 {
        self.peripheral.address
    }

    pub fn peripheral_configuration(&self) -> u8 {
        self.peripheral.configuration
    }

    pub fn peripheral_alternate_setting(&self) -> u8 {
        self.peripheral.alternate_setting
    }

    /// The peripheral sends `data` as one packet to IN pipe `pipe`.
    pub fn device_in(&mut self, pipe: usize, data: &[u8]) {
        let index = pipe % PIPE_COUNT;
        enqueue(&mut self.pipes[index].incoming, packet(data));
        self.service(index);
    }

    /// Packets sent on OUT pipe `pipe`.
    pub fn out_packets(&self, pipe: usize) -> &[Packet] {
        &self.pipes[pipe % PIPE_COUNT].outgoing
    }

    /// Respond to the next token on pipe `pipe` with STALL.
    pub fn stall_pipe(&mut self, pipe: usize) {
        let index = pipe % PIPE_COUNT;
        self.pipes[index].stall_next = true;
        self.service(index);
    }

    /// Flag a transfer error on pipe `pipe`.
    pub fn inject_error(&mut self, pipe: usize) {
        let slot = &self.pipes[pipe % PIPE_COUNT];
        modify_reg!(super::registers, &slot.regs, UPINTX, PERRI: 1);
    }

    pub fn is_vbus_on(&self) -> bool {
        self.vbus
    }

    /// Returns the address that pipes are sending to.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn bus_resets(&self) -> usize {
        self.bus_resets
    }

    /// Total time spent in `delay_ms`.
    pub fn delayed_ms(&self) -> u32 {
        self.delayed_ms
    }

    /// Returns the configuration of pipe `pipe`.
    pub fn pipe_descriptor(&self, pipe: usize) -> Option<TransferDescriptor> {
        self.pipes[pipe % PIPE_COUNT].descriptor
    }

    /// Indicates if pipe `pipe` is frozen.
    pub fn is_pipe_frozen(&self, pipe: usize) -> bool {
        self.pipes[pipe % PIPE_COUNT].is_frozen()
    }

    /// Issue whatever token pipe `index` is ready to issue.
    fn service(&mut self, index: usize) {
        let connected = self.is_device_connected();
        let addressed = self.address == self.peripheral.address;
        let slot = &mut self.pipes[index];
        if slot.descriptor.is_none() || slot.is_frozen() || !connected {
            return;
        }
        if read_reg!(super::registers, &slot.regs, UPINTX, RXSTALLI == 1) {
            return;
        }
        if slot.stall_next {
            slot.stall_next = false;
            modify_reg!(super::registers, &slot.regs, UPINTX, RXSTALLI: 1);
            return;
        }
        let control = slot.endpoint.index() == 0;
        let packet_size = slot.max_packet_size();

        match slot.token() {
            PipeToken::Setup => {
                if let Some(queued) = slot.queued.take() {
                    if !control || !addressed || queued.len() != ControlRequestHeader::SIZE {
                        slot.queued = Some(queued);
                        return;
                    }
                    let mut bytes = [0; ControlRequestHeader::SIZE];
                    bytes.copy_from_slice(&queued);
                    self.peripheral.setup(ControlRequestHeader::parse(&bytes));
                    modify_reg!(super::registers, &slot.regs, UPINTX, TXSTPI: 1);
                }
            }
            PipeToken::In => {
                if read_reg!(super::registers, &slot.regs, UPINTX, RXINI == 1) {
                    return;
                }
                let response = if !control {
                    slot.incoming.pop_front().map_or(InResponse::Nak, InResponse::Data)
                } else if addressed {
                    self.peripheral.in_token(packet_size)
                } else {
                    InResponse::Nak
                };
                match response {
                    InResponse::Data(data) => {
                        self.memory.fill(slot.memory.start, &data);
                        slot.fill = data.len();
                        slot.cursor = 0;
                        modify_reg!(super::registers, &slot.regs, UPINTX, RXINI: 1);
                    }
                    InResponse::Stall => {
                        modify_reg!(super::registers, &slot.regs, UPINTX, RXSTALLI: 1)
                    }
                    InResponse::Nak => {}
                }
            }
            PipeToken::Out => {
                if let Some(queued) = slot.queued.take() {
                    let response = if !control {
                        record(&mut slot.outgoing, queued.clone());
                        OutResponse::Ack
                    } else if addressed {
                        self.peripheral.out_token(&queued)
                    } else {
                        OutResponse::Nak
                    };
                    match response {
                        OutResponse::Ack => {}
                        OutResponse::Nak => {
                            slot.queued = Some(queued);
                            return;
                        }
                        OutResponse::Stall => {
                            modify_reg!(super::registers, &slot.regs, UPINTX, RXSTALLI: 1);
                            return;
                        }
                    }
                }
                modify_reg!(super::registers, &slot.regs, UPINTX, TXOUTI: 1);
            }
        }
    }
}

impl Bank for SimHost {
    fn max_packet_size(&self) -> u16 {
        self.pipe().max_packet_size() as u16
    }

    fn bytes_in_bank(&self) -> u16 {
        let slot = self.pipe();
        (slot.fill - slot.cursor) as u16
    }

    fn is_read_write_allowed(&self) -> bool {
        let slot = self.pipe();
        if slot.descriptor.is_none() {
            return false;
        }
        match slot.token() {
            PipeToken::In => {
                read_reg!(super::registers, &slot.regs, UPINTX, RXINI == 1) && slot.cursor < slot.fill
            }
            PipeToken::Out | PipeToken::Setup => {
                slot.queued.is_none() && slot.fill < slot.max_packet_size()
            }
        }
    }

    fn read_byte(&mut self) -> u8 {
        let index = self.selected.index() % PIPE_COUNT;
        let slot = &mut self.pipes[index];
        if slot.cursor < slot.fill {
            let byte = self.memory.get(slot.memory.start + slot.cursor);
            slot.cursor += 1;
            byte
        } else {
            0
        }
    }

    fn write_byte(&mut self, byte: u8) {
        let index = self.selected.index() % PIPE_COUNT;
        let slot = &mut self.pipes[index];
        if slot.fill < slot.max_packet_size() {
            self.memory.set(slot.memory.start + slot.fill, byte);
            slot.fill += 1;
        }
    }

    fn is_stalled(&self) -> bool {
        read_reg!(super::registers, &self.pipe().regs, UPINTX, RXSTALLI == 1)
    }

    fn clear_stall(&mut self) {
        modify_reg!(super::registers, &self.pipe().regs, UPINTX, RXSTALLI: 0);
    }

    fn frame_number(&self) -> u16 {
        if self.vbus && !self.bus_suspended {
            next_frame(&self.frame)
        } else {
            self.frame.get()
        }
    }
}

impl HostHardware for SimHost {
    const PIPE_COUNT: u8 = PIPE_COUNT as u8;

    fn select_pipe(&mut self, pipe: PipeAddress) {
        self.selected = pipe;
    }

    fn selected_pipe(&self) -> PipeAddress {
        self.selected
    }

    fn configure_pipe(
        &mut self,
        pipe: PipeAddress,
        descriptor: &TransferDescriptor,
        endpoint: EndpointAddress,
    ) -> bool {
        self.select_pipe(pipe);
        let size = usize::from(descriptor.max_packet_size);
        if size == 0 || size > MAX_PACKET_SIZE {
            warn!("SIM PIPE{} REJECTED SIZE {}", pipe.index(), size);
            return false;
        }
        let slot = &mut self.pipes[pipe.index() % PIPE_COUNT];
        if slot.memory.len() < descriptor.bank_memory() {
            match self.memory.allocate(descriptor.bank_memory()) {
                Some(range) => slot.memory = range,
                None => {
                    warn!("SIM PIPE{} OUT OF BANK MEMORY", pipe.index());
                    return false;
                }
            }
        }
        slot.descriptor = Some(*descriptor);
        slot.endpoint = endpoint;
        slot.fill = 0;
        slot.cursor = 0;
        slot.queued = None;
        let token = match (descriptor.transfer_type, descriptor.direction) {
            (crate::hw::TransferType::Control, _) => 0b00,
            (_, UsbDirection::In) => 0b01,
            (_, UsbDirection::Out) => 0b10,
        };
        write_reg!(super::registers, &slot.regs, UPINTX, TXOUTI: 0);
        write_reg!(super::registers, &slot.regs, UPCONX, PEN: 1, PFREEZE: 1);
        write_reg!(super::registers, &slot.regs, UPCFG0X, PTOKEN: token);
        true
    }

    fn is_pipe_configured(&self) -> bool {
        let slot = self.pipe();
        slot.descriptor.is_some() && read_reg!(super::registers, &slot.regs, UPCONX, PEN == 1)
    }

    fn bound_endpoint(&self) -> EndpointAddress {
        self.pipe().endpoint
    }

    fn disable_pipes(&mut self) {
        for slot in self.pipes.iter_mut() {
            let outgoing = core::mem::take(&mut slot.outgoing);
            *slot = PipeSlot::new();
            slot.outgoing = outgoing;
        }
        self.memory.release_all();
    }

    fn reset_pipe(&mut self, pipe: PipeAddress) {
        let slot = &mut self.pipes[pipe.index() % PIPE_COUNT];
        slot.fill = 0;
        slot.cursor = 0;
        slot.queued = None;
        write_reg!(super::registers, &slot.regs, UPINTX, TXOUTI: 0);
    }

    fn set_token(&mut self, token: PipeToken) {
        let token = match token {
            PipeToken::Setup => 0b00,
            PipeToken::In => 0b01,
            PipeToken::Out => 0b10,
        };
        let index = self.selected.index() % PIPE_COUNT;
        modify_reg!(super::registers, &self.pipes[index].regs, UPCFG0X, PTOKEN: token);
        modify_reg!(super::registers, &self.pipes[index].regs, UPINTX, TXOUTI: 0);
        self.service(index);
    }

    fn token(&self) -> PipeToken {
        self.pipe().token()
    }

    fn freeze(&mut self) {
        modify_reg!(super::registers, &self.pipe().regs, UPCONX, PFREEZE: 1);
    }

    fn unfreeze(&mut self) {
        modify_reg!(super::registers, &self.pipe().regs, UPCONX, PFREEZE: 0);
        self.service(self.selected.index() % PIPE_COUNT);
    }

    fn is_frozen(&self) -> bool {
        self.pipe().is_frozen()
    }

    fn is_setup_sent(&self) -> bool {
        read_reg!(super::registers, &self.pipe().regs, UPINTX, TXSTPI == 1)
    }

    fn clear_setup_sent(&mut self) {
        modify_reg!(super::registers, &self.pipe().regs, UPINTX, TXSTPI: 0);
    }

    fn is_in_received(&self) -> bool {
        read_reg!(super::registers, &self.pipe().regs, UPINTX, RXINI == 1)
    }

    fn is_out_ready(&self) -> bool {
        read_reg!(super::registers, &self.pipe().regs, UPINTX, TXOUTI == 1)
    }

    fn clear_in(&mut self) {
        let slot = self.pipe_mut();
        slot.fill = 0;
        slot.cursor = 0;
        modify_reg!(super::registers, &slot.regs, UPINTX, RXINI: 0);
        self.service(self.selected.index() % PIPE_COUNT);
    }

    fn clear_out(&mut self) {
        let index = self.selected.index() % PIPE_COUNT;
        let slot = &mut self.pipes[index];
        let bank = self.memory.slice(slot.memory.start..slot.memory.start + slot.fill);
        slot.queued = Some(packet(bank));
        slot.fill = 0;
        slot.cursor = 0;
        modify_reg!(super::registers, &slot.regs, UPINTX, TXOUTI: 0);
        trace!("SIM PIPE{} SEND", index);
        self.service(index);
    }

    fn is_error(&self) -> bool {
        read_reg!(super::registers, &self.pipe().regs, UPINTX, PERRI == 1)
    }

    fn clear_error(&mut self) {
        modify_reg!(super::registers, &self.pipe().regs, UPINTX, PERRI: 0);
    }

    fn reset_bus(&mut self) {
        self.bus_resets += 1;
        self.reset_polls.set(3);
        self.peripheral.bus_reset();
    }

    fn is_bus_reset_complete(&self) -> bool {
        match self.reset_polls.get() {
            0 => true,
            polls => {
                self.reset_polls.set(polls - 1);
                false
            }
        }
    }

    fn suspend_bus(&mut self) {
        self.bus_suspended = true;
    }

    fn resume_bus(&mut self) {
        self.bus_suspended = false;
    }

    fn is_bus_suspended(&self) -> bool {
        self.bus_suspended
    }

    fn set_device_address(&mut self, address: u8) {
        self.address = address & 0x7F;
    }

    fn is_device_connected(&self) -> bool {
        self.plugged && self.vbus
    }

    fn set_vbus(&mut self, on: bool) {
        self.vbus = on;
        if !on {
            self.peripheral.bus_reset();
        }
    }

    fn delay_ms(&mut self, ms: u16) {
        self.delayed_ms += u32::from(ms);
    }
}
