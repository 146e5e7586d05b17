//! Simulated device controller, driven by a scripted host

use core::{cell::Cell, ops::Range};

use heapless::{Deque, Vec};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

use super::{
    enqueue,
    memory::BankMemory,
    next_frame, packet, record,
    registers::{modify_reg, read_reg, write_reg, EndpointRegisters},
    Packet, MAX_PACKET_SIZE,
};
use crate::{
    context::Speed,
    hw::{Bank, DeviceHardware, TransferDescriptor, TransferType},
    request::ControlRequestHeader,
};

/// Number of simulated endpoints, including the control endpoint.
pub const ENDPOINT_COUNT: usize = 8;

const QUEUE_DEPTH: usize = 32;
const LOG_DEPTH: usize = 64;
const CONTROL_DATA: usize = 512;

/// Progress of the scripted host through a control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStage {
    Idle,
    /// The host is reading the data stage.
    DataIn,
    /// The host is sending the data stage.
    DataOut,
    /// The host waits for the device's zero-length status packet.
    StatusIn,
    /// The host sent its zero-length status packet.
    StatusOut,
    Complete,
    /// The device stalled the request.
    Stalled,
}

struct Slot {
    regs: EndpointRegisters,
    descriptor: Option<TransferDescriptor>,
    memory: Range<usize>,
    fill: usize,
    cursor: usize,
    pending_out: Deque<Packet, QUEUE_DEPTH>,
    hold_in: bool,
    held: Deque<Packet, QUEUE_DEPTH>,
    sent: Vec<Packet, LOG_DEPTH>,
    toggle_resets: usize,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            regs: EndpointRegisters::new(),
            descriptor: None,
            memory: 0..0,
            fill: 0,
            cursor: 0,
            pending_out: Deque::new(),
            hold_in: false,
            held: Deque::new(),
            sent: Vec::new(),
            toggle_resets: 0,
        }
    }

    fn is_control(&self) -> bool {
        matches!(
            self.descriptor,
            Some(TransferDescriptor {
                transfer_type: TransferType::Control,
                ..
            })
        )
    }

    fn is_in(&self) -> bool {
        matches!(
            self.descriptor,
            Some(TransferDescriptor {
                direction: UsbDirection::In,
                ..
            })
        )
    }

    fn max_packet_size(&self) -> usize {
        self.descriptor
            .map_or(0, |descriptor| usize::from(descriptor.max_packet_size))
    }

    fn banks(&self) -> usize {
        self.descriptor
            .map_or(1, |descriptor| descriptor.banks as usize)
    }

    fn flush(&mut self) {
        self.fill = 0;
        self.cursor = 0;
        self.pending_out.clear();
        self.held.clear();
        let ready = (self.is_in() || self.is_control()) as u32;
        write_reg!(super::registers, &self.regs, UEINTX, TXINI: ready);
    }

    /// The bank holds data for the application to read.
    fn is_reading(&self) -> bool {
        read_reg!(super::registers, &self.regs, UEINTX, RXSTPI == 1)
            || read_reg!(super::registers, &self.regs, UEINTX, RXOUTI == 1)
    }

    /// Move the next host packet into the bank, if the bank is free.
    fn load_next_out(&mut self, memory: &mut BankMemory) {
        if self.is_reading() {
            return;
        }
        if let Some(packet) = self.pending_out.pop_front() {
            memory.fill(self.memory.start, &packet);
            self.fill = packet.len();
            self.cursor = 0;
            modify_reg!(super::registers, &self.regs, UEINTX, RXOUTI: 1);
        }
    }

    fn take_bank(&mut self, memory: &BankMemory) -> Packet {
        let bank = memory.slice(self.memory.start..self.memory.start + self.fill);
        self.fill = 0;
        self.cursor = 0;
        packet(bank)
    }
}

/// The scripted host's view of the current control transfer.
struct ControlScript {
    stage: ControlStage,
    header: ControlRequestHeader,
    in_data: Vec<u8, CONTROL_DATA>,
    in_packets: Vec<usize, LOG_DEPTH>,
    abort_after: Option<usize>,
}

impl ControlScript {
    const fn new() -> Self {
        ControlScript {
            stage: ControlStage::Idle,
            header: ControlRequestHeader::new(0, 0, 0, 0, 0),
            in_data: Vec::new(),
            in_packets: Vec::new(),
            abort_after: None,
        }
    }
}

/// A device controller, with a scripted host on the other side of the bus.
///
/// Endpoints are numbered 0 through 7, and each number has a single
/// direction, chosen when it's configured. Endpoint 0 is the control
/// endpoint.
///
/// Packets that the device sends on IN endpoints are logged, and available
/// through [`in_packets`](SimDevice::in_packets). Control transfers are
/// started with [`host_setup`](SimDevice::host_setup); the scripted host
/// then reads or writes the data stage and runs the status stage as the
/// device responds.
pub struct SimDevice {
    memory: BankMemory,
    slots: [Slot; ENDPOINT_COUNT],
    selected: EndpointAddress,
    address: u8,
    attached: bool,
    vbus: bool,
    suspended: bool,
    clock_frozen: bool,
    pll: bool,
    speed: Speed,
    remote_wakeups: usize,
    frame: Cell<u16>,
    control: ControlScript,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A detached device with VBUS present and no configured endpoints.
    pub fn new() -> Self {
        SimDevice {
            memory: BankMemory::new(),
            slots: core::array::from_fn(|_| Slot::new()),
            selected: EndpointAddress::from_parts(0, UsbDirection::Out),
            address: 0,
            attached: false,
            vbus: true,
            suspended: false,
            clock_frozen: false,
            pll: false,
            speed: Speed::Full,
            remote_wakeups: 0,
            frame: Cell::new(0),
            control: ControlScript::new(),
        }
    }

    fn slot_index(address: EndpointAddress) -> usize {
        address.index() % ENDPOINT_COUNT
    }

    fn slot(&self) -> &Slot {
        &self.slots[Self::slot_index(self.selected)]
    }

    fn slot_mut(&mut self) -> &mut Slot {
        &mut self.slots[Self::slot_index(self.selected)]
    }

    /// Apply or remove VBUS.
    pub fn set_vbus(&mut self, present: bool) {
        self.vbus = present;
    }

    /// The host suspends (`true`) or resumes (`false`) the bus.
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// The host starts a control transfer with `header`.
    ///
    /// For host-to-device requests, `data` is sent as the data stage once the
    /// device acknowledges the SETUP packet.
    pub fn host_setup(&mut self, header: ControlRequestHeader, data: &[u8]) {
        let slot = &mut self.slots[0];
        let packet_size = slot.max_packet_size();
        if packet_size == 0 {
            return;
        }
        slot.flush();
        modify_reg!(super::registers, &slot.regs, UECONX, STALLRQ: 0);
        self.memory.fill(slot.memory.start, &header.to_bytes());
        slot.fill = ControlRequestHeader::SIZE;
        modify_reg!(super::registers, &slot.regs, UEINTX, RXSTPI: 1);

        if header.data_stage() == Some(UsbDirection::Out) {
            for chunk in data.chunks(packet_size) {
                enqueue(&mut slot.pending_out, packet(chunk));
            }
        }

        self.control.header = header;
        self.control.in_data.clear();
        self.control.in_packets.clear();
        self.control.stage = match header.data_stage() {
            Some(UsbDirection::In) => ControlStage::DataIn,
            Some(UsbDirection::Out) => ControlStage::DataOut,
            None => ControlStage::StatusIn,
        };
    }

    /// After `packets` IN data packets, the host abandons the current control
    /// transfer and sends the same SETUP packet again.
    pub fn abort_control_after(&mut self, packets: usize) {
        self.control.abort_after = Some(packets);
    }

    /// The host sends `data` as one packet to OUT endpoint `number`.
    pub fn host_out(&mut self, number: usize, data: &[u8]) {
        let slot = &mut self.slots[number % ENDPOINT_COUNT];
        enqueue(&mut slot.pending_out, packet(data));
        slot.load_next_out(&mut self.memory);
    }

    /// Stop (`true`) or resume (`false`) accepting packets from IN endpoint
    /// `number`.
    ///
    /// While held, each sent bank stays occupied, and the endpoint stops
    /// being ready once every bank is occupied.
    pub fn hold_in(&mut self, number: usize, hold: bool) {
        let slot = &mut self.slots[number % ENDPOINT_COUNT];
        slot.hold_in = hold;
        if !hold {
            while let Some(packet) = slot.held.pop_front() {
                record(&mut slot.sent, packet);
            }
            if slot.descriptor.is_some() {
                modify_reg!(super::registers, &slot.regs, UEINTX, TXINI: 1);
            }
        }
    }

    /// Packets the host accepted from IN endpoint `number`.
    pub fn in_packets(&self, number: usize) -> &[Packet] {
        &self.slots[number % ENDPOINT_COUNT].sent
    }

    pub fn control_stage(&self) -> ControlStage {
        self.control.stage
    }

    /// Data stage bytes the host read during the current control transfer.
    pub fn control_in_data(&self) -> &[u8] {
        &self.control.in_data
    }

    /// Sizes of each IN packet of the current control transfer, including
    /// the status stage.
    pub fn control_in_packets(&self) -> &[usize] {
        &self.control.in_packets
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_clock_frozen(&self) -> bool {
        self.clock_frozen
    }

    pub fn is_pll_on(&self) -> bool {
        self.pll
    }

    /// Signalling speed selected by the engine.
    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// How many times the device signalled remote wake up.
    pub fn remote_wakeups(&self) -> usize {
        self.remote_wakeups
    }

    /// Returns the configuration of endpoint `number`.
    pub fn endpoint_descriptor(&self, number: usize) -> Option<TransferDescriptor> {
        self.slots[number % ENDPOINT_COUNT].descriptor
    }

    /// Returns how many times the data toggle of endpoint `number` was reset.
    pub fn data_toggle_resets(&self, number: usize) -> usize {
        self.slots[number % ENDPOINT_COUNT].toggle_resets
    }

    /// Returns the unallocated bank memory, in bytes.
    pub fn available_bank_memory(&self) -> usize {
        self.memory.available()
    }

    fn control_in(&mut self, packet: Packet) {
        let packet_size = self.slots[0].max_packet_size();
        let len = packet.len();
        record(&mut self.control.in_packets, len);
        match self.control.stage {
            ControlStage::DataIn => {
                self.control.in_data.extend_from_slice(&packet).ok();
                let data_packets = self.control.in_packets.len();
                if self.control.abort_after == Some(data_packets) {
                    self.control.abort_after = None;
                    let header = self.control.header;
                    self.host_setup(header, &[]);
                    return;
                }
                let expected = usize::from(self.control.header.length);
                if len < packet_size || self.control.in_data.len() >= expected {
                    self.control.stage = ControlStage::StatusOut;
                    let slot = &mut self.slots[0];
                    enqueue(&mut slot.pending_out, Packet::new());
                    slot.load_next_out(&mut self.memory);
                }
            }
            ControlStage::StatusIn if len == 0 => self.control.stage = ControlStage::Complete,
            _ => {}
        }
    }

    fn control_out(&mut self) {
        match self.control.stage {
            ControlStage::StatusOut => self.control.stage = ControlStage::Complete,
            ControlStage::DataOut
                if self.slots[0].pending_out.is_empty() && !self.slots[0].is_reading() =>
            {
                self.control.stage = ControlStage::StatusIn
            }
            _ => {}
        }
    }
}

impl Bank for SimDevice {
    fn max_packet_size(&self) -> u16 {
        self.slot().max_packet_size() as u16
    }

    fn bytes_in_bank(&self) -> u16 {
        let slot = self.slot();
        (slot.fill - slot.cursor) as u16
    }

    fn is_read_write_allowed(&self) -> bool {
        let slot = self.slot();
        if slot.descriptor.is_none() {
            return false;
        }
        let reading = if slot.is_control() {
            slot.is_reading()
        } else {
            !slot.is_in()
        };
        if reading {
            slot.is_reading() && slot.cursor < slot.fill
        } else {
            read_reg!(super::registers, &slot.regs, UEINTX, TXINI == 1)
                && slot.fill < slot.max_packet_size()
        }
    }

    fn read_byte(&mut self) -> u8 {
        let index = Self::slot_index(self.selected);
        let slot = &mut self.slots[index];
        if slot.cursor < slot.fill {
            let byte = self.memory.get(slot.memory.start + slot.cursor);
            slot.cursor += 1;
            byte
        } else {
            0
        }
    }

    fn write_byte(&mut self, byte: u8) {
        let index = Self::slot_index(self.selected);
        let slot = &mut self.slots[index];
        if slot.fill < slot.max_packet_size() {
            self.memory.set(slot.memory.start + slot.fill, byte);
            slot.fill += 1;
        }
    }

    fn is_stalled(&self) -> bool {
        read_reg!(super::registers, &self.slot().regs, UECONX, STALLRQ == 1)
    }

    fn clear_stall(&mut self) {
        modify_reg!(super::registers, &self.slot().regs, UECONX, STALLRQ: 0);
    }

    fn frame_number(&self) -> u16 {
        if self.vbus && !self.suspended {
            next_frame(&self.frame)
        } else {
            self.frame.get()
        }
    }
}

impl DeviceHardware for SimDevice {
    fn select_endpoint(&mut self, address: EndpointAddress) {
        self.selected = address;
    }

    fn selected_endpoint(&self) -> EndpointAddress {
        self.selected
    }

    fn configure_endpoint(
        &mut self,
        address: EndpointAddress,
        descriptor: &TransferDescriptor,
    ) -> bool {
        self.select_endpoint(address);
        let size = usize::from(descriptor.max_packet_size);
        if size == 0 || size > MAX_PACKET_SIZE {
            warn!("SIM EP{} REJECTED SIZE {}", address.index(), size);
            return false;
        }
        let index = Self::slot_index(address);
        let slot = &mut self.slots[index];
        if slot.memory.len() < descriptor.bank_memory() {
            match self.memory.allocate(descriptor.bank_memory()) {
                Some(range) => slot.memory = range,
                None => {
                    warn!("SIM EP{} OUT OF BANK MEMORY", address.index());
                    return false;
                }
            }
        }
        slot.descriptor = Some(*descriptor);
        write_reg!(super::registers, &slot.regs, UECONX, EPEN: 1);
        slot.flush();
        true
    }

    fn is_endpoint_configured(&self) -> bool {
        let slot = self.slot();
        slot.descriptor.is_some() && read_reg!(super::registers, &slot.regs, UECONX, EPEN == 1)
    }

    fn disable_endpoints(&mut self) {
        for slot in self.slots.iter_mut() {
            let toggle_resets = slot.toggle_resets;
            let sent = core::mem::take(&mut slot.sent);
            *slot = Slot::new();
            slot.toggle_resets = toggle_resets;
            slot.sent = sent;
        }
        self.memory.release_all();
    }

    fn reset_endpoint(&mut self, address: EndpointAddress) {
        self.slots[Self::slot_index(address)].flush();
    }

    fn is_in_ready(&self) -> bool {
        read_reg!(super::registers, &self.slot().regs, UEINTX, TXINI == 1)
    }

    fn is_out_received(&self) -> bool {
        read_reg!(super::registers, &self.slot().regs, UEINTX, RXOUTI == 1)
    }

    fn is_setup_received(&self) -> bool {
        read_reg!(super::registers, &self.slot().regs, UEINTX, RXSTPI == 1)
    }

    fn clear_in(&mut self) {
        let index = Self::slot_index(self.selected);
        let slot = &mut self.slots[index];
        if slot.descriptor.is_none() {
            return;
        }
        let packet = slot.take_bank(&self.memory);
        trace!("SIM EP{} IN {} BYTES", index, packet.len());
        if slot.is_control() {
            self.control_in(packet);
        } else if slot.hold_in {
            enqueue(&mut slot.held, packet);
            let ready = (slot.held.len() < slot.banks()) as u32;
            modify_reg!(super::registers, &slot.regs, UEINTX, TXINI: ready);
        } else {
            record(&mut slot.sent, packet);
        }
    }

    fn clear_out(&mut self) {
        let index = Self::slot_index(self.selected);
        let slot = &mut self.slots[index];
        slot.fill = 0;
        slot.cursor = 0;
        modify_reg!(super::registers, &slot.regs, UEINTX, RXOUTI: 0);
        let control = slot.is_control();
        slot.load_next_out(&mut self.memory);
        if control {
            self.control_out();
        }
    }

    fn clear_setup(&mut self) {
        let index = Self::slot_index(self.selected);
        let slot = &mut self.slots[index];
        slot.fill = 0;
        slot.cursor = 0;
        modify_reg!(super::registers, &slot.regs, UEINTX, RXSTPI: 0);
        slot.load_next_out(&mut self.memory);
    }

    fn stall_transaction(&mut self) {
        modify_reg!(super::registers, &self.slot().regs, UECONX, STALLRQ: 1);
        if self.slot().is_control() {
            self.control.stage = ControlStage::Stalled;
        }
    }

    fn reset_data_toggle(&mut self) {
        self.slot_mut().toggle_resets += 1;
    }

    fn set_device_address(&mut self, address: u8) {
        self.address = address & 0x7F;
    }

    fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    fn attach(&mut self) {
        self.attached = true;
    }

    fn detach(&mut self) {
        self.attached = false;
    }

    fn is_vbus_present(&self) -> bool {
        self.vbus
    }

    fn is_bus_suspended(&self) -> bool {
        self.suspended
    }

    fn set_clock_frozen(&mut self, frozen: bool) {
        self.clock_frozen = frozen;
    }

    fn send_remote_wakeup(&mut self) {
        trace!("SIM REMOTE WAKEUP");
        self.remote_wakeups += 1;
    }

    fn set_pll(&mut self, on: bool) {
        self.pll = on;
    }
}
