//! Control request header
//!
//! The eight byte SETUP packet that starts every control transfer, and
//! helpers for building the standard requests. Request and descriptor
//! codes come from `usb-device`.

use usb_device::{
    control::{Recipient, Request, RequestType},
    descriptor::descriptor_type,
    UsbDirection,
};

/// Mask of the direction bit in `bmRequestType`.
const DIRECTION_MASK: u8 = 0x80;
/// Mask of the type field in `bmRequestType`.
const TYPE_MASK: u8 = 0x60;
const TYPE_SHIFT: u8 = 5;
/// Mask of the recipient field in `bmRequestType`.
const RECIPIENT_MASK: u8 = 0x1F;

/// Compose a `bmRequestType` bitfield.
pub const fn request_type(direction: UsbDirection, kind: RequestType, recipient: Recipient) -> u8 {
    let kind = match kind {
        RequestType::Standard => 0,
        RequestType::Class => 1,
        RequestType::Vendor => 2,
        RequestType::Reserved => 3,
    };
    let recipient = match recipient {
        Recipient::Device => 0,
        Recipient::Interface => 1,
        Recipient::Endpoint => 2,
        Recipient::Other => 3,
        Recipient::Reserved => 4,
    };
    direction as u8 | (kind << TYPE_SHIFT) | recipient
}

/// A control request header (SETUP packet).
///
/// One header exists per control transaction. On the device side, it's read
/// from the control endpoint; on the host side, the caller fills it in before
/// calling [`send_control_request`](crate::host::send_control_request).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ControlRequestHeader {
    /// `bmRequestType`: direction, type and recipient.
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`: the maximum number of bytes in the data stage.
    pub length: u16,
}

impl ControlRequestHeader {
    /// Size of a SETUP packet, in bytes.
    pub const SIZE: usize = 8;

    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        ControlRequestHeader {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Decode a header from its little-endian wire format.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        ControlRequestHeader {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Encode the header in its little-endian wire format.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data stage, as encoded in `bmRequestType`.
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type & DIRECTION_MASK)
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type & TYPE_MASK) >> TYPE_SHIFT {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Direction of the data stage, or `None` if there is no data stage.
    pub fn data_stage(&self) -> Option<UsbDirection> {
        (self.length > 0).then(|| self.direction())
    }

    /// Direction of the status stage.
    ///
    /// The status stage always runs opposite to the data stage. Without a
    /// data stage, the status stage is IN.
    pub fn status_stage(&self) -> UsbDirection {
        match self.data_stage() {
            Some(UsbDirection::In) => UsbDirection::Out,
            Some(UsbDirection::Out) | None => UsbDirection::In,
        }
    }

    /// Descriptor type requested by `GET_DESCRIPTOR` (high byte of `wValue`).
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index requested by `GET_DESCRIPTOR` (low byte of `wValue`).
    pub fn descriptor_index(&self) -> u8 {
        self.value as u8
    }

    /// `GET_DESCRIPTOR` for a descriptor of type `kind`, addressed to the device.
    pub fn get_descriptor(kind: u8, index: u8, language: u16, length: u16) -> Self {
        Self::new(
            request_type(UsbDirection::In, RequestType::Standard, Recipient::Device),
            Request::GET_DESCRIPTOR,
            (u16::from(kind) << 8) | u16::from(index),
            language,
            length,
        )
    }

    /// `GET_DESCRIPTOR(Device)`, reading up to `length` bytes.
    pub fn get_device_descriptor(length: u16) -> Self {
        Self::get_descriptor(descriptor_type::DEVICE, 0, 0, length)
    }

    /// `SET_ADDRESS`
    pub fn set_address(address: u8) -> Self {
        Self::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Device),
            Request::SET_ADDRESS,
            u16::from(address & 0x7F),
            0,
            0,
        )
    }

    /// `SET_CONFIGURATION`
    pub fn set_configuration(configuration: u8) -> Self {
        Self::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Device),
            Request::SET_CONFIGURATION,
            u16::from(configuration),
            0,
            0,
        )
    }

    /// `GET_CONFIGURATION`
    pub fn get_configuration() -> Self {
        Self::new(
            request_type(UsbDirection::In, RequestType::Standard, Recipient::Device),
            Request::GET_CONFIGURATION,
            0,
            0,
            1,
        )
    }

    /// `SET_INTERFACE`
    pub fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Interface),
            Request::SET_INTERFACE,
            u16::from(alternate_setting),
            u16::from(interface),
            0,
        )
    }

    /// `CLEAR_FEATURE(ENDPOINT_HALT)` for the endpoint with raw address `endpoint`.
    pub fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self::new(
            request_type(UsbDirection::Out, RequestType::Standard, Recipient::Endpoint),
            Request::CLEAR_FEATURE,
            Request::FEATURE_ENDPOINT_HALT,
            u16::from(endpoint),
            0,
        )
    }
}
