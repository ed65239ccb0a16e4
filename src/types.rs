//! Common types used throughout the crate
//!

use defmt::Format;
use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// Refers to the speed at which the bus operates
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Speed {
    /// USB 1.0 low speed
    Low,
    /// USB 1.0 full speed
    Full,
    /// USB 2.0 high speed
    High,
}

impl Default for Speed {
    fn default() -> Self {
        Speed::Full
    }
}

impl Format for Speed {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "{}",
            match self {
                Speed::Low => "low",
                Speed::Full => "full",
                Speed::High => "high",
            }
        )
    }
}

/// Represents one of the four transfer types that USB supports
#[derive(Copy, Clone, PartialEq, Format)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Outcome of a completed transfer, as reported by the controller
#[derive(Copy, Clone, PartialEq, Format)]
pub enum XferResult {
    Success,
    Failed,
    Stalled,
}

/// Stage of a control transfer at which a class driver is called
#[derive(Copy, Clone, PartialEq, Format)]
pub enum ControlStage {
    /// A SETUP packet was received; the driver must queue a response
    Setup,
    /// The data stage finished. For OUT requests this is where the
    /// received bytes are validated; returning `false` stalls the
    /// status stage.
    Data,
    /// The status stage finished; last chance to apply side effects
    Ack,
}

/// Address of an endpoint: number (0..15) plus direction in bit 7
///
/// Endpoint zero is the bidirectional control endpoint; it is addressed
/// as two halves (`0x00` for OUT, `0x80` for IN).
#[derive(Clone, Copy, PartialEq, Eq, Format)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub const fn new(number: u8, direction: UsbDirection) -> Self {
        Self((number & 0xF) | direction as u8)
    }

    /// Endpoint number
    ///
    /// Ranges from 0 to 15.
    pub fn number(&self) -> u8 {
        self.0 & 0xF
    }

    /// Direction of the endpoint
    pub fn direction(&self) -> UsbDirection {
        self.0.into()
    }

    pub fn is_in(&self) -> bool {
        self.0 & 0x80 != 0
    }
}

impl From<u8> for EndpointAddress {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<EndpointAddress> for u8 {
    fn from(value: EndpointAddress) -> Self {
        value.0
    }
}

/// Represents a setup packet
///
/// Every control transfer starts with the host sending one of these.
/// The raw 8 bytes arrive through [`crate::event::EventSink::setup_received`];
/// the device task decodes them with [`SetupPacket::from_bytes`] and routes
/// the request.
#[derive(Clone, Copy, PartialEq, Format)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Construct a setup packet
    ///
    /// Mostly useful for tests and host-side tooling; the device normally
    /// only ever decodes packets received from the host.
    ///
    /// - `direction`: direction of the data stage (ignored when `length` is 0)
    /// - `request_type`: `Standard`, `Class` or `Vendor`
    /// - `recipient`: `Device`, `Interface`, `Endpoint` or `Other`
    /// - `request`, `value`: meaning depends on `request_type`
    /// - `index`: interface or endpoint number for those recipients
    /// - `length`: number of bytes in the data stage
    pub fn new(
        direction: UsbDirection,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: (recipient as u8) | ((request_type as u8) << 5) | (direction as u8),
            request,
            value,
            index,
            length,
        }
    }

    /// Decode the 8 bytes of a SETUP packet (little-endian fields)
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
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

    /// Direction of the data stage
    pub fn direction(&self) -> UsbDirection {
        self.request_type.into()
    }

    pub fn request_kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }
}
