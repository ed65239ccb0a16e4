//! Types for (standard) descriptors
//!
//! On the device side descriptors are supplied by the application as raw bytes and
//! served to the host verbatim; the stack itself only ever *reads* them in two places:
//! - `GET_DESCRIPTOR` needs the embedded lengths (`wTotalLength`, a string descriptor's
//!   first byte) to know how much to send
//! - `SET_CONFIGURATION` walks the configuration descriptor to hand each interface to
//!   a class driver and to open the endpoints the driver consumed
//!
//! All descriptors share a common framing: the first two bytes contain the descriptor
//! **length** and **type**. This framing is represented by the [`Descriptor`] type;
//! [`parse::any_descriptor`] splits it off, and the typed views below interpret the
//! remaining data.

use crate::types::{EndpointAddress, TransferType};
use defmt::Format;

/// [`descriptor_type`](Descriptor::descriptor_type) identifying a device descriptor
pub const TYPE_DEVICE: u8 = 1;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying a [`ConfigurationDescriptor`]
pub const TYPE_CONFIGURATION: u8 = 2;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying a string descriptor
pub const TYPE_STRING: u8 = 3;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying an [`InterfaceDescriptor`]
pub const TYPE_INTERFACE: u8 = 4;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying an [`EndpointDescriptor`]
pub const TYPE_ENDPOINT: u8 = 5;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying a device-qualifier descriptor
pub const TYPE_DEVICE_QUALIFIER: u8 = 6;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying an other-speed configuration
pub const TYPE_OTHER_SPEED_CONFIGURATION: u8 = 7;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying an [`InterfaceAssociationDescriptor`]
pub const TYPE_INTERFACE_ASSOCIATION: u8 = 11;
/// [`descriptor_type`](Descriptor::descriptor_type) identifying a BOS descriptor
pub const TYPE_BOS: u8 = 15;

/// Size of the device descriptor, fixed by the USB specification
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
/// Size of an interface descriptor
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
/// Size of an endpoint descriptor
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// Outer framing of a descriptor
pub struct Descriptor<'a> {
    /// Total length of the descriptor, including this length byte itself and the `descriptor_type` byte
    pub length: u8,
    /// Type of descriptor. If this is a standard descriptor, it corresponds to one of the `TYPE_*` constants,
    /// otherwise it is class or vendor specific.
    pub descriptor_type: u8,
    /// Remaining data of the descriptor (`length - 2` bytes)
    pub data: &'a [u8],
}

/// The configuration descriptor header.
///
/// On the wire it is followed by all interface, endpoint and class-specific
/// descriptors of the configuration; `total_length` covers the whole bundle,
/// and is what GET_DESCRIPTOR(CONFIGURATION) responses are sized by.
#[derive(Format)]
pub struct ConfigurationDescriptor {
    /// Combined length of the configuration descriptor and every descriptor
    /// nested under it
    pub total_length: u16,

    /// Number of interfaces in this configuration
    pub num_interfaces: u8,

    /// The value the host passes in SET_CONFIGURATION to select this configuration
    pub value: u8,

    /// Index of string descriptor describing this configuration
    pub index: u8,

    /// Power characteristics; the stack mirrors these in GET_STATUS and the
    /// remote-wakeup feature handling
    pub attributes: ConfigurationAttributes,

    /// Maximum bus power draw, in 2 mA units
    pub max_power: u8,
}

#[derive(Clone, Copy, Format)]
pub struct ConfigurationAttributes(u8);

/// Part of the [`ConfigurationDescriptor`]
impl ConfigurationAttributes {
    /// The configuration declares the device as self-powered
    pub fn self_powered(&self) -> bool {
        (self.0 >> 6) & 1 == 1
    }

    /// Device supports remote wakeup in this configuration
    pub fn remote_wakeup(&self) -> bool {
        (self.0 >> 5) & 1 == 1
    }
}

/// The interface descriptor describes a specific interface within a configuration.
///
/// During `SET_CONFIGURATION` each parsed interface descriptor is offered to the
/// class drivers in turn; the first driver that recognises the class triple claims
/// the interface and everything up to the next unclaimed interface.
#[derive(Format)]
pub struct InterfaceDescriptor {
    /// Zero-based number of this interface within the configuration
    pub interface_number: u8,

    /// Alternate setting this descriptor describes
    pub alternate_setting: u8,

    /// Number of endpoints used by this interface (excluding endpoint zero)
    pub num_endpoints: u8,

    /// Class code; drivers match on the (class, subclass, protocol) triple
    pub interface_class: u8,

    /// Subclass code, qualified by `interface_class`
    pub interface_sub_class: u8,

    /// Protocol code, qualified by `interface_class` and `interface_sub_class`
    pub interface_protocol: u8,

    /// Index of string descriptor describing this interface
    pub interface_index: u8,
}

/// Groups consecutive interfaces into one function ("IAD").
///
/// A class always starts with the interface association (if any), immediately
/// followed by its first interface descriptor.
#[derive(Format)]
pub struct InterfaceAssociationDescriptor {
    /// Number of the first associated interface
    pub first_interface: u8,
    /// How many consecutive interfaces belong to the function
    pub interface_count: u8,
    pub function_class: u8,
    pub function_sub_class: u8,
    pub function_protocol: u8,
    /// Index of string descriptor describing the function
    pub function_index: u8,
}

/// Each endpoint used for an interface has its own descriptor.
///
/// This is what [`crate::UsbDevice::edpt_open`] validates before handing the
/// endpoint to the controller.
#[derive(Format)]
pub struct EndpointDescriptor {
    /// Number and direction of the endpoint
    pub address: EndpointAddress,

    /// Transfer type (and iso sync/usage bits, which this stack ignores)
    pub attributes: EndpointAttributes,

    /// Maximum packet size when this configuration is selected; bounds checked
    /// against the transfer type and bus speed on open
    pub max_packet_size: u16,

    /// Polling interval in frames (interrupt and isochronous endpoints)
    pub interval: u8,
}

#[derive(Clone, Copy, Format)]
/// Attributes of an endpoint
///
/// Part of an [`EndpointDescriptor`].
pub struct EndpointAttributes(u8);

impl EndpointAttributes {
    pub fn transfer_type(&self) -> TransferType {
        unsafe { core::mem::transmute(self.0 & 0b11) }
    }
}

pub mod parse {
    use nom::bytes::streaming::take;
    use nom::combinator::map;
    use nom::number::streaming::{le_u16, u8};
    use nom::sequence::tuple;
    use nom::IResult;

    use super::*;

    /// Parse outer framing of a descriptor
    ///
    /// The resulting `data` within the descriptor can then be parsed with one of the other functions below,
    /// depending on the `type`.
    pub fn any_descriptor(input: &[u8]) -> IResult<&[u8], Descriptor<'_>> {
        let (input, (length, descriptor_type)) = tuple((u8, u8))(input)?;
        let (input, data) = take(length.saturating_sub(2) as usize)(input)?;
        Ok((input, Descriptor { length, descriptor_type, data }))
    }

    /// Parse descriptor data for a configuration
    pub fn configuration_descriptor(input: &[u8]) -> IResult<&[u8], ConfigurationDescriptor> {
        map(
            tuple((le_u16, u8, u8, u8, u8, u8)),
            |(total_length, num_interfaces, value, index, attributes, max_power)| {
                ConfigurationDescriptor {
                    total_length, num_interfaces, value, index,
                    attributes: ConfigurationAttributes(attributes),
                    max_power,
                }
            }
        )(input)
    }

    /// Parse only the `total_length` from a (partial) configuration descriptor.
    ///
    /// `wTotalLength` sits at an odd offset; reading it through `le_u16` keeps
    /// the access byte-wise, so alignment never matters.
    pub fn configuration_total_length(input: &[u8]) -> IResult<&[u8], u16> {
        let (input, _) = take(2usize)(input)?;
        le_u16(input)
    }

    /// Parse descriptor data for an interface
    pub fn interface_descriptor(input: &[u8]) -> IResult<&[u8], InterfaceDescriptor> {
        map(
            tuple((u8, u8, u8, u8, u8, u8, u8)),
            |(interface_number, alternate_setting, num_endpoints, interface_class, interface_sub_class,
              interface_protocol, interface_index)| {
                InterfaceDescriptor {
                    interface_number, alternate_setting, num_endpoints, interface_class, interface_sub_class,
                    interface_protocol, interface_index,
                }
            }
        )(input)
    }

    /// Parse descriptor data for an interface association
    pub fn interface_association_descriptor(
        input: &[u8],
    ) -> IResult<&[u8], InterfaceAssociationDescriptor> {
        map(
            tuple((u8, u8, u8, u8, u8, u8)),
            |(first_interface, interface_count, function_class, function_sub_class,
              function_protocol, function_index)| {
                InterfaceAssociationDescriptor {
                    first_interface, interface_count, function_class, function_sub_class,
                    function_protocol, function_index,
                }
            }
        )(input)
    }

    /// Parse descriptor data for an endpoint
    pub fn endpoint_descriptor(input: &[u8]) -> IResult<&[u8], EndpointDescriptor> {
        map(
            tuple((u8, u8, le_u16, u8)),
            |(address, attributes, max_packet_size, interval)| {
                EndpointDescriptor {
                    address: EndpointAddress::from(address),
                    attributes: EndpointAttributes(attributes),
                    max_packet_size,
                    interval,
                }
            }
        )(input)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_any_descriptor() {
            let data = [8, 7, 6, 5, 4, 3, 2, 1, 0];
            let (rest, desc) = any_descriptor(&data).unwrap();
            assert_eq!(desc.length, 8);
            assert_eq!(desc.descriptor_type, 7);
            assert_eq!(desc.data, &[6, 5, 4, 3, 2, 1]);
            assert_eq!(rest, &[0]);
        }

        #[test]
        fn test_any_descriptor_short_input() {
            // a truncated descriptor must not parse
            let data = [9, 4, 0, 0];
            assert!(any_descriptor(&data).is_err());
        }

        #[test]
        fn test_configuration_total_length() {
            let config = [9, TYPE_CONFIGURATION, 0x20, 0x01, 2, 1, 0, 0x80, 50];
            let (_, total) = configuration_total_length(&config).unwrap();
            assert_eq!(total, 0x0120);
        }

        #[test]
        fn test_endpoint_descriptor() {
            // bulk IN endpoint 1, 512 bytes
            let data = [0x81, 0x02, 0x00, 0x02, 0x00];
            let (_, desc) = endpoint_descriptor(&data).unwrap();
            assert_eq!(desc.address.number(), 1);
            assert!(desc.address.is_in());
            assert!(desc.attributes.transfer_type() == TransferType::Bulk);
            assert_eq!(desc.max_packet_size, 512);
        }

        #[test]
        fn test_interface_descriptor() {
            let data = [2, 0, 2, 0x08, 0x06, 0x50, 0];
            let (_, desc) = interface_descriptor(&data).unwrap();
            assert_eq!(desc.interface_number, 2);
            assert_eq!(desc.num_endpoints, 2);
            assert_eq!(desc.interface_class, 0x08);
            assert_eq!(desc.interface_sub_class, 0x06);
            assert_eq!(desc.interface_protocol, 0x50);
        }
    }
}
