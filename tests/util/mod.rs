//! Shared test harness: a mock controller that plays the host's part.
//!
//! IN transfers complete as soon as they are queued (the host always listens);
//! armed OUT endpoints wait until the test injects data with
//! [`MockBus::host_send`], except zero-length arms (status stages), which
//! complete immediately. Every completion goes through the same [`EventSink`]
//! a real controller ISR would use.

// not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use usbd::bus::{self, DeviceBus};
use usbd::descriptor::EndpointDescriptor;
use usbd::driver::DeviceCallbacks;
use usbd::types::{EndpointAddress, SetupPacket, XferResult};
use usbd::EventSink;

pub struct MockBus<'a> {
    sink: &'a EventSink,
    /// Every IN transfer queued by the stack, in order
    pub sent: Vec<(u8, Vec<u8>)>,
    /// Armed OUT endpoints and their lengths
    pub armed: HashMap<u8, usize>,
    rx: HashMap<u8, Vec<u8>>,
    pub stalled: HashSet<u8>,
    pub address: Option<u8>,
    /// Endpoint addresses opened via `edpt_open`
    pub opened: Vec<u8>,
    pub closed: Vec<u8>,
    /// Requests whose status stage completed (`edpt0_status_complete`)
    pub status_completed: Vec<SetupPacket>,
}

impl<'a> MockBus<'a> {
    pub fn new(sink: &'a EventSink) -> Self {
        Self {
            sink,
            sent: Vec::new(),
            armed: HashMap::new(),
            rx: HashMap::new(),
            stalled: HashSet::new(),
            address: None,
            opened: Vec::new(),
            closed: Vec::new(),
            status_completed: Vec::new(),
        }
    }

    /// The host sends `data` to an armed OUT endpoint
    pub fn host_send(&mut self, ep_addr: u8, data: &[u8]) {
        let armed = self
            .armed
            .remove(&ep_addr)
            .expect("host_send on an endpoint that is not armed");
        let len = armed.min(data.len());
        self.rx.insert(ep_addr, data[..len].to_vec());
        self.sink
            .xfer_complete(EndpointAddress::from(ep_addr), XferResult::Success, len as u32)
            .ok()
            .expect("event queue full");
    }

    /// All payload bytes sent on `ep_addr`, concatenated
    pub fn bytes_sent_on(&self, ep_addr: u8) -> Vec<u8> {
        self.sent
            .iter()
            .filter(|(ep, _)| *ep == ep_addr)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }
}

impl DeviceBus for MockBus<'_> {
    fn init(&mut self) {}
    fn int_enable(&mut self) {}
    fn int_disable(&mut self) {}

    fn set_address(&mut self, address: u8) {
        self.address = Some(address);
        // hardware sends the status packet itself and reports its completion
        self.sink
            .xfer_complete(EndpointAddress::from(0x80), XferResult::Success, 0)
            .ok()
            .expect("event queue full");
    }

    fn remote_wakeup(&mut self) {}

    fn edpt_open(&mut self, desc: &EndpointDescriptor) -> Result<(), bus::Error> {
        self.opened.push(desc.address.into());
        Ok(())
    }

    fn edpt_close(&mut self, ep_addr: EndpointAddress) {
        self.closed.push(ep_addr.into());
    }

    fn edpt_xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<(), bus::Error> {
        self.sent.push((ep_addr.into(), data.to_vec()));
        self.sink
            .xfer_complete(ep_addr, XferResult::Success, data.len() as u32)
            .ok()
            .expect("event queue full");
        Ok(())
    }

    fn edpt_xfer_out(&mut self, ep_addr: EndpointAddress, len: usize) -> Result<(), bus::Error> {
        if len == 0 {
            // status stage: the host acknowledges right away
            self.sink
                .xfer_complete(ep_addr, XferResult::Success, 0)
                .ok()
                .expect("event queue full");
        } else {
            self.armed.insert(ep_addr.into(), len);
        }
        Ok(())
    }

    fn received_data(&self, ep_addr: EndpointAddress, len: usize) -> &[u8] {
        let ep: u8 = ep_addr.into();
        match self.rx.get(&ep) {
            Some(data) => &data[..len.min(data.len())],
            None => &[],
        }
    }

    fn edpt_stall(&mut self, ep_addr: EndpointAddress) {
        self.stalled.insert(ep_addr.into());
    }

    fn edpt_clear_stall(&mut self, ep_addr: EndpointAddress) {
        self.stalled.remove(&u8::from(ep_addr));
    }

    fn edpt0_status_complete(&mut self, request: &SetupPacket) {
        self.status_completed.push(*request);
    }
}

/// Counts device-level callbacks
#[derive(Default)]
pub struct Recorder {
    pub mounted: u32,
    pub unmounted: u32,
    pub suspends: Vec<bool>,
    pub resumes: u32,
}

impl DeviceCallbacks for Recorder {
    fn mount(&mut self) {
        self.mounted += 1;
    }
    fn unmount(&mut self) {
        self.unmounted += 1;
    }
    fn suspend(&mut self, remote_wakeup_en: bool) {
        self.suspends.push(remote_wakeup_en);
    }
    fn resume(&mut self) {
        self.resumes += 1;
    }
}

pub const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, // bLength, bDescriptorType
    0x00, 0x02, // bcdUSB 2.00
    0, 0, 0, // class, subclass, protocol (per interface)
    64, // bMaxPacketSize0
    0x34, 0x12, // idVendor
    0x78, 0x56, // idProduct
    0x00, 0x01, // bcdDevice
    1, 2, 3, // iManufacturer, iProduct, iSerialNumber
    1, // bNumConfigurations
];

/// One MSC interface (SCSI / Bulk-Only) with a bulk OUT at 0x01 and a bulk IN at 0x81
pub const MSC_CONFIG_DESCRIPTOR: [u8; 32] = [
    9, 2, // bLength, bDescriptorType
    32, 0, // wTotalLength
    1, // bNumInterfaces
    1, // bConfigurationValue
    0, // iConfiguration
    0xA0, // bmAttributes: bus powered, remote wakeup
    50, // bMaxPower (100 mA)
    // interface 0: MSC, SCSI transparent, Bulk-Only Transport
    9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0,
    // EP 1 OUT, bulk, 64 bytes
    7, 5, 0x01, 0x02, 64, 0, 0,
    // EP 1 IN, bulk, 64 bytes
    7, 5, 0x81, 0x02, 64, 0, 0,
];

pub fn get_descriptor(desc_type: u8, index: u8, length: u16) -> [u8; 8] {
    let value = ((desc_type as u16) << 8) | index as u16;
    [
        0x80,
        0x06,
        value as u8,
        (value >> 8) as u8,
        0,
        0,
        length as u8,
        (length >> 8) as u8,
    ]
}

pub fn set_address(address: u8) -> [u8; 8] {
    [0x00, 0x05, address, 0, 0, 0, 0, 0]
}

pub fn set_configuration(value: u8) -> [u8; 8] {
    [0x00, 0x09, value, 0, 0, 0, 0, 0]
}

pub fn clear_endpoint_halt(ep_addr: u8) -> [u8; 8] {
    [0x02, 0x01, 0, 0, ep_addr, 0, 0, 0]
}
