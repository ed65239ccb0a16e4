//! Control-transfer engine for endpoint zero
//!
//! Implements the three-stage SETUP / DATA / STATUS protocol. The engine owns a
//! scratch buffer: IN responses are copied into it when a request handler answers,
//! then pushed to the host one `EP0`-sized packet at a time; OUT data accumulates
//! in it and is handed to the class driver when the data stage completes.
//!
//! Routing a completed transaction back into the engine happens in
//! [`UsbDevice`](crate::UsbDevice); the direction of the completed endpoint relative
//! to the request tells the stage apart: a completion *against* the request
//! direction is the status stage.

use crate::bus::{self, DeviceBus};
use crate::endpoint::EndpointTable;
use crate::types::{EndpointAddress, SetupPacket};
use defmt::trace;
use usb_device::UsbDirection;

/// Size of the engine's scratch buffer. Control responses larger than this
/// (unusually big configuration descriptors) are truncated.
pub const CONTROL_BUF_SIZE: usize = 256;

pub(crate) const EP0_OUT: EndpointAddress = EndpointAddress::new(0, UsbDirection::Out);
pub(crate) const EP0_IN: EndpointAddress = EndpointAddress::new(0, UsbDirection::In);

/// The control transfer in progress (overwritten by every new SETUP)
pub(crate) struct ControlPipe {
    request: Option<SetupPacket>,
    buf: [u8; CONTROL_BUF_SIZE],
    /// Total bytes to move in the data stage (min of requested and available)
    data_len: usize,
    /// Bytes moved so far
    total_xferred: usize,
    /// Driver whose `control_xfer` is called at the DATA and ACK stages
    complete_driver: Option<usize>,
}

/// What a completed EP0 transaction meant
pub(crate) enum Ep0Event {
    /// Status stage finished; the transfer is done
    StatusDone(SetupPacket),
    /// Data stage finished (all bytes moved, or a short packet ended it)
    DataDone(SetupPacket),
    /// Another data-stage packet was queued
    MoreData,
    /// No transfer was in progress (stale completion after a reset)
    Ignored,
}

impl ControlPipe {
    pub const fn new() -> Self {
        Self {
            request: None,
            buf: [0; CONTROL_BUF_SIZE],
            data_len: 0,
            total_xferred: 0,
            complete_driver: None,
        }
    }

    pub fn reset(&mut self) {
        self.request = None;
        self.data_len = 0;
        self.total_xferred = 0;
        self.complete_driver = None;
    }

    /// Record a request without queueing anything.
    ///
    /// Used for SET_ADDRESS, where the controller sends the status packet at its
    /// own discretion and only reports its completion.
    pub fn set_request(&mut self, request: &SetupPacket) {
        self.request = Some(*request);
        self.data_len = 0;
        self.total_xferred = 0;
    }

    pub fn set_complete_driver(&mut self, driver: Option<usize>) {
        self.complete_driver = driver;
    }

    pub fn complete_driver(&self) -> Option<usize> {
        self.complete_driver
    }

    /// Data received so far in an OUT data stage
    pub fn received(&self) -> &[u8] {
        &self.buf[..self.total_xferred]
    }

    /// Answer an IN request with `data`.
    ///
    /// `data` is clamped to the request's `wLength` and copied into the scratch
    /// buffer, then the first packet is queued. A request with `wLength == 0`
    /// goes straight to the status stage.
    pub fn respond<B: DeviceBus>(
        &mut self,
        endpoints: &EndpointTable,
        bus: &mut B,
        ep0_size: usize,
        request: &SetupPacket,
        data: &[u8],
    ) -> Result<(), bus::Error> {
        self.request = Some(*request);
        self.total_xferred = 0;
        self.data_len = data
            .len()
            .min(request.length as usize)
            .min(CONTROL_BUF_SIZE);
        self.buf[..self.data_len].copy_from_slice(&data[..self.data_len]);

        if request.length > 0 {
            self.data_stage(endpoints, bus, ep0_size)
        } else {
            self.send_status(endpoints, bus)
        }
    }

    /// Accept the data stage of an OUT request into the scratch buffer.
    ///
    /// The class driver validates the received bytes when the DATA stage
    /// completes (via [`ControlPipe::received`]).
    pub fn receive<B: DeviceBus>(
        &mut self,
        endpoints: &EndpointTable,
        bus: &mut B,
        ep0_size: usize,
        request: &SetupPacket,
    ) -> Result<(), bus::Error> {
        self.request = Some(*request);
        self.total_xferred = 0;
        self.data_len = (request.length as usize).min(CONTROL_BUF_SIZE);

        if request.length > 0 {
            self.data_stage(endpoints, bus, ep0_size)
        } else {
            self.send_status(endpoints, bus)
        }
    }

    /// Acknowledge a request without a data stage
    pub fn status<B: DeviceBus>(
        &mut self,
        endpoints: &EndpointTable,
        bus: &mut B,
        request: &SetupPacket,
    ) -> Result<(), bus::Error> {
        self.request = Some(*request);
        self.total_xferred = 0;
        self.data_len = 0;
        self.send_status(endpoints, bus)
    }

    /// Feed a completed EP0 transaction into the engine.
    ///
    /// Queues follow-up packets as needed and reports which stage finished.
    pub fn note_complete<B: DeviceBus>(
        &mut self,
        endpoints: &EndpointTable,
        bus: &mut B,
        ep0_size: usize,
        ep_addr: EndpointAddress,
        len: usize,
    ) -> Result<Ep0Event, bus::Error> {
        let Some(request) = self.request else {
            return Ok(Ep0Event::Ignored);
        };

        // Completion against the request's direction is the status stage
        if ep_addr.direction() != request.direction() {
            trace!("-> Idle");
            return Ok(Ep0Event::StatusDone(request));
        }

        if request.direction() == UsbDirection::Out && len > 0 {
            let end = self.total_xferred + len;
            if end > self.data_len {
                // host sent more than announced; drop the excess
                return Ok(Ep0Event::DataDone(request));
            }
            let data = bus.received_data(EP0_OUT, len);
            self.buf[self.total_xferred..end].copy_from_slice(&data[..len]);
        }

        self.total_xferred += len;

        // The data stage ends when all requested bytes were moved or the
        // packet was short (a zero-length packet counts as short).
        if request.length as usize == self.total_xferred || len < ep0_size {
            trace!("-> Status");
            Ok(Ep0Event::DataDone(request))
        } else {
            self.data_stage(endpoints, bus, ep0_size)?;
            Ok(Ep0Event::MoreData)
        }
    }

    /// Queue one data-stage packet (at most `ep0_size` bytes, possibly zero)
    fn data_stage<B: DeviceBus>(
        &mut self,
        endpoints: &EndpointTable,
        bus: &mut B,
        ep0_size: usize,
    ) -> Result<(), bus::Error> {
        let Some(request) = self.request else {
            return Ok(());
        };
        let xact = (self.data_len - self.total_xferred).min(ep0_size);
        match request.direction() {
            UsbDirection::In => endpoints.xfer_in(
                bus,
                EP0_IN,
                &self.buf[self.total_xferred..self.total_xferred + xact],
            ),
            UsbDirection::Out => endpoints.xfer_out(bus, EP0_OUT, xact),
        }
    }

    /// Queue the zero-length status packet, opposite to the data-stage direction
    pub fn send_status<B: DeviceBus>(
        &mut self,
        endpoints: &EndpointTable,
        bus: &mut B,
    ) -> Result<(), bus::Error> {
        let Some(request) = self.request else {
            return Ok(());
        };
        match request.direction() {
            UsbDirection::In => endpoints.xfer_out(bus, EP0_OUT, 0),
            UsbDirection::Out => endpoints.xfer_in(bus, EP0_IN, &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EndpointDescriptor;
    use usb_device::control::{Recipient, RequestType};

    /// Accepts everything, remembers the last queued transaction
    struct NullBus {
        last_in: Option<(EndpointAddress, usize)>,
        last_out: Option<(EndpointAddress, usize)>,
        rx: [u8; CONTROL_BUF_SIZE],
    }

    impl NullBus {
        fn new() -> Self {
            Self {
                last_in: None,
                last_out: None,
                rx: [0; CONTROL_BUF_SIZE],
            }
        }
    }

    impl DeviceBus for NullBus {
        fn init(&mut self) {}
        fn int_enable(&mut self) {}
        fn int_disable(&mut self) {}
        fn set_address(&mut self, _address: u8) {}
        fn remote_wakeup(&mut self) {}
        fn edpt_open(&mut self, _desc: &EndpointDescriptor) -> Result<(), bus::Error> {
            Ok(())
        }
        fn edpt_close(&mut self, _ep_addr: EndpointAddress) {}
        fn edpt_xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<(), bus::Error> {
            self.last_in = Some((ep_addr, data.len()));
            Ok(())
        }
        fn edpt_xfer_out(&mut self, ep_addr: EndpointAddress, len: usize) -> Result<(), bus::Error> {
            self.last_out = Some((ep_addr, len));
            Ok(())
        }
        fn received_data(&self, _ep_addr: EndpointAddress, len: usize) -> &[u8] {
            &self.rx[..len]
        }
        fn edpt_stall(&mut self, _ep_addr: EndpointAddress) {}
        fn edpt_clear_stall(&mut self, _ep_addr: EndpointAddress) {}
    }

    fn get_descriptor_request(length: u16) -> SetupPacket {
        SetupPacket::new(
            UsbDirection::In,
            RequestType::Standard,
            Recipient::Device,
            usb_device::control::Request::GET_DESCRIPTOR,
            0x0100,
            0,
            length,
        )
    }

    #[test]
    fn test_respond_clamps_to_wlength() {
        let mut pipe = ControlPipe::new();
        let endpoints = EndpointTable::new();
        let mut bus = NullBus::new();

        let data = [0xAA; 100];
        let request = get_descriptor_request(10);
        pipe.respond(&endpoints, &mut bus, 64, &request, &data).ok().unwrap();
        assert_eq!(pipe.data_len, 10);
        assert!(matches!(bus.last_in, Some((ep, 10)) if ep == EP0_IN));
    }

    #[test]
    fn test_respond_chunks_per_packet() {
        let mut pipe = ControlPipe::new();
        let endpoints = EndpointTable::new();
        let mut bus = NullBus::new();

        let data = [0x55; 100];
        let request = get_descriptor_request(256);
        pipe.respond(&endpoints, &mut bus, 64, &request, &data).ok().unwrap();
        assert!(matches!(bus.last_in, Some((_, 64))));

        endpoints.clear_busy_claimed(EP0_IN);
        let outcome = pipe
            .note_complete(&endpoints, &mut bus, 64, EP0_IN, 64)
            .ok()
            .unwrap();
        assert!(matches!(outcome, Ep0Event::MoreData));
        // 36 bytes remain: a short packet, terminating the data stage
        assert!(matches!(bus.last_in, Some((_, 36))));

        endpoints.clear_busy_claimed(EP0_IN);
        let outcome = pipe
            .note_complete(&endpoints, &mut bus, 64, EP0_IN, 36)
            .ok()
            .unwrap();
        assert!(matches!(outcome, Ep0Event::DataDone(_)));
    }

    #[test]
    fn test_zero_length_request_is_status_only() {
        let mut pipe = ControlPipe::new();
        let endpoints = EndpointTable::new();
        let mut bus = NullBus::new();

        let request = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Standard,
            Recipient::Device,
            usb_device::control::Request::SET_CONFIGURATION,
            1,
            0,
            0,
        );
        pipe.status(&endpoints, &mut bus, &request).ok().unwrap();
        // OUT request acknowledges with a zero-length IN packet
        assert!(matches!(bus.last_in, Some((ep, 0)) if ep == EP0_IN));
        assert!(bus.last_out.is_none());

        endpoints.clear_busy_claimed(EP0_IN);
        let outcome = pipe
            .note_complete(&endpoints, &mut bus, 64, EP0_IN, 0)
            .ok()
            .unwrap();
        assert!(matches!(outcome, Ep0Event::StatusDone(_)));
    }
}
