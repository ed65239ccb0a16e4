#![no_std]

pub mod bus;
pub mod descriptor;
pub mod driver;
pub mod event;
pub mod types;

mod control;
mod endpoint;

pub use control::CONTROL_BUF_SIZE;
pub use endpoint::{EP_MAX, ITF_MAX};
pub use event::{Event, EventSink};

use bus::DeviceBus;
use control::{ControlPipe, Ep0Event, EP0_IN, EP0_OUT};
use defmt::{debug, trace, warn};
use descriptor::parse;
use descriptor::EndpointDescriptor;
use driver::{ClassDriver, DeviceCallbacks};
use endpoint::EndpointTable;
use event::Event as BusEvent;
use types::{ControlStage, EndpointAddress, SetupPacket, Speed, TransferType};
use usb_device::control::{Recipient, Request, RequestType};

/// Init-time configuration of the stack
#[derive(Clone, Copy)]
pub struct Config {
    /// Maximum packet size of endpoint zero (8, 16, 32 or 64)
    pub ep0_max_packet_size: u8,
    /// The controller is capable of high speed
    pub high_speed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ep0_max_packet_size: 64,
            high_speed: false,
        }
    }
}

/// The descriptors served to the host, supplied by the application as raw bytes.
///
/// The stack never generates descriptors; it only delivers these verbatim
/// (truncated to what the host asked for) and walks `configuration` during
/// SET_CONFIGURATION.
#[derive(Clone, Copy)]
pub struct DescriptorSet<'a> {
    /// The 18-byte device descriptor
    pub device: &'a [u8],
    /// The full configuration bundle (configuration descriptor followed by all
    /// interface, endpoint and class-specific descriptors; `wTotalLength` covers it)
    pub configuration: &'a [u8],
    /// String descriptors, indexed by the string index used in the other descriptors
    pub strings: &'a [&'a [u8]],
    /// Binary object store; only served when present
    pub bos: Option<&'a [u8]>,
    /// Only served on high-speed capable devices
    pub device_qualifier: Option<&'a [u8]>,
    /// Only served on high-speed capable devices
    pub other_speed_configuration: Option<&'a [u8]>,
}

impl<'a> DescriptorSet<'a> {
    pub const fn new(device: &'a [u8], configuration: &'a [u8], strings: &'a [&'a [u8]]) -> Self {
        Self {
            device,
            configuration,
            strings,
            bos: None,
            device_qualifier: None,
            other_speed_configuration: None,
        }
    }
}

/// Mutable device state, zeroed on every bus reset
#[derive(Default)]
struct DeviceState {
    addressed: bool,
    cfg_num: u8,
    speed: Speed,
    remote_wakeup_en: bool,
    remote_wakeup_support: bool,
    self_powered: bool,
}

/// The USB device stack.
///
/// Owns the controller, the endpoint table and the control-transfer engine.
/// Class drivers live outside and are passed to [`UsbDevice::task`], which
/// drains the shared [`EventSink`] and dispatches each event to exactly one
/// handler. All driver callbacks run on the task; interrupt handlers only
/// ever push events.
pub struct UsbDevice<'a, B> {
    bus: B,
    sink: &'a EventSink,
    config: Config,
    descriptors: DescriptorSet<'a>,
    state: DeviceState,
    endpoints: EndpointTable,
    control: ControlPipe,
}

impl<'a, B: DeviceBus> UsbDevice<'a, B> {
    /// Initialize the controller and hand it to the stack.
    ///
    /// `events` is the sink the controller's interrupt handler reports into;
    /// it is usually a `static` shared between the ISR and this object.
    pub fn new(
        mut bus: B,
        events: &'a EventSink,
        config: Config,
        descriptors: DescriptorSet<'a>,
    ) -> Self {
        bus.init();
        bus.int_enable();
        Self {
            bus,
            sink: events,
            config,
            descriptors,
            state: DeviceState::default(),
            endpoints: EndpointTable::new(),
            control: ControlPipe::new(),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// The event sink shared with the controller ISR.
    ///
    /// Class drivers also use this to queue zero-length completions to
    /// themselves when they need to retry later without blocking.
    pub fn events(&self) -> &'a EventSink {
        self.sink
    }

    /// Speed reported by the last bus reset
    pub fn speed(&self) -> Speed {
        self.state.speed
    }

    /// At least one SETUP packet was seen since the last reset or unplug
    pub fn connected(&self) -> bool {
        self.sink.is_connected()
    }

    pub fn suspended(&self) -> bool {
        self.sink.is_suspended()
    }

    pub fn addressed(&self) -> bool {
        self.state.addressed
    }

    /// A non-zero configuration is active
    pub fn configured(&self) -> bool {
        self.state.cfg_num != 0
    }

    /// Present the pull-up resistor (if the controller supports soft-connect)
    pub fn connect(&mut self) {
        self.bus.connect();
    }

    pub fn disconnect(&mut self) {
        self.bus.disconnect();
    }

    /// Ask the host to resume the bus.
    ///
    /// Only allowed while suspended, with remote wakeup supported by the
    /// active configuration and enabled by the host.
    pub fn remote_wakeup(&mut self) -> bool {
        if !(self.sink.is_suspended() && self.state.remote_wakeup_support && self.state.remote_wakeup_en)
        {
            return false;
        }
        self.bus.remote_wakeup();
        true
    }

    /// Subscribe (or unsubscribe) the class drivers' `sof` hooks to
    /// start-of-frame events. While unsubscribed, SOF is filtered out
    /// before it ever reaches the queue.
    pub fn enable_sof_events(&mut self, enable: bool) {
        self.sink.enable_sof(enable);
    }

    //------------- Device task -------------//

    /// Drain the event queue, handling each event to completion.
    ///
    /// Call this from the main loop (or a dedicated thread) whenever the
    /// controller interrupt has fired. Never call it from interrupt context.
    pub fn task(
        &mut self,
        drivers: &mut [&mut dyn ClassDriver<B>],
        callbacks: &mut dyn DeviceCallbacks,
    ) {
        while self.task_one(drivers, callbacks) {}
    }

    /// Handle a single queued event. Returns `false` if the queue was empty.
    pub fn task_one(
        &mut self,
        drivers: &mut [&mut dyn ClassDriver<B>],
        callbacks: &mut dyn DeviceCallbacks,
    ) -> bool {
        match self.sink.pop() {
            Some(event) => {
                self.handle_event(event, drivers, callbacks);
                true
            }
            None => false,
        }
    }

    fn handle_event(
        &mut self,
        event: BusEvent,
        drivers: &mut [&mut dyn ClassDriver<B>],
        callbacks: &mut dyn DeviceCallbacks,
    ) {
        debug!("USBD {}", event);
        match event {
            BusEvent::BusReset(speed) => {
                self.reset_stack(drivers);
                self.state.speed = speed;
            }
            BusEvent::Unplugged => {
                self.reset_stack(drivers);
                callbacks.unmount();
            }
            BusEvent::SetupReceived(bytes) => {
                let request = SetupPacket::from_bytes(bytes);
                // connected after the first SETUP; a new SETUP also frees and
                // un-halts both halves of endpoint zero
                self.sink.set_connected(true);
                self.endpoints.release_control_endpoint();
                if !self.process_control_request(&request, drivers, callbacks) {
                    debug!("  stall EP0");
                    self.stall_control_endpoint();
                }
            }
            BusEvent::XferComplete {
                ep_addr,
                result,
                len,
            } => {
                if ep_addr.number() as usize >= EP_MAX {
                    warn!("completion on out-of-range EP {}", ep_addr);
                    return;
                }
                self.endpoints.clear_busy_claimed(ep_addr);
                if ep_addr.number() == 0 {
                    if !self.handle_ep0_complete(drivers, ep_addr, len as usize) {
                        debug!("  stall EP0");
                        self.stall_control_endpoint();
                    }
                } else if let Some(driver_id) = self.endpoints.driver_for_endpoint(ep_addr) {
                    if let Some(driver) = drivers.get_mut(driver_id as usize) {
                        driver.xfer_complete(self, ep_addr, result, len as usize);
                    }
                } else {
                    // completion on an endpoint nobody owns (closed or reset
                    // mid-transfer); tolerated and dropped
                    warn!("dropped completion on unbound EP {}", ep_addr);
                }
            }
            BusEvent::Suspend => callbacks.suspend(self.state.remote_wakeup_en),
            BusEvent::Resume => callbacks.resume(),
            BusEvent::Sof => {
                for driver in drivers.iter_mut() {
                    driver.sof(self);
                }
            }
            BusEvent::FuncCall { func, param } => func(param),
        }
    }

    fn reset_stack(&mut self, drivers: &mut [&mut dyn ClassDriver<B>]) {
        self.sink.set_connected(false);
        self.state = DeviceState::default();
        self.endpoints.reset();
        self.control.reset();
        for driver in drivers.iter_mut() {
            driver.reset(self);
        }
    }

    //------------- Control transfers -------------//

    /// Answer an IN control request with `data` (clamped to what the host asked for).
    ///
    /// Class drivers call this from [`ClassDriver::control_xfer`] at the
    /// [`ControlStage::Setup`] stage; the bytes are copied, so short-lived
    /// buffers are fine.
    pub fn control_respond(&mut self, request: &SetupPacket, data: &[u8]) -> bool {
        let ep0_size = self.config.ep0_max_packet_size as usize;
        let Self {
            bus,
            endpoints,
            control,
            ..
        } = self;
        control.respond(endpoints, bus, ep0_size, request, data).is_ok()
    }

    /// Accept the data stage of an OUT control request.
    ///
    /// The received bytes are available via [`UsbDevice::control_data`] when the
    /// driver is called back at the [`ControlStage::Data`] stage.
    pub fn control_receive(&mut self, request: &SetupPacket) -> bool {
        let ep0_size = self.config.ep0_max_packet_size as usize;
        let Self {
            bus,
            endpoints,
            control,
            ..
        } = self;
        control.receive(endpoints, bus, ep0_size, request).is_ok()
    }

    /// Acknowledge a control request that moves no data
    pub fn control_status(&mut self, request: &SetupPacket) -> bool {
        let Self {
            bus,
            endpoints,
            control,
            ..
        } = self;
        control.status(endpoints, bus, request).is_ok()
    }

    /// Data received in the current control transfer's OUT data stage
    pub fn control_data(&self) -> &[u8] {
        self.control.received()
    }

    fn stall_control_endpoint(&mut self) {
        self.bus.edpt_stall(EP0_OUT);
        self.bus.edpt_stall(EP0_IN);
        self.endpoints.set_stalled(EP0_OUT, true);
        self.endpoints.set_stalled(EP0_IN, true);
    }

    fn handle_ep0_complete(
        &mut self,
        drivers: &mut [&mut dyn ClassDriver<B>],
        ep_addr: EndpointAddress,
        len: usize,
    ) -> bool {
        let ep0_size = self.config.ep0_max_packet_size as usize;
        let outcome = {
            let Self {
                bus,
                endpoints,
                control,
                ..
            } = self;
            match control.note_complete(endpoints, bus, ep0_size, ep_addr, len) {
                Ok(outcome) => outcome,
                Err(_) => return false,
            }
        };

        match outcome {
            Ep0Event::StatusDone(request) => {
                self.bus.edpt0_status_complete(&request);
                if let Some(id) = self.control.complete_driver() {
                    if let Some(driver) = drivers.get_mut(id) {
                        driver.control_xfer(self, ControlStage::Ack, &request);
                    }
                }
                true
            }
            Ep0Event::DataDone(request) => {
                // the driver can still fail the transfer here, e.g. when the
                // received OUT data does not make sense
                let mut accepted = true;
                if let Some(id) = self.control.complete_driver() {
                    if let Some(driver) = drivers.get_mut(id) {
                        accepted = driver.control_xfer(self, ControlStage::Data, &request);
                    }
                }
                if !accepted {
                    return false;
                }
                let Self {
                    bus,
                    endpoints,
                    control,
                    ..
                } = self;
                control.send_status(endpoints, bus).is_ok()
            }
            Ep0Event::MoreData | Ep0Event::Ignored => true,
        }
    }

    //------------- Control request routing -------------//

    fn invoke_class_control(
        &mut self,
        drivers: &mut [&mut dyn ClassDriver<B>],
        driver_id: u8,
        request: &SetupPacket,
    ) -> bool {
        let Some(driver) = drivers.get_mut(driver_id as usize) else {
            return false;
        };
        self.control.set_complete_driver(Some(driver_id as usize));
        driver.control_xfer(self, ControlStage::Setup, request)
    }

    /// Route a SETUP packet. Returning `false` stalls both halves of EP0.
    fn process_control_request(
        &mut self,
        request: &SetupPacket,
        drivers: &mut [&mut dyn ClassDriver<B>],
        callbacks: &mut dyn DeviceCallbacks,
    ) -> bool {
        self.control.set_complete_driver(None);

        if request.request_kind() == RequestType::Reserved {
            return false;
        }

        match request.recipient() {
            Recipient::Device => self.handle_device_request(request, drivers, callbacks),
            Recipient::Interface => self.handle_interface_request(request, drivers),
            Recipient::Endpoint => self.handle_endpoint_request(request, drivers),
            _ => false,
        }
    }

    fn handle_device_request(
        &mut self,
        request: &SetupPacket,
        drivers: &mut [&mut dyn ClassDriver<B>],
        callbacks: &mut dyn DeviceCallbacks,
    ) -> bool {
        if request.request_kind() == RequestType::Class {
            // class request addressed to the device: route by the interface in wIndex
            let itf_num = request.index as u8;
            let Some(driver_id) = self.endpoints.driver_for_interface(itf_num) else {
                return false;
            };
            return self.invoke_class_control(drivers, driver_id, request);
        }

        if request.request_kind() != RequestType::Standard {
            return false;
        }

        match request.request {
            Request::SET_ADDRESS => {
                // The controller decides whether the status stage goes out
                // before or after the address register is written, so only
                // record the request and skip the usual status packet.
                self.control.set_request(request);
                self.bus.set_address(request.value as u8);
                self.state.addressed = true;
                true
            }
            Request::GET_CONFIGURATION => {
                let cfg_num = self.state.cfg_num;
                self.control_respond(request, &[cfg_num])
            }
            Request::SET_CONFIGURATION => {
                let cfg_num = request.value as u8;
                if self.state.cfg_num == 0 && cfg_num != 0 {
                    if !self.process_set_config(drivers, callbacks) {
                        return false;
                    }
                }
                self.state.cfg_num = cfg_num;
                self.control_status(request)
            }
            Request::GET_DESCRIPTOR => self.process_get_descriptor(request),
            Request::SET_FEATURE => {
                // only remote wakeup is supported as a device feature
                if request.value != Request::FEATURE_DEVICE_REMOTE_WAKEUP {
                    return false;
                }
                self.state.remote_wakeup_en = true;
                self.control_status(request)
            }
            Request::CLEAR_FEATURE => {
                if request.value != Request::FEATURE_DEVICE_REMOTE_WAKEUP {
                    return false;
                }
                self.state.remote_wakeup_en = false;
                self.control_status(request)
            }
            Request::GET_STATUS => {
                // bit 0: self powered, bit 1: remote wakeup enabled
                let status = (self.state.self_powered as u16)
                    | ((self.state.remote_wakeup_en as u16) << 1);
                self.control_respond(request, &status.to_le_bytes())
            }
            _ => false,
        }
    }

    fn handle_interface_request(
        &mut self,
        request: &SetupPacket,
        drivers: &mut [&mut dyn ClassDriver<B>],
    ) -> bool {
        let itf_num = request.index as u8;
        let Some(driver_id) = self.endpoints.driver_for_interface(itf_num) else {
            return false;
        };

        // every interface request (standard or class) goes to the bound driver
        // first; notable ones are GET_HID_REPORT_DESCRIPTOR and SET_INTERFACE
        if self.invoke_class_control(drivers, driver_id, request) {
            return true;
        }

        // GET_INTERFACE and SET_INTERFACE must be answered even when the
        // driver does not implement alternate settings
        if request.request_kind() != RequestType::Standard {
            return false;
        }
        self.control.set_complete_driver(None);
        match request.request {
            Request::GET_INTERFACE => self.control_respond(request, &[0]),
            Request::SET_INTERFACE => self.control_status(request),
            _ => false,
        }
    }

    fn handle_endpoint_request(
        &mut self,
        request: &SetupPacket,
        drivers: &mut [&mut dyn ClassDriver<B>],
    ) -> bool {
        let ep_addr = EndpointAddress::from(request.index as u8);
        if ep_addr.number() as usize >= EP_MAX {
            return false;
        }
        let driver_id = self.endpoints.driver_for_endpoint(ep_addr);

        if request.request_kind() != RequestType::Standard {
            let Some(driver_id) = driver_id else {
                return false;
            };
            return self.invoke_class_control(drivers, driver_id, request);
        }

        match request.request {
            Request::GET_STATUS => {
                let status = self.endpoints.is_stalled(ep_addr) as u16;
                self.control_respond(request, &status.to_le_bytes())
            }
            Request::CLEAR_FEATURE | Request::SET_FEATURE => {
                if request.value == Request::FEATURE_ENDPOINT_HALT {
                    if request.request == Request::CLEAR_FEATURE {
                        self.edpt_clear_stall(ep_addr);
                    } else {
                        self.edpt_stall(ep_addr);
                    }
                }

                // forward to the owning driver as well (classes may need to
                // reset their buffers on a cleared halt), but never let it
                // take over the status stage
                if let Some(driver_id) = driver_id {
                    let _ = self.invoke_class_control(drivers, driver_id, request);
                    self.control.set_complete_driver(None);
                }

                // send the status ourselves unless the driver already did
                if self.endpoints.is_busy(EP0_IN) {
                    true
                } else {
                    self.control_status(request)
                }
            }
            _ => false,
        }
    }

    fn process_get_descriptor(&mut self, request: &SetupPacket) -> bool {
        let desc_type = (request.value >> 8) as u8;
        let desc_index = request.value as u8;
        let descriptors = self.descriptors;

        match desc_type {
            descriptor::TYPE_DEVICE => {
                trace!("  get device descriptor");
                let ep0_size = self.config.ep0_max_packet_size as usize;
                let mut request = *request;
                let mut len = descriptor::DEVICE_DESCRIPTOR_LEN.min(descriptors.device.len());
                if ep0_size < descriptor::DEVICE_DESCRIPTOR_LEN && !self.state.addressed {
                    // Some hosts read only one EP0 packet's worth before assigning
                    // an address. Clamping wLength as well keeps the engine from
                    // terminating the shortened response with a ZLP.
                    len = len.min(ep0_size);
                    request.length = request.length.min(ep0_size as u16);
                }
                self.control_respond(&request, &descriptors.device[..len])
            }
            descriptor::TYPE_CONFIGURATION => {
                trace!("  get configuration descriptor [{}]", desc_index);
                if desc_index != 0 {
                    return false;
                }
                let config = descriptors.configuration;
                // length comes from wTotalLength, not from the request
                let Ok((_, total)) = parse::configuration_total_length(config) else {
                    return false;
                };
                let total = (total as usize).min(config.len());
                self.control_respond(request, &config[..total])
            }
            descriptor::TYPE_STRING => {
                trace!("  get string descriptor [{}]", desc_index);
                let Some(string) = descriptors.strings.get(desc_index as usize) else {
                    return false;
                };
                // a string descriptor's first byte is its own length
                let Some(&len) = string.first() else {
                    return false;
                };
                let len = (len as usize).min(string.len());
                self.control_respond(request, &string[..len])
            }
            descriptor::TYPE_BOS => {
                trace!("  get BOS descriptor");
                // only answered when the application registered one
                let Some(bos) = descriptors.bos else {
                    return false;
                };
                // BOS shares the configuration layout: wTotalLength at offset 2
                let Ok((_, total)) = parse::configuration_total_length(bos) else {
                    return false;
                };
                let total = (total as usize).min(bos.len());
                self.control_respond(request, &bos[..total])
            }
            descriptor::TYPE_DEVICE_QUALIFIER => {
                trace!("  get device qualifier");
                if !self.config.high_speed {
                    return false;
                }
                let Some(qualifier) = descriptors.device_qualifier else {
                    return false;
                };
                let Some(&len) = qualifier.first() else {
                    return false;
                };
                let len = (len as usize).min(qualifier.len());
                self.control_respond(request, &qualifier[..len])
            }
            descriptor::TYPE_OTHER_SPEED_CONFIGURATION => {
                trace!("  get other speed configuration");
                if !self.config.high_speed {
                    return false;
                }
                let Some(other) = descriptors.other_speed_configuration else {
                    return false;
                };
                let Ok((_, total)) = parse::configuration_total_length(other) else {
                    return false;
                };
                let total = (total as usize).min(other.len());
                self.control_respond(request, &other[..total])
            }
            _ => false,
        }
    }

    /// Walk the configuration descriptor, handing each interface to the first
    /// driver that claims it and recording interface/endpoint ownership.
    fn process_set_config(
        &mut self,
        drivers: &mut [&mut dyn ClassDriver<B>],
        callbacks: &mut dyn DeviceCallbacks,
    ) -> bool {
        let config = self.descriptors.configuration;
        let Ok((_, header)) = parse::any_descriptor(config) else {
            return false;
        };
        if header.descriptor_type != descriptor::TYPE_CONFIGURATION {
            return false;
        }
        let Ok((_, config_desc)) = parse::configuration_descriptor(header.data) else {
            return false;
        };

        self.state.remote_wakeup_support = config_desc.attributes.remote_wakeup();
        self.state.self_powered = config_desc.attributes.self_powered();

        let total = (config_desc.total_length as usize).min(config.len());
        let mut offset = header.length as usize;

        while offset < total {
            let Ok((_, desc)) = parse::any_descriptor(&config[offset..total]) else {
                return false;
            };

            // a function always starts with its interface association (if any),
            // immediately followed by the first interface descriptor
            let mut assoc = None;
            let mut itf_offset = offset;
            if desc.descriptor_type == descriptor::TYPE_INTERFACE_ASSOCIATION {
                let Ok((_, iad)) = parse::interface_association_descriptor(desc.data) else {
                    return false;
                };
                itf_offset = offset + desc.length as usize;
                assoc = Some(iad);
            }

            let Ok((_, itf_desc)) = parse::any_descriptor(&config[itf_offset..total]) else {
                return false;
            };
            if itf_desc.descriptor_type != descriptor::TYPE_INTERFACE {
                return false;
            }
            let Ok((_, itf)) = parse::interface_descriptor(itf_desc.data) else {
                return false;
            };

            let remaining = &config[itf_offset..total];

            let mut claimed = None;
            for (driver_id, driver) in drivers.iter_mut().enumerate() {
                if let Some(consumed) = driver.open(self, &itf, remaining) {
                    claimed = Some((driver_id as u8, consumed));
                    break;
                }
            }
            // no driver for an interface fails the whole SET_CONFIGURATION
            let Some((driver_id, consumed)) = claimed else {
                warn!("no driver claimed interface {}", itf.interface_number);
                return false;
            };
            if consumed < descriptor::INTERFACE_DESCRIPTOR_LEN || consumed > remaining.len() {
                return false;
            }
            if self.endpoints.interface_is_bound(itf.interface_number) {
                return false;
            }
            debug!(
                "  driver {} opened interface {}",
                driver_id, itf.interface_number
            );
            self.endpoints.bind_interface(itf.interface_number, driver_id);

            if let Some(iad) = assoc {
                // the association's first interface and class must match what
                // was just opened; all associated interfaces share the driver
                if iad.first_interface != itf.interface_number
                    || iad.function_class != itf.interface_class
                {
                    return false;
                }
                for i in 1..iad.interface_count {
                    self.endpoints
                        .bind_interface(itf.interface_number + i, driver_id);
                }
            }

            self.mark_interface_endpoints(&remaining[..consumed], driver_id);
            offset = itf_offset + consumed;
        }

        callbacks.mount();
        true
    }

    /// Record every endpoint descriptor in the consumed range as owned by the driver
    fn mark_interface_endpoints(&mut self, mut bytes: &[u8], driver_id: u8) {
        while let Ok((rest, desc)) = parse::any_descriptor(bytes) {
            if desc.descriptor_type == descriptor::TYPE_ENDPOINT {
                if let Ok((_, ep)) = parse::endpoint_descriptor(desc.data) {
                    self.endpoints.bind_endpoint(ep.address, driver_id);
                }
            }
            bytes = rest;
        }
    }

    //------------- Endpoint API for class drivers -------------//

    /// Validate an endpoint descriptor against the current speed and open it.
    pub fn edpt_open(&mut self, desc: &EndpointDescriptor) -> Result<(), bus::Error> {
        debug!("  open EP {} with size {}", desc.address, desc.max_packet_size);
        let number = desc.address.number() as usize;
        if number == 0 || number >= EP_MAX {
            return Err(bus::Error::InvalidEndpoint);
        }

        let high_speed = self.state.speed == Speed::High;
        let size = desc.max_packet_size;
        let size_ok = match desc.attributes.transfer_type() {
            TransferType::Isochronous => size <= if high_speed { 1024 } else { 1023 },
            // high-speed bulk must be exactly 512
            TransferType::Bulk => {
                if high_speed {
                    size == 512
                } else {
                    matches!(size, 8 | 16 | 32 | 64)
                }
            }
            TransferType::Interrupt => size <= if high_speed { 1024 } else { 64 },
            TransferType::Control => false,
        };
        if !size_ok {
            return Err(bus::Error::InvalidEndpoint);
        }

        self.bus.edpt_open(desc)
    }

    /// Open two consecutive endpoint descriptors as a matched IN/OUT pair.
    ///
    /// `descriptors` must start at the first endpoint descriptor (right after
    /// the interface descriptor for classes like CDC data, MSC and vendor).
    /// Returns `(out, in)`.
    pub fn open_endpoint_pair(
        &mut self,
        descriptors: &[u8],
        transfer_type: TransferType,
    ) -> Result<(EndpointAddress, EndpointAddress), bus::Error> {
        let mut ep_out = None;
        let mut ep_in = None;
        let mut bytes = descriptors;

        for _ in 0..2 {
            let Ok((rest, desc)) = parse::any_descriptor(bytes) else {
                return Err(bus::Error::InvalidEndpoint);
            };
            if desc.descriptor_type != descriptor::TYPE_ENDPOINT {
                return Err(bus::Error::InvalidEndpoint);
            }
            let Ok((_, ep)) = parse::endpoint_descriptor(desc.data) else {
                return Err(bus::Error::InvalidEndpoint);
            };
            if ep.attributes.transfer_type() != transfer_type {
                return Err(bus::Error::InvalidEndpoint);
            }
            self.edpt_open(&ep)?;
            if ep.address.is_in() {
                ep_in = Some(ep.address);
            } else {
                ep_out = Some(ep.address);
            }
            bytes = rest;
        }

        match (ep_out, ep_in) {
            (Some(out), Some(r#in)) => Ok((out, r#in)),
            _ => Err(bus::Error::InvalidEndpoint),
        }
    }

    /// Send `data` on an IN endpoint.
    ///
    /// Marks the endpoint busy before touching the controller; it stays busy
    /// until the completion event is handled. Queueing on a busy endpoint is
    /// a bug in the caller and panics.
    pub fn edpt_xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<(), bus::Error> {
        trace!("  queue EP {} with {} bytes", ep_addr, data.len());
        self.endpoints.xfer_in(&mut self.bus, ep_addr, data)
    }

    /// Arm an OUT endpoint to receive up to `len` bytes.
    pub fn edpt_xfer_out(&mut self, ep_addr: EndpointAddress, len: usize) -> Result<(), bus::Error> {
        trace!("  arm EP {} for {} bytes", ep_addr, len);
        self.endpoints.xfer_out(&mut self.bus, ep_addr, len)
    }

    /// Bytes received by the most recent OUT transfer on `ep_addr`
    pub fn received(&self, ep_addr: EndpointAddress, len: usize) -> &[u8] {
        self.bus.received_data(ep_addr, len)
    }

    /// Reserve an endpoint ahead of a transfer (two-phase submit).
    ///
    /// Succeeds only when the endpoint is neither busy nor claimed.
    pub fn edpt_claim(&self, ep_addr: EndpointAddress) -> bool {
        self.endpoints.try_claim(ep_addr)
    }

    /// Give up a claim without submitting a transfer
    pub fn edpt_release(&self, ep_addr: EndpointAddress) -> bool {
        self.endpoints.release(ep_addr)
    }

    pub fn edpt_busy(&self, ep_addr: EndpointAddress) -> bool {
        self.endpoints.is_busy(ep_addr)
    }

    pub fn edpt_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.endpoints.is_stalled(ep_addr)
    }

    pub fn edpt_stall(&mut self, ep_addr: EndpointAddress) {
        self.bus.edpt_stall(ep_addr);
        self.endpoints.set_stalled(ep_addr, true);
    }

    pub fn edpt_clear_stall(&mut self, ep_addr: EndpointAddress) {
        self.bus.edpt_clear_stall(ep_addr);
        self.endpoints.set_stalled(ep_addr, false);
    }

    /// Close an endpoint, discarding any transfer in flight.
    ///
    /// An in-flight completion may still be delivered afterwards; it is
    /// dropped because the endpoint no longer maps to a driver.
    pub fn edpt_close(&mut self, ep_addr: EndpointAddress) {
        self.bus.edpt_close(ep_addr);
        self.endpoints.forget(ep_addr);
    }
}
