//! Interface for implementing class drivers
//!
//! Class drivers (CDC, MSC, HID, ...) are instantiated by application code and passed
//! to the [`UsbDevice::task`](crate::UsbDevice::task) function as a slice of trait
//! objects. The stack calls the methods of this trait at the appropriate times; a
//! driver's position in the slice is its driver id for the lifetime of the device.
//!
//! ## Walkthrough for an enumerating device
//!
//! 1. The host resets the bus. The stack clears all of its state and calls
//!    [`reset`](ClassDriver::reset) on every driver.
//! 2. The host reads descriptors and assigns an address; class drivers are not
//!    involved yet.
//! 3. The host sends SET_CONFIGURATION. The stack walks the configuration
//!    descriptor and offers each interface to every driver in turn by calling
//!    [`open`](ClassDriver::open). The first driver that recognises the interface
//!    claims it by returning the number of descriptor bytes it consumed, opening
//!    its endpoints from within `open` (see
//!    [`UsbDevice::open_endpoint_pair`](crate::UsbDevice::open_endpoint_pair)).
//!    The stack then records which endpoints belong to the driver.
//! 4. From then on, completed transfers on the driver's endpoints are delivered to
//!    [`xfer_complete`](ClassDriver::xfer_complete), and control requests targeting
//!    the driver's interfaces or endpoints arrive at
//!    [`control_xfer`](ClassDriver::control_xfer).
//!
//! ## Handling control requests
//!
//! `control_xfer` is called first with [`ControlStage::Setup`]. The driver must
//! either answer (via [`UsbDevice::control_respond`](crate::UsbDevice::control_respond),
//! [`control_receive`](crate::UsbDevice::control_receive) or
//! [`control_status`](crate::UsbDevice::control_status)) and return `true`, or return
//! `false` to stall the request. For requests it answered, the driver is called again
//! with [`ControlStage::Data`] when the data stage completes (for OUT requests the
//! received bytes are in [`UsbDevice::control_data`](crate::UsbDevice::control_data);
//! returning `false` here stalls the status stage) and finally with
//! [`ControlStage::Ack`] once the status stage went out.
//!
//! ## Waiting without blocking
//!
//! Driver callbacks run on the device task and must not block. A driver that has to
//! wait (for the medium to become ready, for the host to clear a halt) queues a
//! zero-length completion to itself through
//! [`UsbDevice::events`](crate::UsbDevice::events) and retries when it fires; the MSC
//! driver does exactly this.

use crate::bus::DeviceBus;
use crate::descriptor::InterfaceDescriptor;
use crate::types::{ControlStage, EndpointAddress, SetupPacket, XferResult};
use crate::UsbDevice;

pub mod msc;

/// The ClassDriver trait
///
/// See [module-level documentation](`crate::driver`) for details.
///
pub trait ClassDriver<B: DeviceBus> {
    /// Bus was reset (or the device unplugged). Drop all transfer state.
    fn reset(&mut self, usb: &mut UsbDevice<B>);

    /// Offered an interface during SET_CONFIGURATION.
    ///
    /// `descriptors` holds the remaining configuration-descriptor bytes, starting
    /// at the interface descriptor that `itf` was parsed from. If the driver
    /// supports the interface it must open its endpoints and return the total
    /// number of bytes it consumed (interface descriptor included); otherwise
    /// `None`, and the next driver is asked.
    fn open(
        &mut self,
        usb: &mut UsbDevice<B>,
        itf: &InterfaceDescriptor,
        descriptors: &[u8],
    ) -> Option<usize>;

    /// A control request addressed to this driver's interface or endpoint.
    ///
    /// Returning `false` at the [`ControlStage::Setup`] stage stalls the request,
    /// at the [`ControlStage::Data`] stage it stalls the status stage.
    fn control_xfer(
        &mut self,
        usb: &mut UsbDevice<B>,
        stage: ControlStage,
        request: &SetupPacket,
    ) -> bool;

    /// A transfer on one of this driver's endpoints completed.
    fn xfer_complete(
        &mut self,
        usb: &mut UsbDevice<B>,
        ep_addr: EndpointAddress,
        result: XferResult,
        len: usize,
    ) -> bool;

    /// Start-of-frame. Only delivered after
    /// [`UsbDevice::enable_sof_events`](crate::UsbDevice::enable_sof_events).
    fn sof(&mut self, _usb: &mut UsbDevice<B>) {}
}

/// Device-level notifications.
///
/// Passed to [`UsbDevice::task`](crate::UsbDevice::task) next to the driver list;
/// applications that do not care pass `&mut ()`.
pub trait DeviceCallbacks {
    /// The host configured the device
    fn mount(&mut self) {}

    /// The device was unplugged
    fn unmount(&mut self) {}

    /// The bus was suspended. `remote_wakeup_en` tells whether the host
    /// has allowed the device to wake it.
    fn suspend(&mut self, _remote_wakeup_en: bool) {}

    /// The host resumed the bus
    fn resume(&mut self) {}
}

impl DeviceCallbacks for () {}
