//! Interface for device controller hardware
//!
//! In order to use `usbd` on a given device, there must be a [`DeviceBus`] implementation
//! specific to that device's USB controller (often called a DCD, device controller driver).
//!
//! The implementation has two halves:
//! - the methods of this trait, called from task context by the stack
//! - event reporting: the controller's interrupt handler reports bus activity by calling
//!   into the [`EventSink`](crate::event::EventSink) that the application shares between
//!   the ISR and the [`UsbDevice`](crate::UsbDevice). The ISR must do nothing else; in
//!   particular it must never call class-driver or control-engine code.
//!

use crate::descriptor::EndpointDescriptor;
use crate::types::{EndpointAddress, SetupPacket};
use defmt::Format;

/// Interface for device controller hardware
///
pub trait DeviceBus {
    /// Put the controller into device mode and get it ready for a bus reset.
    ///
    /// This is called once when the [`UsbDevice`](crate::UsbDevice) is created.
    ///
    /// It must do any preparation needed to enable the hardware and put it into the
    /// appropriate mode to act as a device. After `init` and [`DeviceBus::int_enable`],
    /// the controller must report bus resets, received SETUP packets and transfer
    /// completions through the shared [`EventSink`](crate::event::EventSink).
    fn init(&mut self);

    /// Enable the controller interrupt
    fn int_enable(&mut self);

    /// Disable the controller interrupt
    fn int_disable(&mut self);

    /// Load the given address into the controller's device-address register.
    ///
    /// Called while handling SET_ADDRESS. Depending on the hardware, the status stage
    /// must be sent either before or after the register write; the controller is
    /// responsible for sequencing this itself and must report the status-stage
    /// completion as a zero-length IN transfer on endpoint 0 when done.
    fn set_address(&mut self, address: u8);

    /// Present the pull-up resistor, making the device visible to the host
    ///
    /// Optional: controllers without soft-connect control leave this empty.
    fn connect(&mut self) {}

    /// Remove the pull-up resistor
    fn disconnect(&mut self) {}

    /// Drive a remote-wakeup signal on the bus.
    ///
    /// Only called while the bus is suspended and the host has enabled remote wakeup.
    fn remote_wakeup(&mut self);

    /// Configure an endpoint described by the given descriptor.
    ///
    /// The stack validates the descriptor (transfer type, packet size per speed)
    /// before calling this, so the implementation only needs to reject what the
    /// hardware itself cannot do (e.g. out of endpoint slots).
    fn edpt_open(&mut self, desc: &EndpointDescriptor) -> Result<(), Error>;

    /// Disable an endpoint, discarding any transfer in flight.
    ///
    /// A completion for a discarded transfer may still be reported afterwards;
    /// the stack tolerates (and drops) it.
    fn edpt_close(&mut self, ep_addr: EndpointAddress);

    /// Send `data` on an IN endpoint.
    ///
    /// The implementation must copy the bytes (into a hardware FIFO or a
    /// DMA-reachable buffer it owns) before returning; the slice is not
    /// guaranteed to live past this call.
    ///
    /// Once the host has taken all bytes, the ISR must report a completion for
    /// `ep_addr` through the event sink. An empty slice sends a zero-length packet.
    fn edpt_xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<(), Error>;

    /// Arm an OUT endpoint to receive up to `len` bytes.
    ///
    /// Once data has arrived (or a short packet ended the transfer early), the ISR
    /// must report a completion with the actual byte count. The received bytes must
    /// then be readable via [`DeviceBus::received_data`].
    fn edpt_xfer_out(&mut self, ep_addr: EndpointAddress, len: usize) -> Result<(), Error>;

    /// Access the bytes received by the most recent OUT transfer on `ep_addr`.
    ///
    /// The given `len` is the byte count from the completion event. The returned
    /// buffer stays valid until the endpoint is armed again.
    fn received_data(&self, ep_addr: EndpointAddress, len: usize) -> &[u8];

    /// Halt an endpoint. The host sees STALL handshakes until the condition is cleared.
    fn edpt_stall(&mut self, ep_addr: EndpointAddress);

    /// Clear a halt condition and reset the endpoint's data toggle to DATA0.
    fn edpt_clear_stall(&mut self, ep_addr: EndpointAddress);

    /// Called when the status stage of a control transfer completed.
    ///
    /// Optional hook for controllers that need to know when the SET_ADDRESS
    /// status stage went out before committing the address register.
    fn edpt0_status_complete(&mut self, _request: &SetupPacket) {}
}

/// Error returned by controller operations
#[derive(Copy, Clone, PartialEq, Format)]
pub enum Error {
    /// The endpoint cannot be opened (wrong type or packet size for the
    /// current speed, or out of hardware resources)
    InvalidEndpoint,
    /// The controller rejected the operation
    Rejected,
}
