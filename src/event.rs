//! Event queue between the controller ISR and the device task
//!
//! The controller's interrupt handler never calls into the stack directly. It records
//! what happened as an [`Event`] and pushes it into the [`EventSink`]; the device task
//! drains the sink from thread context and dispatches each event exactly once.
//!
//! The sink is lock-free and may be shared freely: any number of interrupt contexts
//! may push, only the device task pops.

use crate::types::{EndpointAddress, Speed, XferResult};
use core::sync::atomic::{AtomicBool, Ordering};
use heapless::mpmc::MpMcQueue;

/// Depth of the event queue.
///
/// Sized for the worst-case burst between two task runs: one bus event plus one
/// completion per open endpoint. Overflow is a sizing bug, not a runtime condition.
pub const QUEUE_DEPTH: usize = 16;

/// A bus event, recorded by the ISR and handled by the device task
#[derive(Clone, Copy, PartialEq)]
pub enum Event {
    /// Host reset the bus; enumeration starts over at the given speed
    BusReset(Speed),
    /// V_BUS went away
    Unplugged,
    /// Bus was idle for 3 ms
    Suspend,
    /// Host resumed the bus
    Resume,
    /// Start-of-frame
    Sof,
    /// An 8-byte SETUP packet arrived on endpoint 0
    SetupReceived([u8; 8]),
    /// A transfer queued with `edpt_xfer_in`/`edpt_xfer_out` finished
    XferComplete {
        ep_addr: EndpointAddress,
        result: XferResult,
        len: u32,
    },
    /// Run `func(param)` in task context
    FuncCall { func: fn(usize), param: usize },
}

impl defmt::Format for Event {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Event::BusReset(speed) => defmt::write!(fmt, "bus reset ({})", speed),
            Event::Unplugged => defmt::write!(fmt, "unplugged"),
            Event::Suspend => defmt::write!(fmt, "suspend"),
            Event::Resume => defmt::write!(fmt, "resume"),
            Event::Sof => defmt::write!(fmt, "sof"),
            Event::SetupReceived(bytes) => defmt::write!(fmt, "setup {}", bytes),
            Event::XferComplete { ep_addr, len, .. } => {
                defmt::write!(fmt, "xfer complete on EP {} with {} bytes", ep_addr, len)
            }
            Event::FuncCall { .. } => defmt::write!(fmt, "func call"),
        }
    }
}

/// The queue was full. Events must never be dropped silently, so the caller
/// is expected to treat this as a fatal sizing bug.
pub struct QueueFull;

/// Where the controller reports bus activity.
///
/// The application typically keeps one of these in a `static` so that both the
/// interrupt handler and the [`UsbDevice`](crate::UsbDevice) can reach it:
///
/// ```ignore
/// static USB_EVENTS: EventSink = EventSink::new();
/// ```
///
/// Besides the queue itself, the sink owns the `connected` / `suspended` flags,
/// because the inline event filtering below needs them in push context:
/// - `Unplugged` is dropped unless the device is connected (V_BUS bounces)
/// - `Suspend` / `Resume` are dropped while unconnected: boards without V_BUS
///   detection cannot tell suspend from disconnect
/// - `Sof` is dropped unless a subscriber enabled it
pub struct EventSink {
    queue: MpMcQueue<Event, QUEUE_DEPTH>,
    connected: AtomicBool,
    suspended: AtomicBool,
    sof_enabled: AtomicBool,
}

impl EventSink {
    pub const fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
            connected: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            sof_enabled: AtomicBool::new(false),
        }
    }

    /// Push an event, with the inline filtering described above applied.
    ///
    /// Never blocks. On `Err` the queue was full; the queue must be sized so
    /// that this cannot happen, so callers are expected to assert on it.
    pub fn try_push(&self, event: Event) -> Result<(), QueueFull> {
        match event {
            Event::Unplugged => {
                if !self.connected.swap(false, Ordering::AcqRel) {
                    return Ok(());
                }
                self.suspended.store(false, Ordering::Release);
            }
            Event::Suspend => {
                if !self.connected.load(Ordering::Acquire) {
                    return Ok(());
                }
                self.suspended.store(true, Ordering::Release);
            }
            Event::Resume => {
                if !self.connected.load(Ordering::Acquire) {
                    return Ok(());
                }
                self.suspended.store(false, Ordering::Release);
            }
            Event::Sof => {
                if !self.sof_enabled.load(Ordering::Acquire) {
                    return Ok(());
                }
            }
            _ => {}
        }
        self.queue.enqueue(event).map_err(|_| QueueFull)
    }

    /// Report a bus reset at the given speed
    pub fn bus_reset(&self, speed: Speed) -> Result<(), QueueFull> {
        self.try_push(Event::BusReset(speed))
    }

    /// Report that V_BUS went away
    pub fn unplugged(&self) -> Result<(), QueueFull> {
        self.try_push(Event::Unplugged)
    }

    /// Report a suspend condition (bus idle for 3 ms)
    pub fn suspend(&self) -> Result<(), QueueFull> {
        self.try_push(Event::Suspend)
    }

    /// Report that the host resumed the bus
    pub fn resume(&self) -> Result<(), QueueFull> {
        self.try_push(Event::Resume)
    }

    /// Report a start-of-frame
    pub fn sof(&self) -> Result<(), QueueFull> {
        self.try_push(Event::Sof)
    }

    /// Report a received SETUP packet
    pub fn setup_received(&self, setup: [u8; 8]) -> Result<(), QueueFull> {
        self.try_push(Event::SetupReceived(setup))
    }

    /// Report a completed transfer
    pub fn xfer_complete(
        &self,
        ep_addr: EndpointAddress,
        result: XferResult,
        len: u32,
    ) -> Result<(), QueueFull> {
        self.try_push(Event::XferComplete {
            ep_addr,
            result,
            len,
        })
    }

    /// Defer a function call from interrupt into task context
    pub fn defer(&self, func: fn(usize), param: usize) -> Result<(), QueueFull> {
        self.try_push(Event::FuncCall { func, param })
    }

    /// At least one SETUP packet was seen since the last reset or unplug
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The bus is currently suspended
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if !connected {
            self.suspended.store(false, Ordering::Release);
        }
    }

    pub(crate) fn enable_sof(&self, enable: bool) {
        self.sof_enabled.store(enable, Ordering::Release);
    }

    pub(crate) fn pop(&self) -> Option<Event> {
        self.queue.dequeue()
    }
}
