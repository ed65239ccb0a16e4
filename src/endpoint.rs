//! Per-endpoint bookkeeping
//!
//! One flag byte per (number, direction) pair, updated with single
//! compare-exchange operations so the ISR-visible `busy` bit and the
//! task-owned `claimed` bit can live in the same word without locks.

use crate::bus::{self, DeviceBus};
use crate::types::EndpointAddress;
use core::sync::atomic::{AtomicU8, Ordering};

/// Highest endpoint number supported (0..EP_MAX-1, each with IN and OUT)
pub const EP_MAX: usize = 9;

/// Number of interfaces that can be mapped to drivers
pub const ITF_MAX: usize = 16;

const BUSY: u8 = 1 << 0;
const STALLED: u8 = 1 << 1;
const CLAIMED: u8 = 1 << 2;

pub(crate) struct EndpointTable {
    flags: [[AtomicU8; 2]; EP_MAX],
    ep_to_drv: [[Option<u8>; 2]; EP_MAX],
    itf_to_drv: [Option<u8>; ITF_MAX],
}

fn index(ep_addr: EndpointAddress) -> (usize, usize) {
    (ep_addr.number() as usize, ep_addr.is_in() as usize)
}

impl EndpointTable {
    pub const fn new() -> Self {
        const FLAG: AtomicU8 = AtomicU8::new(0);
        const PAIR: [AtomicU8; 2] = [FLAG, FLAG];
        Self {
            flags: [PAIR; EP_MAX],
            ep_to_drv: [[None; 2]; EP_MAX],
            itf_to_drv: [None; ITF_MAX],
        }
    }

    /// Forget all flags and driver mappings (bus reset / unplug)
    pub fn reset(&mut self) {
        for pair in &self.flags {
            pair[0].store(0, Ordering::Release);
            pair[1].store(0, Ordering::Release);
        }
        self.ep_to_drv = [[None; 2]; EP_MAX];
        self.itf_to_drv = [None; ITF_MAX];
    }

    fn flag(&self, ep_addr: EndpointAddress) -> &AtomicU8 {
        let (num, dir) = index(ep_addr);
        &self.flags[num][dir]
    }

    pub fn is_busy(&self, ep_addr: EndpointAddress) -> bool {
        self.flag(ep_addr).load(Ordering::Acquire) & BUSY != 0
    }

    pub fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.flag(ep_addr).load(Ordering::Acquire) & STALLED != 0
    }

    /// Reserve an endpoint ahead of a transfer.
    ///
    /// Succeeds only while the endpoint is neither busy nor already claimed.
    pub fn try_claim(&self, ep_addr: EndpointAddress) -> bool {
        let flag = self.flag(ep_addr);
        let mut current = flag.load(Ordering::Acquire);
        loop {
            if current & (BUSY | CLAIMED) != 0 {
                return false;
            }
            match flag.compare_exchange_weak(
                current,
                current | CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Give up a claim that was never submitted.
    ///
    /// Succeeds only while the endpoint is claimed and not busy.
    pub fn release(&self, ep_addr: EndpointAddress) -> bool {
        let flag = self.flag(ep_addr);
        let mut current = flag.load(Ordering::Acquire);
        loop {
            if current & CLAIMED == 0 || current & BUSY != 0 {
                return false;
            }
            match flag.compare_exchange_weak(
                current,
                current & !CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Mark a transfer done: busy and claimed are cleared together
    pub fn clear_busy_claimed(&self, ep_addr: EndpointAddress) {
        self.flag(ep_addr).fetch_and(!(BUSY | CLAIMED), Ordering::AcqRel);
    }

    /// Record a halt condition. A halted endpoint is also marked busy so
    /// no transfer can be queued on it until the halt is cleared.
    pub fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        if stalled {
            self.flag(ep_addr).fetch_or(STALLED | BUSY, Ordering::AcqRel);
        } else {
            self.flag(ep_addr).fetch_and(!(STALLED | BUSY), Ordering::AcqRel);
        }
    }

    /// Free both halves of endpoint zero (on every received SETUP; a new
    /// SETUP clears a control-endpoint halt by definition)
    pub fn release_control_endpoint(&self) {
        self.flags[0][0].store(0, Ordering::Release);
        self.flags[0][1].store(0, Ordering::Release);
    }

    /// Forget the flags and driver mapping of a closed endpoint
    pub fn forget(&mut self, ep_addr: EndpointAddress) {
        self.flag(ep_addr).store(0, Ordering::Release);
        let (num, dir) = index(ep_addr);
        self.ep_to_drv[num][dir] = None;
    }

    pub fn driver_for_endpoint(&self, ep_addr: EndpointAddress) -> Option<u8> {
        let (num, dir) = index(ep_addr);
        self.ep_to_drv[num][dir]
    }

    pub fn bind_endpoint(&mut self, ep_addr: EndpointAddress, driver_id: u8) {
        let (num, dir) = index(ep_addr);
        if let Some(pair) = self.ep_to_drv.get_mut(num) {
            pair[dir] = Some(driver_id);
        }
    }

    pub fn driver_for_interface(&self, itf_num: u8) -> Option<u8> {
        self.itf_to_drv.get(itf_num as usize).copied().flatten()
    }

    pub fn interface_is_bound(&self, itf_num: u8) -> bool {
        self.driver_for_interface(itf_num).is_some()
    }

    pub fn bind_interface(&mut self, itf_num: u8, driver_id: u8) {
        if let Some(slot) = self.itf_to_drv.get_mut(itf_num as usize) {
            *slot = Some(driver_id);
        }
    }

    /// Queue an IN transfer, flipping `busy` before touching the controller:
    /// the completion interrupt can fire before `edpt_xfer_in` returns and
    /// must observe the endpoint as busy.
    pub fn xfer_in<B: DeviceBus>(
        &self,
        bus: &mut B,
        ep_addr: EndpointAddress,
        data: &[u8],
    ) -> Result<(), bus::Error> {
        self.begin_xfer(ep_addr);
        match bus.edpt_xfer_in(ep_addr, data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear_busy_claimed(ep_addr);
                Err(e)
            }
        }
    }

    /// Arm an OUT endpoint for up to `len` bytes; same busy contract as
    /// [`EndpointTable::xfer_in`].
    pub fn xfer_out<B: DeviceBus>(
        &self,
        bus: &mut B,
        ep_addr: EndpointAddress,
        len: usize,
    ) -> Result<(), bus::Error> {
        self.begin_xfer(ep_addr);
        match bus.edpt_xfer_out(ep_addr, len) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear_busy_claimed(ep_addr);
                Err(e)
            }
        }
    }

    fn begin_xfer(&self, ep_addr: EndpointAddress) {
        let previous = self.flag(ep_addr).fetch_or(BUSY, Ordering::AcqRel);
        if previous & BUSY != 0 {
            panic!("BUG: transfer queued on busy endpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_device::UsbDirection;

    fn ep(number: u8, is_in: bool) -> EndpointAddress {
        let direction = if is_in {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        EndpointAddress::new(number, direction)
    }

    #[test]
    fn test_claim_release() {
        let table = EndpointTable::new();
        assert!(table.try_claim(ep(1, true)));
        // already claimed
        assert!(!table.try_claim(ep(1, true)));
        // other direction is independent
        assert!(table.try_claim(ep(1, false)));

        assert!(table.release(ep(1, true)));
        assert!(!table.release(ep(1, true)));
        assert!(table.try_claim(ep(1, true)));
    }

    #[test]
    fn test_stall_blocks_claim() {
        let table = EndpointTable::new();
        table.set_stalled(ep(2, false), true);
        assert!(table.is_stalled(ep(2, false)));
        assert!(table.is_busy(ep(2, false)));
        assert!(!table.try_claim(ep(2, false)));

        table.set_stalled(ep(2, false), false);
        assert!(!table.is_busy(ep(2, false)));
        assert!(table.try_claim(ep(2, false)));
    }

    #[test]
    fn test_driver_binding() {
        let mut table = EndpointTable::new();
        table.bind_interface(0, 3);
        table.bind_endpoint(ep(1, true), 3);
        assert_eq!(table.driver_for_interface(0), Some(3));
        assert_eq!(table.driver_for_endpoint(ep(1, true)), Some(3));
        assert_eq!(table.driver_for_endpoint(ep(1, false)), None);

        table.reset();
        assert_eq!(table.driver_for_interface(0), None);
        assert_eq!(table.driver_for_endpoint(ep(1, true)), None);
    }
}
