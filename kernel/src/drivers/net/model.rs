//! Register-level e1000 stand-in for host runs
//!
//! Plays the device side of the rings: consumes pending TX descriptors from
//! TDH on, and fills RX slots from RDH up to (not including) RDT, the way
//! the DMA engine does. The driver lets the TX tail catch up with the head,
//! so a pending slot is one whose DD bit is clear rather than one short of
//! TDT. Descriptor and buffer memory is reached through the
//! `Mmu`, exactly where the driver told the "device" it lives.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};

use x86_64::PhysAddr;

use super::e1000::*;
use crate::memory::Mmu;

pub struct NicModel {
    regs: Registers,
}

impl NicModel {
    /// A powered-on device with link up, and the driver's handle to it
    pub fn new() -> (Self, Registers) {
        // The register file is leaked so a handle can never outlive it
        let file: &'static mut [u32] = Box::leak(alloc::vec![0u32; MMIO_WINDOW / 4].into_boxed_slice());
        let base = NonNull::from(&mut file[0]);
        // SAFETY: `file` covers MMIO_WINDOW bytes for the rest of the process
        let (model, driver) = unsafe { (Registers::new(base), Registers::new(base)) };
        model.write(REG_STATUS, STATUS_LU);
        (Self { regs: model }, driver)
    }

    pub fn reg(&self, offset: u32) -> u32 {
        self.regs.read(offset)
    }

    pub fn set_link(&mut self, up: bool) {
        self.regs.write(REG_STATUS, if up { STATUS_LU } else { 0 });
    }

    fn ring_base(&self, lo: u32, hi: u32) -> u64 {
        u64::from(self.regs.read(lo)) | (u64::from(self.regs.read(hi)) << 32)
    }

    fn desc_ptr<M: Mmu, D>(mmu: &M, base: u64, index: u32) -> *mut D {
        mmu.phys_ptr(PhysAddr::new(base + u64::from(index) * 16)) as *mut D
    }

    /// Send everything queued. Returns the packets in ring order.
    pub fn transmit<M: Mmu>(&mut self, mmu: &M) -> Vec<Vec<u8>> {
        let base = self.ring_base(REG_TDBAL, REG_TDBAH);
        let slots = self.regs.read(REG_TDLEN) / 16;
        let mut head = self.regs.read(REG_TDH);
        let mut sent = Vec::new();

        for _ in 0..slots {
            let at = Self::desc_ptr::<M, TxDesc>(mmu, base, head);
            // SAFETY: the driver placed `slots` descriptors at `base`
            let mut desc = unsafe { ptr::read_volatile(at) };
            if desc.status & TDESC_STA_DD != 0 {
                break;
            }
            let mut data = alloc::vec![0u8; desc.length as usize];
            mmu.read_phys(PhysAddr::new(desc.addr), &mut data);
            sent.push(data);

            desc.status |= TDESC_STA_DD;
            // SAFETY: as above
            unsafe { ptr::write_volatile(at, desc) };
            head = (head + 1) % slots;
        }
        self.regs.write(REG_TDH, head);
        sent
    }

    /// Deliver `packet` into the next free RX slot. `false` if the ring
    /// has no free slot (the device would drop it).
    pub fn receive<M: Mmu>(&mut self, mmu: &M, packet: &[u8]) -> bool {
        self.fill(mmu, packet, RDESC_STA_DD | RDESC_STA_EOP)
    }

    /// Deliver the first descriptor of a multi-descriptor packet
    pub fn receive_fragment<M: Mmu>(&mut self, mmu: &M, packet: &[u8]) -> bool {
        self.fill(mmu, packet, RDESC_STA_DD)
    }

    fn fill<M: Mmu>(&mut self, mmu: &M, packet: &[u8], status: u8) -> bool {
        let base = self.ring_base(REG_RDBAL, REG_RDBAH);
        let slots = self.regs.read(REG_RDLEN) / 16;
        let head = self.regs.read(REG_RDH);
        if slots == 0 || head == self.regs.read(REG_RDT) {
            return false;
        }

        let at = Self::desc_ptr::<M, RxDesc>(mmu, base, head);
        // SAFETY: the driver placed `slots` descriptors at `base`
        let mut desc = unsafe { ptr::read_volatile(at) };
        mmu.write_phys(PhysAddr::new(desc.addr), packet);
        desc.length = packet.len() as u16;
        desc.status = status;
        // SAFETY: as above
        unsafe { ptr::write_volatile(at, desc) };

        self.regs.write(REG_RDH, (head + 1) % slots);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NicConfig;
    use crate::drivers::net::NetDevice;
    use crate::memory::soft::SoftMmu;

    #[test]
    fn test_rx_ring_holds_one_less_than_slots() {
        let mut mmu = SoftMmu::new(32);
        let (mut model, regs) = NicModel::new();
        let cfg = NicConfig { tx_slots: 8, rx_slots: 8, ..NicConfig::default() };
        let _dev = NetDevice::attach(&mut mmu, regs, &cfg).unwrap();

        for i in 0..7u8 {
            assert!(model.receive(&mmu, &[i; 60]), "slot {}", i);
        }
        assert!(!model.receive(&mmu, &[9; 60]));
    }

    #[test]
    fn test_full_tx_ring_drains() {
        let mut mmu = SoftMmu::new(32);
        let (mut model, regs) = NicModel::new();
        let cfg = NicConfig { tx_slots: 8, rx_slots: 8, ..NicConfig::default() };
        let mut dev = NetDevice::attach(&mut mmu, regs, &cfg).unwrap();

        let frame = mmu.allocate_frame().unwrap();
        mmu.incref(frame);
        for i in 0..8u8 {
            mmu.write_phys(super::super::data_addr(frame), &[i]);
            dev.put_tx(&mut mmu, frame, 1).unwrap();
        }
        assert_eq!(model.reg(REG_TDT), model.reg(REG_TDH));

        assert_eq!(model.transmit(&mmu).len(), 8);
        assert!(dev.tx_available());
        assert!(model.transmit(&mmu).is_empty());
    }

    #[test]
    fn test_link_status_visible_to_driver() {
        let mut mmu = SoftMmu::new(32);
        let (mut model, regs) = NicModel::new();
        let cfg = NicConfig { tx_slots: 8, rx_slots: 8, ..NicConfig::default() };
        let dev = NetDevice::attach(&mut mmu, regs, &cfg).unwrap();

        assert!(dev.nic().link_up());
        model.set_link(false);
        assert!(!dev.nic().link_up());
        assert_eq!(model.reg(REG_RCTL) & RCTL_EN, RCTL_EN);
    }
}
