//! Intel E1000 descriptor rings
//!
//! Legacy-descriptor TX and RX rings for the 82540EM (QEMU's default NIC),
//! polled, one descriptor per packet. The driver never allocates: ring
//! memory, buffers and the MMIO window are handed in at attach time and
//! outlive the instance.

use core::ptr::{self, NonNull};

use x86_64::PhysAddr;

use crate::config::NicConfig;

// ============================================================================
// E1000 Register Offsets
// ============================================================================

pub const REG_CTRL: u32 = 0x0000;        // Device Control
pub const REG_STATUS: u32 = 0x0008;      // Device Status
pub const REG_IMC: u32 = 0x00D8;         // Interrupt Mask Clear

pub const REG_RCTL: u32 = 0x0100;        // Receive Control
pub const REG_RDBAL: u32 = 0x2800;       // RX Descriptor Base Low
pub const REG_RDBAH: u32 = 0x2804;       // RX Descriptor Base High
pub const REG_RDLEN: u32 = 0x2808;       // RX Descriptor Length
pub const REG_RDH: u32 = 0x2810;         // RX Descriptor Head
pub const REG_RDT: u32 = 0x2818;         // RX Descriptor Tail

pub const REG_TCTL: u32 = 0x0400;        // Transmit Control
pub const REG_TIPG: u32 = 0x0410;        // TX Inter-Packet Gap
pub const REG_TDBAL: u32 = 0x3800;       // TX Descriptor Base Low
pub const REG_TDBAH: u32 = 0x3804;       // TX Descriptor Base High
pub const REG_TDLEN: u32 = 0x3808;       // TX Descriptor Length
pub const REG_TDH: u32 = 0x3810;         // TX Descriptor Head
pub const REG_TDT: u32 = 0x3818;         // TX Descriptor Tail

pub const REG_MTA: u32 = 0x5200;         // Multicast Table Array (128 entries)
pub const REG_RAL0: u32 = 0x5400;        // Receive Address Low
pub const REG_RAH0: u32 = 0x5404;        // Receive Address High

/// Bytes of register space the driver touches
pub const MMIO_WINDOW: usize = 0x6000;

const MTA_ENTRIES: u32 = 128;

// ============================================================================
// Register Bits
// ============================================================================

pub const STATUS_LU: u32 = 1 << 1;       // Link Up

pub const RAH_AV: u32 = 1 << 31;         // Address Valid

pub const RCTL_EN: u32 = 1 << 1;         // Receiver Enable
pub const RCTL_BAM: u32 = 1 << 15;       // Broadcast Accept Mode
pub const RCTL_BSIZE_2048: u32 = 0 << 16; // Buffer Size 2048
pub const RCTL_SECRC: u32 = 1 << 26;     // Strip Ethernet CRC

pub const TCTL_EN: u32 = 1 << 1;         // Transmit Enable
pub const TCTL_PSP: u32 = 1 << 3;        // Pad Short Packets
const TCTL_CT_SHIFT: u32 = 4;            // Collision Threshold
const TCTL_COLD_SHIFT: u32 = 12;         // Collision Distance
/// Full-duplex 10/100/1000 values from the 8254x manual, 14.5
pub const TCTL_CT: u32 = 0x10 << TCTL_CT_SHIFT;
pub const TCTL_COLD: u32 = 0x40 << TCTL_COLD_SHIFT;
pub const TIPG_DEFAULT: u32 = 10 | (8 << 10) | (6 << 20);

pub const TDESC_CMD_EOP: u8 = 1 << 0;    // End of Packet
pub const TDESC_CMD_RS: u8 = 1 << 3;     // Report Status
pub const TDESC_STA_DD: u8 = 1 << 0;     // Descriptor Done

pub const RDESC_STA_DD: u8 = 1 << 0;     // Descriptor Done
pub const RDESC_STA_EOP: u8 = 1 << 1;    // End of Packet

// ============================================================================
// Descriptor Structures
// ============================================================================

/// Transmit Descriptor (Legacy Format)
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDesc {
    pub addr: u64,       // Physical address of buffer
    pub length: u16,
    pub cso: u8,         // Checksum offset
    pub cmd: u8,
    pub status: u8,
    pub css: u8,         // Checksum start
    pub special: u16,
}

/// Receive Descriptor (Legacy Format)
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDesc {
    pub addr: u64,       // Physical address of buffer
    pub length: u16,
    pub checksum: u16,
    pub status: u8,
    pub errors: u8,
    pub special: u16,
}

/// Ring is full; the slot at the tail still belongs to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

/// Nothing received since the last read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Empty;

// ============================================================================
// MMIO
// ============================================================================

/// The device's register window
pub struct Registers {
    base: NonNull<u32>,
}

// SAFETY: the window is only reached through `&self`/`&mut self` of the
// owning driver, which is itself never shared between CPUs.
unsafe impl Send for Registers {}

impl Registers {
    /// # Safety
    /// `base` must map at least `MMIO_WINDOW` bytes of device registers (or
    /// memory standing in for them) for as long as the handle lives.
    pub unsafe fn new(base: NonNull<u32>) -> Self {
        Self { base }
    }

    pub fn read(&self, offset: u32) -> u32 {
        debug_assert!((offset as usize) < MMIO_WINDOW && offset % 4 == 0);
        // SAFETY: offset is inside the window promised by `new`
        unsafe { ptr::read_volatile(self.base.as_ptr().add(offset as usize / 4)) }
    }

    pub fn write(&self, offset: u32, value: u32) {
        debug_assert!((offset as usize) < MMIO_WINDOW && offset % 4 == 0);
        // SAFETY: as for read
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset as usize / 4), value) }
    }
}

/// One page of descriptor memory, seen by both CPU and device
#[derive(Debug, Clone, Copy)]
pub struct RingMemory {
    pub virt: NonNull<u8>,
    pub phys: PhysAddr,
}

struct Ring<D> {
    descs: NonNull<D>,
    len: usize,
}

impl<D: Copy> Ring<D> {
    fn get(&self, index: usize) -> D {
        // SAFETY: index is masked by callers; descs covers len entries
        unsafe { ptr::read_volatile(self.descs.as_ptr().add(index)) }
    }

    fn set(&mut self, index: usize, desc: D) {
        // SAFETY: as for get
        unsafe { ptr::write_volatile(self.descs.as_ptr().add(index), desc) }
    }

    fn mask(&self, index: usize) -> usize {
        index & (self.len - 1)
    }

    fn bytes(&self) -> u32 {
        (self.len * core::mem::size_of::<D>()) as u32
    }
}

// ============================================================================
// E1000 Driver
// ============================================================================

pub struct E1000 {
    regs: Registers,
    tx: Ring<TxDesc>,
    rx: Ring<RxDesc>,
    mac: [u8; 6],
}

// SAFETY: ring memory is owned by this instance for its whole life
unsafe impl Send for E1000 {}

impl E1000 {
    /// Program the device and hand it both rings.
    ///
    /// `rx_buffers` must hold one DMA address per RX slot.
    ///
    /// # Safety
    /// Both `RingMemory` pages must stay valid, exclusively owned by the
    /// device, and at the stated physical addresses until the device is
    /// reset. Every RX buffer address must have 2048 writable bytes behind
    /// it.
    pub unsafe fn attach(
        regs: Registers,
        cfg: &NicConfig,
        tx_mem: RingMemory,
        rx_mem: RingMemory,
        rx_buffers: &[PhysAddr],
    ) -> Self {
        debug_assert_eq!(rx_buffers.len(), cfg.rx_slots);

        let mut nic = Self {
            regs,
            tx: Ring { descs: tx_mem.virt.cast(), len: cfg.tx_slots },
            rx: Ring { descs: rx_mem.virt.cast(), len: cfg.rx_slots },
            mac: cfg.mac,
        };

        // Polled mode
        nic.regs.write(REG_IMC, 0xFFFF_FFFF);

        nic.set_mac();
        for i in 0..MTA_ENTRIES {
            nic.regs.write(REG_MTA + i * 4, 0);
        }

        nic.init_tx(tx_mem.phys);
        nic.init_rx(rx_mem.phys, rx_buffers);

        crate::log!("[E1000] {} TX / {} RX slots, MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            cfg.tx_slots, cfg.rx_slots,
            nic.mac[0], nic.mac[1], nic.mac[2], nic.mac[3], nic.mac[4], nic.mac[5]);
        nic
    }

    fn set_mac(&mut self) {
        let m = self.mac.map(u32::from);
        let ral = m[0] | (m[1] << 8) | (m[2] << 16) | (m[3] << 24);
        let rah = m[4] | (m[5] << 8) | RAH_AV;
        self.regs.write(REG_RAL0, ral);
        self.regs.write(REG_RAH0, rah);
    }

    fn init_tx(&mut self, phys: PhysAddr) {
        // Every slot starts out reclaimable
        let done = TxDesc { status: TDESC_STA_DD, ..TxDesc::default() };
        for i in 0..self.tx.len {
            self.tx.set(i, done);
        }

        self.regs.write(REG_TDBAL, phys.as_u64() as u32);
        self.regs.write(REG_TDBAH, (phys.as_u64() >> 32) as u32);
        self.regs.write(REG_TDLEN, self.tx.bytes());
        self.regs.write(REG_TDH, 0);
        self.regs.write(REG_TDT, 0);

        self.regs.write(REG_TCTL, TCTL_EN | TCTL_PSP | TCTL_CT | TCTL_COLD);
        self.regs.write(REG_TIPG, TIPG_DEFAULT);
    }

    fn init_rx(&mut self, phys: PhysAddr, buffers: &[PhysAddr]) {
        for i in 0..self.rx.len {
            let addr = buffers.get(i).map_or(0, |b| b.as_u64());
            self.rx.set(i, RxDesc { addr, ..RxDesc::default() });
        }

        self.regs.write(REG_RDBAL, phys.as_u64() as u32);
        self.regs.write(REG_RDBAH, (phys.as_u64() >> 32) as u32);
        self.regs.write(REG_RDLEN, self.rx.bytes());
        // Head at 0, tail one behind: every slot but the tail is the device's
        self.regs.write(REG_RDH, 0);
        self.regs.write(REG_RDT, (self.rx.len - 1) as u32);

        self.regs.write(REG_RCTL, RCTL_EN | RCTL_BAM | RCTL_BSIZE_2048 | RCTL_SECRC);
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn status(&self) -> u32 {
        self.regs.read(REG_STATUS)
    }

    pub fn link_up(&self) -> bool {
        self.status() & STATUS_LU != 0
    }

    pub fn tx_slots(&self) -> usize {
        self.tx.len
    }

    pub fn rx_slots(&self) -> usize {
        self.rx.len
    }

    pub fn tx_tail(&self) -> usize {
        self.tx.mask(self.regs.read(REG_TDT) as usize)
    }

    fn rx_tail(&self) -> usize {
        self.rx.mask(self.regs.read(REG_RDT) as usize)
    }

    /// Queue `desc` at the tail. Returns the new tail index.
    pub fn tx_try_put(&mut self, desc: TxDesc) -> Result<usize, Full> {
        let tail = self.tx_tail();
        if self.tx.get(tail).status & TDESC_STA_DD == 0 {
            return Err(Full);
        }
        self.tx.set(tail, TxDesc { cmd: desc.cmd | TDESC_CMD_RS, status: 0, ..desc });
        let next = self.tx.mask(tail + 1);
        self.regs.write(REG_TDT, next as u32);
        Ok(next)
    }

    pub fn tx_available(&self) -> bool {
        self.tx.get(self.tx_tail()).status & TDESC_STA_DD != 0
    }

    /// Take the next received packet.
    ///
    /// The caller's buffer address goes into the ring and the slot's filled
    /// buffer comes back in `desc`, along with length and status. Returns the
    /// slot index, which becomes the new tail.
    ///
    /// # Panics
    /// On a packet split over several descriptors; buffers are sized so that
    /// never happens for standard frames.
    pub fn rx_try_read(&mut self, desc: &mut RxDesc) -> Result<usize, Empty> {
        let next = self.rx.mask(self.rx_tail() + 1);
        let slot = self.rx.get(next);
        if slot.status & RDESC_STA_DD == 0 {
            return Err(Empty);
        }
        if slot.status & RDESC_STA_EOP == 0 {
            panic!("[E1000] fragmented packet in RX slot {}", next);
        }

        let fresh = desc.addr;
        *desc = slot;
        self.rx.set(next, RxDesc { addr: fresh, ..RxDesc::default() });
        self.regs.write(REG_RDT, next as u32);
        Ok(next)
    }

    pub fn rx_available(&self) -> bool {
        self.rx_is_done(self.rx.mask(self.rx_tail() + 1))
    }

    pub fn rx_is_done(&self, index: usize) -> bool {
        self.rx.get(self.rx.mask(index)).status & RDESC_STA_DD != 0
    }
}
