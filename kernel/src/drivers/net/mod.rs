//! Network device
//!
//! Binds the e1000 rings to physical frames. Ring pages and RX buffers are
//! `Mmu` frames pinned with an extra reference for as long as the device
//! holds them, so an environment unmapping a page the device still owns
//! never frees it out from under the DMA engine.

pub mod e1000;
#[cfg(any(test, feature = "hosted"))]
pub mod model;

use alloc::vec::Vec;
use core::ptr::NonNull;

use x86_64::PhysAddr;

use exokern_abi::net::PACKET_DATA_OFFSET;
use exokern_abi::{SysError, SysResult};

use self::e1000::{Registers, RingMemory, RxDesc, TxDesc, E1000, TDESC_CMD_EOP};
use crate::config::NicConfig;
use crate::memory::{Frame, Mmu};

pub struct NetDevice {
    nic: E1000,
    rings: [Frame; 2],
    /// Frame last queued in each TX slot
    tx_frames: Vec<Option<Frame>>,
    /// Buffer frame currently owned by each RX slot
    rx_frames: Vec<Frame>,
}

/// DMA address of the packet data inside a packet page
fn data_addr(frame: Frame) -> PhysAddr {
    frame.start_address() + PACKET_DATA_OFFSET as u64
}

fn pinned<M: Mmu>(mmu: &mut M) -> SysResult<Frame> {
    let frame = mmu.allocate_frame().ok_or(SysError::NoMem)?;
    mmu.incref(frame);
    Ok(frame)
}

impl NetDevice {
    /// Allocate ring memory and RX buffers, then start the device.
    ///
    /// On `NoMem` every frame taken so far is released again.
    pub fn attach<M: Mmu>(mmu: &mut M, regs: Registers, cfg: &NicConfig) -> SysResult<Self> {
        cfg.validate()?;

        let mut taken = Vec::with_capacity(cfg.rx_slots + 2);
        for _ in 0..cfg.rx_slots + 2 {
            match pinned(mmu) {
                Ok(frame) => taken.push(frame),
                Err(e) => {
                    crate::log_error!("[NET] out of memory after {} of {} frames", taken.len(), cfg.rx_slots + 2);
                    for frame in taken {
                        mmu.decref(frame);
                    }
                    return Err(e);
                }
            }
        }

        let rx_frames = taken.split_off(2);
        let rings = [taken[0], taken[1]];
        let buffers: Vec<PhysAddr> = rx_frames.iter().copied().map(data_addr).collect();

        let mem = |frame: Frame| -> SysResult<RingMemory> {
            Ok(RingMemory {
                virt: NonNull::new(mmu.frame_ptr(frame)).ok_or(SysError::NoMem)?,
                phys: frame.start_address(),
            })
        };
        let (tx_mem, rx_mem) = (mem(rings[0])?, mem(rings[1])?);

        // SAFETY: both ring frames and every buffer frame are pinned until
        // the device is dropped, and each buffer has a full page behind it.
        let nic = unsafe { E1000::attach(regs, cfg, tx_mem, rx_mem, &buffers) };

        Ok(Self {
            nic,
            rings,
            tx_frames: alloc::vec![None; cfg.tx_slots],
            rx_frames,
        })
    }

    pub fn nic(&self) -> &E1000 {
        &self.nic
    }

    /// Frames the device holds a reference on
    pub fn pinned_frames(&self) -> usize {
        self.rings.len() + self.rx_frames.len() + self.tx_frames.iter().flatten().count()
    }

    /// Queue the `len`-byte packet in `frame`'s packet page.
    ///
    /// `frame` stays pinned until its slot is reused.
    pub fn put_tx<M: Mmu>(&mut self, mmu: &mut M, frame: Frame, len: usize) -> SysResult<usize> {
        let slot = self.nic.tx_tail();
        let desc = TxDesc {
            addr: data_addr(frame).as_u64(),
            length: len as u16,
            cmd: TDESC_CMD_EOP,
            ..TxDesc::default()
        };
        let tail = self.nic.tx_try_put(desc).map_err(|_| SysError::TxFull)?;

        mmu.incref(frame);
        if let Some(done) = self.tx_frames[slot].replace(frame) {
            mmu.decref(done);
        }
        #[cfg(feature = "net-trace")]
        crate::log_trace!("[NET] tx slot {} frame {:#x} len {}", slot, frame.start_address().as_u64(), len);
        Ok(tail)
    }

    /// Trade `frame` for the next received packet.
    ///
    /// Returns the filled frame and the packet length. The ring takes its
    /// own reference on `frame`; the returned frame carries the reference
    /// the ring held, which the caller now owns.
    pub fn read_rx<M: Mmu>(&mut self, mmu: &mut M, frame: Frame) -> SysResult<(Frame, usize)> {
        let mut desc = RxDesc { addr: data_addr(frame).as_u64(), ..RxDesc::default() };
        let slot = self.nic.rx_try_read(&mut desc).map_err(|_| SysError::RxEmpty)?;

        mmu.incref(frame);
        let filled = core::mem::replace(&mut self.rx_frames[slot], frame);
        debug_assert_eq!(data_addr(filled).as_u64(), desc.addr);
        #[cfg(feature = "net-trace")]
        crate::log_trace!("[NET] rx slot {} frame {:#x} len {}", slot, filled.start_address().as_u64(), desc.length);
        Ok((filled, desc.length as usize))
    }

    pub fn tx_available(&self) -> bool {
        self.nic.tx_available()
    }

    pub fn rx_available(&self) -> bool {
        self.nic.rx_available()
    }
}

#[cfg(test)]
mod tests {
    use super::model::NicModel;
    use super::*;
    use crate::memory::soft::SoftMmu;

    fn small() -> NicConfig {
        NicConfig { tx_slots: 8, rx_slots: 8, ..NicConfig::default() }
    }

    fn packet_frame(mmu: &mut SoftMmu, payload: &[u8]) -> Frame {
        let frame = mmu.allocate_frame().unwrap();
        mmu.incref(frame);
        mmu.write_phys(data_addr(frame), payload);
        frame
    }

    #[test]
    fn test_attach_pins_rings_and_buffers() {
        let mut mmu = SoftMmu::new(32);
        let (_model, regs) = NicModel::new();
        let dev = NetDevice::attach(&mut mmu, regs, &small()).unwrap();
        assert_eq!(mmu.frames_in_use(), 10);
        assert_eq!(dev.pinned_frames(), 10);
        assert!(dev.tx_available());
        assert!(!dev.rx_available());
    }

    #[test]
    fn test_attach_out_of_memory_releases_frames() {
        let mut mmu = SoftMmu::new(6);
        let (_model, regs) = NicModel::new();
        assert!(matches!(NetDevice::attach(&mut mmu, regs, &small()), Err(SysError::NoMem)));
        assert_eq!(mmu.frames_in_use(), 0);
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let mut mmu = SoftMmu::new(32);
        let (_model, regs) = NicModel::new();
        let cfg = NicConfig { tx_slots: 12, ..small() };
        assert!(matches!(NetDevice::attach(&mut mmu, regs, &cfg), Err(SysError::InvalidArg)));
        assert_eq!(mmu.frames_in_use(), 0);
    }

    #[test]
    fn test_tx_pins_until_slot_reused() {
        let mut mmu = SoftMmu::new(32);
        let (mut model, regs) = NicModel::new();
        let mut dev = NetDevice::attach(&mut mmu, regs, &small()).unwrap();

        let first = packet_frame(&mut mmu, b"first");
        dev.put_tx(&mut mmu, first, 5).unwrap();
        mmu.decref(first);
        assert_eq!(mmu.refcount(first), 1);

        let sent = model.transmit(&mmu);
        assert_eq!(sent, [b"first".to_vec()]);

        for i in 0..7 {
            let frame = packet_frame(&mut mmu, &[i]);
            dev.put_tx(&mut mmu, frame, 1).unwrap();
            mmu.decref(frame);
        }
        model.transmit(&mmu);
        // Wrapping around to slot 0 releases the first packet
        let again = packet_frame(&mut mmu, b"again");
        dev.put_tx(&mut mmu, again, 5).unwrap();
        assert_eq!(mmu.refcount(first), 0);
    }

    #[test]
    fn test_tx_full_without_drain() {
        let mut mmu = SoftMmu::new(32);
        let (_model, regs) = NicModel::new();
        let mut dev = NetDevice::attach(&mut mmu, regs, &small()).unwrap();
        let frame = packet_frame(&mut mmu, b"x");
        for _ in 0..8 {
            dev.put_tx(&mut mmu, frame, 1).unwrap();
        }
        assert!(!dev.tx_available());
        assert_eq!(dev.put_tx(&mut mmu, frame, 1), Err(SysError::TxFull));
        assert_eq!(mmu.refcount(frame), 1 + 8);
    }

    #[test]
    fn test_rx_trades_frames() {
        let mut mmu = SoftMmu::new(32);
        let (mut model, regs) = NicModel::new();
        let mut dev = NetDevice::attach(&mut mmu, regs, &small()).unwrap();

        let carry = packet_frame(&mut mmu, &[]);
        assert_eq!(dev.read_rx(&mut mmu, carry), Err(SysError::RxEmpty));

        assert!(model.receive(&mmu, b"hello"));
        assert!(dev.rx_available());
        let (filled, len) = dev.read_rx(&mut mmu, carry).unwrap();
        assert_eq!(len, 5);
        assert_ne!(filled, carry);

        let mut buf = [0u8; 5];
        mmu.read_phys(data_addr(filled), &mut buf);
        assert_eq!(&buf, b"hello");
        // carry is now held by the ring as well as by us
        assert_eq!(mmu.refcount(carry), 2);
        assert_eq!(mmu.refcount(filled), 1);
        assert_eq!(dev.pinned_frames(), 10);
    }
}
