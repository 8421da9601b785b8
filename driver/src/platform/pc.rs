//! Polled PC backend for [`Platform`].
//!
//! This is the bring-up implementation: it talks to real ports, masks
//! real 8259 lines, and walks real PCI configuration space, but it has
//! no scheduler, so the wait-queue is a ticket spin and the interrupt
//! rendezvous polls a latch that [`handle_irq`] feeds from the IRQ
//! stub. A kernel with a scheduler supplies its own [`Platform`] and
//! parks tasks instead.
//!
//! [`handle_irq`]: crate::driver::AtaDriver::handle_irq

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use ide_shared::{pcicfg, pic, portio};

use super::{PciSlot, Platform};

#[cfg(target_arch = "x86")]
use core::arch::x86::_rdtsc;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::_rdtsc;

/// FIFO spin gate: the thread that started waiting first enters first.
struct SpinQueue {
    next: AtomicU64,
    serving: AtomicU64,
}

impl SpinQueue {
    const fn new() -> Self {
        SpinQueue {
            next: AtomicU64::new(0),
            serving: AtomicU64::new(0),
        }
    }

    fn wait(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.serving.fetch_add(1, Ordering::Release);
    }
}

pub struct PcPlatform {
    /// TSC ticks per millisecond, measured by the boot code
    tsc_per_ms: u64,
    queues: [SpinQueue; 2],
    latches: [AtomicI32; 2],
}

impl PcPlatform {
    /// # Safety
    ///
    /// The caller must run in ring 0 with exclusive ownership of the
    /// IDE task-file ports, the 8259 mask registers, and PCI
    /// configuration space.
    pub unsafe fn new(tsc_per_ms: u64) -> Self {
        PcPlatform {
            tsc_per_ms: tsc_per_ms.max(1),
            queues: [SpinQueue::new(), SpinQueue::new()],
            latches: [AtomicI32::new(0), AtomicI32::new(0)],
        }
    }

    fn now(&self) -> u64 {
        // SAFETY: rdtsc has no side effects.
        unsafe { _rdtsc() }
    }

    fn spin_ticks(&self, ticks: u64) {
        let start = self.now();
        while self.now().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }
}

impl Platform for PcPlatform {
    fn inb(&self, port: u16) -> u8 {
        // SAFETY: port ownership asserted at construction.
        unsafe { portio::inb(port) }
    }

    fn outb(&self, port: u16, value: u8) {
        // SAFETY: port ownership asserted at construction.
        unsafe { portio::outb(port, value) }
    }

    fn inw(&self, port: u16) -> u16 {
        // SAFETY: port ownership asserted at construction.
        unsafe { portio::inw(port) }
    }

    fn outw(&self, port: u16, value: u16) {
        // SAFETY: port ownership asserted at construction.
        unsafe { portio::outw(port, value) }
    }

    fn outl(&self, port: u16, value: u32) {
        // SAFETY: port ownership asserted at construction.
        unsafe { portio::outl(port, value) }
    }

    fn msleep(&self, ms: u64) {
        self.spin_ticks(ms * self.tsc_per_ms);
    }

    fn usleep(&self, us: u64) {
        self.spin_ticks((us * self.tsc_per_ms / 1000).max(1));
    }

    fn ticks_ms(&self) -> u64 {
        self.now() / self.tsc_per_ms
    }

    fn irq_mask(&self, irq: u8) {
        // SAFETY: interrupt-controller ownership asserted at
        // construction.
        unsafe { pic::irq_mask(irq) }
    }

    fn irq_unmask(&self, irq: u8) {
        // SAFETY: interrupt-controller ownership asserted at
        // construction.
        unsafe { pic::irq_unmask(irq) }
    }

    fn irq_assign_current_cpu(&self, _irq: u8) {
        // Single CPU at bring-up.
    }

    fn pci_find_class(&self, class_code: u32) -> Option<PciSlot> {
        // SAFETY: configuration access serialized by the per-host
        // queues above.
        let (bus, device, function) = unsafe { pcicfg::find_class(class_code) }?;
        Some(PciSlot {
            bus,
            device,
            function,
        })
    }

    fn pci_read_config(&self, slot: PciSlot, offset: u8) -> u32 {
        // SAFETY: see pci_find_class.
        unsafe { pcicfg::read_config(slot.bus, slot.device, slot.function, offset) }
    }

    fn pci_write_config(&self, slot: PciSlot, offset: u8, value: u32) {
        // SAFETY: see pci_find_class.
        unsafe { pcicfg::write_config(slot.bus, slot.device, slot.function, offset, value) }
    }

    fn pci_write_config16(&self, slot: PciSlot, offset: u8, value: u16) {
        // SAFETY: see pci_find_class.
        unsafe { pcicfg::write_config16(slot.bus, slot.device, slot.function, offset, value) }
    }

    fn queue_wait(&self, host: usize) {
        self.queues[host].wait();
    }

    fn queue_release(&self, host: usize) {
        self.queues[host].release();
    }

    fn intr_wait(&self, host: usize, timeout_ms: u64) -> bool {
        let deadline = self.ticks_ms() + timeout_ms;
        loop {
            let taken = self.latches[host]
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |latch| {
                    if latch > 0 {
                        Some(latch - 1)
                    } else {
                        None
                    }
                });
            if taken.is_ok() {
                return true;
            }
            if self.ticks_ms() >= deadline {
                return false;
            }
            core::hint::spin_loop();
        }
    }

    fn intr_wake(&self, host: usize) {
        self.latches[host].fetch_add(1, Ordering::AcqRel);
    }

    fn phys_addr(&self, ptr: *const u8) -> u32 {
        // Identity-mapped low memory at bring-up.
        ptr as usize as u32
    }
}
