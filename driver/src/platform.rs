//! The kernel services this driver consumes.
//!
//! The driver core never touches hardware or the scheduler directly;
//! everything goes through [`Platform`]. The kernel implements it with
//! real port I/O, the 8259/IOAPIC, PCI configuration access, and its
//! wait primitives. Host tests implement it with a simulated
//! controller.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod pc;

/// Address of a function on the PCI configuration bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciSlot {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// Port I/O, delay timers, interrupt control, PCI configuration space,
/// and the two scheduling primitives the command engine parks on.
pub trait Platform: Send + Sync {
    // Port I/O ------------------------------------------------------------

    fn inb(&self, port: u16) -> u8;
    fn outb(&self, port: u16, value: u8);
    fn inw(&self, port: u16) -> u16;
    fn outw(&self, port: u16, value: u16);
    fn outl(&self, port: u16, value: u32);

    // Timers --------------------------------------------------------------

    /// Delay for `ms` milliseconds. May yield the CPU.
    fn msleep(&self, ms: u64);

    /// Delay for `us` microseconds. Sub-microsecond settle times (the
    /// 400 ns after a device select) are requested as `usleep(1)`.
    fn usleep(&self, us: u64);

    /// Free-running millisecond counter used for busy-wait budgets.
    fn ticks_ms(&self) -> u64;

    // Interrupt controller ------------------------------------------------

    fn irq_mask(&self, irq: u8);
    fn irq_unmask(&self, irq: u8);

    /// Route `irq` to the CPU the caller is running on, so the
    /// interrupt rendezvous stays local. No-op on uniprocessor hosts.
    fn irq_assign_current_cpu(&self, irq: u8);

    // PCI configuration space ---------------------------------------------

    /// Find a function whose (class, subclass) pair matches
    /// `class_code` (class in bits 15:8, subclass in bits 7:0).
    fn pci_find_class(&self, class_code: u32) -> Option<PciSlot>;
    fn pci_read_config(&self, slot: PciSlot, offset: u8) -> u32;
    fn pci_write_config(&self, slot: PciSlot, offset: u8, value: u32);
    fn pci_write_config16(&self, slot: PciSlot, offset: u8, value: u16);

    // Scheduling ----------------------------------------------------------

    /// Join the FIFO wait-queue serializing commands on `host`;
    /// returns once the caller holds it.
    fn queue_wait(&self, host: usize);

    /// Release the wait-queue for `host`, waking the next task in line.
    fn queue_release(&self, host: usize);

    /// Park until `intr_wake(host)` arrives or `timeout_ms` elapses.
    /// Returns false on timeout. Wakes are latched: a wake delivered
    /// while no task is parked satisfies the next wait, because the
    /// device interrupt can fire between starting a bus-master
    /// transfer and parking.
    fn intr_wait(&self, host: usize, timeout_ms: u64) -> bool;

    /// Wake the task parked in `intr_wait` for `host`, or latch the
    /// wake if none is parked yet. The only thing an IRQ handler needs
    /// to call.
    fn intr_wake(&self, host: usize);

    // Memory --------------------------------------------------------------

    /// Physical address of `ptr`, as the bus-master engine will see it.
    fn phys_addr(&self, ptr: *const u8) -> u32;
}
