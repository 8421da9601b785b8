//! Test-only simulated IDE controller: two channels of ATA disks and
//! ATAPI drives behind the real register protocol, a PIIX-style PCI
//! function, a bus-master engine, a virtual clock, and the two
//! scheduling primitives. The driver under test cannot tell it from
//! port I/O; the tests read back the traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

use crate::busmaster::{Prd, PRD_EOT};
use crate::platform::{PciSlot, Platform};
use crate::regs::{CTL_NIEN, CTL_SRST, IRR_CD, STA_DRQ, STA_ERR, STA_RDY};

/// Bus-master I/O base handed out via BAR4 (bit 0 = I/O space flag).
const BM_BASE: u16 = 0xC000;
const BM_BAR: u32 = BM_BASE as u32 | 1;

/// Value a floating bus returns.
const FLOATING: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    IrqMask(u8),
    IrqUnmask(u8),
    IrqSteer(u8),
    Sleep(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct PortOp {
    pub write: bool,
    pub port: u16,
    pub value: u32,
    pub thread: ThreadId,
}

pub struct DiskConfig {
    pub total_sectors: u32,
    pub model: &'static str,
    pub pio_word: u16,
    pub mdma_word: u16,
    pub udma_word: u16,
    /// When false the engine never completes and never interrupts
    pub dma_completes: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            total_sectors: 0x4000,
            model: "SIM HARDDISK",
            pio_word: 0x0003,
            mdma_word: 0x0007,
            udma_word: 0x003F,
            dma_completes: true,
        }
    }
}

pub struct CdromConfig {
    pub last_lba: u32,
    pub sector_size: u32,
    pub model: &'static str,
    pub overlapped: bool,
    /// (key, asc, ascq) answers for successive REQUEST SENSE calls;
    /// TEST UNIT READY fails while any remain
    pub sense: Vec<(u8, u8, u8)>,
}

impl Default for CdromConfig {
    fn default() -> Self {
        CdromConfig {
            last_lba: 0x4A853,
            sector_size: 2048,
            model: "SIM CD-ROM",
            overlapped: false,
            sense: Vec::new(),
        }
    }
}

struct SimDevice {
    atapi: bool,
    model: String,
    sector_size: u32,
    total_sectors: u32,
    overlapped: bool,
    pio_word: u16,
    mdma_word: u16,
    udma_word: u16,
    dma_completes: bool,
    status: u8,
    written: HashMap<u32, Vec<u8>>,
    sense_queue: VecDeque<(u8, u8, u8)>,
    features_log: Vec<(u8, u8)>,
    init_params: Option<(u8, u8)>,
    start_stop: Vec<u8>,
    commands: Vec<u8>,
}

impl SimDevice {
    fn disk(cfg: DiskConfig) -> Self {
        SimDevice {
            atapi: false,
            model: cfg.model.into(),
            sector_size: 512,
            total_sectors: cfg.total_sectors,
            overlapped: false,
            pio_word: cfg.pio_word,
            mdma_word: cfg.mdma_word,
            udma_word: cfg.udma_word,
            dma_completes: cfg.dma_completes,
            status: STA_RDY,
            written: HashMap::new(),
            sense_queue: VecDeque::new(),
            features_log: Vec::new(),
            init_params: None,
            start_stop: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn cdrom(cfg: CdromConfig) -> Self {
        SimDevice {
            atapi: true,
            model: cfg.model.into(),
            sector_size: cfg.sector_size,
            total_sectors: cfg.last_lba.wrapping_add(1),
            overlapped: cfg.overlapped,
            pio_word: 0x0003,
            mdma_word: 0x0007,
            udma_word: 0x003F,
            dma_completes: true,
            status: STA_RDY,
            written: HashMap::new(),
            sense_queue: cfg.sense.into_iter().collect(),
            features_log: Vec::new(),
            init_params: None,
            start_stop: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Contents of one sector: whatever was last written, else a
    /// deterministic fill derived from the LBA.
    fn sector(&self, lba: u32) -> Vec<u8> {
        self.written.get(&lba).cloned().unwrap_or_else(|| {
            (0..self.sector_size as usize)
                .map(|j| (lba as usize).wrapping_mul(31).wrapping_add(j) as u8)
                .collect()
        })
    }

    fn read_range(&self, lba: u32, count: u32) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..count {
            data.extend_from_slice(&self.sector(lba + i));
        }
        data
    }

    fn write_range(&mut self, lba: u32, bytes: &[u8]) {
        for (i, sector) in bytes.chunks(self.sector_size as usize).enumerate() {
            self.written.insert(lba + i as u32, sector.to_vec());
        }
    }

    fn identify(&self) -> VecDeque<u8> {
        let mut words = [0u16; 256];
        words[0] = if self.atapi { 0x8500 } else { 0x0040 };
        words[1] = 0x3FFF;
        words[3] = 15;
        words[6] = 63;
        let mut model = [b' '; 40];
        let len = self.model.len().min(40);
        model[..len].copy_from_slice(&self.model.as_bytes()[..len]);
        for i in 0..20 {
            words[27 + i] = u16::from(model[i * 2]) << 8 | u16::from(model[i * 2 + 1]);
        }
        words[49] = 0x0300 | if self.overlapped { 0x2000 } else { 0 };
        if !self.atapi {
            words[60] = (self.total_sectors & 0xFFFF) as u16;
            words[61] = (self.total_sectors >> 16) as u16;
        }
        words[63] = self.mdma_word;
        words[64] = self.pio_word;
        words[88] = self.udma_word;

        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

enum OutKind {
    AtaWrite { lba: u32 },
    AtapiWrite { lba: u32 },
    Cdb { features: u8 },
}

enum PendingDma {
    ToHost(Vec<u8>),
    FromHost { lba: u32 },
}

enum Service {
    Pio(Vec<u8>),
    Dma(PendingDma),
}

struct SimChannel {
    devices: [Option<SimDevice>; 2],
    selected: usize,
    forced_status: Option<u8>,
    nien: bool,
    features: u8,
    nsect: u8,
    lbal: u8,
    lbam: u8,
    lbah: u8,
    devhead: u8,
    irr: u8,
    fifo_in: VecDeque<u8>,
    fifo_out: Vec<u8>,
    expect_out: usize,
    out_kind: Option<OutKind>,
    pending_dma: Option<PendingDma>,
    service_pending: Option<Service>,
    /// An overlapped bus release whose DRQ indication has not been
    /// read yet. The first status-register read returns DRQ and then
    /// drops the device to idle until SERVICE.
    release_pending: bool,
    bm_command: u8,
    bm_status: u8,
    bm_prdt: u32,
}

impl SimChannel {
    fn new() -> Self {
        SimChannel {
            devices: [None, None],
            selected: 0,
            forced_status: None,
            nien: false,
            features: 0,
            nsect: 0,
            lbal: 0,
            lbam: 0,
            lbah: 0,
            devhead: 0,
            irr: 0,
            fifo_in: VecDeque::new(),
            fifo_out: Vec::new(),
            expect_out: 0,
            out_kind: None,
            pending_dma: None,
            service_pending: None,
            release_pending: false,
            bm_command: 0,
            bm_status: 0,
            bm_prdt: 0,
        }
    }

    fn device(&mut self) -> Option<&mut SimDevice> {
        self.devices[self.selected].as_mut()
    }

    fn status(&self) -> u8 {
        if let Some(forced) = self.forced_status {
            return forced;
        }
        match &self.devices[self.selected] {
            Some(dev) => dev.status,
            None => FLOATING,
        }
    }

    fn lba28(&self) -> u32 {
        u32::from(self.devhead & 0xF) << 24
            | u32::from(self.lbah) << 16
            | u32::from(self.lbam) << 8
            | u32::from(self.lbal)
    }

    fn count(&self) -> u32 {
        if self.nsect == 0 {
            256
        } else {
            u32::from(self.nsect)
        }
    }

    fn reset(&mut self) {
        for dev in self.devices.iter_mut().flatten() {
            dev.status = STA_RDY;
        }
        self.selected = 0;
        self.irr = 0;
        self.fifo_in.clear();
        self.fifo_out.clear();
        self.expect_out = 0;
        self.out_kind = None;
        self.pending_dma = None;
        self.service_pending = None;
        self.release_pending = false;
    }
}

struct SimPci {
    slot: PciSlot,
    vendor_device: u32,
    command: u16,
    config: HashMap<u8, u32>,
    writes: Vec<(u8, u32)>,
}

struct Sim {
    clock_ms: u64,
    channels: [SimChannel; 2],
    pci: Option<SimPci>,
    intr_latch: [i32; 2],
    phys_map: Vec<usize>,
    port_log: Vec<PortOp>,
    events: Vec<Event>,
    prd_log: [Vec<(u32, u32)>; 2],
}

struct HostQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

#[derive(Default)]
struct QueueState {
    held: bool,
    waiters: VecDeque<ThreadId>,
}

impl HostQueue {
    fn new() -> Self {
        HostQueue {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        state.waiters.push_back(me);
        while state.held || state.waiters.front() != Some(&me) {
            state = self.cond.wait(state).unwrap();
        }
        state.waiters.pop_front();
        state.held = true;
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.held = false;
        drop(state);
        self.cond.notify_all();
    }
}

/// The simulated platform. One instance per test; share across
/// threads for the serialization scenarios.
pub struct SimPlatform {
    inner: Mutex<Sim>,
    queues: [HostQueue; 2],
}

impl SimPlatform {
    pub fn new() -> Self {
        SimPlatform {
            inner: Mutex::new(Sim {
                clock_ms: 0,
                channels: [SimChannel::new(), SimChannel::new()],
                pci: None,
                intr_latch: [0, 0],
                phys_map: Vec::new(),
                port_log: Vec::new(),
                events: Vec::new(),
                prd_log: [Vec::new(), Vec::new()],
            }),
            queues: [HostQueue::new(), HostQueue::new()],
        }
    }

    pub fn attach_disk(&self, host: usize, dev: usize, cfg: DiskConfig) {
        let mut sim = self.inner.lock().unwrap();
        sim.channels[host].devices[dev] = Some(SimDevice::disk(cfg));
    }

    pub fn attach_cdrom(&self, host: usize, dev: usize, cfg: CdromConfig) {
        let mut sim = self.inner.lock().unwrap();
        sim.channels[host].devices[dev] = Some(SimDevice::cdrom(cfg));
    }

    /// Put an IDE function with the given vendor:device dword on the
    /// PCI bus.
    pub fn install_ide_bridge(&self, vendor_device: u32) {
        let mut sim = self.inner.lock().unwrap();
        sim.pci = Some(SimPci {
            slot: PciSlot {
                bus: 0,
                device: 7,
                function: 1,
            },
            vendor_device,
            command: 0x0001,
            config: HashMap::new(),
            writes: Vec::new(),
        });
    }

    /// Pre-set a bridge timing/enable dword, as a BIOS would.
    pub fn set_bridge_config(&self, offset: u8, value: u32) {
        let mut sim = self.inner.lock().unwrap();
        if let Some(pci) = sim.pci.as_mut() {
            pci.config.insert(offset, value);
        }
    }

    pub fn bridge_config(&self, offset: u8) -> u32 {
        let sim = self.inner.lock().unwrap();
        sim.pci
            .as_ref()
            .and_then(|pci| pci.config.get(&offset).copied())
            .unwrap_or(0)
    }

    pub fn bridge_writes(&self) -> Vec<(u8, u32)> {
        let sim = self.inner.lock().unwrap();
        sim.pci.as_ref().map(|pci| pci.writes.clone()).unwrap_or_default()
    }

    pub fn channel(&self, host: usize) -> ChannelProxy<'_> {
        ChannelProxy { sim: self, host }
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn port_log(&self) -> Vec<PortOp> {
        self.inner.lock().unwrap().port_log.clone()
    }

    pub fn clear_port_log(&self) {
        self.inner.lock().unwrap().port_log.clear();
    }

    pub fn prd_log(&self, host: usize) -> Vec<(u32, u32)> {
        self.inner.lock().unwrap().prd_log[host].clone()
    }

    pub fn features_log(&self, host: usize, dev: usize) -> Vec<(u8, u8)> {
        self.with_device(host, dev, |d| d.features_log.clone())
    }

    pub fn commands_log(&self, host: usize, dev: usize) -> Vec<u8> {
        self.with_device(host, dev, |d| d.commands.clone())
    }

    pub fn init_params(&self, host: usize, dev: usize) -> Option<(u8, u8)> {
        self.with_device(host, dev, |d| d.init_params)
    }

    pub fn start_stop_log(&self, host: usize, dev: usize) -> Vec<u8> {
        self.with_device(host, dev, |d| d.start_stop.clone())
    }

    pub fn sector_bytes(&self, host: usize, dev: usize, lba: u32, count: u32) -> Vec<u8> {
        self.with_device(host, dev, |d| d.read_range(lba, count))
    }

    pub fn irq_latched(&self, host: usize) -> i32 {
        self.inner.lock().unwrap().intr_latch[host]
    }

    fn with_device<R>(&self, host: usize, dev: usize, f: impl FnOnce(&mut SimDevice) -> R) -> R {
        let mut sim = self.inner.lock().unwrap();
        let device = sim.channels[host].devices[dev]
            .as_mut()
            .expect("no simulated device in slot");
        f(device)
    }
}

pub struct ChannelProxy<'a> {
    sim: &'a SimPlatform,
    host: usize,
}

impl ChannelProxy<'_> {
    pub fn force_status(&self, status: u8) {
        let mut sim = self.sim.inner.lock().unwrap();
        sim.channels[self.host].forced_status = Some(status);
    }
}

/// (host, register) for a task-file port; register 8 is the
/// control/alt-status port.
const REG_CTRL: u16 = 8;

fn route(port: u16) -> Option<(usize, u16)> {
    match port {
        0x1F0..=0x1F7 => Some((0, port - 0x1F0)),
        0x3F6 => Some((0, REG_CTRL)),
        0x170..=0x177 => Some((1, port - 0x170)),
        0x376 => Some((1, REG_CTRL)),
        _ => None,
    }
}

fn route_bm(port: u16) -> Option<(usize, u16)> {
    if (BM_BASE..BM_BASE + 16).contains(&port) {
        let offset = port - BM_BASE;
        Some(((offset / 8) as usize, offset % 8))
    } else {
        None
    }
}

impl Sim {
    fn log(&mut self, write: bool, port: u16, value: u32) {
        self.port_log.push(PortOp {
            write,
            port,
            value,
            thread: std::thread::current().id(),
        });
    }

    fn raise_irq(&mut self, host: usize) {
        if !self.channels[host].nien {
            self.intr_latch[host] += 1;
        }
    }

    fn read8(&mut self, port: u16) -> u8 {
        if let Some((host, reg)) = route(port) {
            let ch = &mut self.channels[host];
            return match reg {
                2 => match &ch.devices[ch.selected] {
                    Some(_) => ch.irr,
                    None => FLOATING,
                },
                4 | 5 => match &ch.devices[ch.selected] {
                    Some(dev) if dev.atapi => {
                        if reg == 4 {
                            0x14
                        } else {
                            0xEB
                        }
                    }
                    Some(_) => 0,
                    None => FLOATING,
                },
                7 => {
                    // Reading the status register acknowledges an
                    // overlapped bus release: DRQ shows once, then the
                    // device idles until SERVICE.
                    let status = ch.status();
                    if ch.release_pending {
                        ch.release_pending = false;
                        if let Some(dev) = ch.device() {
                            dev.status = STA_RDY;
                        }
                    }
                    status
                }
                REG_CTRL => ch.status(),
                _ => 0,
            };
        }
        if let Some((host, reg)) = route_bm(port) {
            let ch = &self.channels[host];
            return match reg {
                0 => ch.bm_command,
                2 => ch.bm_status,
                _ => 0,
            };
        }
        0
    }

    fn write8(&mut self, port: u16, value: u8) {
        if let Some((host, reg)) = route(port) {
            match reg {
                1 => self.channels[host].features = value,
                2 => self.channels[host].nsect = value,
                3 => self.channels[host].lbal = value,
                4 => self.channels[host].lbam = value,
                5 => self.channels[host].lbah = value,
                6 => {
                    let ch = &mut self.channels[host];
                    ch.devhead = value;
                    ch.selected = usize::from(value >> 4 & 1);
                }
                7 => self.command(host, value),
                REG_CTRL => {
                    if value & CTL_SRST != 0 {
                        self.channels[host].reset();
                    }
                    self.channels[host].nien = value & CTL_NIEN != 0;
                }
                _ => {}
            }
            return;
        }
        if let Some((host, reg)) = route_bm(port) {
            match reg {
                0 => self.bm_command(host, value),
                2 => {
                    let ch = &mut self.channels[host];
                    ch.bm_status &= !(value & 0x06);
                }
                _ => {}
            }
        }
    }

    fn read16(&mut self, port: u16) -> u16 {
        if let Some((host, 0)) = route(port) {
            let ch = &mut self.channels[host];
            let lo = ch.fifo_in.pop_front().unwrap_or(0xFF);
            let hi = ch.fifo_in.pop_front().unwrap_or(0xFF);
            if ch.fifo_in.is_empty() {
                if let Some(dev) = ch.device() {
                    dev.status &= !STA_DRQ;
                }
            }
            return u16::from_le_bytes([lo, hi]);
        }
        u16::from(self.read8(port))
    }

    fn write16(&mut self, port: u16, value: u16) {
        if let Some((host, 0)) = route(port) {
            let bytes = value.to_le_bytes();
            let ch = &mut self.channels[host];
            if ch.expect_out > 0 {
                ch.fifo_out.extend_from_slice(&bytes);
                if ch.fifo_out.len() >= ch.expect_out {
                    self.finish_out(host);
                }
            }
            return;
        }
        self.write8(port, value as u8);
    }

    fn command(&mut self, host: usize, opcode: u8) {
        let ch = &mut self.channels[host];
        let lba = ch.lba28();
        let count = ch.count();
        let features = ch.features;
        let nsect = ch.nsect;
        let head = ch.devhead & 0xF;
        let selected = ch.selected;

        // Split the borrow so the device and the channel FIFOs can be
        // touched together.
        let SimChannel {
            devices,
            irr,
            fifo_in,
            fifo_out,
            expect_out,
            out_kind,
            pending_dma,
            service_pending,
            ..
        } = ch;
        let Some(dev) = devices[selected].as_mut() else {
            return;
        };
        dev.commands.push(opcode);

        match opcode {
            0xEC | 0xA1 => {
                *fifo_in = dev.identify();
                dev.status = STA_RDY | STA_DRQ;
            }
            0xEF => {
                dev.features_log.push((features, nsect));
                dev.status = STA_RDY;
            }
            0x91 => {
                dev.init_params = Some((head, nsect));
                dev.status = STA_RDY;
            }
            0xE1 | 0x08 => {
                dev.status = STA_RDY;
            }
            0x20 => {
                *fifo_in = dev.read_range(lba, count).into_iter().collect();
                dev.status = STA_RDY | STA_DRQ;
            }
            0x30 => {
                dev.status = STA_RDY | STA_DRQ;
                *expect_out = count as usize * 512;
                fifo_out.clear();
                *out_kind = Some(OutKind::AtaWrite { lba });
            }
            0xC8 => {
                *pending_dma = Some(PendingDma::ToHost(dev.read_range(lba, count)));
                dev.status = STA_RDY;
            }
            0xCA => {
                dev.status = STA_RDY;
                *pending_dma = Some(PendingDma::FromHost { lba });
            }
            0xA0 => {
                dev.status = STA_RDY | STA_DRQ;
                *irr = IRR_CD;
                *expect_out = 12;
                fifo_out.clear();
                *out_kind = Some(OutKind::Cdb { features });
            }
            0xA2 => match service_pending.take() {
                Some(Service::Pio(data)) => {
                    dev.status = STA_RDY | STA_DRQ;
                    *fifo_in = data.into_iter().collect();
                }
                Some(Service::Dma(op)) => {
                    dev.status = STA_RDY | STA_DRQ;
                    *pending_dma = Some(op);
                }
                None => {
                    dev.status = STA_RDY | STA_ERR;
                }
            },
            _ => {
                dev.status = STA_RDY | STA_ERR;
            }
        }
    }

    fn finish_out(&mut self, host: usize) {
        let ch = &mut self.channels[host];
        let bytes = core::mem::take(&mut ch.fifo_out);
        ch.expect_out = 0;
        match ch.out_kind.take() {
            Some(OutKind::AtaWrite { lba }) | Some(OutKind::AtapiWrite { lba }) => {
                if let Some(dev) = ch.device() {
                    dev.write_range(lba, &bytes);
                    dev.status = STA_RDY;
                }
            }
            Some(OutKind::Cdb { features }) => {
                let mut cdb = [0u8; 12];
                cdb.copy_from_slice(&bytes[..12]);
                self.execute_cdb(host, features, cdb);
            }
            None => {}
        }
    }

    fn execute_cdb(&mut self, host: usize, features: u8, cdb: [u8; 12]) {
        let dma = features & 0x01 != 0;
        let ovl = features & 0x02 != 0;

        let ch = &mut self.channels[host];
        let selected = ch.selected;
        let SimChannel {
            devices,
            fifo_out,
            expect_out,
            out_kind,
            pending_dma,
            ..
        } = ch;
        let Some(dev) = devices[selected].as_mut() else {
            return;
        };

        match cdb[0] {
            // TEST UNIT READY
            0x00 => {
                dev.status = if dev.sense_queue.is_empty() {
                    STA_RDY
                } else {
                    STA_RDY | STA_ERR
                };
            }
            // REQUEST SENSE
            0x03 => {
                let (key, asc, ascq) = dev.sense_queue.pop_front().unwrap_or((0, 0, 0));
                let mut data = vec![0u8; 14];
                data[0] = 0x70;
                data[2] = key;
                data[7] = 6;
                data[12] = asc;
                data[13] = ascq;
                self.respond(host, data, dma, ovl);
            }
            // READ CAPACITY
            0x25 => {
                let last_lba = dev.total_sectors.wrapping_sub(1);
                let block_len = dev.sector_size;
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&last_lba.to_be_bytes());
                data.extend_from_slice(&block_len.to_be_bytes());
                self.respond(host, data, dma, ovl);
            }
            // START STOP UNIT
            0x1B => {
                dev.start_stop.push(cdb[4]);
                dev.status = STA_RDY;
            }
            // READ(10)
            0x28 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let count = u32::from(cdb[7]) << 8 | u32::from(cdb[8]);
                let data = dev.read_range(lba, count);
                self.respond(host, data, dma, ovl);
            }
            // WRITE(10)
            0x2A => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let count = u32::from(cdb[7]) << 8 | u32::from(cdb[8]);
                dev.status = STA_RDY | STA_DRQ;
                if dma {
                    *pending_dma = Some(PendingDma::FromHost { lba });
                } else {
                    *expect_out = (count * dev.sector_size) as usize;
                    fifo_out.clear();
                    *out_kind = Some(OutKind::AtapiWrite { lba });
                }
            }
            _ => {
                dev.status = STA_RDY | STA_ERR;
            }
        }
    }

    /// Hand a device-to-host response to the driver by the channel the
    /// features byte selected.
    fn respond(&mut self, host: usize, data: Vec<u8>, dma: bool, ovl: bool) {
        let ch = &mut self.channels[host];
        if let Some(dev) = ch.device() {
            dev.status = STA_RDY | STA_DRQ;
        }
        if ovl {
            // Release the bus; data is deferred until SERVICE. The
            // polled path sees the release via the status register,
            // the interrupt path gets a bus-release interrupt on top
            // of the service interrupt.
            ch.service_pending = Some(if dma {
                Service::Dma(PendingDma::ToHost(data))
            } else {
                Service::Pio(data)
            });
            ch.release_pending = true;
            self.raise_irq(host);
            if dma {
                self.raise_irq(host);
            }
        } else if dma {
            ch.pending_dma = Some(PendingDma::ToHost(data));
        } else {
            ch.fifo_in = data.into_iter().collect();
        }
    }

    fn bm_command(&mut self, host: usize, value: u8) {
        self.channels[host].bm_command = value;
        if value & 0x01 == 0 {
            return;
        }

        let completes = {
            let ch = &mut self.channels[host];
            match ch.device() {
                Some(dev) => dev.dma_completes,
                None => false,
            }
        };
        if !completes {
            return;
        }

        let Some(op) = self.channels[host].pending_dma.take() else {
            return;
        };

        let prdt = self.channels[host].bm_prdt;
        let prd_ptr = self.resolve(prdt) as *const Prd;
        // The descriptor the driver pinned; read it back the way the
        // engine would.
        let prd = unsafe { core::ptr::read(prd_ptr) };
        self.prd_log[host].push((prd.phys_addr, prd.byte_count));

        let bytes = (prd.byte_count & !PRD_EOT) as usize;
        let buffer = self.resolve(prd.phys_addr) as *mut u8;

        match op {
            PendingDma::ToHost(data) => {
                let n = bytes.min(data.len());
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buffer, n) };
            }
            PendingDma::FromHost { lba } => {
                let mut data = vec![0u8; bytes];
                unsafe { core::ptr::copy_nonoverlapping(buffer as *const u8, data.as_mut_ptr(), bytes) };
                let ch = &mut self.channels[host];
                if let Some(dev) = ch.device() {
                    dev.write_range(lba, &data);
                }
            }
        }

        let ch = &mut self.channels[host];
        ch.bm_status |= 0x04;
        if let Some(dev) = ch.device() {
            dev.status = STA_RDY;
        }
        self.raise_irq(host);
    }

    fn resolve(&self, token: u32) -> usize {
        self.phys_map[token as usize - 1]
    }
}

impl Platform for SimPlatform {
    fn inb(&self, port: u16) -> u8 {
        let mut sim = self.inner.lock().unwrap();
        let value = sim.read8(port);
        sim.log(false, port, u32::from(value));
        value
    }

    fn outb(&self, port: u16, value: u8) {
        let mut sim = self.inner.lock().unwrap();
        sim.log(true, port, u32::from(value));
        sim.write8(port, value);
    }

    fn inw(&self, port: u16) -> u16 {
        let mut sim = self.inner.lock().unwrap();
        let value = sim.read16(port);
        sim.log(false, port, u32::from(value));
        value
    }

    fn outw(&self, port: u16, value: u16) {
        let mut sim = self.inner.lock().unwrap();
        sim.log(true, port, u32::from(value));
        sim.write16(port, value);
    }

    fn outl(&self, port: u16, value: u32) {
        let mut sim = self.inner.lock().unwrap();
        sim.log(true, port, value);
        if let Some((host, 4)) = route_bm(port) {
            sim.channels[host].bm_prdt = value;
        }
    }

    fn msleep(&self, ms: u64) {
        let mut sim = self.inner.lock().unwrap();
        sim.clock_ms += ms;
        sim.events.push(Event::Sleep(ms));
    }

    fn usleep(&self, _us: u64) {
        let mut sim = self.inner.lock().unwrap();
        sim.clock_ms += 1;
    }

    fn ticks_ms(&self) -> u64 {
        let mut sim = self.inner.lock().unwrap();
        let now = sim.clock_ms;
        sim.clock_ms += 1;
        now
    }

    fn irq_mask(&self, irq: u8) {
        self.inner.lock().unwrap().events.push(Event::IrqMask(irq));
    }

    fn irq_unmask(&self, irq: u8) {
        self.inner
            .lock()
            .unwrap()
            .events
            .push(Event::IrqUnmask(irq));
    }

    fn irq_assign_current_cpu(&self, irq: u8) {
        self.inner.lock().unwrap().events.push(Event::IrqSteer(irq));
    }

    fn pci_find_class(&self, class_code: u32) -> Option<PciSlot> {
        let sim = self.inner.lock().unwrap();
        match &sim.pci {
            Some(pci) if class_code == 0x0101 => Some(pci.slot),
            _ => None,
        }
    }

    fn pci_read_config(&self, _slot: PciSlot, offset: u8) -> u32 {
        let sim = self.inner.lock().unwrap();
        let Some(pci) = sim.pci.as_ref() else {
            return 0;
        };
        match offset {
            0x00 => pci.vendor_device,
            0x04 => u32::from(pci.command),
            0x20 => BM_BAR,
            _ => pci.config.get(&offset).copied().unwrap_or(0),
        }
    }

    fn pci_write_config(&self, _slot: PciSlot, offset: u8, value: u32) {
        let mut sim = self.inner.lock().unwrap();
        if let Some(pci) = sim.pci.as_mut() {
            pci.writes.push((offset, value));
            match offset {
                0x04 => pci.command = value as u16,
                _ => {
                    pci.config.insert(offset, value);
                }
            }
        }
    }

    fn pci_write_config16(&self, _slot: PciSlot, offset: u8, value: u16) {
        let mut sim = self.inner.lock().unwrap();
        if let Some(pci) = sim.pci.as_mut() {
            pci.writes.push((offset, u32::from(value)));
            if offset == 0x04 {
                pci.command = value;
            }
        }
    }

    fn queue_wait(&self, host: usize) {
        self.queues[host].acquire();
    }

    fn queue_release(&self, host: usize) {
        self.queues[host].release();
    }

    fn intr_wait(&self, host: usize, timeout_ms: u64) -> bool {
        let mut sim = self.inner.lock().unwrap();
        if sim.intr_latch[host] > 0 {
            sim.intr_latch[host] -= 1;
            true
        } else {
            // Nothing will arrive while we hold the bus model; burn
            // the whole budget.
            sim.clock_ms += timeout_ms;
            false
        }
    }

    fn intr_wake(&self, host: usize) {
        self.inner.lock().unwrap().intr_latch[host] += 1;
    }

    fn phys_addr(&self, ptr: *const u8) -> u32 {
        let mut sim = self.inner.lock().unwrap();
        sim.phys_map.push(ptr as usize);
        sim.phys_map.len() as u32
    }
}
