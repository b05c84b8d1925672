//! Driver for the 25-series SPI NOR flash holding the device's bitstreams
//! and firmware images.
//!
//! The driver owns one [`SpiPhy`] master channel for the duration of every
//! call; nothing here is re-entrant. Erase and program commands only start
//! the operation inside the chip — callers poll the busy bit through
//! [`SpiFlash::wait_while_busy`] before issuing the next command.

use crate::utils::HexSlice;
use crate::{BusWidth, SpiPhy};
use bitflags::bitflags;

/// Size of one program page in bytes.
pub const PAGE_SIZE: usize = 256;

/// Size of the erase unit used by this driver (command 0xD8).
pub const SECTOR_SIZE: u32 = 64 * 1024;

/// Number of 256-byte security pages.
pub const SECURITY_PAGES: u8 = 4;

enum Opcode {
    /// Read the 16-bit manufacturer ID and 8-bit device ID.
    ReadJedecId = 0x9F,
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// Read status register 1.
    ReadStatus = 0x05,
    /// Read status register 2.
    ReadStatus2 = 0x35,
    /// Write status register 1. Not all bits are writeable.
    WriteStatus = 0x01,
    /// Write status register 2.
    WriteStatus2 = 0x31,
    Read = 0x03,
    /// Quad-input page program: address in single width, data on all four
    /// lanes.
    QuadPageProg = 0x32,
    /// Erase the 64 KiB block containing the address.
    BlockErase64 = 0xD8,
    /// Read the factory-programmed 64-bit unique ID (four dummy bytes
    /// between command and data).
    ReadUniqueId = 0x4B,
    ReadSecurity = 0x48,
    ProgramSecurity = 0x42,
    EraseSecurity = 0x44,
}

bitflags! {
    /// Status register 1 bits.
    pub struct Status: u8 {
        /// Erase or write in progress.
        const BUSY = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
        /// The 3 block-protect region bits.
        const BP = 0b0001_1100;
        /// Top/bottom protection select.
        const TB = 1 << 5;
        /// Sector/block protection granularity.
        const SEC = 1 << 6;
        /// **S**tatus **R**egister **P**rotect bit.
        const SRP = 1 << 7;
    }
}

bitflags! {
    /// Status register 2 bits.
    pub struct Status2: u8 {
        /// Status register lock.
        const SRL = 1 << 0;
        /// Quad enable.
        const QE = 1 << 1;
        /// Security page lock bits.
        const LB = 0b0011_1000;
        /// Complement protect: inverts the block-protect map.
        const CMP = 1 << 6;
        /// Erase/program suspend status.
        const SUS = 1 << 7;
    }
}

/// Status register 1 image that write-protects everything but the
/// bootloader region (BP bits plus top/bottom select).
const PROTECT_SR1: u8 = 0b0011_0000;
/// Bits of status register 1 that take part in the protection check (the
/// BUSY and WEL bits are transient and ignored).
const PROTECT_SR1_MASK: u8 = 0b1111_1100;
/// Status register 2 image for the locked state: quad enabled, CMP clear.
const PROTECT_SR2_LOCK: u8 = 0b0000_0010;
/// Status register 2 image for the unlocked state: setting CMP inverts an
/// all-clear protection map, leaving the whole array writable.
const PROTECT_SR2_UNLOCK: u8 = 0b0100_0010;
/// Bits of status register 2 that take part in the protection check.
const PROTECT_SR2_MASK: u8 = 0b0100_0011;

/// Driver for the external NOR flash.
///
/// # Type Parameters
///
/// * **`P`**: The SPI master channel the flash chip is attached to.
#[derive(Debug)]
pub struct SpiFlash<P: SpiPhy> {
    phy: P,
}

impl<P: SpiPhy> SpiFlash<P> {
    /// Creates a driver over `phy`.
    ///
    /// The PHY must already be clocked; no chip reset is performed.
    pub fn new(phy: P) -> Self {
        Self { phy }
    }

    /// Releases the underlying PHY.
    pub fn free(self) -> P {
        self.phy
    }

    #[cfg(test)]
    pub(crate) fn phy(&self) -> &P {
        &self.phy
    }

    #[cfg(test)]
    pub(crate) fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Runs `f` inside one chip-select bracket, starting in single width.
    fn transaction<R>(&mut self, f: impl FnOnce(&mut P) -> R) -> R {
        self.phy.configure(8, BusWidth::Single, 0x01);
        self.phy.set_cs(true);
        let r = f(&mut self.phy);
        self.phy.set_cs(false);
        r
    }

    /// Issues a command with no response data.
    fn command(&mut self, bytes: &[u8]) {
        self.transaction(|phy| {
            for &b in bytes {
                phy.exchange(b);
            }
        });
    }

    fn read_register(&mut self, opcode: Opcode) -> u8 {
        self.transaction(|phy| {
            phy.exchange(opcode as u8);
            phy.exchange(0)
        })
    }

    /// Reads status register 1.
    pub fn read_status(&mut self) -> Status {
        Status::from_bits_truncate(self.read_register(Opcode::ReadStatus))
    }

    /// Reads status register 2.
    pub fn read_status2(&mut self) -> Status2 {
        Status2::from_bits_truncate(self.read_register(Opcode::ReadStatus2))
    }

    /// Sets the write enable latch. Must precede every program or erase
    /// command; the chip clears it again when the operation finishes.
    pub fn write_enable(&mut self) {
        self.command(&[Opcode::WriteEnable as u8]);
    }

    /// Spins until the busy bit clears, running `tick` once per poll so
    /// the caller can keep foreground work (LED animation) alive during
    /// long erases.
    pub fn wait_while_busy(&mut self, mut tick: impl FnMut()) {
        while self.read_status().contains(Status::BUSY) {
            tick();
        }
    }

    /// Reads the JEDEC manufacturer and device bytes.
    pub fn read_jedec_id(&mut self) -> [u8; 3] {
        let mut id = [0; 3];
        self.transaction(|phy| {
            phy.exchange(Opcode::ReadJedecId as u8);
            for b in &mut id {
                *b = phy.exchange(0);
            }
        });
        info!("flash JEDEC id: {:?}", HexSlice(id));
        id
    }

    /// Reads flash contents into `buf`, starting at `addr`.
    ///
    /// Only the low 24 bits of `addr` reach the device.
    pub fn read(&mut self, addr: u32, buf: &mut [u8]) {
        self.transaction(|phy| {
            phy.exchange(Opcode::Read as u8);
            exchange_addr(phy, addr);
            for b in buf {
                *b = phy.exchange(0);
            }
        });
    }

    /// Starts erasing the 64 KiB block containing `addr`.
    ///
    /// The caller must have set the write enable latch and must poll
    /// [`wait_while_busy`](Self::wait_while_busy) before the next command.
    pub fn sector_erase(&mut self, addr: u32) {
        self.transaction(|phy| {
            phy.exchange(Opcode::BlockErase64 as u8);
            exchange_addr(phy, addr);
        });
    }

    /// Starts programming up to one page at `addr` using the quad-input
    /// page program command: opcode and address go out in single width,
    /// then the PHY switches to all four lanes for the data.
    ///
    /// `data` must fit the page containing `addr`; the caller polls the
    /// busy bit afterwards.
    pub fn page_program(&mut self, addr: u32, data: &[u8]) {
        debug_assert!(data.len() <= PAGE_SIZE);
        debug_assert!(addr as usize % PAGE_SIZE + data.len() <= PAGE_SIZE);

        self.phy.configure(8, BusWidth::Single, 0x01);
        self.phy.set_cs(true);

        self.phy.exchange(Opcode::QuadPageProg as u8);
        exchange_addr(&mut self.phy, addr);

        self.phy.configure(8, BusWidth::Quad, 0x0F);
        for &b in data {
            self.phy.exchange(b);
        }

        self.phy.set_cs(false);
    }

    /// Streams `data` to flash starting at `addr`, erasing each 64 KiB
    /// block the first time the write crosses into it and programming in
    /// page-sized chunks. `tick` keeps running during the busy polls.
    ///
    /// `addr` must be page aligned.
    pub fn write_stream(&mut self, addr: u32, data: &[u8], mut tick: impl FnMut()) {
        debug_assert!(addr as usize % PAGE_SIZE == 0);

        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            let current = addr + (i * PAGE_SIZE) as u32;

            if current % SECTOR_SIZE == 0 {
                self.write_enable();
                self.sector_erase(current);
                self.wait_while_busy(&mut tick);
            }

            self.write_enable();
            self.page_program(current, chunk);
            self.wait_while_busy(&mut tick);
        }
    }

    /// Reads the factory-programmed 64-bit unique device ID.
    pub fn read_uuid(&mut self) -> [u8; 8] {
        let mut uuid = [0; 8];
        self.transaction(|phy| {
            phy.exchange(Opcode::ReadUniqueId as u8);
            for _ in 0..4 {
                phy.exchange(0xFF);
            }
            for b in &mut uuid {
                *b = phy.exchange(0xFF);
            }
        });
        debug!("flash unique id: {:?}", HexSlice(uuid));
        uuid
    }

    /// Returns whether the array write protection is currently configured:
    /// the block-protect bits cover everything but the bootloader region
    /// and the complement bit is clear.
    pub fn protection_read(&mut self) -> bool {
        if self.read_status().bits() & PROTECT_SR1_MASK != PROTECT_SR1 {
            return false;
        }
        self.read_status2().bits() & PROTECT_SR2_MASK == PROTECT_SR2_LOCK
    }

    /// Rewrites both status registers to lock or unlock the array.
    pub fn protection_write(&mut self, lock: bool) {
        self.write_enable();
        self.command(&[Opcode::WriteStatus as u8, PROTECT_SR1]);

        self.write_enable();
        let sr2 = if lock {
            PROTECT_SR2_LOCK
        } else {
            PROTECT_SR2_UNLOCK
        };
        self.command(&[Opcode::WriteStatus2 as u8, sr2]);
    }

    /// Reads one 256-byte security page.
    pub fn security_read(&mut self, page: u8, buf: &mut [u8; 256]) {
        debug_assert!(page < SECURITY_PAGES);
        self.transaction(|phy| {
            phy.exchange(Opcode::ReadSecurity as u8);
            exchange_addr(phy, security_addr(page));
            // One dummy byte before data shifts out.
            phy.exchange(0);
            for b in buf.iter_mut() {
                *b = phy.exchange(0);
            }
        });
    }

    /// Programs one security page and waits for completion.
    pub fn security_write(&mut self, page: u8, buf: &[u8; 256]) {
        debug_assert!(page < SECURITY_PAGES);
        self.write_enable();
        self.transaction(|phy| {
            phy.exchange(Opcode::ProgramSecurity as u8);
            exchange_addr(phy, security_addr(page));
            for &b in buf.iter() {
                phy.exchange(b);
            }
        });
        self.wait_while_busy(|| ());
    }

    /// Erases one security page and waits for completion.
    pub fn security_erase(&mut self, page: u8) {
        debug_assert!(page < SECURITY_PAGES);
        self.write_enable();
        self.transaction(|phy| {
            phy.exchange(Opcode::EraseSecurity as u8);
            exchange_addr(phy, security_addr(page));
        });
        self.wait_while_busy(|| ());
    }
}

/// Shifts out a 24-bit address, big-endian.
fn exchange_addr<P: SpiPhy>(phy: &mut P, addr: u32) {
    phy.exchange((addr >> 16) as u8);
    phy.exchange((addr >> 8) as u8);
    phy.exchange(addr as u8);
}

/// Security pages sit at `page << 12` in the command's address field.
fn security_addr(page: u8) -> u32 {
    u32::from(page) << 12
}
