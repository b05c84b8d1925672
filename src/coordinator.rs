//! Glue between the DFU class and the flash driver: maps `(alt, block)`
//! to partition addresses, enforces partition bounds, erases ahead of the
//! write pointer and keeps the status LEDs alive while the flash is busy.

use crate::dfu::{DfuState, DfuStatus, DfuTarget, XFER_BUFSIZE};
use crate::flash::{SpiFlash, PAGE_SIZE, SECTOR_SIZE};
use crate::visual::{LedState, StatusLeds};
use crate::SpiPhy;

/// One downloadable region of the flash array, selected by the DFU
/// alternate setting of the same index.
#[derive(Debug, Copy, Clone)]
pub struct Partition {
    pub base: u32,
    pub length: u32,
}

/// Milliseconds the main loop keeps running after DFU_DETACH before it
/// reboots into the freshly written image.
pub const DETACH_TIMEOUT_MS: u32 = 100;

/// Writes DFU download blocks into partitioned flash.
#[derive(Debug)]
pub struct FlashWriter<P: SpiPhy, L: StatusLeds> {
    flash: SpiFlash<P>,
    leds: L,
    partitions: &'static [Partition],
    detach_ms: u32,
}

impl<P: SpiPhy, L: StatusLeds> FlashWriter<P, L> {
    /// Builds a writer over `partitions`. The table must hold 64 KiB
    /// aligned, 64 KiB sized, non-overlapping entries.
    pub fn new(flash: SpiFlash<P>, leds: L, partitions: &'static [Partition]) -> Self {
        debug_assert!(!partitions.is_empty());
        for (i, p) in partitions.iter().enumerate() {
            debug_assert!(p.base % SECTOR_SIZE == 0);
            debug_assert!(p.length > 0 && p.length % SECTOR_SIZE == 0);
            for q in &partitions[i + 1..] {
                debug_assert!(p.base + p.length <= q.base || q.base + q.length <= p.base);
            }
        }
        debug_assert!(u32::from(XFER_BUFSIZE) % PAGE_SIZE as u32 == 0);
        debug_assert!(SECTOR_SIZE % u32::from(XFER_BUFSIZE) == 0);

        Self {
            flash,
            leds,
            partitions,
            detach_ms: 0,
        }
    }

    pub fn leds_mut(&mut self) -> &mut L {
        &mut self.leds
    }

    /// Remaining milliseconds of the detach countdown; zero when not
    /// armed.
    pub fn detach_remaining(&self) -> u32 {
        self.detach_ms
    }

    /// Burns one millisecond off the countdown, returning the remainder.
    pub fn detach_decrement(&mut self) -> u32 {
        self.detach_ms = self.detach_ms.saturating_sub(1);
        self.detach_ms
    }

    pub fn free(self) -> (SpiFlash<P>, L) {
        (self.flash, self.leds)
    }

    #[cfg(test)]
    pub(crate) fn flash_phy(&self) -> &P {
        self.flash.phy()
    }

    #[cfg(test)]
    pub(crate) fn leds_ref(&self) -> &L {
        &self.leds
    }
}

impl<P: SpiPhy, L: StatusLeds> DfuTarget for FlashWriter<P, L> {
    fn poll_timeout(&mut self, _alt: u8, state: DfuState) -> u32 {
        match state {
            // Programming happens synchronously right after the status
            // reply, so ask to be polled again at the minimum interval.
            DfuState::DnBusy => 1,
            _ => 0,
        }
    }

    fn download(&mut self, alt: u8, block_num: u16, data: &[u8]) -> DfuStatus {
        let Self {
            flash,
            leds,
            partitions,
            ..
        } = self;

        leds.set_state(LedState::Download);

        let part = match partitions.get(usize::from(alt)) {
            Some(p) => p,
            None => {
                leds.set_state(LedState::Error);
                return DfuStatus::ErrAddress;
            }
        };

        let offset = u32::from(block_num) * u32::from(XFER_BUFSIZE);
        if offset >= part.length {
            leds.set_state(LedState::Error);
            return DfuStatus::ErrAddress;
        }

        let mut address = part.base + offset;

        // First block of a 64 KiB erase unit: clear it before writing.
        if address % SECTOR_SIZE == 0 {
            flash.write_enable();
            flash.sector_erase(address);
            flash.wait_while_busy(|| leds.tick());
        }

        for chunk in data.chunks(PAGE_SIZE) {
            flash.write_enable();
            flash.page_program(address, chunk);
            flash.wait_while_busy(|| leds.tick());
            address += PAGE_SIZE as u32;
        }

        DfuStatus::Ok
    }

    fn manifest(&mut self, _alt: u8) -> DfuStatus {
        // The image went straight to flash; nothing is buffered, so
        // manifestation is complete as soon as it starts. A checksum over
        // the written partition would belong here.
        self.leds.set_state(LedState::Download);
        DfuStatus::Ok
    }

    fn abort(&mut self, _alt: u8) {
        self.leds.set_state(LedState::Error);
    }

    fn detach(&mut self) {
        self.leds.set_state(LedState::Sleep);
        self.detach_ms = DETACH_TIMEOUT_MS;
    }
}
