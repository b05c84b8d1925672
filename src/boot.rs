//! Cold-start policy: decide between serving DFU and handing control to
//! the user image, and manage the flash protection lifecycle around that
//! decision.
//!
//! Three inputs select bootloader service: the user button held at power
//! up, a zero scratch register left behind by a commanded reboot, and
//! magic words in flash security page 3. The magic comes in two flavors:
//! a one-shot word that is erased as soon as it is honored, and a sticky
//! word that survives until something else clears the page.

use crate::coordinator::FlashWriter;
use crate::dfu::DfuClass;
use crate::eptri::{Eptri, UsbCtrl};
use crate::flash::SpiFlash;
use crate::stack::UsbStack;
use crate::visual::StatusLeds;
use crate::SpiPhy;
use embedded_hal::blocking::delay::DelayMs;

/// Stay in the bootloader once, then clear the request.
pub const MAGIC_STAY_ONCE: u32 = 0x021B_3BCD;
/// Stay in the bootloader until the page is rewritten.
pub const MAGIC_STAY: u32 = 0xC4F8_6D8A;

/// Security page holding the boot magic.
const MAGIC_PAGE: u8 = 3;

/// DAC code for 1.8 V on the VCCIO rails.
const VCCIO_1V8: u16 = 45_000;

/// Holding the button this long while serving commands a reset back into
/// the bootloader.
pub const BUTTON_HOLD_RESET_MS: u32 = 5000;

/// Everything the boot policy needs from the SoC besides flash and USB.
pub trait Board: DelayMs<u32> {
    /// Scratch CSR; survives a soft reset, zeroed to request bootloader.
    fn scratch(&self) -> u32;
    fn set_scratch(&mut self, value: u32);

    /// Raw button register; bit 0 is active low.
    fn button_in(&self) -> u8;

    fn set_vccio(&mut self, channel: usize, code: u16);
    fn vccio_enable(&mut self);

    /// Asserts or releases the USB controller's reset line.
    fn usb_core_reset(&mut self, assert: bool);

    /// Maps the bootloader partition into the download window.
    fn enable_bootloader_mapping(&mut self);

    /// Global interrupt enable.
    fn irq_enable(&mut self, on: bool);

    /// Reboots the SoC through the control block. Execution does not
    /// continue past this on hardware.
    fn soft_reset(&mut self);

    fn now_ms(&self) -> u32;
}

/// What `startup` decided.
#[derive(Debug, Copy, Clone)]
pub struct Startup {
    /// Enter the DFU service loop instead of booting the user image.
    pub enter_dfu: bool,
    /// The bootloader partition itself is unlocked for writing.
    pub bootloader_upgrade: bool,
}

/// How the service loop ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Proceed to the user image via `reset_out`.
    UserImage,
    /// A commanded reset back into the bootloader was issued.
    BootloaderReset,
}

/// Cold-start sequence: power rails, USB controller reset, protection
/// lifecycle and the stay-in-bootloader decision.
pub fn startup<B: Board, P: SpiPhy>(board: &mut B, flash: &mut SpiFlash<P>) -> Startup {
    // The USB PHY needs its IO rail; the hardware wants all three
    // channels configured together.
    for ch in 0..3 {
        board.set_vccio(ch, VCCIO_1V8);
    }
    board.delay_ms(10);
    board.vccio_enable();

    board.usb_core_reset(true);
    board.delay_ms(20);
    board.usb_core_reset(false);
    board.delay_ms(20);

    flash.read_jedec_id();

    let mut bootloader_upgrade = false;
    if board.scratch() == 0 {
        // A soft reboot asked for a bootloader upgrade: expose the
        // bootloader partition and drop the array protection.
        board.enable_bootloader_mapping();
        bootloader_upgrade = true;
        flash.protection_write(false);
    } else if !flash.protection_read() {
        flash.protection_write(true);
    }

    let mut stay_in_bootloader = false;
    let mut page = [0; 256];
    flash.security_read(MAGIC_PAGE, &mut page);
    let word = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
    if word == MAGIC_STAY_ONCE {
        stay_in_bootloader = true;
        flash.security_erase(MAGIC_PAGE);
    } else if word == MAGIC_STAY {
        stay_in_bootloader = true;
    }

    Startup {
        enter_dfu: board.button_in() & 1 == 0 || stay_in_bootloader,
        bootloader_upgrade,
    }
}

/// The DFU service loop: USB stack task, LED task, button supervision and
/// the detach countdown. Returns when the device should stop serving.
pub fn run<B, C, P, L>(
    board: &mut B,
    usb: &mut Eptri<C>,
    stack: &mut UsbStack,
    dfu: &mut DfuClass<FlashWriter<P, L>>,
) -> Handoff
where
    B: Board,
    C: UsbCtrl,
    P: SpiPhy,
    L: StatusLeds,
{
    let mut button_since = board.now_ms();
    let mut countdown_ms = board.now_ms();

    loop {
        stack.task(usb, dfu);
        dfu.target_mut().leds_mut().tick();

        if board.button_in() == 0 {
            if board.now_ms().wrapping_sub(button_since) > BUTTON_HOLD_RESET_MS {
                // Commanded reset: come back up with the bootloader
                // partition unlocked.
                board.set_scratch(0);
                board.irq_enable(false);
                usb.disconnect();
                board.delay_ms(20);
                board.soft_reset();
                return Handoff::BootloaderReset;
            }
        } else {
            button_since = board.now_ms();
        }

        if dfu.target().detach_remaining() > 0 {
            let now = board.now_ms();
            if now != countdown_ms {
                countdown_ms = now;
                if dfu.target_mut().detach_decrement() == 0 {
                    return Handoff::UserImage;
                }
            }
        }
    }
}

/// Common exit path: interrupts off, bus released, protection restored.
/// The caller then asserts `reset_out` (or spins into the soft reset).
pub fn shutdown<B: Board, C: UsbCtrl, P: SpiPhy>(
    board: &mut B,
    usb: &mut Eptri<C>,
    flash: &mut SpiFlash<P>,
) {
    board.irq_enable(false);
    usb.disconnect();
    board.delay_ms(20);

    if !flash.protection_read() {
        flash.protection_write(true);
    }
}
