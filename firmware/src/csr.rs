//! Register access for the SoC's CSR bus and the seam-trait
//! implementations over it.
//!
//! Addresses mirror the generated CSR map of the LiteX build: one
//! peripheral per 0x800 window, 32-bit registers on 4-byte strides.

use core::arch::asm;
use dfu_boot::eptri::{Speed, UsbCtrl};
use dfu_boot::{boot::Board, BusWidth, SpiPhy};
use embedded_hal::blocking::delay::DelayMs;

pub const CSR_BASE: usize = 0xf000_0000;

const CTRL_BASE: usize = CSR_BASE + 0x0000;
const BUTTON_BASE: usize = CSR_BASE + 0x0800;
const LEDS_BASE: usize = CSR_BASE + 0x1000;
const RESET_OUT_BASE: usize = CSR_BASE + 0x1800;
const BOOT_ALT_BASE: usize = CSR_BASE + 0x2000;
const VCCIO_BASE: usize = CSR_BASE + 0x2800;
const SPIFLASH_BASE: usize = CSR_BASE + 0x3000;
const TIMER0_BASE: usize = CSR_BASE + 0x3800;
const USB_CTRL_BASE: usize = CSR_BASE + 0x4000;
const USB_SETUP_BASE: usize = CSR_BASE + 0x4800;
const USB_IN_EP_BASE: usize = CSR_BASE + 0x5000;
const USB_OUT_EP_BASE: usize = CSR_BASE + 0x5800;

/// Interrupt numbers from the generated map.
pub const TIMER0_IRQ: u32 = 1;
pub const USB_CTRL_IRQ: u32 = 2;
pub const USB_SETUP_IRQ: u32 = 3;
pub const USB_IN_EP_IRQ: u32 = 4;
pub const USB_OUT_EP_IRQ: u32 = 5;

pub const USB_IRQ_MASK: u32 =
    1 << USB_CTRL_IRQ | 1 << USB_SETUP_IRQ | 1 << USB_IN_EP_IRQ | 1 << USB_OUT_EP_IRQ;

pub const CLOCK_HZ: u32 = 60_000_000;

#[derive(Debug, Copy, Clone)]
struct Reg(usize);

impl Reg {
    #[inline(always)]
    fn read(self) -> u32 {
        unsafe { (self.0 as *const u32).read_volatile() }
    }

    #[inline(always)]
    fn write(self, value: u32) {
        unsafe { (self.0 as *mut u32).write_volatile(value) }
    }
}

mod ctrl {
    use super::*;
    pub const RESET: Reg = Reg(CTRL_BASE);
    pub const SCRATCH: Reg = Reg(CTRL_BASE + 0x04);
}

mod timer0 {
    use super::*;
    pub const LOAD: Reg = Reg(TIMER0_BASE);
    pub const RELOAD: Reg = Reg(TIMER0_BASE + 0x04);
    pub const EN: Reg = Reg(TIMER0_BASE + 0x08);
    pub const UPDATE_VALUE: Reg = Reg(TIMER0_BASE + 0x0C);
    pub const VALUE: Reg = Reg(TIMER0_BASE + 0x10);
    pub const EV_PENDING: Reg = Reg(TIMER0_BASE + 0x18);
    pub const EV_ENABLE: Reg = Reg(TIMER0_BASE + 0x1C);
}

mod spiflash {
    use super::*;
    pub const CS: Reg = Reg(SPIFLASH_BASE);
    /// len[7:0] | width[11:8] | mask[19:12]
    pub const PHYCONFIG: Reg = Reg(SPIFLASH_BASE + 0x04);
    pub const RXTX: Reg = Reg(SPIFLASH_BASE + 0x08);
    /// tx_ready[0] | rx_ready[1]
    pub const STATUS: Reg = Reg(SPIFLASH_BASE + 0x0C);
}

mod usb {
    use super::*;
    pub const CONNECT: Reg = Reg(USB_CTRL_BASE);
    pub const SPEED: Reg = Reg(USB_CTRL_BASE + 0x04);
    pub const RESET: Reg = Reg(USB_CTRL_BASE + 0x08);
    pub const CTRL_EV_PENDING: Reg = Reg(USB_CTRL_BASE + 0x10);
    pub const CTRL_EV_ENABLE: Reg = Reg(USB_CTRL_BASE + 0x14);

    pub const SETUP_DATA: Reg = Reg(USB_SETUP_BASE);
    pub const SETUP_HAVE: Reg = Reg(USB_SETUP_BASE + 0x04);
    pub const SETUP_ADDRESS: Reg = Reg(USB_SETUP_BASE + 0x08);
    pub const SETUP_RESET: Reg = Reg(USB_SETUP_BASE + 0x0C);
    pub const SETUP_EV_PENDING: Reg = Reg(USB_SETUP_BASE + 0x10);
    pub const SETUP_EV_ENABLE: Reg = Reg(USB_SETUP_BASE + 0x14);

    pub const IN_DATA: Reg = Reg(USB_IN_EP_BASE);
    pub const IN_EPNO: Reg = Reg(USB_IN_EP_BASE + 0x04);
    pub const IN_STALL: Reg = Reg(USB_IN_EP_BASE + 0x08);
    pub const IN_RESET: Reg = Reg(USB_IN_EP_BASE + 0x0C);
    pub const IN_EV_PENDING: Reg = Reg(USB_IN_EP_BASE + 0x10);
    pub const IN_EV_ENABLE: Reg = Reg(USB_IN_EP_BASE + 0x14);

    pub const OUT_DATA: Reg = Reg(USB_OUT_EP_BASE);
    pub const OUT_DATA_EP: Reg = Reg(USB_OUT_EP_BASE + 0x04);
    pub const OUT_HAVE: Reg = Reg(USB_OUT_EP_BASE + 0x08);
    pub const OUT_EPNO: Reg = Reg(USB_OUT_EP_BASE + 0x0C);
    pub const OUT_ENABLE: Reg = Reg(USB_OUT_EP_BASE + 0x10);
    pub const OUT_PRIME: Reg = Reg(USB_OUT_EP_BASE + 0x14);
    pub const OUT_STALL: Reg = Reg(USB_OUT_EP_BASE + 0x18);
    pub const OUT_RESET: Reg = Reg(USB_OUT_EP_BASE + 0x1C);
    pub const OUT_EV_PENDING: Reg = Reg(USB_OUT_EP_BASE + 0x20);
    pub const OUT_EV_ENABLE: Reg = Reg(USB_OUT_EP_BASE + 0x24);
}

// VexRiscv exposes its external interrupt mask and pending lines as the
// custom CSRs 0xBC0 and 0xFC0.

pub fn irq_get_mask() -> u32 {
    let mask: u32;
    unsafe { asm!("csrr {0}, 0xBC0", out(reg) mask) };
    mask
}

pub fn irq_set_mask(mask: u32) {
    unsafe { asm!("csrw 0xBC0, {0}", in(reg) mask) };
}

pub fn irq_pending() -> u32 {
    let pending: u32;
    unsafe { asm!("csrr {0}, 0xFC0", out(reg) pending) };
    pending
}

pub fn irq_global(enable: bool) {
    unsafe {
        if enable {
            riscv::register::mstatus::set_mie();
            riscv::register::mie::set_mext();
        } else {
            riscv::register::mstatus::clear_mie();
        }
    }
}

/// Millisecond tick, written only by the timer interrupt.
static mut SYSTEM_TICKS: u32 = 0;

pub fn ticks() -> u32 {
    // 32-bit aligned read; tear-free on this core.
    unsafe { core::ptr::addr_of!(SYSTEM_TICKS).read_volatile() }
}

pub fn timer_isr() {
    timer0::EV_PENDING.write(timer0::EV_PENDING.read());
    unsafe {
        let ticks = core::ptr::addr_of_mut!(SYSTEM_TICKS);
        ticks.write_volatile(ticks.read_volatile().wrapping_add(1));
    }
}

/// Starts the millisecond tick and unmasks its interrupt.
pub fn timer_init() {
    timer0::RELOAD.write(CLOCK_HZ / 1000);
    timer0::EN.write(1);
    timer0::EV_ENABLE.write(1);

    irq_set_mask(irq_get_mask() | 1 << TIMER0_IRQ);
    irq_global(true);
}

/// The LiteSPI master channel wired to the NOR flash.
#[derive(Debug)]
pub struct FlashPort;

impl SpiPhy for FlashPort {
    fn configure(&mut self, bits: u8, width: BusWidth, mask: u8) {
        spiflash::PHYCONFIG
            .write(u32::from(bits) | (width as u32) << 8 | u32::from(mask) << 12);
    }

    fn set_cs(&mut self, asserted: bool) {
        spiflash::CS.write(asserted as u32);
    }

    fn exchange(&mut self, tx: u8) -> u8 {
        while spiflash::STATUS.read() & 1 == 0 {}
        spiflash::RXTX.write(u32::from(tx));
        while spiflash::STATUS.read() & 2 == 0 {}
        spiflash::RXTX.read() as u8
    }
}

/// The eptri device controller.
#[derive(Debug)]
pub struct UsbPort;

impl UsbCtrl for UsbPort {
    fn connect(&mut self, on: bool) {
        usb::CONNECT.write(on as u32);
    }

    fn speed(&self) -> Speed {
        if usb::SPEED.read() != 0 {
            Speed::Full
        } else {
            Speed::High
        }
    }

    fn ctrl_pending(&self) -> bool {
        usb::CTRL_EV_PENDING.read() != 0
    }

    fn ctrl_clear_pending(&mut self) {
        usb::CTRL_EV_PENDING.write(usb::CTRL_EV_PENDING.read());
    }

    fn ctrl_ev_enable(&mut self, on: bool) {
        usb::CTRL_EV_ENABLE.write(on as u32);
    }

    fn irq_enable(&mut self) {
        irq_set_mask(irq_get_mask() | USB_IRQ_MASK);
    }

    fn irq_disable(&mut self) {
        irq_set_mask(irq_get_mask() & !USB_IRQ_MASK);
    }

    fn setup_reset(&mut self) {
        usb::SETUP_RESET.write(1);
    }

    fn setup_pending(&self) -> bool {
        usb::SETUP_EV_PENDING.read() != 0
    }

    fn setup_clear_pending(&mut self) {
        usb::SETUP_EV_PENDING.write(usb::SETUP_EV_PENDING.read());
    }

    fn setup_ev_enable(&mut self, on: bool) {
        usb::SETUP_EV_ENABLE.write(on as u32);
    }

    fn setup_have(&self) -> bool {
        usb::SETUP_HAVE.read() != 0
    }

    fn setup_data(&mut self) -> u8 {
        usb::SETUP_DATA.read() as u8
    }

    fn set_address(&mut self, addr: u8) {
        usb::SETUP_ADDRESS.write(u32::from(addr));
    }

    fn in_reset(&mut self) {
        usb::IN_RESET.write(1);
    }

    fn in_pending(&self) -> bool {
        usb::IN_EV_PENDING.read() != 0
    }

    fn in_clear_pending(&mut self) {
        usb::IN_EV_PENDING.write(usb::IN_EV_PENDING.read());
    }

    fn in_ev_enable(&mut self, on: bool) {
        usb::IN_EV_ENABLE.write(on as u32);
    }

    fn in_data(&mut self, byte: u8) {
        usb::IN_DATA.write(u32::from(byte));
    }

    fn in_epno(&mut self, ep: u8) {
        usb::IN_EPNO.write(u32::from(ep & 0x0F));
    }

    fn in_stall(&mut self, on: bool) {
        usb::IN_STALL.write(on as u32);
    }

    fn out_reset(&mut self) {
        usb::OUT_RESET.write(1);
    }

    fn out_pending(&self) -> bool {
        usb::OUT_EV_PENDING.read() != 0
    }

    fn out_clear_pending(&mut self) {
        usb::OUT_EV_PENDING.write(usb::OUT_EV_PENDING.read());
    }

    fn out_ev_enable(&mut self, on: bool) {
        usb::OUT_EV_ENABLE.write(on as u32);
    }

    fn out_have(&self) -> bool {
        usb::OUT_HAVE.read() != 0
    }

    fn out_data(&mut self) -> u8 {
        usb::OUT_DATA.read() as u8
    }

    fn out_data_ep(&self) -> u8 {
        usb::OUT_DATA_EP.read() as u8
    }

    fn out_epno(&mut self, ep: u8) {
        usb::OUT_EPNO.write(u32::from(ep & 0x0F));
    }

    fn out_stall(&mut self, on: bool) {
        usb::OUT_STALL.write(on as u32);
    }

    fn out_enable(&mut self, on: bool) {
        usb::OUT_ENABLE.write(on as u32);
    }

    fn out_prime(&mut self) {
        usb::OUT_PRIME.write(1);
    }
}

/// Control, power and button plumbing.
#[derive(Debug)]
pub struct BoardPort;

impl BoardPort {
    /// Hands off to the user bitstream. The platform reboots on assert.
    pub fn reset_out(&mut self) {
        Reg(RESET_OUT_BASE).write(1);
    }

    pub fn led_bank(&self) -> usize {
        LEDS_BASE
    }
}

impl DelayMs<u32> for BoardPort {
    fn delay_ms(&mut self, ms: u32) {
        // One-shot countdown on timer0, like the pre-service sleep in the
        // C runtime; the periodic tick is reprogrammed by timer_init.
        timer0::EN.write(0);
        timer0::RELOAD.write(0);
        timer0::LOAD.write(CLOCK_HZ / 1000 * ms);
        timer0::EN.write(1);
        timer0::UPDATE_VALUE.write(1);
        while timer0::VALUE.read() != 0 {
            timer0::UPDATE_VALUE.write(1);
        }
    }
}

impl Board for BoardPort {
    fn scratch(&self) -> u32 {
        ctrl::SCRATCH.read()
    }

    fn set_scratch(&mut self, value: u32) {
        ctrl::SCRATCH.write(value);
    }

    fn button_in(&self) -> u8 {
        Reg(BUTTON_BASE).read() as u8
    }

    fn set_vccio(&mut self, channel: usize, code: u16) {
        Reg(VCCIO_BASE + 4 * channel).write(u32::from(code));
    }

    fn vccio_enable(&mut self) {
        Reg(VCCIO_BASE + 0x0C).write(1);
    }

    fn usb_core_reset(&mut self, assert: bool) {
        usb::RESET.write(assert as u32);
    }

    fn enable_bootloader_mapping(&mut self) {
        Reg(BOOT_ALT_BASE).write(1);
    }

    fn irq_enable(&mut self, on: bool) {
        irq_global(on);
    }

    fn soft_reset(&mut self) {
        ctrl::RESET.write(1);
    }

    fn now_ms(&self) -> u32 {
        ticks()
    }
}
