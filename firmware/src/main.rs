//! Firmware entry: boot decision, interrupt dispatch and the DFU service
//! loop, wired to the SoC through the `csr` module.

#![no_std]
#![no_main]

mod csr;
mod leds;

use csr::{BoardPort, FlashPort, UsbPort};
use dfu_boot::boot::{self, Handoff};
use dfu_boot::coordinator::{FlashWriter, Partition};
use dfu_boot::dfu::{DfuClass, XFER_BUFSIZE};
use dfu_boot::eptri::Eptri;
use dfu_boot::flash::SpiFlash;
use dfu_boot::stack::{StackConfig, UsbStack};
use leds::LedBank;
use panic_halt as _;
use riscv_rt::entry;

static PARTITIONS: [Partition; 4] = [
    Partition {
        base: 0x20_0000,
        length: 0x60_0000,
    }, // main gateware
    Partition {
        base: 0x80_0000,
        length: 0x40_0000,
    }, // main firmware
    Partition {
        base: 0xC0_0000,
        length: 0x40_0000,
    }, // extra
    Partition {
        base: 0x00_0000,
        length: 0x20_0000,
    }, // bootloader
];

static ALT_NAMES: [&str; 4] = [
    "main-gateware @0x200000",
    "main-firmware @0x800000",
    "extra @0xc00000",
    "bootloader @0x000000",
];

/// The device-controller back-end, shared with the interrupt handler.
/// The foreground serializes against the ISR through the controller's
/// interrupt mask; nothing else may touch this.
static mut USB: Option<Eptri<UsbPort>> = None;

#[export_name = "MachineExternal"]
fn machine_external() {
    let pending = csr::irq_pending() & csr::irq_get_mask();

    if pending & csr::USB_IRQ_MASK != 0 {
        if let Some(usb) = unsafe { (*core::ptr::addr_of_mut!(USB)).as_mut() } {
            usb.isr();
        }
    }

    if pending & (1 << csr::TIMER0_IRQ) != 0 {
        csr::timer_isr();
    }
}

#[entry]
fn main() -> ! {
    let mut board = BoardPort;
    let mut flash = SpiFlash::new(FlashPort);

    let decision = boot::startup(&mut board, &mut flash);
    let usb = unsafe { (*core::ptr::addr_of_mut!(USB)).get_or_insert(Eptri::new(UsbPort)) };

    if decision.enter_dfu {
        csr::timer_init();

        let uuid = flash.read_uuid();
        let mut stack = UsbStack::new(
            StackConfig {
                manufacturer: "Good Stuff Department",
                product: "nor-boot (dfu)",
                alt_names: &ALT_NAMES,
                xfer_size: XFER_BUFSIZE,
            },
            &uuid,
        );

        let leds = LedBank::new(board.led_bank(), decision.bootloader_upgrade);
        let mut dfu = DfuClass::new(FlashWriter::new(flash, leds, &PARTITIONS));

        usb.init();
        usb.int_enable();

        let handoff = boot::run(&mut board, usb, &mut stack, &mut dfu);

        let (mut flash, _leds) = dfu.free().free();
        boot::shutdown(&mut board, usb, &mut flash);

        if let Handoff::BootloaderReset = handoff {
            // The soft reset is already in flight.
            loop {
                riscv::asm::nop();
            }
        }
    } else {
        boot::shutdown(&mut board, usb, &mut flash);
    }

    // Hand over to the user bitstream.
    loop {
        board.reset_out();
    }
}
