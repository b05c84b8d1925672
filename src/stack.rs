//! Minimal class-agnostic USB device stack: a synchronous control-transfer
//! pipeline over the endpoint-zero slots of the [`eptri`](crate::eptri)
//! back-end, plus standard-request handling for a single-configuration
//! device.
//!
//! Class and vendor requests on the one interface are routed to a
//! [`ControlClass`]; everything this device serves beyond that is
//! descriptors.

use crate::descriptors::{
    self, DESC_CONFIGURATION, DESC_DEVICE, DESC_STRING, MSFT_OS_STRING_INDEX, STR_ALT_BASE,
    STR_MANUFACTURER, STR_PRODUCT, STR_SERIAL,
};
use crate::dfu::XFER_BUFSIZE;
use crate::eptri::{EpAddr, Eptri, TransferType, UsbCtrl, UsbEvent, EP_SIZE};
use core::ptr;

const GET_STATUS: u8 = 0;
const CLEAR_FEATURE: u8 = 1;
const SET_FEATURE: u8 = 3;
const SET_ADDRESS: u8 = 5;
const GET_DESCRIPTOR: u8 = 6;
const GET_CONFIGURATION: u8 = 8;
const SET_CONFIGURATION: u8 = 9;
const GET_INTERFACE: u8 = 10;
const SET_INTERFACE: u8 = 11;

const ENDPOINT_HALT: u16 = 0;

/// The 8-byte packet starting every control transfer.
#[derive(Debug, Copy, Clone)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Request kind from bits 6:5 — 0 standard, 1 class, 2 vendor.
    fn kind(&self) -> u8 {
        (self.request_type >> 5) & 0x03
    }

    fn recipient(&self) -> u8 {
        self.request_type & 0x1F
    }
}

/// A class implementation hanging off the device's single interface.
pub trait ControlClass {
    /// The host selected an alternate setting.
    fn set_alt(&mut self, alt: u8);

    fn alt(&self) -> u8;

    /// A bus reset tore the session down.
    fn bus_reset(&mut self);

    /// Handles a class request. `data` carries the OUT data stage if the
    /// request had one; an IN reply goes into `reply`. Returns the reply
    /// length, or `None` to stall.
    fn control_request(
        &mut self,
        setup: &SetupPacket,
        data: Option<&[u8]>,
        reply: &mut [u8],
    ) -> Option<usize>;

    /// Called once the reply or status stage of the last accepted request
    /// has been queued; long-running work belongs here.
    fn control_complete(&mut self);
}

/// Where a control transfer currently stands.
#[derive(Debug, Copy, Clone)]
enum Phase {
    Idle,
    /// Sending a data stage; an OUT ZLP status follows.
    DataIn,
    /// Waiting for the host's zero-length status packet.
    StatusOut,
    /// Receiving a data stage for this request.
    DataOut(SetupPacket),
    /// Our zero-length status packet is on its way out.
    StatusIn,
}

/// Which buffer an IN reply is served from.
#[derive(Debug, Copy, Clone)]
enum Source {
    Ctrl,
    Reply,
}

/// Strings and sizing the stack needs to describe the device.
#[derive(Debug)]
pub struct StackConfig {
    pub manufacturer: &'static str,
    pub product: &'static str,
    /// One name per alternate setting, same order as the partition table.
    pub alt_names: &'static [&'static str],
    pub xfer_size: u16,
}

/// Control-pipeline state. One of these per device, long-lived; the
/// endpoint-zero data buffer lives inside.
pub struct UsbStack {
    config: StackConfig,
    serial: [u8; descriptors::SERIAL_DESCRIPTOR_LEN],
    ctrl_buf: [u8; XFER_BUFSIZE as usize],
    reply_buf: [u8; 64],
    phase: Phase,
    configuration: u8,
}

impl core::fmt::Debug for UsbStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbStack")
            .field("phase", &self.phase)
            .field("configuration", &self.configuration)
            .finish()
    }
}

impl UsbStack {
    /// Builds the stack; `uuid` is the flash unique ID the serial-number
    /// string is derived from.
    pub fn new(config: StackConfig, uuid: &[u8; 8]) -> Self {
        assert!(!config.alt_names.is_empty());
        assert!(config.xfer_size <= XFER_BUFSIZE);
        Self {
            serial: descriptors::serial_descriptor(uuid),
            config,
            ctrl_buf: [0; XFER_BUFSIZE as usize],
            reply_buf: [0; 64],
            phase: Phase::Idle,
            configuration: 0,
        }
    }

    /// Foreground task: drains back-end events and advances whatever
    /// control transfer is in flight. Call from the main loop.
    pub fn task<C: UsbCtrl, K: ControlClass>(&mut self, usb: &mut Eptri<C>, class: &mut K) {
        while let Some(ev) = usb.next_event() {
            match ev {
                UsbEvent::Reset(speed) => {
                    trace!("bus reset, speed {:?}", speed);
                    usb.endpoint_open(EpAddr::EP0_OUT, TransferType::Control);
                    usb.endpoint_open(EpAddr::EP0_IN, TransferType::Control);
                    self.phase = Phase::Idle;
                    self.configuration = 0;
                    class.bus_reset();
                }
                UsbEvent::Setup(raw) => {
                    let setup = SetupPacket::parse(&raw);
                    self.handle_setup(usb, class, setup);
                }
                UsbEvent::XferComplete { ep, len } => {
                    self.handle_complete(usb, class, ep, len);
                }
            }
        }
    }

    fn handle_setup<C: UsbCtrl, K: ControlClass>(
        &mut self,
        usb: &mut Eptri<C>,
        class: &mut K,
        setup: SetupPacket,
    ) {
        // A fresh SETUP supersedes any transfer still in flight.
        self.phase = Phase::Idle;

        if !setup.is_device_to_host() && setup.length > 0 {
            if usize::from(setup.length) > self.ctrl_buf.len() {
                return self.stall(usb);
            }
            self.phase = Phase::DataOut(setup);
            unsafe {
                usb.endpoint_xfer(EpAddr::EP0_OUT, self.ctrl_buf.as_mut_ptr(), setup.length);
            }
            return;
        }

        self.dispatch(usb, class, setup, None);
        class.control_complete();
    }

    fn handle_complete<C: UsbCtrl, K: ControlClass>(
        &mut self,
        usb: &mut Eptri<C>,
        class: &mut K,
        ep: EpAddr,
        len: u16,
    ) {
        match self.phase {
            Phase::DataIn if ep == EpAddr::EP0_IN => {
                // Data stage done, expect the host's status ZLP.
                self.phase = Phase::StatusOut;
                unsafe {
                    usb.endpoint_xfer(EpAddr::EP0_OUT, ptr::null_mut(), 0);
                }
            }
            Phase::StatusOut if ep == EpAddr::EP0_OUT => self.phase = Phase::Idle,
            Phase::StatusIn if ep == EpAddr::EP0_IN => self.phase = Phase::Idle,
            Phase::DataOut(setup) if ep == EpAddr::EP0_OUT => {
                let len = usize::from(len.min(setup.length));
                self.phase = Phase::Idle;
                self.dispatch(usb, class, setup, Some(len));
                class.control_complete();
            }
            // Completions on other endpoints don't concern the pipeline.
            _ => {}
        }
    }

    /// Routes a request once all of it (including any OUT data) is here.
    fn dispatch<C: UsbCtrl, K: ControlClass>(
        &mut self,
        usb: &mut Eptri<C>,
        class: &mut K,
        setup: SetupPacket,
        data_len: Option<usize>,
    ) {
        match setup.kind() {
            0 => self.standard_request(usb, class, setup),
            1 => {
                let data = match data_len {
                    Some(n) => Some(&self.ctrl_buf[..n]),
                    None => None,
                };
                let reply = class.control_request(&setup, data, &mut self.reply_buf);
                match reply {
                    Some(n) if setup.is_device_to_host() && setup.length > 0 => {
                        self.send_in(usb, Source::Reply, n, setup.length)
                    }
                    Some(_) => self.send_status(usb),
                    None => self.stall(usb),
                }
            }
            2 => self.vendor_request(usb, setup),
            _ => self.stall(usb),
        }
    }

    fn standard_request<C: UsbCtrl, K: ControlClass>(
        &mut self,
        usb: &mut Eptri<C>,
        class: &mut K,
        setup: SetupPacket,
    ) {
        match setup.request {
            GET_DESCRIPTOR if setup.is_device_to_host() => {
                match self.build_descriptor(&setup) {
                    Some(len) => self.send_in(usb, Source::Ctrl, len, setup.length),
                    None => self.stall(usb),
                }
            }
            SET_ADDRESS => {
                // The back-end sends the status packet itself, before the
                // address register changes.
                self.phase = Phase::StatusIn;
                usb.set_address(setup.value as u8);
            }
            SET_CONFIGURATION => {
                self.configuration = setup.value as u8;
                self.send_status(usb);
            }
            GET_CONFIGURATION => {
                self.reply_buf[0] = self.configuration;
                self.send_in(usb, Source::Reply, 1, setup.length);
            }
            GET_STATUS => {
                self.reply_buf[0] = 0;
                self.reply_buf[1] = 0;
                self.send_in(usb, Source::Reply, 2, setup.length);
            }
            SET_INTERFACE => {
                if (setup.value as usize) < self.config.alt_names.len() {
                    class.set_alt(setup.value as u8);
                    self.send_status(usb);
                } else {
                    self.stall(usb);
                }
            }
            GET_INTERFACE => {
                self.reply_buf[0] = class.alt();
                self.send_in(usb, Source::Reply, 1, setup.length);
            }
            CLEAR_FEATURE | SET_FEATURE if setup.recipient() == 2 => {
                if setup.value == ENDPOINT_HALT {
                    let ep = EpAddr::new(
                        setup.index as u8 & 0x0F,
                        if setup.index & 0x80 != 0 {
                            crate::eptri::Direction::In
                        } else {
                            crate::eptri::Direction::Out
                        },
                    );
                    if setup.request == SET_FEATURE {
                        usb.endpoint_stall(ep);
                    } else {
                        usb.endpoint_clear_stall(ep);
                    }
                    self.send_status(usb);
                } else {
                    self.stall(usb);
                }
            }
            _ => self.stall(usb),
        }
    }

    fn vendor_request<C: UsbCtrl>(&mut self, usb: &mut Eptri<C>, setup: SetupPacket) {
        if setup.request == descriptors::MSFT_VENDOR_CODE && setup.index == 0x0004 {
            let wcid = &descriptors::MSFT_WCID;
            self.ctrl_buf[..wcid.len()].copy_from_slice(wcid);
            self.send_in(usb, Source::Ctrl, wcid.len(), setup.length);
        } else {
            self.stall(usb);
        }
    }

    /// Serializes the requested descriptor into `ctrl_buf`.
    fn build_descriptor(&mut self, setup: &SetupPacket) -> Option<usize> {
        let dtype = (setup.value >> 8) as u8;
        let index = setup.value as u8;

        match dtype {
            DESC_DEVICE => {
                let desc = descriptors::device_descriptor(EP_SIZE as u8);
                self.ctrl_buf[..desc.len()].copy_from_slice(&desc);
                Some(desc.len())
            }
            DESC_CONFIGURATION => Some(descriptors::write_configuration(
                &mut self.ctrl_buf,
                self.config.alt_names.len() as u8,
                self.config.xfer_size,
            )),
            DESC_STRING => self.build_string(index),
            _ => None,
        }
    }

    fn build_string(&mut self, index: u8) -> Option<usize> {
        match index {
            0 => {
                self.ctrl_buf[..4].copy_from_slice(&descriptors::LANGID_DESCRIPTOR);
                Some(4)
            }
            STR_MANUFACTURER => Some(descriptors::write_string(
                &mut self.ctrl_buf,
                self.config.manufacturer,
            )),
            STR_PRODUCT => Some(descriptors::write_string(
                &mut self.ctrl_buf,
                self.config.product,
            )),
            STR_SERIAL => {
                self.ctrl_buf[..self.serial.len()].copy_from_slice(&self.serial);
                Some(self.serial.len())
            }
            MSFT_OS_STRING_INDEX => {
                let desc = &descriptors::MSFT_OS_DESCRIPTOR;
                self.ctrl_buf[..desc.len()].copy_from_slice(desc);
                Some(desc.len())
            }
            i if (i >= STR_ALT_BASE)
                && usize::from(i - STR_ALT_BASE) < self.config.alt_names.len() =>
            {
                Some(descriptors::write_string(
                    &mut self.ctrl_buf,
                    self.config.alt_names[usize::from(i - STR_ALT_BASE)],
                ))
            }
            _ => None,
        }
    }

    fn send_in<C: UsbCtrl>(
        &mut self,
        usb: &mut Eptri<C>,
        source: Source,
        len: usize,
        requested: u16,
    ) {
        let len = len.min(usize::from(requested)) as u16;
        let ptr = match source {
            Source::Ctrl => self.ctrl_buf.as_mut_ptr(),
            Source::Reply => self.reply_buf.as_mut_ptr(),
        };
        self.phase = Phase::DataIn;
        unsafe {
            usb.endpoint_xfer(EpAddr::EP0_IN, ptr, len);
        }
    }

    fn send_status<C: UsbCtrl>(&mut self, usb: &mut Eptri<C>) {
        self.phase = Phase::StatusIn;
        unsafe {
            usb.endpoint_xfer(EpAddr::EP0_IN, ptr::null_mut(), 0);
        }
    }

    fn stall<C: UsbCtrl>(&mut self, usb: &mut Eptri<C>) {
        self.phase = Phase::Idle;
        usb.endpoint_stall(EpAddr::EP0_IN);
        usb.endpoint_stall(EpAddr::EP0_OUT);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::eptri::mock::MockCtrl;

    pub fn stack_config() -> StackConfig {
        StackConfig {
            manufacturer: "Good Stuff Department",
            product: "nor-boot (dfu)",
            alt_names: &[
                "main-gateware @0x200000",
                "main-firmware @0x800000",
                "extra @0xc00000",
                "bootloader @0x000000",
            ],
            xfer_size: XFER_BUFSIZE,
        }
    }

    /// Runs `isr` + `task` rounds until the pipeline settles.
    pub fn pump<K: ControlClass>(usb: &mut Eptri<MockCtrl>, stack: &mut UsbStack, class: &mut K) {
        for _ in 0..4 {
            usb.isr();
            stack.task(usb, class);
        }
    }

    /// Drives a full control-IN transfer and returns the concatenated
    /// data-stage payload.
    pub fn control_in<K: ControlClass>(
        usb: &mut Eptri<MockCtrl>,
        stack: &mut UsbStack,
        class: &mut K,
        setup: [u8; 8],
    ) -> Vec<u8> {
        usb.ctrl_mut().in_packets.clear();
        usb.ctrl_mut().host_setup(&setup);
        pump(usb, stack, class);

        let data: Vec<u8> = usb
            .ctrl_mut()
            .in_packets
            .iter()
            .flat_map(|(_, p)| p.iter().copied())
            .collect();

        // Status ZLP from the host side.
        usb.ctrl_mut().host_out(0, &[]);
        pump(usb, stack, class);
        data
    }

    /// Drives a control-OUT (or no-data) transfer.
    pub fn control_out<K: ControlClass>(
        usb: &mut Eptri<MockCtrl>,
        stack: &mut UsbStack,
        class: &mut K,
        setup: [u8; 8],
        data: &[u8],
    ) {
        usb.ctrl_mut().host_setup(&setup);
        pump(usb, stack, class);
        for chunk in data.chunks(usize::from(EP_SIZE)) {
            usb.ctrl_mut().host_out(0, chunk);
            pump(usb, stack, class);
        }
        pump(usb, stack, class);
    }

    pub fn get_descriptor(dtype: u8, index: u8, length: u16) -> [u8; 8] {
        [
            0x80,
            GET_DESCRIPTOR,
            index,
            dtype,
            0,
            0,
            length as u8,
            (length >> 8) as u8,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::eptri::mock::{MockCtrl, Op};

    /// Interface-less stand-in for the DFU class.
    struct NoClass {
        alt: u8,
    }

    impl ControlClass for NoClass {
        fn set_alt(&mut self, alt: u8) {
            self.alt = alt;
        }
        fn alt(&self) -> u8 {
            self.alt
        }
        fn bus_reset(&mut self) {}
        fn control_request(
            &mut self,
            _setup: &SetupPacket,
            _data: Option<&[u8]>,
            _reply: &mut [u8],
        ) -> Option<usize> {
            None
        }
        fn control_complete(&mut self) {}
    }

    fn fixture() -> (Eptri<MockCtrl>, UsbStack, NoClass) {
        let mut usb = Eptri::new(MockCtrl::new());
        usb.init();
        let stack = UsbStack::new(stack_config(), &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        (usb, stack, NoClass { alt: 0 })
    }

    #[test]
    fn serves_the_device_descriptor() {
        let (mut usb, mut stack, mut class) = fixture();
        let data = control_in(&mut usb, &mut stack, &mut class, get_descriptor(1, 0, 18));
        assert_eq!(data.len(), 18);
        assert_eq!(u16::from_le_bytes([data[8], data[9]]), 0x1209);
        assert_eq!(u16::from_le_bytes([data[10], data[11]]), 0x5AF0);
    }

    #[test]
    fn serves_the_serial_derived_from_the_uuid() {
        let (mut usb, mut stack, mut class) = fixture();
        let data = control_in(&mut usb, &mut stack, &mut class, get_descriptor(3, 3, 255));

        let utf16: Vec<u16> = data[2..]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(
            String::from_utf16(&utf16).unwrap(),
            "00-11-22-33-44-55-66-77"
        );
    }

    #[test]
    fn serves_the_microsoft_os_string_and_wcid() {
        let (mut usb, mut stack, mut class) = fixture();
        let data = control_in(&mut usb, &mut stack, &mut class, get_descriptor(3, 0xEE, 18));
        assert_eq!(data[0], 18);
        assert_eq!(&data[2..4], &[b'M', 0]);
        assert_eq!(data[16], b'~');

        // The vendor request named by that string returns the WCID blob.
        let data = control_in(
            &mut usb,
            &mut stack,
            &mut class,
            [0xC0, b'~', 0, 0, 0x04, 0x00, 40, 0],
        );
        assert_eq!(data.len(), 40);
        assert_eq!(&data[18..24], b"WINUSB");
    }

    #[test]
    fn truncates_descriptors_to_the_requested_length() {
        let (mut usb, mut stack, mut class) = fixture();
        let data = control_in(&mut usb, &mut stack, &mut class, get_descriptor(2, 0, 9));
        assert_eq!(data.len(), 9);
        // Full request returns the whole thing: 1 config + 4 interfaces +
        // functional descriptor.
        let data = control_in(&mut usb, &mut stack, &mut class, get_descriptor(2, 0, 256));
        assert_eq!(data.len(), 9 + 4 * 9 + 9);
    }

    #[test]
    fn set_address_orders_status_before_address() {
        let (mut usb, mut stack, mut class) = fixture();
        control_out(
            &mut usb,
            &mut stack,
            &mut class,
            [0x00, 5, 42, 0, 0, 0, 0, 0],
            &[],
        );

        let ops = &usb.ctrl_mut().ops;
        let commit = ops
            .iter()
            .position(|op| matches!(op, Op::InCommit { ep: 0, len: 0 }))
            .expect("no status packet");
        let addr = ops
            .iter()
            .position(|op| *op == Op::SetAddress(42))
            .expect("no address write");
        assert!(commit < addr);
    }

    #[test]
    fn set_interface_selects_the_alt_setting() {
        let (mut usb, mut stack, mut class) = fixture();
        control_out(
            &mut usb,
            &mut stack,
            &mut class,
            [0x01, SET_INTERFACE, 2, 0, 0, 0, 0, 0],
            &[],
        );
        assert_eq!(class.alt, 2);

        let data = control_in(
            &mut usb,
            &mut stack,
            &mut class,
            [0x81, GET_INTERFACE, 0, 0, 0, 0, 1, 0],
        );
        assert_eq!(data, vec![2]);
    }

    #[test]
    fn unknown_descriptor_stalls_endpoint_zero() {
        let (mut usb, mut stack, mut class) = fixture();
        usb.ctrl_mut().host_setup(&get_descriptor(0x42, 0, 8));
        pump(&mut usb, &mut stack, &mut class);
        assert!(usb.ctrl_mut().in_stalled);
    }
}
