//! USB descriptor material: the device/configuration blobs, string
//! composition (including the serial number derived from the flash UUID)
//! and the Microsoft WCID descriptors that get WinUSB bound automatically.

/// <https://pid.codes>, assigned to this bootloader.
pub const VENDOR_ID: u16 = 0x1209;
pub const PRODUCT_ID: u16 = 0x5AF0;
pub const DEVICE_RELEASE: u16 = 0x0100;

/// Vendor request byte Windows uses to fetch the WCID descriptor.
pub const MSFT_VENDOR_CODE: u8 = b'~';

/// String descriptor index of the Microsoft OS string.
pub const MSFT_OS_STRING_INDEX: u8 = 0xEE;

pub const DESC_DEVICE: u8 = 1;
pub const DESC_CONFIGURATION: u8 = 2;
pub const DESC_STRING: u8 = 3;
pub const DESC_INTERFACE: u8 = 4;
pub const DESC_DFU_FUNCTIONAL: u8 = 0x21;

/// Fixed string indices; alternate-setting names follow from
/// [`STR_ALT_BASE`].
pub const STR_MANUFACTURER: u8 = 1;
pub const STR_PRODUCT: u8 = 2;
pub const STR_SERIAL: u8 = 3;
pub const STR_ALT_BASE: u8 = 4;

/// bmAttributes of the DFU functional descriptor: the device detaches by
/// itself, survives manifestation, and accepts downloads (no upload).
const DFU_ATTRIBUTES: u8 = 0x08 | 0x04 | 0x01;

/// wDetachTimeOut granted to the host.
const DETACH_TIMEOUT_MS: u16 = 1000;

const DFU_VERSION: u16 = 0x0110;

/// Application-specific class, DFU subclass, DFU-mode protocol.
const DFU_INTERFACE_CLASS: [u8; 3] = [0xFE, 0x01, 0x02];

/// Device descriptor. Class/subclass/protocol stay zero; the DFU class
/// sits on the interface.
pub fn device_descriptor(ep0_size: u8) -> [u8; 18] {
    [
        18,
        DESC_DEVICE,
        0x00,
        0x02, // bcdUSB 2.00
        0x00,
        0x00,
        0x00,
        ep0_size,
        VENDOR_ID as u8,
        (VENDOR_ID >> 8) as u8,
        PRODUCT_ID as u8,
        (PRODUCT_ID >> 8) as u8,
        DEVICE_RELEASE as u8,
        (DEVICE_RELEASE >> 8) as u8,
        STR_MANUFACTURER,
        STR_PRODUCT,
        STR_SERIAL,
        1, // bNumConfigurations
    ]
}

/// Serializes the one configuration: one DFU interface with `alt_count`
/// alternate settings (one per flash partition) and the DFU functional
/// descriptor. Returns the total length.
pub fn write_configuration(buf: &mut [u8], alt_count: u8, xfer_size: u16) -> usize {
    let total = 9 + 9 * usize::from(alt_count) + 9;
    assert!(buf.len() >= total);

    buf[..9].copy_from_slice(&[
        9,
        DESC_CONFIGURATION,
        total as u8,
        (total >> 8) as u8,
        1, // bNumInterfaces
        1, // bConfigurationValue
        0,
        0x80, // bus powered
        50,   // 100 mA
    ]);

    let mut off = 9;
    for alt in 0..alt_count {
        buf[off..off + 9].copy_from_slice(&[
            9,
            DESC_INTERFACE,
            0,
            alt,
            0, // no endpoints besides EP0
            DFU_INTERFACE_CLASS[0],
            DFU_INTERFACE_CLASS[1],
            DFU_INTERFACE_CLASS[2],
            STR_ALT_BASE + alt,
        ]);
        off += 9;
    }

    buf[off..off + 9].copy_from_slice(&[
        9,
        DESC_DFU_FUNCTIONAL,
        DFU_ATTRIBUTES,
        DETACH_TIMEOUT_MS as u8,
        (DETACH_TIMEOUT_MS >> 8) as u8,
        xfer_size as u8,
        (xfer_size >> 8) as u8,
        DFU_VERSION as u8,
        (DFU_VERSION >> 8) as u8,
    ]);

    total
}

/// String descriptor 0: we speak US English.
pub const LANGID_DESCRIPTOR: [u8; 4] = [4, DESC_STRING, 0x09, 0x04];

/// Encodes an ASCII string descriptor, capped at 31 characters.
pub fn write_string(buf: &mut [u8], s: &str) -> usize {
    let chars = s.len().min(31);
    let len = 2 + 2 * chars;
    buf[0] = len as u8;
    buf[1] = DESC_STRING;
    for (i, c) in s.bytes().take(chars).enumerate() {
        buf[2 + 2 * i] = c;
        buf[3 + 2 * i] = 0;
    }
    len
}

/// Length of the serial string descriptor: 8 bytes as hex pairs with a
/// dash between every pair, 23 UTF-16 code units plus the header.
pub const SERIAL_DESCRIPTOR_LEN: usize = 2 + 2 * 23;

/// Builds the serial-number string descriptor from the flash's unique ID:
/// 16 lowercase hex nibbles grouped as `xx-xx-xx-xx-xx-xx-xx-xx`.
pub fn serial_descriptor(uuid: &[u8; 8]) -> [u8; SERIAL_DESCRIPTOR_LEN] {
    fn hex(d: u8) -> u8 {
        if d <= 9 {
            d + b'0'
        } else {
            d - 10 + b'a'
        }
    }

    let mut desc = [0; SERIAL_DESCRIPTOR_LEN];
    desc[0] = SERIAL_DESCRIPTOR_LEN as u8;
    desc[1] = DESC_STRING;

    let mut off = 2;
    let mut push = |c: u8, off: &mut usize| {
        desc[*off] = c;
        *off += 2;
    };
    for (i, &b) in uuid.iter().enumerate() {
        if i != 0 {
            push(b'-', &mut off);
        }
        push(hex(b >> 4), &mut off);
        push(hex(b & 0xF), &mut off);
    }
    desc
}

/// Microsoft OS 1.0 string descriptor ("MSFT100" plus our vendor code),
/// served at string index 0xEE.
pub const MSFT_OS_DESCRIPTOR: [u8; 18] = [
    18,
    DESC_STRING,
    b'M',
    0,
    b'S',
    0,
    b'F',
    0,
    b'T',
    0,
    b'1',
    0,
    b'0',
    0,
    b'0',
    0,
    MSFT_VENDOR_CODE,
    0,
];

/// WCID compatible-ID feature descriptor: binds WinUSB to interface 0.
pub const MSFT_WCID: [u8; 40] = [
    40, 0, 0, 0, // length
    0x00, 0x01, // version 1.0
    0x04, 0x00, // compatibility ID descriptor index
    0x01, // one section
    0, 0, 0, 0, 0, 0, 0, // reserved
    0,    // interface number
    0x01, // reserved
    b'W', b'I', b'N', b'U', b'S', b'B', 0, 0, // compatible ID
    0, 0, 0, 0, 0, 0, 0, 0, // sub-compatible ID (unused)
    0, 0, 0, 0, 0, 0, // reserved
];
