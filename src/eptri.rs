//! Back-end for the "eptri" USB device controller: three independent
//! FIFO-backed engines (SETUP, IN, OUT) sharing one PHY.
//!
//! The back-end keeps one transfer slot per endpoint and direction. The
//! foreground posts transfers with [`Eptri::endpoint_xfer`]; the interrupt
//! handler ([`Eptri::isr`]) moves bytes between the FIFOs and the slots and
//! queues one [`UsbEvent`] per completed transfer for the upper stack to
//! drain. Foreground and ISR serialize on the controller's interrupt mask:
//! every foreground mutation of a slot happens with the USB interrupt
//! sources disabled.

use core::ptr;

/// Number of endpoints per direction.
pub const EP_COUNT: usize = 16;

/// Max packet size of every endpoint FIFO.
pub const EP_SIZE: u16 = 64;

/// Capacity of the event queue between ISR and foreground.
const EVENT_QUEUE: usize = 16;

/// Bus speed negotiated at reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Speed {
    Full,
    High,
}

/// Transfer direction, seen from the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Endpoint address: number in the low nibble, direction in bit 7.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EpAddr(u8);

impl EpAddr {
    pub const EP0_OUT: EpAddr = EpAddr(0x00);
    pub const EP0_IN: EpAddr = EpAddr(0x80);

    pub const fn new(number: u8, dir: Direction) -> Self {
        match dir {
            Direction::Out => EpAddr(number & 0x0F),
            Direction::In => EpAddr(number & 0x0F | 0x80),
        }
    }

    pub fn number(self) -> u8 {
        self.0 & 0x0F
    }

    pub fn direction(self) -> Direction {
        if self.0 & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer types, as declared in an endpoint descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Notifications queued by the ISR for the upper stack.
#[derive(Debug, Copy, Clone)]
pub enum UsbEvent {
    /// A bus reset occurred; all transfers were discarded.
    Reset(Speed),
    /// A complete 8-byte SETUP packet arrived.
    Setup([u8; 8]),
    /// The transfer posted on `ep` finished after `len` bytes.
    XferComplete { ep: EpAddr, len: u16 },
}

/// Register-level access to the controller, one method per CSR operation.
///
/// Event-pending registers are write-1-to-clear in hardware; the trait
/// exposes them as a `pending` probe plus a `clear` action.
pub trait UsbCtrl {
    /// Controls the bus pullup; disconnecting drops us off the bus.
    fn connect(&mut self, on: bool);
    /// Speed negotiated by the controller, valid after a bus reset.
    fn speed(&self) -> Speed;
    fn ctrl_pending(&self) -> bool;
    fn ctrl_clear_pending(&mut self);
    fn ctrl_ev_enable(&mut self, on: bool);

    /// Unmasks all four USB event sources at the interrupt controller.
    fn irq_enable(&mut self);
    /// Masks all four USB event sources. This is the only mutual-exclusion
    /// mechanism between foreground and ISR.
    fn irq_disable(&mut self);

    fn setup_reset(&mut self);
    fn setup_pending(&self) -> bool;
    fn setup_clear_pending(&mut self);
    fn setup_ev_enable(&mut self, on: bool);
    fn setup_have(&self) -> bool;
    fn setup_data(&mut self) -> u8;
    /// Writes the device address register.
    fn set_address(&mut self, addr: u8);

    fn in_reset(&mut self);
    fn in_pending(&self) -> bool;
    fn in_clear_pending(&mut self);
    fn in_ev_enable(&mut self, on: bool);
    /// Pushes one byte into the IN FIFO.
    fn in_data(&mut self, byte: u8);
    /// Writing the endpoint number queues the staged FIFO contents.
    fn in_epno(&mut self, ep: u8);
    fn in_stall(&mut self, on: bool);

    fn out_reset(&mut self);
    fn out_pending(&self) -> bool;
    fn out_clear_pending(&mut self);
    fn out_ev_enable(&mut self, on: bool);
    fn out_have(&self) -> bool;
    fn out_data(&mut self) -> u8;
    /// Endpoint number the hardware reports for the current OUT data.
    fn out_data_ep(&self) -> u8;
    /// Selects the endpoint the stall/enable gates apply to.
    fn out_epno(&mut self, ep: u8);
    fn out_stall(&mut self, on: bool);
    /// Per-transfer receive gate; must be re-armed after every drain.
    fn out_enable(&mut self, on: bool);
    fn out_prime(&mut self);
}

/// Non-null marker for a zero-byte transfer, so the slot is not idle.
const ZLP_SENTINEL: *mut u8 = usize::MAX as *mut u8;

/// One posted transfer. `buf` is caller-owned storage that must stay valid
/// until the completion event is delivered; a null `buf` means the slot is
/// idle.
#[derive(Debug, Copy, Clone)]
struct Slot {
    buf: *mut u8,
    offset: u16,
    max: u16,
}

impl Slot {
    const IDLE: Slot = Slot {
        buf: ptr::null_mut(),
        offset: 0,
        max: 0,
    };

    fn idle(&self) -> bool {
        self.buf.is_null()
    }
}

/// Round-robin cursor over the IN endpoint slots.
#[derive(Debug)]
struct TxScheduler {
    current: u8,
    active: bool,
}

impl TxScheduler {
    /// Moves the cursor to the next armed slot, scanning the ring exactly
    /// once. Returns whether any armed slot is selected afterwards (staying
    /// put counts when the current slot is still armed).
    fn advance(&mut self, slots: &[Slot; EP_COUNT]) -> bool {
        let prev = self.current;
        let mut ep = (prev + 1) & 0x0F;
        while ep != prev {
            if !slots[ep as usize].idle() {
                self.current = ep;
                return true;
            }
            ep = (ep + 1) & 0x0F;
        }
        !slots[prev as usize].idle()
    }
}

/// Fixed-capacity ring between ISR (producer) and foreground (consumer).
#[derive(Debug)]
struct EventQueue {
    slots: [UsbEvent; EVENT_QUEUE],
    head: usize,
    len: usize,
}

impl EventQueue {
    const fn new() -> Self {
        Self {
            slots: [UsbEvent::Reset(Speed::Full); EVENT_QUEUE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, ev: UsbEvent) {
        if self.len == EVENT_QUEUE {
            // The upper stack has stopped draining; dropping the event is
            // the least-bad option, the host will retry.
            debug_assert!(false, "usb event queue overflow");
            return;
        }
        self.slots[(self.head + self.len) % EVENT_QUEUE] = ev;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<UsbEvent> {
        if self.len == 0 {
            return None;
        }
        let ev = self.slots[self.head];
        self.head = (self.head + 1) % EVENT_QUEUE;
        self.len -= 1;
        Some(ev)
    }
}

/// Device-controller back-end state: both slot tables, the IN scheduler
/// and the event queue.
#[derive(Debug)]
pub struct Eptri<C: UsbCtrl> {
    ctrl: C,
    rx: [Slot; EP_COUNT],
    tx: [Slot; EP_COUNT],
    sched: TxScheduler,
    reset_count: u8,
    events: EventQueue,
}

impl<C: UsbCtrl> Eptri<C> {
    pub fn new(ctrl: C) -> Self {
        Self {
            ctrl,
            rx: [Slot::IDLE; EP_COUNT],
            tx: [Slot::IDLE; EP_COUNT],
            sched: TxScheduler {
                current: 0,
                active: false,
            },
            reset_count: 0,
            events: EventQueue::new(),
        }
    }

    /// Brings the controller up and makes the device visible on the bus:
    /// pullup dropped, engines reset, slots cleared, all event sources
    /// enabled, pullup re-asserted.
    pub fn init(&mut self) {
        self.ctrl.connect(false);

        self.ctrl.setup_reset();
        self.ctrl.in_reset();
        self.ctrl.out_reset();

        self.rx = [Slot::IDLE; EP_COUNT];
        self.tx = [Slot::IDLE; EP_COUNT];
        self.sched.current = 0;
        self.sched.active = false;
        self.reset_count = 0;

        self.ctrl.ctrl_clear_pending();
        self.ctrl.setup_clear_pending();
        self.ctrl.in_clear_pending();
        self.ctrl.out_clear_pending();
        self.ctrl.ctrl_ev_enable(true);
        self.ctrl.setup_ev_enable(true);
        self.ctrl.in_ev_enable(true);
        self.ctrl.out_ev_enable(true);

        self.ctrl.connect(true);
    }

    /// Unmasks the USB interrupt sources.
    pub fn int_enable(&mut self) {
        self.ctrl.irq_enable();
    }

    /// Masks the USB interrupt sources.
    pub fn int_disable(&mut self) {
        self.ctrl.irq_disable();
    }

    /// Drops the bus pullup, disconnecting from the host.
    pub fn disconnect(&mut self) {
        self.ctrl.connect(false);
    }

    /// Number of bus resets seen since `init`. Wrapping; only ever
    /// incremented by the ISR.
    pub fn reset_count(&self) -> u8 {
        self.reset_count
    }

    /// Next queued event, or `None`. Safe to call with interrupts live;
    /// the queue is locked against the ISR while popping.
    pub fn next_event(&mut self) -> Option<UsbEvent> {
        self.ctrl.irq_disable();
        let ev = self.events.pop();
        self.ctrl.irq_enable();
        ev
    }

    /// Performs the ACK status IN transfer for SET_ADDRESS and only then
    /// writes the address register, blocking until the status packet has
    /// left the FIFO.
    pub fn set_address(&mut self, addr: u8) {
        unsafe {
            self.endpoint_xfer(EpAddr::EP0_IN, ptr::null_mut(), 0);
        }
        while self.sched.active {
            self.relax();
        }
        self.ctrl.set_address(addr);
    }

    /// Prepares an endpoint for use. Isochronous endpoints are not
    /// supported by the controller and are rejected.
    pub fn endpoint_open(&mut self, ep: EpAddr, ttype: TransferType) -> bool {
        if ttype == TransferType::Isochronous {
            return false;
        }
        match ep.direction() {
            Direction::Out => self.rx[ep.number() as usize] = Slot::IDLE,
            Direction::In => self.tx[ep.number() as usize] = Slot::IDLE,
        }
        true
    }

    pub fn endpoint_stall(&mut self, ep: EpAddr) {
        match ep.direction() {
            Direction::Out => {
                let enable = !self.rx[ep.number() as usize].idle();
                self.ctrl.out_epno(ep.number());
                self.ctrl.out_stall(true);
                self.ctrl.out_enable(enable);
            }
            Direction::In => {
                // The stall is applied by the epno write and implicitly
                // cleared when data is next committed.
                self.ctrl.in_stall(true);
                self.ctrl.in_epno(ep.number());
            }
        }
    }

    pub fn endpoint_clear_stall(&mut self, ep: EpAddr) {
        if ep.direction() == Direction::Out {
            let enable = !self.rx[ep.number() as usize].idle();
            self.ctrl.out_epno(ep.number());
            self.ctrl.out_stall(false);
            self.ctrl.out_enable(enable);
        }
        // IN endpoints unstall when more data is written.
    }

    /// Posts a transfer of `total_bytes` through `buffer`.
    ///
    /// Blocks while a previous posting on the same endpoint is still
    /// draining. If a bus reset lands during that wait the posting is
    /// abandoned and the call still reports success; the upper stack will
    /// re-drive whatever transfer it needs after the reset event.
    ///
    /// A null `buffer` with `total_bytes == 0` posts a zero-length packet.
    ///
    /// # Safety
    ///
    /// `buffer` must point to `total_bytes` bytes that stay valid and
    /// untouched by the caller until the completion event for this
    /// endpoint is delivered (the ISR reads or writes them).
    pub unsafe fn endpoint_xfer(&mut self, ep: EpAddr, buffer: *mut u8, total_bytes: u16) -> bool {
        let num = ep.number() as usize;

        // A zero-byte transfer still needs a non-idle slot.
        let buffer = if buffer.is_null() && total_bytes == 0 {
            ZLP_SENTINEL
        } else {
            buffer
        };
        debug_assert!(!buffer.is_null());

        let prev_reset = self.reset_count;

        match ep.direction() {
            Direction::In => {
                while !self.tx[num].idle() {
                    self.relax();
                }

                self.ctrl.irq_disable();
                if prev_reset != self.reset_count {
                    self.ctrl.irq_enable();
                    return true;
                }

                self.tx[num] = Slot {
                    buf: buffer,
                    offset: 0,
                    max: total_bytes,
                };

                // If the transmit side is idle, claim it and stage the
                // first packet; otherwise the scheduler picks this slot up
                // after the in-flight transfer finishes.
                if !self.sched.active {
                    self.sched.current = num as u8;
                    self.sched.active = true;
                    self.tx_push();
                }
                self.ctrl.irq_enable();
            }
            Direction::Out => {
                while !self.rx[num].idle() {
                    self.relax();
                }

                self.ctrl.irq_disable();
                if prev_reset != self.reset_count {
                    self.ctrl.irq_enable();
                    return true;
                }

                self.rx[num] = Slot {
                    buf: buffer,
                    offset: 0,
                    max: total_bytes,
                };

                self.ctrl.out_epno(num as u8);
                self.ctrl.out_prime();
                self.ctrl.out_enable(true);
                self.ctrl.irq_enable();
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn ctrl_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// Interrupt entry point: services events until none are pending, in
    /// priority order reset > setup > in > out.
    pub fn isr(&mut self) {
        loop {
            if self.ctrl.ctrl_pending() {
                self.handle_reset();
            } else if self.ctrl.setup_pending() {
                self.handle_setup();
            } else if self.ctrl.in_pending() {
                self.handle_in();
            } else if self.ctrl.out_pending() {
                self.handle_out();
            } else {
                return;
            }
        }
    }

    /// One iteration of a foreground busy-wait. On hardware the ISR
    /// preempts the spin; under test it runs inline here.
    fn relax(&mut self) {
        #[cfg(test)]
        self.isr();
        #[cfg(not(test))]
        core::hint::spin_loop();
    }

    fn handle_reset(&mut self) {
        self.ctrl.ctrl_clear_pending();

        self.reset_count = self.reset_count.wrapping_add(1);
        self.ctrl.setup_ev_enable(false);
        self.ctrl.in_ev_enable(false);
        self.ctrl.out_ev_enable(false);

        self.ctrl.set_address(0);

        self.ctrl.setup_reset();
        self.ctrl.in_reset();
        self.ctrl.out_reset();

        self.rx = [Slot::IDLE; EP_COUNT];
        self.tx = [Slot::IDLE; EP_COUNT];
        self.sched.current = 0;
        self.sched.active = false;

        self.ctrl.ctrl_clear_pending();
        self.ctrl.setup_clear_pending();
        self.ctrl.in_clear_pending();
        self.ctrl.out_clear_pending();
        self.ctrl.setup_ev_enable(true);
        self.ctrl.in_ev_enable(true);
        self.ctrl.out_ev_enable(true);
        self.ctrl.ctrl_ev_enable(true);

        let speed = self.ctrl.speed();
        self.events.push(UsbEvent::Reset(speed));
    }

    fn handle_setup(&mut self) {
        let mut packet = [0; 8];
        let mut len = 0usize;

        while self.ctrl.setup_have() {
            let c = self.ctrl.setup_data();
            if len < packet.len() {
                packet[len] = c;
            }
            len += 1;
        }

        // Anything other than exactly 8 bytes was a receive error; drop it
        // and let the host retry.
        if len == 8 {
            self.events.push(UsbEvent::Setup(packet));
        }

        self.ctrl.setup_clear_pending();
    }

    fn handle_in(&mut self) {
        self.ctrl.in_clear_pending();

        let cur = self.sched.current as usize;

        // The armed buffer disappeared (bus reset teardown); look for other
        // work or go idle.
        if self.tx[cur].idle() {
            if self.sched.advance(&self.tx) {
                self.tx_push();
            } else {
                self.sched.active = false;
            }
            return;
        }

        if self.tx[cur].offset >= self.tx[cur].max {
            let len = self.tx[cur].max;
            self.tx[cur] = Slot::IDLE;

            if !self.sched.advance(&self.tx) {
                self.sched.active = false;
            }
            self.events.push(UsbEvent::XferComplete {
                ep: EpAddr::new(cur as u8, Direction::In),
                len,
            });
            if !self.sched.active {
                return;
            }
        }

        self.tx_push();
    }

    /// Stages up to one packet from the current IN slot and commits it.
    fn tx_push(&mut self) {
        let cur = self.sched.current as usize;
        let slot = &mut self.tx[cur];

        let mut added = 0;
        while added < EP_SIZE && slot.offset < slot.max {
            // Slot invariant: a non-sentinel buffer covers `max` bytes, and
            // the sentinel only ever pairs with max == 0.
            let byte = unsafe { slot.buf.add(slot.offset as usize).read() };
            self.ctrl.in_data(byte);
            slot.offset += 1;
            added += 1;
        }

        self.ctrl.in_epno(cur as u8);
    }

    fn handle_out(&mut self) {
        let num = (self.ctrl.out_data_ep() & 0x0F) as usize;
        let slot = &mut self.rx[num];

        // Drain the FIFO; bytes beyond the posted length are discarded.
        let mut total_read: u32 = 0;
        let mut cursor = slot.offset;
        while self.ctrl.out_have() {
            let c = self.ctrl.out_data();
            total_read += 1;
            if cursor < slot.max && slot.buf != ZLP_SENTINEL {
                unsafe { slot.buf.add(cursor as usize).write(c) };
                cursor += 1;
            }
        }

        let reached = u32::from(slot.offset) + total_read;
        slot.offset = core::cmp::min(reached, u32::from(slot.max)) as u16;

        // A transfer is over when the buffer filled, when a short packet
        // arrived, or when a ZLP terminated a run of full packets.
        let filled = slot.offset == slot.max;
        let zlp = total_read == 0 && slot.offset % EP_SIZE == 0;
        let short = slot.offset % EP_SIZE != 0 && total_read < 66;

        if filled || zlp || short {
            let len = slot.offset;
            *slot = Slot::IDLE;

            // Consumed everything; let the engine accept the next packet.
            self.ctrl.out_enable(true);

            self.events.push(UsbEvent::XferComplete {
                ep: EpAddr::new(num as u8, Direction::Out),
                len,
            });
        } else {
            self.ctrl.out_enable(true);
        }

        self.ctrl.out_clear_pending();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Register-visible side effects, in program order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        InCommit { ep: u8, len: usize },
        SetAddress(u8),
        Connect(bool),
    }

    /// Simulates the three FIFO engines well enough for the back-end's
    /// state machines: queued OUT/SETUP bytes, captured IN packets, and
    /// manually raised event-pending flags.
    #[derive(Debug, Default)]
    pub struct MockCtrl {
        pub ops: Vec<Op>,
        pub irq_enabled: bool,

        pub ctrl_pending: bool,
        pub speed: bool, // mirrors the speed CSR: set = full speed

        pub setup_pending: bool,
        pub setup_fifo: VecDeque<u8>,

        pub in_pending: bool,
        pub in_staged: Vec<u8>,
        pub in_packets: Vec<(u8, Vec<u8>)>,
        /// Complete each committed IN packet immediately, as a host that
        /// ACKs every packet would.
        pub in_auto_ack: bool,

        pub out_pending: bool,
        pub out_fifo: VecDeque<u8>,
        pub out_ep: u8,
        pub out_enabled: bool,

        pub in_stalled: bool,
        pub out_stalled: bool,
    }

    impl MockCtrl {
        pub fn new() -> Self {
            let mut this = Self::default();
            this.in_auto_ack = true;
            this
        }

        /// Makes an OUT packet available, as the host would.
        pub fn host_out(&mut self, ep: u8, data: &[u8]) {
            self.out_ep = ep;
            self.out_fifo.extend(data.iter().copied());
            self.out_pending = true;
        }

        pub fn host_setup(&mut self, data: &[u8]) {
            self.setup_fifo.extend(data.iter().copied());
            self.setup_pending = true;
        }
    }

    impl UsbCtrl for MockCtrl {
        fn connect(&mut self, on: bool) {
            self.ops.push(Op::Connect(on));
        }
        fn speed(&self) -> Speed {
            if self.speed {
                Speed::Full
            } else {
                Speed::High
            }
        }
        fn ctrl_pending(&self) -> bool {
            self.ctrl_pending
        }
        fn ctrl_clear_pending(&mut self) {
            self.ctrl_pending = false;
        }
        fn ctrl_ev_enable(&mut self, _on: bool) {}

        fn irq_enable(&mut self) {
            self.irq_enabled = true;
        }
        fn irq_disable(&mut self) {
            self.irq_enabled = false;
        }

        fn setup_reset(&mut self) {
            self.setup_fifo.clear();
        }
        fn setup_pending(&self) -> bool {
            self.setup_pending
        }
        fn setup_clear_pending(&mut self) {
            self.setup_pending = false;
        }
        fn setup_ev_enable(&mut self, _on: bool) {}
        fn setup_have(&self) -> bool {
            !self.setup_fifo.is_empty()
        }
        fn setup_data(&mut self) -> u8 {
            self.setup_fifo.pop_front().unwrap_or(0)
        }
        fn set_address(&mut self, addr: u8) {
            self.ops.push(Op::SetAddress(addr));
        }

        fn in_reset(&mut self) {
            self.in_staged.clear();
        }
        fn in_pending(&self) -> bool {
            self.in_pending
        }
        fn in_clear_pending(&mut self) {
            self.in_pending = false;
        }
        fn in_ev_enable(&mut self, _on: bool) {}
        fn in_data(&mut self, byte: u8) {
            self.in_staged.push(byte);
        }
        fn in_epno(&mut self, ep: u8) {
            let payload = core::mem::replace(&mut self.in_staged, Vec::new());
            self.ops.push(Op::InCommit {
                ep,
                len: payload.len(),
            });
            self.in_packets.push((ep, payload));
            if self.in_auto_ack {
                self.in_pending = true;
            }
        }
        fn in_stall(&mut self, on: bool) {
            self.in_stalled = on;
        }

        fn out_reset(&mut self) {
            self.out_fifo.clear();
        }
        fn out_pending(&self) -> bool {
            self.out_pending
        }
        fn out_clear_pending(&mut self) {
            self.out_pending = false;
        }
        fn out_ev_enable(&mut self, _on: bool) {}
        fn out_have(&self) -> bool {
            !self.out_fifo.is_empty()
        }
        fn out_data(&mut self) -> u8 {
            self.out_fifo.pop_front().unwrap_or(0)
        }
        fn out_data_ep(&self) -> u8 {
            self.out_ep
        }
        fn out_epno(&mut self, _ep: u8) {}
        fn out_stall(&mut self, on: bool) {
            self.out_stalled = on;
        }
        fn out_enable(&mut self, on: bool) {
            self.out_enabled = on;
        }
        fn out_prime(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockCtrl, Op};
    use super::*;

    fn backend() -> Eptri<MockCtrl> {
        let mut usb = Eptri::new(MockCtrl::new());
        usb.init();
        usb
    }

    fn drain(usb: &mut Eptri<MockCtrl>) -> Vec<UsbEvent> {
        let mut evs = Vec::new();
        while let Some(ev) = usb.next_event() {
            evs.push(ev);
        }
        evs
    }

    #[test]
    fn rejects_isochronous_endpoints() {
        let mut usb = backend();
        assert!(!usb.endpoint_open(EpAddr::new(1, Direction::In), TransferType::Isochronous));
        assert!(usb.endpoint_open(EpAddr::new(1, Direction::In), TransferType::Bulk));
    }

    #[test]
    fn setup_of_exactly_eight_bytes_is_delivered() {
        let mut usb = backend();
        usb.ctrl.host_setup(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]);
        usb.isr();

        match drain(&mut usb).as_slice() {
            [UsbEvent::Setup(pkt)] => assert_eq!(pkt[1], 0x06),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn truncated_setup_is_dropped() {
        let mut usb = backend();
        usb.ctrl.host_setup(&[0x80, 0x06, 0x00]);
        usb.isr();
        assert!(drain(&mut usb).is_empty());
        assert!(!usb.ctrl.setup_pending);
    }

    #[test]
    fn in_transfer_splits_into_max_packets() {
        let mut usb = backend();
        let mut buf = [0u8; 100];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }

        unsafe {
            usb.endpoint_xfer(EpAddr::new(2, Direction::In), buf.as_mut_ptr(), 100);
        }
        // First packet staged immediately, rest on IN-complete.
        usb.isr();

        let packets: Vec<usize> = usb.ctrl.in_packets.iter().map(|(_, p)| p.len()).collect();
        assert_eq!(packets, vec![64, 36]);
        assert_eq!(usb.ctrl.in_packets[1].1[0], 64);

        match drain(&mut usb).as_slice() {
            [UsbEvent::XferComplete { ep, len }] => {
                assert_eq!(*ep, EpAddr::new(2, Direction::In));
                assert_eq!(*len, 100);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn zero_length_in_posts_sentinel_packet() {
        let mut usb = backend();
        unsafe {
            usb.endpoint_xfer(EpAddr::EP0_IN, core::ptr::null_mut(), 0);
        }
        usb.isr();

        assert_eq!(usb.ctrl.in_packets, vec![(0, vec![])]);
        match drain(&mut usb).as_slice() {
            [UsbEvent::XferComplete { len: 0, .. }] => {}
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn round_robin_alternates_between_armed_endpoints() {
        let mut usb = backend();
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];

        let ep1 = EpAddr::new(1, Direction::In);
        let ep2 = EpAddr::new(2, Direction::In);

        usb.ctrl.in_auto_ack = false;
        unsafe {
            usb.endpoint_xfer(ep1, a.as_mut_ptr(), 64);
            usb.endpoint_xfer(ep2, b.as_mut_ptr(), 64);
        }

        let mut completions = Vec::new();
        for _ in 0..6 {
            usb.ctrl.in_pending = true;
            usb.isr();
            for ev in drain(&mut usb) {
                if let UsbEvent::XferComplete { ep, .. } = ev {
                    completions.push(ep.number());
                    // Keep both endpoints continuously armed.
                    unsafe {
                        if ep == ep1 {
                            usb.endpoint_xfer(ep1, a.as_mut_ptr(), 64);
                        } else {
                            usb.endpoint_xfer(ep2, b.as_mut_ptr(), 64);
                        }
                    }
                }
            }
        }

        assert_eq!(completions, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn out_transfer_completes_when_filled() {
        let mut usb = backend();
        let mut buf = [0u8; 128];

        unsafe {
            usb.endpoint_xfer(EpAddr::new(1, Direction::Out), buf.as_mut_ptr(), 128);
        }

        usb.ctrl.host_out(1, &[0x11; 64]);
        usb.isr();
        // A full packet on a packet boundary: more may follow.
        assert!(drain(&mut usb).is_empty());

        usb.ctrl.host_out(1, &[0x22; 64]);
        usb.isr();
        match drain(&mut usb).as_slice() {
            [UsbEvent::XferComplete { len: 128, .. }] => {}
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(buf[0], 0x11);
        assert_eq!(buf[64], 0x22);
    }

    #[test]
    fn out_transfer_completes_on_zlp() {
        let mut usb = backend();
        let mut buf = [0u8; 128];

        unsafe {
            usb.endpoint_xfer(EpAddr::new(1, Direction::Out), buf.as_mut_ptr(), 128);
        }

        usb.ctrl.host_out(1, &[0x33; 64]);
        usb.isr();
        assert!(drain(&mut usb).is_empty());

        // Zero-length packet closes the transfer early.
        usb.ctrl.host_out(1, &[]);
        usb.isr();
        match drain(&mut usb).as_slice() {
            [UsbEvent::XferComplete { len: 64, .. }] => {}
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn out_transfer_completes_on_short_packet() {
        let mut usb = backend();
        let mut buf = [0u8; 128];

        unsafe {
            usb.endpoint_xfer(EpAddr::new(1, Direction::Out), buf.as_mut_ptr(), 128);
        }

        usb.ctrl.host_out(1, &[0x44; 10]);
        usb.isr();
        match drain(&mut usb).as_slice() {
            [UsbEvent::XferComplete { len: 10, .. }] => {}
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn set_address_sends_status_before_address_write() {
        let mut usb = backend();
        usb.set_address(42);

        let commit = usb
            .ctrl
            .ops
            .iter()
            .position(|op| matches!(op, Op::InCommit { ep: 0, len: 0 }))
            .expect("no status packet");
        let addr = usb
            .ctrl
            .ops
            .iter()
            .position(|op| *op == Op::SetAddress(42))
            .expect("no address write");
        assert!(commit < addr);
    }

    #[test]
    fn bus_reset_tears_down_transfers() {
        let mut usb = backend();
        let mut buf = [0u8; 64];
        usb.ctrl.in_auto_ack = false;
        unsafe {
            usb.endpoint_xfer(EpAddr::new(3, Direction::In), buf.as_mut_ptr(), 64);
        }

        usb.ctrl.ctrl_pending = true;
        usb.ctrl.speed = true;
        usb.isr();

        assert_eq!(usb.reset_count(), 1);
        assert!(usb.tx.iter().all(Slot::idle));
        assert!(usb.ctrl.ops.contains(&Op::SetAddress(0)));
        match drain(&mut usb).as_slice() {
            [UsbEvent::Reset(Speed::Full)] => {}
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn xfer_aborts_when_reset_arrives_during_wait() {
        let mut usb = backend();
        let mut first = [0u8; 128];
        let mut second = [0u8; 64];
        let ep = EpAddr::new(1, Direction::In);

        // Park an unfinished transfer in the slot, then schedule a reset
        // that fires while the second post is waiting for it to drain.
        usb.ctrl.in_auto_ack = false;
        unsafe {
            usb.endpoint_xfer(ep, first.as_mut_ptr(), 128);
        }
        usb.ctrl.ctrl_pending = true;

        assert!(unsafe { usb.endpoint_xfer(ep, second.as_mut_ptr(), 64) });

        assert_eq!(usb.reset_count(), 1);
        // The abandoned post must not have claimed the slot.
        assert!(usb.tx[1].idle());
    }
}
