//! Contract for the board's status indication.
//!
//! The LED animation itself is presentation and lives with the board
//! support; the core only selects a state and keeps the animation ticking.

/// What the device is currently doing, as shown to the user.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedState {
    /// Waiting for a host.
    Idle,
    /// Waiting for a host, with the bootloader partition unlocked.
    IdleBootloader,
    /// A download is being written to flash.
    Download,
    /// The last operation failed; the host has been told.
    Error,
    /// About to detach and reboot.
    Sleep,
}

/// Driven by the core whenever the activity changes, and ticked from the
/// main loop *and* from within flash busy-wait loops.
///
/// Implementations must tolerate `tick` being called re-entrantly often
/// (every status poll during a multi-second erase) and rate-limit
/// internally.
pub trait StatusLeds {
    fn set_state(&mut self, state: LedState);
    fn tick(&mut self);
}

/// No-op indication for boards without LEDs.
#[derive(Debug, Default)]
pub struct NullLeds;

impl StatusLeds for NullLeds {
    fn set_state(&mut self, _state: LedState) {}
    fn tick(&mut self) {}
}
