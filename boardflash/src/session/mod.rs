//! Per-device-class session: decides which component owns the serial port
//! and hands it over between them.
//!
//! ```text
//!            acquire_for_bootloader            acquire_for_monitor
//!   Idle ---------------------------> Bootloader -----------------> Monitor
//!    ^  <---------------------------       |     (release + reuse)     |
//!    |      release_from_bootloader        |                           |
//!    +-------------------------------------+---------------------------+
//!                                      release_from_monitor / shutdown
//! ```
//!
//! Raw uploads borrow the writable side from `Idle` (with an open port) or
//! alongside the monitor.

mod coordinator;
mod state;

pub use coordinator::{
    Coordinator, DEFAULT_RESET_HOLD, DEFAULT_UNLOCK_TIMEOUT, SessionConfig, StateListener,
};
pub use state::{Controls, SessionState};
