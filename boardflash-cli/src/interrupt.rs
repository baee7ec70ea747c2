//! Ctrl-C handling.
//!
//! The handler never kills the process: it raises a flag that command loops
//! poll, and cancels every token registered with [`cancel_on_interrupt`] so
//! a running upload stops at the next chunk boundary.

use boardflash::CancelToken;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static TOKENS: Mutex<Vec<CancelToken>> = Mutex::new(Vec::new());

/// Install the process-wide Ctrl-C handler.
pub(crate) fn install() {
    let result = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
        for token in TOKENS.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            token.cancel();
        }
    });
    match result {
        Ok(()) => debug!("Ctrl-C handler installed"),
        Err(e) => warn!("Could not install Ctrl-C handler: {e}"),
    }
}

/// Cancel `token` whenever Ctrl-C is pressed.
pub(crate) fn cancel_on_interrupt(token: CancelToken) {
    TOKENS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(token);
}

/// Whether Ctrl-C was pressed since the flag was last cleared.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Forget an earlier Ctrl-C.
pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}
