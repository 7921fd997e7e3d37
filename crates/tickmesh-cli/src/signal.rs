//! Ctrl+C handling.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

/// Returns a flag set on SIGINT or SIGTERM. A second signal while the flag
/// is set exits the process.
#[cfg(unix)]
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&interrupted))?;
        flag::register(signal, Arc::clone(&interrupted))?;
    }
    Ok(interrupted)
}

/// Returns a flag set on Ctrl+C.
#[cfg(windows)]
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    use std::sync::atomic::Ordering;

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;
    Ok(interrupted)
}

#[cfg(not(any(unix, windows)))]
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    Ok(Arc::new(AtomicBool::new(false)))
}
