//! Ctrl-C handling: the first press cancels the running turn, the next exits.

use std::io;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use chat_provider::CancelSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// The cancel signal was raised; a running turn stops at its next check.
    Cancel,
    /// The signal was already raised and nobody cleared it.
    Exit,
}

/// Raises `cancel` and reports what the press means.
///
/// The engine clears the signal when a turn starts, so a second press only
/// exits when the first one has not been consumed by a new turn.
pub fn on_interrupt(cancel: &CancelSignal) -> InterruptAction {
    if cancel.swap(true, Ordering::SeqCst) {
        InterruptAction::Exit
    } else {
        InterruptAction::Cancel
    }
}

/// Keeps the signal listener alive; dropping it unregisters the handler.
pub struct InterruptGuard {
    #[cfg(unix)]
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(unix)]
pub fn install_interrupt_handler(cancel: CancelSignal) -> io::Result<InterruptGuard> {
    use signal_hook::consts::SIGINT;
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT])?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("tool-chat-interrupt".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                match on_interrupt(&cancel) {
                    InterruptAction::Cancel => {
                        tracing::info!("interrupt: cancelling current turn");
                        eprintln!("\n(interrupt: press Ctrl-C again to exit)");
                    }
                    InterruptAction::Exit => {
                        tracing::info!("interrupt: exiting");
                        eprintln!();
                        std::process::exit(130);
                    }
                }
            }
        })?;

    Ok(InterruptGuard {
        handle,
        thread: Some(thread),
    })
}

#[cfg(not(unix))]
pub fn install_interrupt_handler(_cancel: CancelSignal) -> io::Result<InterruptGuard> {
    Ok(InterruptGuard { thread: None })
}
