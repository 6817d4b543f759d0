//! User interruption as a value the dispatcher can wait on.

use crate::error::{PoolError, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::OnceLock;

/// Cloneable interrupt trigger.
///
/// Every clone shares one slot: the first [`trigger`](Interrupt::trigger)
/// fills it and the dispatcher waiting on [`receiver`](Interrupt::receiver)
/// wakes up. Further triggers before that are coalesced. A trigger only
/// counts for a running batch: `execute_pool` clears a pending one when it
/// starts.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Sender<()>,
    rx: Receiver<()>,
}

static CTRLC: OnceLock<Interrupt> = OnceLock::new();

impl Interrupt {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Interrupt wired to Ctrl+C (SIGINT) for the whole process.
    ///
    /// The handler is installed on first use; later calls return clones of
    /// the same interrupt.
    pub fn ctrlc() -> Result<Self> {
        if let Some(existing) = CTRLC.get() {
            return Ok(existing.clone());
        }

        let interrupt = Self::new();
        let handler = interrupt.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nReceived Ctrl+C, stopping workers...");
            handler.trigger();
        })
        .map_err(|e| PoolError::Config(format!("cannot install Ctrl+C handler: {}", e)))?;

        Ok(CTRLC.get_or_init(|| interrupt).clone())
    }

    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }

    /// Drop a pending trigger. Returns whether there was one.
    pub fn clear(&self) -> bool {
        let mut pending = false;
        while self.rx.try_recv().is_ok() {
            pending = true;
        }
        pending
    }

    /// Whether an interrupt is pending (without consuming it).
    pub fn is_triggered(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Channel to `select!` on; a message means "interrupted".
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_is_shared_by_clones() {
        let interrupt = Interrupt::new();
        let remote = interrupt.clone();
        assert!(!interrupt.is_triggered());

        remote.trigger();
        remote.trigger();
        assert!(interrupt.is_triggered());
        assert!(
            interrupt
                .receiver()
                .recv_timeout(Duration::from_millis(100))
                .is_ok()
        );
        assert!(!interrupt.is_triggered());
    }

    #[test]
    fn test_clear_drops_pending_trigger() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.clear());

        interrupt.clone().trigger();
        assert!(interrupt.clear());
        assert!(!interrupt.is_triggered());
        assert!(interrupt.receiver().try_recv().is_err());
    }
}
