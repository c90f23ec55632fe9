use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A cancellation signal polled by networks between layer executions.
///
/// Clones share the same flag, so a training loop running on another thread can hold one clone
/// and cancel the passes driven through the other.
#[derive(Debug, Clone, Default)]
pub struct CancelEvent {
    flag: Arc<AtomicBool>,
}

impl CancelEvent {
    /// Creates a new, unset `CancelEvent`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Lowers the signal again.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let event = CancelEvent::new();
        let other = event.clone();

        assert!(!other.is_cancelled());
        event.cancel();
        assert!(other.is_cancelled());
        other.reset();
        assert!(!event.is_cancelled());
    }
}
