use std::sync::atomic::{AtomicU8, Ordering};

const UNSET: u8 = 0;

/// How a request or stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Succeeded = 1,
    Failed = 2,
    Canceled = 3,
}

impl Outcome {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Outcome::Succeeded),
            2 => Some(Outcome::Failed),
            3 => Some(Outcome::Canceled),
            _ => None,
        }
    }
}

/// Write-once terminal outcome. The first claim wins.
#[derive(Debug, Default)]
pub(crate) struct TerminalSlot {
    value: AtomicU8,
}

impl TerminalSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call set the slot.
    pub(crate) fn claim(&self, outcome: Outcome) -> bool {
        self.value
            .compare_exchange(UNSET, outcome as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn get(&self) -> Option<Outcome> {
        Outcome::from_u8(self.value.load(Ordering::Acquire))
    }

    pub(crate) fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_claim_wins() {
        let slot = TerminalSlot::new();
        assert!(!slot.is_set());
        assert!(slot.claim(Outcome::Canceled));
        assert!(!slot.claim(Outcome::Succeeded));
        assert_eq!(slot.get(), Some(Outcome::Canceled));
    }

    #[test]
    fn test_racing_claims_have_one_winner() {
        for _ in 0..50 {
            let slot = Arc::new(TerminalSlot::new());
            let handles: Vec<_> = [Outcome::Succeeded, Outcome::Failed, Outcome::Canceled]
                .into_iter()
                .map(|outcome| {
                    let slot = Arc::clone(&slot);
                    thread::spawn(move || slot.claim(outcome))
                })
                .collect();
            let wins = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1);
        }
    }
}
