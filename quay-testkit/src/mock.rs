use parking_lot::Mutex;
use quay::{WakeHint, WakeRecipient};

/// Wake recipient that records every hint it is offered.
#[derive(Debug, Default)]
pub struct RecordingRecipient {
    wakes: Mutex<Vec<Option<WakeHint>>>,
    accept: bool,
}

impl RecordingRecipient {
    pub fn new() -> Self {
        Self {
            wakes: Mutex::new(Vec::new()),
            accept: true,
        }
    }

    /// A recipient that records hints but never acts on them.
    pub fn refusing() -> Self {
        Self {
            accept: false,
            ..Self::default()
        }
    }

    pub fn wake_count(&self) -> usize {
        self.wakes.lock().len()
    }

    pub fn hints(&self) -> Vec<Option<WakeHint>> {
        self.wakes.lock().clone()
    }

    pub fn assert_woken_at_least(&self, expected: usize) {
        let count = self.wake_count();
        assert!(
            count >= expected,
            "Expected at least {expected} wake-ups, got {count}"
        );
    }
}

impl WakeRecipient for RecordingRecipient {
    fn wake(&self, hint: Option<&WakeHint>) -> bool {
        self.wakes.lock().push(hint.cloned());
        self.accept
    }
}
