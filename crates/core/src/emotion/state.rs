use crate::emotion::EmotionClass;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Consistent copy of the shared emotion value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmotionSnapshot {
    pub current: EmotionClass,
    pub updated_at: Instant,
}

struct EmotionCell {
    value: Mutex<EmotionSnapshot>,
}

impl EmotionCell {
    fn lock(&self) -> MutexGuard<'_, EmotionSnapshot> {
        match self.value.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("emotion state lock was poisoned; recovering and continuing");
                poisoned.into_inner()
            }
        }
    }
}

/// Creates the shared emotion value, starting at `neutral`. The writer half is not
/// `Clone`, so only one component can ever publish.
pub fn emotion_cell() -> (EmotionWriter, EmotionReader) {
    let cell = Arc::new(EmotionCell {
        value: Mutex::new(EmotionSnapshot {
            current: EmotionClass::Neutral,
            updated_at: Instant::now(),
        }),
    });
    (
        EmotionWriter { cell: cell.clone() },
        EmotionReader { cell },
    )
}

pub struct EmotionWriter {
    cell: Arc<EmotionCell>,
}

impl EmotionWriter {
    /// Stores `class` if it differs from the current value. Returns whether a write
    /// happened.
    pub fn publish(&self, class: EmotionClass, now: Instant) -> bool {
        let mut guard = self.cell.lock();
        if guard.current == class {
            return false;
        }
        *guard = EmotionSnapshot {
            current: class,
            updated_at: now,
        };
        true
    }

    pub fn reader(&self) -> EmotionReader {
        EmotionReader {
            cell: self.cell.clone(),
        }
    }
}

#[derive(Clone)]
pub struct EmotionReader {
    cell: Arc<EmotionCell>,
}

impl EmotionReader {
    pub fn snapshot(&self) -> EmotionSnapshot {
        *self.cell.lock()
    }

    pub fn current(&self) -> EmotionClass {
        self.snapshot().current
    }
}
