//! Monotonic ULID generation for event ids.

use std::sync::Mutex;
use std::time::Duration;

/// Thread-safe monotonic ULID source. Ids generated within the same
/// millisecond still sort in generation order.
pub struct IdGenerator {
    inner: Mutex<ulid::Generator>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self { inner: Mutex::new(ulid::Generator::new()) }
    }

    /// 26-char Crockford-Base32 ULID.
    pub fn next(&self) -> String {
        let mut gen = self.inner.lock().unwrap();
        loop {
            match gen.generate() {
                Ok(u) => return u.to_string(),
                // Random component overflowed within one millisecond; wait
                // for the clock to tick.
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Liveness probe for the health endpoint.
    pub fn alive(&self) -> bool {
        self.next().len() == 26
    }
}
