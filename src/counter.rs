//! A 128-bit monotonically increasing counter, little-endian on the wire.
//! Backs both `master_counter` (§3) and every `file.secret_counter` (§4.3).
//! Fetch-increment must be atomic across threads per spec.md §4.3; this
//! wraps the 128-bit state in a mutex rather than attempting lock-free CAS
//! on a non-native-width integer, the same trade the original made by
//! specializing `std::atomic<counter>` around an internal mutex.

use parking_lot::Mutex;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct CounterState(pub u128);

impl CounterState {
    pub const SIZE: usize = 16;

    pub fn from_le_bytes(bytes: &[u8; 16]) -> Self {
        CounterState(u128::from_le_bytes(*bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    fn increment(self) -> Self {
        CounterState(self.0.wrapping_add(1))
    }
}

/// An atomically fetch-incrementable 128-bit counter.
pub struct Counter {
    state: Mutex<CounterState>,
}

impl Counter {
    pub fn new(initial: CounterState) -> Self {
        Self { state: Mutex::new(initial) }
    }

    pub fn from_le_bytes(bytes: &[u8; 16]) -> Self {
        Self::new(CounterState::from_le_bytes(bytes))
    }

    /// Returns the current value then advances the counter by one.
    pub fn fetch_increment(&self) -> CounterState {
        let mut guard = self.state.lock();
        let current = *guard;
        *guard = guard.increment();
        current
    }

    pub fn current(&self) -> CounterState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_increment_advances_and_returns_previous() {
        let c = Counter::new(CounterState(41));
        assert_eq!(c.fetch_increment(), CounterState(41));
        assert_eq!(c.current(), CounterState(42));
    }

    #[test]
    fn le_byte_round_trip() {
        let state = CounterState(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let bytes = state.to_le_bytes();
        assert_eq!(CounterState::from_le_bytes(&bytes), state);
    }

    #[test]
    fn concurrent_increments_are_all_observed() {
        use std::sync::Arc;
        use std::thread;
        let counter = Arc::new(Counter::new(CounterState(0)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    c.fetch_increment();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.current(), CounterState(800));
    }
}
