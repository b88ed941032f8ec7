//! Startup synchronization between the orchestrator and the board threads.
//!
//! Each board thread owns a [`ReadyFlag`] that it sets once its board is
//! configured; the orchestrator waits on every flag in turn. A single
//! [`StartBarrier`] is then released so all boards begin reading together.
//! Both predicates are checked under the lock before waiting, so a thread
//! that arrives after the notification still sees it.

use crate::SourceError;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigState {
    Pending,
    Configured,
    Failed(SourceError),
}

#[derive(Debug)]
pub struct ReadyFlag {
    state: Mutex<ConfigState>,
    cond: Condvar,
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConfigState::Pending),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self, state: ConfigState) {
        let mut current = lock(&self.state);
        *current = state;
        self.cond.notify_all();
    }

    /// Record `state` unless the board already reported. Returns whether it
    /// was recorded.
    pub fn set_if_pending(&self, state: ConfigState) -> bool {
        let mut current = lock(&self.state);
        if *current != ConfigState::Pending {
            return false;
        }
        *current = state;
        self.cond.notify_all();
        true
    }

    /// Block until the board thread has reported success or failure.
    pub fn wait(&self) -> ConfigState {
        let mut state = lock(&self.state);
        while *state == ConfigState::Pending {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSignal {
    Started,
    Aborted,
}

#[derive(Debug, Default)]
pub struct StartBarrier {
    signal: Mutex<Option<StartSignal>>,
    cond: Condvar,
}

impl StartBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let every waiting board thread start acquiring. Returns `true` for
    /// the call that actually broadcast; later calls are no-ops.
    pub fn release(&self) -> bool {
        self.broadcast(StartSignal::Started)
    }

    /// Wake all waiters with [`StartSignal::Aborted`] if startup failed.
    pub fn abort(&self) -> bool {
        self.broadcast(StartSignal::Aborted)
    }

    pub fn wait(&self) -> StartSignal {
        let mut signal = lock(&self.signal);
        loop {
            if let Some(signal) = *signal {
                return signal;
            }
            signal = self.cond.wait(signal).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_released(&self) -> bool {
        *lock(&self.signal) == Some(StartSignal::Started)
    }

    fn broadcast(&self, value: StartSignal) -> bool {
        let mut signal = lock(&self.signal);
        if signal.is_some() {
            return false;
        }
        *signal = Some(value);
        self.cond.notify_all();
        true
    }
}

// The guarded values are plain flags that a panicking holder cannot leave
// half-written.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_late_waiter_sees_release() {
        let barrier = Arc::new(StartBarrier::new());
        assert!(barrier.release());

        // Waiters that start only after the broadcast must not block.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), StartSignal::Started);
        }
    }

    #[test]
    fn test_waiters_block_until_release() {
        let barrier = Arc::new(StartBarrier::new());
        let passed = Arc::new(AtomicBool::new(false));

        let handle = {
            let barrier = Arc::clone(&barrier);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                barrier.wait();
                passed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!passed.load(Ordering::SeqCst));
        assert!(!barrier.is_released());

        barrier.release();
        handle.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_set_if_pending_keeps_first_report() {
        let flag = ReadyFlag::new();
        assert!(flag.set_if_pending(ConfigState::Configured));
        assert!(!flag.set_if_pending(ConfigState::Failed(SourceError::Configuration(
            "late".into()
        ))));
        assert_eq!(flag.wait(), ConfigState::Configured);
    }

    #[test]
    fn test_single_broadcast() {
        let barrier = StartBarrier::new();
        assert!(barrier.release());
        assert!(!barrier.release());
        assert!(!barrier.abort());
        assert_eq!(barrier.wait(), StartSignal::Started);
    }

    #[test]
    fn test_abort() {
        let barrier = StartBarrier::new();
        assert!(barrier.abort());
        assert!(!barrier.is_released());
        assert_eq!(barrier.wait(), StartSignal::Aborted);
    }

    #[test]
    fn test_ready_flag() {
        let flag = Arc::new(ReadyFlag::new());
        let handle = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                flag.set(ConfigState::Configured);
            })
        };
        assert_eq!(flag.wait(), ConfigState::Configured);
        handle.join().unwrap();

        let failed = ReadyFlag::new();
        failed.set(ConfigState::Failed(SourceError::Configuration("bad".into())));
        assert!(matches!(failed.wait(), ConfigState::Failed(_)));
    }
}
