//! Binary set/clear events shared between playback threads.
//!
//! Used for the "audible progress" signal (writer → beat scheduler) and the
//! end-of-stream signal (writer → controller).

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake all waiters.
    pub fn set(&self) {
        let mut g = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        if !*g {
            *g = true;
            drop(g);
            self.cv.notify_all();
        }
    }

    pub fn clear(&self) {
        let mut g = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *g = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the event is set or `timeout` elapses.
    ///
    /// Returns the flag value at wake-up.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let g = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        if *g {
            return true;
        }
        let (g, _timeout) = self
            .cv
            .wait_timeout_while(g, timeout, |set| !*set)
            .unwrap_or_else(|e| e.into_inner());
        *g
    }
}
