//! Lifetime token gating user-held closures against session destruction.
//!
//! A session hands result functions into arbitrary user code that may
//! outlive it. Each such closure captures a weak reference to the
//! session's shield token; its first act is to upgrade, and an upgrade
//! failure means the session is gone and the closure returns without
//! touching anything.
//!
//! Destruction clears the strong reference and then spins until no
//! upgrade can succeed, so a closure that is mid-execution finishes
//! before the session's teardown continues.

use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

pub(crate) struct Shield {
    token: Mutex<Option<Arc<()>>>,
}

impl Shield {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(Some(Arc::new(()))),
        }
    }

    /// A weak reference for a closure to capture. Already-cleared
    /// shields hand out a dead weak.
    pub fn weak(&self) -> Weak<()> {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::downgrade)
            .unwrap_or_default()
    }

    /// Drop the strong reference and wait until every outstanding
    /// upgrade has been released.
    pub fn clear(&self) {
        let taken = self
            .token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(strong) = taken else {
            return;
        };
        let weak = Arc::downgrade(&strong);
        drop(strong);
        while weak.upgrade().is_some() {
            thread::sleep(Duration::from_millis(1));
        }
    }
}
