//! Pending-invoke registry and promise-id allocation.
//!
//! The registry maps `(connection handle, promise id)` to the
//! completion callback registered at `invoke` time. Client sessions
//! have a single implicit peer and use connection key zero.
//!
//! An entry exists exactly while its invocation is unresolved and the
//! originating connection is up: it leaves the registry through
//! [`PendingInvokes::take`] (response arrived), [`PendingInvokes::drain`]
//! (remote disconnect) or [`PendingInvokes::drain_all`] (local
//! disconnect). Callbacks are always invoked with the registry lock
//! released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::protocol::RESPONSE_FLAG;
use crate::session::PromiseCallback;
use crate::Handle;

/// Registry of unresolved invocations.
#[derive(Default)]
pub(crate) struct PendingInvokes {
    inner: Mutex<HashMap<Handle, HashMap<Handle, PromiseCallback>>>,
}

impl PendingInvokes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a completion callback for `(conn, id)`.
    ///
    /// Returns any displaced callback. A displacement means the 31-bit
    /// id space rolled all the way around onto a still-pending entry;
    /// the caller logs it and completes the stale entry.
    pub fn register(&self, conn: Handle, id: Handle, cb: PromiseCallback) -> Option<PromiseCallback> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conn)
            .or_default()
            .insert(id, cb)
    }

    /// Remove and return the callback for `(conn, id)`, if present.
    pub fn take(&self, conn: Handle, id: Handle) -> Option<PromiseCallback> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let callbacks = inner.get_mut(&conn)?;
        let cb = callbacks.remove(&id);
        if callbacks.is_empty() {
            inner.remove(&conn);
        }
        cb
    }

    /// Remove and return every callback for `conn`.
    pub fn drain(&self, conn: Handle) -> Vec<PromiseCallback> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.remove(&conn) {
            Some(map) => map.into_values().collect(),
            None => Vec::new(),
        }
    }

    /// Remove and return every callback for every connection.
    pub fn drain_all(&self) -> Vec<PromiseCallback> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .drain()
            .flat_map(|(_, map)| map.into_values())
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|m| m.len())
            .sum()
    }
}

/// Monotonic promise-id allocator.
///
/// Ids live in the low 31 bits; the allocator rolls over past
/// `0x7FFF_FFFF` back to 1, skipping zero (zero marks a one-way
/// message on the wire).
#[derive(Default)]
pub(crate) struct PromiseIds {
    last: AtomicU32,
    rollover: Mutex<()>,
}

impl PromiseIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Handle {
        let mut id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id >= RESPONSE_FLAG {
            let _guard = self.rollover.lock().unwrap_or_else(|e| e.into_inner());
            if self.last.load(Ordering::Relaxed) >= RESPONSE_FLAG {
                self.last.store(0, Ordering::Relaxed);
            }
            id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InvokeResult;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn noop() -> PromiseCallback {
        Box::new(|_, _| {})
    }

    #[test]
    fn test_register_take() {
        let pending = PendingInvokes::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = fired.clone();
        pending.register(
            1,
            7,
            Box::new(move |code, body| {
                assert_eq!(code, InvokeResult::Good);
                assert_eq!(&body[..], b"ok");
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(pending.take(1, 8).is_none());
        assert!(pending.take(2, 7).is_none());

        let cb = pending.take(1, 7).unwrap();
        cb(InvokeResult::Good, Bytes::from_static(b"ok"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // take removes the entry.
        assert!(pending.take(1, 7).is_none());
    }

    #[test]
    fn test_register_displaces_stale_entry() {
        let pending = PendingInvokes::new();
        assert!(pending.register(1, 7, noop()).is_none());
        assert!(pending.register(1, 7, noop()).is_some());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_drain_single_connection() {
        let pending = PendingInvokes::new();
        pending.register(1, 1, noop());
        pending.register(1, 2, noop());
        pending.register(2, 3, noop());

        let drained = pending.drain(1);
        assert_eq!(drained.len(), 2);
        assert_eq!(pending.len(), 1);
        assert!(pending.drain(1).is_empty());
    }

    #[test]
    fn test_drain_all() {
        let pending = PendingInvokes::new();
        pending.register(1, 1, noop());
        pending.register(2, 2, noop());
        pending.register(3, 3, noop());

        assert_eq!(pending.drain_all().len(), 3);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_promise_ids_skip_zero() {
        let ids = PromiseIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_promise_ids_roll_over_below_response_flag() {
        let ids = PromiseIds::new();
        ids.last.store(RESPONSE_FLAG - 2, Ordering::Relaxed);

        assert_eq!(ids.next(), RESPONSE_FLAG - 1);
        // Next allocation would set the response flag; it wraps to 1.
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_promise_ids_unique_across_threads() {
        let ids = Arc::new(PromiseIds::new());
        let mut threads = Vec::new();
        for _ in 0..4 {
            let ids = ids.clone();
            threads.push(std::thread::spawn(move || {
                (0..1000).map(|_| ids.next()).collect::<Vec<u32>>()
            }));
        }

        let mut all: Vec<u32> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len());
        assert!(all.iter().all(|&id| id != 0 && id < RESPONSE_FLAG));
    }
}
