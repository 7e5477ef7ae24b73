//! Thread exception state and cooperative interrupts
//!
//! The VM's execution model is single-threaded under a global execution
//! lock. A helper that fails sets the thread's pending exception triple and
//! returns null; emitted code then branches into the active handler chain.
//! Asynchronous exceptions raised from other threads are parked here and
//! delivered at the next `periodic_work` pulse.

use std::cell::RefCell;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::vm::value::{exc_type_object, new_exception, none_value, ExcKind, Payload, ValueRef};

/// An exception triple: (type object, exception value, traceback).
pub type ExcTriple = (ValueRef, ValueRef, ValueRef);

thread_local! {
    static PENDING: RefCell<Option<ExcTriple>> = const { RefCell::new(None) };
}

/// Raise a builtin exception on the current thread.
pub fn raise(kind: ExcKind, message: impl Into<String>) {
    let ty = exc_type_object(kind);
    ty.incref();
    let value = new_exception(kind, message);
    let tb = none_value();
    tb.incref();
    set_pending(ty, value, tb);
}

/// Install a pending exception triple, taking ownership of all three
/// references. Any previously pending triple is released.
pub fn set_pending(exc_type: ValueRef, value: ValueRef, traceback: ValueRef) {
    PENDING.with(|p| {
        if let Some((t, v, tb)) = p.borrow_mut().replace((exc_type, value, traceback)) {
            t.decref();
            v.decref();
            tb.decref();
        }
    });
}

/// Whether an exception is pending on the current thread.
pub fn pending() -> bool {
    PENDING.with(|p| p.borrow().is_some())
}

/// Take the pending triple, transferring ownership to the caller.
pub fn take_pending() -> Option<ExcTriple> {
    PENDING.with(|p| p.borrow_mut().take())
}

/// Drop any pending exception.
pub fn clear_pending() {
    if let Some((t, v, tb)) = take_pending() {
        t.decref();
        v.decref();
        tb.decref();
    }
}

/// Kind of the pending exception, when it is a builtin exception value.
pub fn pending_kind() -> Option<ExcKind> {
    PENDING.with(|p| {
        p.borrow().as_ref().and_then(|(_, v, _)| {
            if v.is_null() || v.is_tagged() {
                return None;
            }
            match v.payload() {
                Payload::Exception(e) => Some(e.kind),
                _ => None,
            }
        })
    })
}

/// Message of the pending exception, for tests and diagnostics.
pub fn pending_message() -> Option<String> {
    PENDING.with(|p| {
        p.borrow().as_ref().and_then(|(_, v, _)| {
            if v.is_null() || v.is_tagged() {
                return None;
            }
            match v.payload() {
                Payload::Exception(e) => Some(e.message.clone()),
                _ => None,
            }
        })
    })
}

thread_local! {
    static HANDLED: RefCell<Option<ExcTriple>> = const { RefCell::new(None) };
}

/// Swap the thread's "currently handled exception" state (the exception an
/// active except clause is processing). Returns the previous state; the
/// caller owns the returned references and this module takes ownership of
/// the new ones.
pub fn swap_handled(new: Option<ExcTriple>) -> Option<ExcTriple> {
    HANDLED.with(|h| std::mem::replace(&mut *h.borrow_mut(), new))
}

/// Clone the currently handled triple with fresh references (for bare
/// `raise`). None when no exception is being handled.
pub fn handled_snapshot() -> Option<ExcTriple> {
    HANDLED.with(|h| {
        h.borrow().as_ref().map(|(t, v, tb)| {
            t.incref();
            v.incref();
            tb.incref();
            (*t, *v, *tb)
        })
    })
}

static EXECUTION_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

type Callback = Box<dyn FnOnce() + Send>;

static SCHEDULED: Lazy<Mutex<Vec<Callback>>> = Lazy::new(|| Mutex::new(Vec::new()));
static ASYNC_EXC: Lazy<Mutex<Option<ValueRef>>> = Lazy::new(|| Mutex::new(None));

/// Queue a cross-thread callback; it runs at the next `periodic_work`.
pub fn schedule_callback(f: impl FnOnce() + Send + 'static) {
    SCHEDULED.lock().push(Box::new(f));
}

/// Park an asynchronous exception for delivery at the next pulse. Takes
/// ownership of the reference; replaces any undelivered one.
pub fn set_async_exception(value: ValueRef) {
    if let Some(old) = ASYNC_EXC.lock().replace(value) {
        old.decref();
    }
}

/// The cooperative-concurrency pulse. Emitted code calls this at loop
/// back-edges: it releases and re-acquires the execution lock, services
/// scheduled callbacks, and delivers any parked asynchronous exception.
/// Returns nonzero when the caller must enter its error unwind path.
pub extern "C" fn periodic_work() -> i32 {
    drop(EXECUTION_LOCK.lock());

    let callbacks: Vec<Callback> = std::mem::take(&mut *SCHEDULED.lock());
    for cb in callbacks {
        cb();
    }

    if let Some(value) = ASYNC_EXC.lock().take() {
        let kind = if value.is_null() || value.is_tagged() {
            ExcKind::InterruptedError
        } else {
            match value.payload() {
                Payload::Exception(e) => e.kind,
                _ => ExcKind::InterruptedError,
            }
        };
        let ty = exc_type_object(kind);
        ty.incref();
        let tb = none_value();
        tb.incref();
        set_pending(ty, value, tb);
        return -1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::new_exception;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_raise_and_take() {
        assert!(!pending());
        raise(ExcKind::ValueError, "bad value");
        assert!(pending());
        assert_eq!(pending_kind(), Some(ExcKind::ValueError));
        let (t, v, tb) = take_pending().unwrap();
        assert!(!pending());
        t.decref();
        v.decref();
        tb.decref();
    }

    #[test]
    fn test_replace_releases_old() {
        raise(ExcKind::TypeError, "first");
        raise(ExcKind::KeyError, "second");
        assert_eq!(pending_kind(), Some(ExcKind::KeyError));
        clear_pending();
    }

    #[test]
    fn test_periodic_work_idle() {
        assert_eq!(periodic_work(), 0);
    }

    #[test]
    fn test_periodic_work_runs_callbacks() {
        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();
        schedule_callback(move || flag.store(true, Ordering::SeqCst));
        assert_eq!(periodic_work(), 0);
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_periodic_work_delivers_async_exception() {
        set_async_exception(new_exception(ExcKind::InterruptedError, "stop"));
        assert_eq!(periodic_work(), -1);
        assert_eq!(pending_kind(), Some(ExcKind::InterruptedError));
        clear_pending();
    }
}
