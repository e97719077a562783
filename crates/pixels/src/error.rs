//! Thread-local last-error channel with a monotonic counter, for callers
//! that want a human-readable reason after a `false`/`Err` return without
//! threading strings through every signature.

use std::cell::{Cell, RefCell};

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
    static ERROR_COUNT: Cell<u64> = const { Cell::new(0) };
}

/// Record an error message, bumping the counter.
pub fn set_error(message: impl Into<String>) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message.into()));
    ERROR_COUNT.with(|count| count.set(count.get() + 1));
}

/// The most recently recorded error message on this thread, if any.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Monotonic count of errors recorded on this thread.
pub fn error_count() -> u64 {
    ERROR_COUNT.with(|count| count.get())
}

/// How many errors were recorded since a previously sampled count.
pub fn error_count_since(previous: u64) -> u64 {
    error_count().saturating_sub(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_counter_reports_new_errors_since_sample() {
        let before = error_count();
        assert_eq!(error_count_since(before), 0);

        set_error("first thing went wrong");
        set_error(format!("then {} more", 1));

        assert_eq!(error_count_since(before), 2);
        assert_eq!(last_error().as_deref(), Some("then 1 more"));
    }

    #[test]
    fn errors_are_thread_local() {
        set_error("main thread error");
        let other = std::thread::spawn(|| last_error()).join().expect("join");
        assert_eq!(other, None);
    }
}
