use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, ignoring poisoning. The guarded state is kept consistent at every await-free step.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a closure when dropped unless defused first.
pub struct ScopeGuard<F: FnOnce()> {
    dropfn: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn defuse(mut self) {
        self.dropfn = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(dropfn) = self.dropfn.take() {
            dropfn();
        }
    }
}

pub fn defer<F: FnOnce()>(dropfn: F) -> ScopeGuard<F> {
    ScopeGuard { dropfn: Some(dropfn) }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::defer;

    #[test]
    fn runs_unless_defused() {
        let hits = Cell::new(0);
        {
            let _guard = defer(|| hits.set(hits.get() + 1));
        }
        defer(|| hits.set(hits.get() + 10)).defuse();
        assert_eq!(hits.get(), 1);
    }
}
