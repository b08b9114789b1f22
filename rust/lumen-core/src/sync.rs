//! The compile serialization section.
//!
//! Data shared across compiled units (the count of outstanding units,
//! interned names) lives inside a [`CompileSection`], and the collection
//! published deopt metadata is appended to is only written from inside it. The section is a reentrant lock: a thread that already
//! holds it may enter again.
//!
//! Entering the section blocks until the lock is free. Threaded compile
//! episodes are tracked with [`ThreadedEpisode`] guards so callers can tell
//! whether workers may be contending. Code holding `&mut CompileSection`
//! bypasses the lock entirely with [`CompileSection::get_mut`].

use std::cell::{RefCell, RefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Reentrant serialization section protecting a `T`.
pub struct CompileSection<T> {
    episodes: AtomicUsize,
    inner: ReentrantMutex<RefCell<T>>,
}

impl<T> CompileSection<T> {
    pub fn new(value: T) -> Self {
        Self {
            episodes: AtomicUsize::new(0),
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Whether a multi-threaded compile episode is in progress.
    pub fn is_threaded(&self) -> bool {
        self.episodes.load(Ordering::Acquire) > 0
    }

    /// Start a multi-threaded compile episode. The episode ends when the
    /// returned guard is dropped. Episodes nest.
    pub fn begin_threaded(&self) -> ThreadedEpisode<'_, T> {
        let depth = self.episodes.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(depth, "threaded compile episode started");
        ThreadedEpisode { section: self }
    }

    /// Enter the section, waiting for any other thread to leave it. The
    /// guard may be held while entering again on the same thread; data
    /// borrows taken through nested guards must not overlap.
    pub fn enter(&self) -> SectionGuard<'_, T> {
        SectionGuard {
            guard: self.inner.lock(),
        }
    }

    /// Run `f` with mutable access to the protected data.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.enter();
        let mut data = guard.borrow_mut();
        f(&mut data)
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut().get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().into_inner()
    }
}

impl<T: Default> Default for CompileSection<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for CompileSection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileSection")
            .field("threaded", &self.is_threaded())
            .finish_non_exhaustive()
    }
}

/// Guard for an entered [`CompileSection`].
pub struct SectionGuard<'a, T> {
    guard: ReentrantMutexGuard<'a, RefCell<T>>,
}

impl<T> SectionGuard<'_, T> {
    /// Mutably borrow the protected data.
    ///
    /// # Panics
    /// Panics if a borrow from an enclosing guard on this thread is still
    /// alive.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.guard.borrow_mut()
    }
}

/// A running multi-threaded compile episode.
pub struct ThreadedEpisode<'a, T> {
    section: &'a CompileSection<T>,
}

impl<T> Drop for ThreadedEpisode<'_, T> {
    fn drop(&mut self) {
        let remaining = self.section.episodes.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::debug!(remaining, "threaded compile episode finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_threaded_access_never_blocks() {
        let section = CompileSection::new(Vec::<u32>::new());
        assert!(!section.is_threaded());
        section.with(|v| v.push(1));
        section.with(|v| v.push(2));
        assert_eq!(section.into_inner(), vec![1, 2]);
    }

    #[test]
    fn section_is_reentrant() {
        let section = CompileSection::new(0u32);
        let outer = section.enter();
        *outer.borrow_mut() += 1;
        // Re-entering on the same thread succeeds.
        section.with(|n| *n += 1);
        drop(outer);
        assert_eq!(section.with(|n| *n), 2);
    }

    #[test]
    fn episodes_nest() {
        let section = CompileSection::new(());
        let a = section.begin_threaded();
        let b = section.begin_threaded();
        assert!(section.is_threaded());
        drop(a);
        assert!(section.is_threaded());
        drop(b);
        assert!(!section.is_threaded());
    }

    #[test]
    fn threaded_episode_serialises_writers() {
        let section = Arc::new(CompileSection::new(Vec::<usize>::new()));
        let episode_section = Arc::clone(&section);
        let _episode = episode_section.begin_threaded();
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let section = Arc::clone(&section);
                scope.spawn(move || {
                    for i in 0..100 {
                        section.with(|v| v.push(worker * 1000 + i));
                    }
                });
            }
        });
        assert_eq!(section.with(|v| v.len()), 400);
    }

    #[test]
    fn contention_outside_an_episode_waits() {
        let section = CompileSection::new(0u32);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        section.with(|n| *n += 1);
                    }
                });
            }
        });
        assert!(!section.is_threaded());
        assert_eq!(section.into_inner(), 800);
    }

    #[test]
    fn get_mut_bypasses_lock() {
        let mut section = CompileSection::new(5u8);
        *section.get_mut() += 1;
        assert_eq!(section.with(|n| *n), 6);
    }
}
