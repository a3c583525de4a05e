//! Single-writer, many-reader publication of immutable values
//!
//! Readers reserve the current value without locking and keep it alive for
//! as long as they hold the returned `Arc`. Only the holder of the
//! [`SnapshotPublisher`] can replace it; the previous value is handed back so
//! the caller decides when it is released.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// Create a reader/publisher pair around `initial`
pub fn channel<T>(initial: T) -> (SnapshotReader<T>, SnapshotPublisher<T>) {
    let cell = Arc::new(ArcSwap::from_pointee(initial));
    (
        SnapshotReader { cell: cell.clone() },
        SnapshotPublisher { cell },
    )
}

/// Read side, cheap to clone and safe to use from any task
pub struct SnapshotReader<T> {
    cell: Arc<ArcSwap<T>>,
}

impl<T> SnapshotReader<T> {
    /// Reserve the currently published value
    pub fn reserve(&self) -> Arc<T> {
        self.cell.load_full()
    }
}

impl<T> Clone for SnapshotReader<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SnapshotReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotReader").field(&self.reserve()).finish()
    }
}

/// Write side. There is exactly one per channel.
pub struct SnapshotPublisher<T> {
    cell: Arc<ArcSwap<T>>,
}

impl<T> SnapshotPublisher<T> {
    pub fn current(&self) -> Arc<T> {
        self.cell.load_full()
    }

    /// Atomically replace the published value, returning the previous one
    #[must_use = "the previous snapshot must be retired"]
    pub fn publish(&mut self, next: T) -> Arc<T> {
        self.cell.swap(Arc::new(next))
    }
}

impl<T: fmt::Debug> fmt::Debug for SnapshotPublisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotPublisher").field(&self.current()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_publish_returns_previous() {
        let (reader, mut publisher) = channel(vec![1]);
        let reserved = reader.reserve();

        let old = publisher.publish(vec![1, 2]);
        assert!(Arc::ptr_eq(&old, &reserved));
        assert_eq!(*reader.reserve(), vec![1, 2]);
        assert_eq!(*reserved, vec![1]);
    }

    #[test]
    fn test_readers_never_see_torn_values() {
        let (reader, mut publisher) = channel(vec![0u64; 16]);
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = reader.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = reader.reserve();
                        let first = snapshot[0];
                        assert!(snapshot.iter().all(|v| *v == first));
                        assert!(first >= last);
                        last = first;
                    }
                })
            })
            .collect();

        for generation in 1..=2000u64 {
            let old = publisher.publish(vec![generation; 16]);
            drop(old);
        }
        done.store(true, Ordering::Relaxed);

        for handle in readers {
            handle.join().unwrap();
        }
    }
}
