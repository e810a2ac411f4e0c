//! Concurrency-limited parallel iteration.
//!
//! Plays the part of a host tile scheduler: items are handed to rayon workers
//! with at most `max_concurrent` in flight, which caps how many tile graphs are
//! resident at once.

use rayon::prelude::*;

/// Runs `f` for every item in parallel, at most `max_concurrent` at a time.
///
/// Chunks are processed in order; the first chunk that yields an error stops
/// the iteration and that error is returned. Items inside the failing chunk may
/// still run.
///
/// # Panics
///
/// Panics if `max_concurrent` is 0.
pub fn try_par_for_each_limited<T, E, F>(items: &[T], max_concurrent: usize, f: F) -> Result<(), E>
where
    T: Sync,
    E: Send,
    F: Fn(&T) -> Result<(), E> + Sync,
{
    assert!(max_concurrent > 0, "max_concurrent must be > 0");

    for chunk in items.chunks(max_concurrent) {
        chunk.par_iter().try_for_each(&f)?;
    }
    Ok(())
}

/// Default concurrency for [`try_par_for_each_limited`]: the rayon pool size.
pub fn default_concurrency() -> usize {
    rayon::current_num_threads().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn visits_every_item_once() {
        let items: Vec<usize> = (0..37).collect();
        let sum = AtomicUsize::new(0);
        let visits = AtomicUsize::new(0);

        let result: Result<(), ()> = try_par_for_each_limited(&items, 4, |&x| {
            sum.fetch_add(x, Ordering::SeqCst);
            visits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(visits.load(Ordering::SeqCst), 37);
        assert_eq!(sum.load(Ordering::SeqCst), (0..37).sum::<usize>());
    }

    #[test]
    fn caps_items_in_flight() {
        let items: Vec<i32> = (0..20).collect();
        let in_flight = AtomicUsize::new(0);
        let max_observed = AtomicUsize::new(0);

        let result: Result<(), ()> = try_par_for_each_limited(&items, 3, |_| {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_observed.fetch_max(current, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(2));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(result.is_ok());
        let max = max_observed.load(Ordering::SeqCst);
        assert!(max <= 3, "max in-flight was {max}, expected <= 3");
    }

    #[test]
    fn stops_after_failing_chunk() {
        let items: Vec<i32> = (0..10).collect();
        let visits = AtomicUsize::new(0);

        let result = try_par_for_each_limited(&items, 2, |&x| {
            visits.fetch_add(1, Ordering::SeqCst);
            if x == 3 {
                Err(format!("item {x} failed"))
            } else {
                Ok(())
            }
        });

        assert_eq!(result, Err("item 3 failed".to_string()));
        assert!(visits.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn empty_input_is_ok() {
        let items: Vec<i32> = vec![];
        let result: Result<(), ()> = try_par_for_each_limited(&items, 3, |_| Ok(()));
        assert!(result.is_ok());
    }

    #[test]
    #[should_panic(expected = "max_concurrent must be > 0")]
    fn zero_concurrency_panics() {
        let _ = try_par_for_each_limited(&[1, 2, 3], 0, |_| Ok::<(), ()>(()));
    }
}
