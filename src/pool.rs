use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Result, ZpaqError};

/// Runs `f` over `items` on `threads` workers and returns the results in
/// item order, regardless of completion order. The coordinator owns the
/// output; workers only ever hand back `(index, result)` pairs, which is
/// what keeps the archive layout deterministic under any scheduling.
///
/// Cancellation is cooperative: the flag is checked between items, and a
/// raised flag surfaces as an interrupted-I/O error.
pub fn run_ordered<T, R, F>(
    items: Vec<T>,
    threads: usize,
    cancel: &AtomicBool,
    f: F,
) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let threads = threads.max(1).min(total);
    if threads == 1 {
        // Inline fast path; no channel ceremony for a single lane.
        let mut out = Vec::with_capacity(total);
        for item in items {
            if cancel.load(Ordering::Relaxed) {
                return Err(interrupted());
            }
            out.push(f(item)?);
        }
        return Ok(out);
    }

    let started = std::time::Instant::now();
    let queue = Mutex::new(items.into_iter().enumerate());
    let (tx, rx) = mpsc::channel::<(usize, Result<R>)>();

    let results = std::thread::scope(|scope| {
        for _ in 0..threads {
            let tx = tx.clone();
            let queue = &queue;
            let f = &f;
            scope.spawn(move || loop {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                let next = queue.lock().expect("queue lock").next();
                match next {
                    Some((idx, item)) => {
                        if tx.send((idx, f(item))).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<Result<R>>> = (0..total).map(|_| None).collect();
        let mut received = 0usize;
        while let Ok((idx, res)) = rx.recv() {
            slots[idx] = Some(res);
            received += 1;
        }
        debug!(
            items = total,
            received,
            threads,
            duration_ms = started.elapsed().as_millis() as u64,
            "worker pool drained"
        );
        slots
    });

    if cancel.load(Ordering::Relaxed) {
        return Err(interrupted());
    }

    let mut out = Vec::with_capacity(total);
    for slot in results {
        match slot {
            Some(Ok(r)) => out.push(r),
            Some(Err(e)) => return Err(e),
            None => return Err(interrupted()),
        }
    }
    Ok(out)
}

fn interrupted() -> ZpaqError {
    ZpaqError::Io(std::io::Error::new(
        std::io::ErrorKind::Interrupted,
        "operation cancelled",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn results_come_back_in_item_order() {
        let cancel = AtomicBool::new(false);
        let items: Vec<u64> = (0..64).collect();
        let out = run_ordered(items.clone(), 8, &cancel, |i| {
            // Uneven work so completion order scrambles.
            std::thread::sleep(std::time::Duration::from_micros((64 - i) * 50));
            Ok(i * 2)
        })
        .unwrap();
        assert_eq!(out, items.iter().map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn first_error_propagates() {
        let cancel = AtomicBool::new(false);
        let err = run_ordered((0..16u32).collect(), 4, &cancel, |i| {
            if i == 7 {
                Err(ZpaqError::Corrupt("boom"))
            } else {
                Ok(i)
            }
        })
        .expect_err("must fail");
        assert!(matches!(err, ZpaqError::Corrupt("boom")));
    }

    #[test]
    fn cancel_stops_the_batch() {
        let cancel = AtomicBool::new(false);
        let done = AtomicUsize::new(0);
        let err = run_ordered((0..1000u32).collect(), 4, &cancel, |i| {
            if i == 3 {
                cancel.store(true, Ordering::Relaxed);
            }
            done.fetch_add(1, Ordering::Relaxed);
            Ok(i)
        })
        .expect_err("cancelled");
        assert!(matches!(err, ZpaqError::Io(_)));
        assert!(done.load(Ordering::Relaxed) < 1000);
    }

    #[test]
    fn empty_batch_is_fine() {
        let cancel = AtomicBool::new(false);
        let out: Vec<u32> = run_ordered(Vec::<u32>::new(), 4, &cancel, Ok).unwrap();
        assert!(out.is_empty());
    }
}
