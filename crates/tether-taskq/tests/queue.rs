use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tether_taskq::{QueueError, WorkQueue};

#[test]
fn concurrent_submitters_lose_and_duplicate_nothing() {
    const SUBMITTERS: u32 = 4;
    const PER_SUBMITTER: u32 = 1_000;

    // Deliberately small so submitters regularly hit a full queue.
    let queue = WorkQueue::with_capacity_bytes(4 * (2 + 64)).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let drainer = {
        let queue = queue.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                let finished = done.load(Ordering::SeqCst);
                queue.drain_with(|item| seen.push(item)).unwrap();
                if finished && queue.peek_count() == 0 {
                    return seen;
                }
                thread::yield_now();
            }
        })
    };

    thread::scope(|s| {
        for t in 0..SUBMITTERS {
            let queue = queue.clone();
            s.spawn(move || {
                for i in 0..PER_SUBMITTER {
                    let item = t * PER_SUBMITTER + i;
                    loop {
                        match queue.submit(item) {
                            Ok(()) => break,
                            Err(QueueError::QueueFull { .. }) => thread::yield_now(),
                            Err(err) => panic!("submit failed: {err}"),
                        }
                    }
                }
            });
        }
    });
    done.store(true, Ordering::SeqCst);

    let mut seen = drainer.join().unwrap();
    assert_eq!(seen.len() as u32, SUBMITTERS * PER_SUBMITTER);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len() as u32, SUBMITTERS * PER_SUBMITTER);
}

#[test]
fn per_submitter_order_survives_draining() {
    let queue = WorkQueue::with_capacity_bytes(4 * (2 + 16)).unwrap();
    let mut seen = Vec::new();
    for i in 0..100 {
        while let Err(QueueError::QueueFull { .. }) = queue.submit(i) {
            queue.drain_with(|item| seen.push(item)).unwrap();
        }
    }
    queue.drain_with(|item| seen.push(item)).unwrap();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[derive(Debug, Clone)]
enum Op {
    Submit(u32),
    Drain,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => any::<u32>().prop_map(Op::Submit), 1 => Just(Op::Drain)]
}

proptest! {
    #[test]
    fn queue_matches_a_bounded_fifo(slots in 1u32..8, ops in proptest::collection::vec(op(), 0..64)) {
        let queue = WorkQueue::with_capacity_bytes(4 * (2 + slots)).unwrap();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::Submit(item) => {
                    let result = queue.submit(item);
                    if model.len() as u32 == slots {
                        let full = matches!(result, Err(QueueError::QueueFull { capacity }) if capacity == slots);
                        prop_assert!(full);
                    } else {
                        prop_assert!(result.is_ok());
                        model.push_back(item);
                    }
                }
                Op::Drain => {
                    let mut drained = Vec::new();
                    let n = queue.drain_with(|item| drained.push(item)).unwrap();
                    prop_assert_eq!(n, drained.len());
                    prop_assert_eq!(drained, model.drain(..).collect::<Vec<_>>());
                }
            }
            prop_assert_eq!(queue.peek_count(), model.len() as u32);
        }
    }
}
