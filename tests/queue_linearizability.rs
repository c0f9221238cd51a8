//! MPSC/SPSC correctness under arbitrary producer counts and batch sizes
//! (§8 testable properties 1–2), driven by proptest rather than the fixed
//! constants the in-module unit tests use.

use proptest::prelude::*;
use squall::collections::{MpscQueue, SpscQueue};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn spsc_preserves_order_for_any_run_length(n in 1usize..5_000) {
        let q = Arc::new(SpscQueue::<usize>::with_capacity(64));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut i = 0;
                while i < n {
                    if q.enqueue(i).is_ok() {
                        i += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::with_capacity(n);
        while received.len() < n {
            if let Some(v) = q.dequeue() {
                received.push(v);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        prop_assert_eq!(received, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn mpsc_preserves_all_items_across_producer_counts(producers in 1usize..6, per_producer in 1usize..1_000) {
        let q = Arc::new(MpscQueue::<(usize, usize)>::with_capacity(1024));
        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut i = 0;
                    while i < per_producer {
                        if q.enqueue((p, i)).is_ok() {
                            i += 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = producers * per_producer;
        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            if let Some(item) = q.dequeue() {
                received.push(item);
            } else {
                thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        prop_assert_eq!(received.len(), total);
        let unique: HashSet<_> = received.iter().copied().collect();
        prop_assert_eq!(unique.len(), total);

        let mut last_per_producer = vec![None; producers];
        for (p, i) in received {
            if let Some(last) = last_per_producer[p] {
                prop_assert!(i > last);
            }
            last_per_producer[p] = Some(i);
        }
    }
}
