//! Property-based tests for the rdmt engine using proptest.
//!
//! These check the engine's bookkeeping invariants (pool occupancy,
//! exactly-once completion, single task callbacks) across randomized
//! schedules on the simulated fabric.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rdmt::task::TaskTable;
use rdmt::{
    BufferClass, BufferPool, BufferPoolConfig, CompletionCode, EngineEvent, RequestId, SimFabric,
    TaskContext, TaskOutcome,
};

use common::{config, connect, engine, pump, server};

proptest! {
    #[test]
    fn prop_pool_never_exceeds_capacity(
        capacity in 1usize..8,
        ops in proptest::collection::vec(any::<bool>(), 0..64),
    ) {
        let fabric = SimFabric::new();
        let node = Arc::new(fabric.node("pool"));
        let mut pool = BufferPool::new(
            node,
            BufferPoolConfig { capacity, command_size: 24, bulk_size: 32 },
        ).unwrap();
        let mut held = Vec::new();
        for allocate in ops {
            if allocate {
                match pool.allocate(BufferClass::Bulk) {
                    Some(slot) => held.push(slot),
                    None => prop_assert_eq!(held.len(), capacity),
                }
            } else if let Some(slot) = held.pop() {
                pool.free(slot);
            }
            prop_assert!(pool.in_use(BufferClass::Bulk) <= capacity);
            prop_assert_eq!(pool.in_use(BufferClass::Bulk), held.len());
            prop_assert_eq!(pool.in_use(BufferClass::Command), 0);
        }

        let mut offsets: Vec<usize> = held.iter().map(|s| s.offset()).collect();
        offsets.sort_unstable();
        offsets.dedup();
        prop_assert_eq!(offsets.len(), held.len());
        for slot in held {
            pool.free(slot);
        }
        prop_assert_eq!(pool.stats().bulk_in_use, 0);
    }

    #[test]
    fn prop_permuted_completions_resolve_exactly_once(
        rotations in proptest::collection::vec(0usize..4, 1..16),
        reverse in any::<bool>(),
        put_first in any::<bool>(),
    ) {
        let fabric = SimFabric::new();
        let mut srv = server(&fabric, config(4, 64));
        let mut cli = engine(&fabric, "client", config(4, 64));
        let (s1, c1) = connect(&mut srv, &mut cli);
        let (s2, c2) = connect(&mut srv, &mut cli);
        srv.stage_bulk(s1, b"first").unwrap();
        srv.stage_bulk(s2, b"second").unwrap();

        fabric.set_hold_completions(true);
        let (a, b) = if put_first {
            (cli.put(c1, b"put!", None).unwrap(), cli.get(c2, 0, None).unwrap())
        } else {
            (cli.get(c1, 0, None).unwrap(), cli.get(c2, 0, None).unwrap())
        };

        let mut finished: HashMap<RequestId, usize> = HashMap::new();
        let mut round = 0;
        while finished.len() < 2 && round < 64 {
            let rotate = rotations[round % rotations.len()];
            fabric.release_held(|held| {
                if reverse {
                    held.reverse();
                }
                if !held.is_empty() {
                    let k = rotate % held.len();
                    held.rotate_left(k);
                }
            });
            for events in pump(&mut [&mut srv, &mut cli]) {
                for event in events {
                    match event {
                        EngineEvent::GetCompleted { request, .. }
                        | EngineEvent::PutCompleted { request, .. } => {
                            *finished.entry(request).or_default() += 1;
                        }
                        _ => {}
                    }
                }
            }
            round += 1;
        }
        fabric.set_hold_completions(false);
        fabric.release_held(|_| {});
        for events in pump(&mut [&mut srv, &mut cli]) {
            for event in events {
                if let EngineEvent::GetCompleted { request, .. }
                | EngineEvent::PutCompleted { request, .. } = event
                {
                    *finished.entry(request).or_default() += 1;
                }
            }
        }

        prop_assert_eq!(finished.get(&a).copied(), Some(1));
        prop_assert_eq!(finished.get(&b).copied(), Some(1));
        prop_assert_eq!(finished.len(), 2);
        prop_assert_eq!(cli.pending_requests(), 0);
        prop_assert_eq!(cli.credits(c1).unwrap(), 1);
        prop_assert_eq!(cli.credits(c2).unwrap(), 1);
    }

    #[test]
    fn prop_task_callback_fires_once(
        (count, order, failures) in (1usize..=8).prop_flat_map(|n| (
            Just(n),
            Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            proptest::collection::vec(any::<bool>(), n),
        )),
    ) {
        let mut tasks = TaskTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task = tasks.create(TaskContext::Rebuild, count);
        tasks.set_callback(task, Box::new(move |outcome: &TaskOutcome| {
            assert_eq!(outcome.total, count);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })).unwrap();

        let slots: Vec<_> = (0..count).map(|_| tasks.attach(task).unwrap()).collect();
        prop_assert!(tasks.attach(task).is_err());

        let mut expected = CompletionCode::Success;
        for (done, &i) in order.iter().enumerate() {
            let code = if failures[i] {
                CompletionCode::Provider(i as i32 + 1)
            } else {
                CompletionCode::Success
            };
            if expected.is_success() {
                expected = code;
            }
            let outcome = tasks.complete(slots[i], code);
            if done + 1 < count {
                prop_assert!(outcome.is_none());
                prop_assert_eq!(calls.load(Ordering::SeqCst), 0);
            } else {
                let outcome = outcome.unwrap();
                prop_assert_eq!(outcome.result, expected);
                prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
            }
        }

        // repeated completions and sweeps never fire again
        for slot in &slots {
            prop_assert!(tasks.complete(*slot, CompletionCode::Success).is_none());
        }
        prop_assert!(tasks.sweep().is_empty());
        prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
        let status = tasks.status(task).unwrap();
        prop_assert!(status.finished);
        prop_assert_eq!(status.completed, count);
    }

    #[test]
    fn prop_timer_task_fires_once(count in 1usize..=8, extra_loops in 0usize..4) {
        let fabric = SimFabric::new();
        let mut cli = engine(&fabric, "client", config(2, 64));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task = cli.create_task(TaskContext::Mount, count);
        cli.set_task_callback(task, Box::new(move |_: &TaskOutcome| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })).unwrap();

        for _ in 0..count {
            cli.start_timer(Duration::ZERO, Some(task)).unwrap();
        }
        for _ in 0..=extra_loops {
            cli.run_once(Duration::ZERO).unwrap();
        }

        prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
        prop_assert_eq!(cli.metrics().snapshot().timers_fired, count as u64);
    }
}
