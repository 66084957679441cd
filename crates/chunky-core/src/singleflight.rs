use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Per-key call deduplication: under concurrent [`Group::run`] calls with the
/// same key, exactly one caller (the leader) executes the closure; the rest
/// block until the leader finishes and share its cloned result.
///
/// The map holds keys only while a call is in flight, so a later `run` with
/// the same key executes again. Callers wanting memoization layer a cache on
/// top, which is exactly what the pack reader does.
///
/// A panicking leader poisons the in-flight call instead of leaving waiters
/// blocked: followers observe the poison and panic themselves, and the key
/// is removed so future callers start a fresh flight.
pub struct Group<K, V> {
    calls: Mutex<HashMap<K, Arc<Call<V>>>>,
}

struct CallState<V> {
    result: Option<V>,
    poisoned: bool,
}

struct Call<V> {
    state: Mutex<CallState<V>>,
    ready: Condvar,
}

impl<V> Call<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState {
                result: None,
                poisoned: false,
            }),
            ready: Condvar::new(),
        }
    }
}

/// Finishes a leader's flight on drop, whether `f` returned or unwound: any
/// call left without a result is marked poisoned, waiters are woken, and the
/// key leaves the map.
struct LeaderCleanup<'a, K: Eq + Hash, V> {
    calls: &'a Mutex<HashMap<K, Arc<Call<V>>>>,
    call: &'a Call<V>,
    key: &'a K,
}

impl<K: Eq + Hash, V> Drop for LeaderCleanup<'_, K, V> {
    fn drop(&mut self) {
        {
            let mut state = lock_unpoisoned(&self.call.state);
            if state.result.is_none() {
                state.poisoned = true;
            }
        }
        self.call.ready.notify_all();
        lock_unpoisoned(self.calls).remove(self.key);
    }
}

/// Lock that survives std mutex poisoning; this guard runs during unwinds,
/// where a second panic would abort.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Group<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key`, or wait for the in-flight leader. Returns the
    /// shared value and whether this caller was the leader.
    pub fn run<F: FnOnce() -> V>(&self, key: K, f: F) -> (V, bool) {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap();
            match calls.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let fresh = Arc::new(Call::new());
                    calls.insert(key.clone(), Arc::clone(&fresh));
                    (fresh, true)
                }
            }
        };

        if leader {
            let cleanup = LeaderCleanup {
                calls: &self.calls,
                call: &call,
                key: &key,
            };
            let value = f();
            {
                let mut state = lock_unpoisoned(&cleanup.call.state);
                state.result = Some(value.clone());
            }
            drop(cleanup);
            (value, true)
        } else {
            let mut state = call.state.lock().unwrap();
            loop {
                if let Some(value) = &state.result {
                    return (value.clone(), false);
                }
                if state.poisoned {
                    panic!("singleflight leader panicked");
                }
                state = call.ready.wait(state).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn single_caller_runs_once() {
        let group: Group<&str, u32> = Group::new();
        let (value, leader) = group.run("key", || 7);
        assert_eq!(value, 7);
        assert!(leader);
    }

    #[test]
    fn sequential_calls_rerun() {
        let group: Group<&str, u32> = Group::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            group.run("key", || {
                calls.fetch_add(1, Ordering::SeqCst);
                0
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_callers_share_one_execution() {
        const THREADS: usize = 8;
        let group: Arc<Group<String, u64>> = Arc::new(Group::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let group = Arc::clone(&group);
                let executions = Arc::clone(&executions);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let (value, _) = group.run("shared".to_string(), || {
                        executions.fetch_add(1, Ordering::SeqCst);
                        // Keep the call in flight long enough for every
                        // thread to pile onto it.
                        std::thread::sleep(Duration::from_millis(100));
                        42u64
                    });
                    value
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_keys_run_independently() {
        let group: Group<u32, u32> = Group::new();
        let (a, _) = group.run(1, || 10);
        let (b, _) = group.run(2, || 20);
        assert_eq!((a, b), (10, 20));
    }

    #[test]
    fn leader_panic_does_not_strand_followers() {
        let group: Arc<Group<&'static str, u32>> = Arc::new(Group::new());
        let barrier = Arc::new(Barrier::new(2));

        let leader_group = Arc::clone(&group);
        let leader_barrier = Arc::clone(&barrier);
        let leader = std::thread::spawn(move || {
            leader_group.run("key", || {
                leader_barrier.wait();
                // Give the follower time to join the flight.
                std::thread::sleep(Duration::from_millis(100));
                panic!("leader died mid-flight");
            })
        });

        barrier.wait();
        let follower_group = Arc::clone(&group);
        let follower = std::thread::spawn(move || follower_group.run("key", || 7));

        assert!(leader.join().is_err());

        // The follower must terminate either way: it observed the poisoned
        // flight (and panicked), or it arrived after cleanup and ran fresh.
        match follower.join() {
            Err(_) => {}
            Ok((value, was_leader)) => {
                assert_eq!(value, 7);
                assert!(was_leader);
            }
        }
    }

    #[test]
    fn key_is_reusable_after_leader_panic() {
        let group: Arc<Group<&'static str, u32>> = Arc::new(Group::new());

        let panicking_group = Arc::clone(&group);
        let handle = std::thread::spawn(move || {
            panicking_group.run("key", || -> u32 { panic!("boom") })
        });
        assert!(handle.join().is_err());

        // The panicked flight left no residue: a fresh call runs normally.
        let (value, leader) = group.run("key", || 9);
        assert_eq!(value, 9);
        assert!(leader);
    }
}
