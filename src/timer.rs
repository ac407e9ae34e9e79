// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-shot timer wheel for the event loop: a min-heap of deadlines
//! keyed by an opaque handle, with lazy cancellation so `cancel` never has
//! to search the heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Opaque handle returned by [`TimerWheel::start`]; used to cancel or
/// re-arm the same logical timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

struct Entry {
    deadline: Instant,
    handle: TimerHandle,
    generation: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// A timer that has fired, ready for the caller to act on. `argument`
/// carries whatever the caller attached at `start` time.
pub struct Fired<A> {
    pub handle: TimerHandle,
    pub argument: A,
}

/// Named single-shot timer wheel. "Named" here means handle-addressed:
/// starting a timer on a handle that already has one in flight replaces
/// it outright (the old schedule fires nothing).
pub struct TimerWheel<A> {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<TimerHandle, (u64, A)>,
    next_handle: u64,
}

impl<A> Default for TimerWheel<A> {
    fn default() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl<A> TimerWheel<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle with no schedule attached yet.
    pub fn new_handle(&mut self) -> TimerHandle {
        let h = TimerHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    /// Schedule `argument` to fire on `handle` after `delay`. Replaces any
    /// schedule already in flight for this handle; the stale heap entry
    /// (if any) is left in place and discarded as a no-op when it's popped,
    /// since its generation will no longer match.
    pub fn start(&mut self, handle: TimerHandle, delay: Duration, argument: A) {
        let generation = self
            .live
            .get(&handle)
            .map(|(g, _)| g + 1)
            .unwrap_or(0);
        self.live.insert(handle, (generation, argument));
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            handle,
            generation,
        }));
    }

    /// Cancel `handle`'s in-flight schedule, if any. Idempotent.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.live.remove(&handle);
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.live.contains_key(&handle)
    }

    /// Duration until the next live timer fires, or `None` if the wheel is
    /// empty of live schedules -- used as the event loop's readiness-wait
    /// timeout.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.drop_stale();
        self.heap.peek().map(|Reverse(e)| {
            e.deadline.saturating_duration_since(Instant::now())
        })
    }

    /// Pop every timer whose deadline has passed and is still live. Bounds
    /// per-tick work to the number of timers actually due; a timer that was
    /// cancelled or superseded before its pop is silently dropped here
    /// rather than ever reaching the caller.
    pub fn poll(&mut self) -> Vec<Fired<A>> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            match self.live.get(&entry.handle) {
                Some((gen, _)) if *gen == entry.generation => {
                    let (_, argument) = self.live.remove(&entry.handle).unwrap();
                    fired.push(Fired {
                        handle: entry.handle,
                        argument,
                    });
                }
                _ => {} // stale or cancelled; drop
            }
        }
        fired
    }

    fn drop_stale(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let still_live = matches!(self.live.get(&entry.handle), Some((gen, _)) if *gen == entry.generation);
            if still_live {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_after_delay_elapses() {
        let mut wheel: TimerWheel<&str> = TimerWheel::new();
        let h = wheel.new_handle();
        wheel.start(h, Duration::from_millis(1), "payload");
        std::thread::sleep(Duration::from_millis(5));
        let fired = wheel.poll();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].argument, "payload");
    }

    #[test]
    fn restart_on_same_handle_replaces_the_schedule() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let h = wheel.new_handle();
        wheel.start(h, Duration::from_millis(1), 1);
        wheel.start(h, Duration::from_millis(1), 2);
        std::thread::sleep(Duration::from_millis(5));
        let fired = wheel.poll();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].argument, 2);
    }

    #[test]
    fn cancel_is_idempotent_and_suppresses_firing() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let h = wheel.new_handle();
        wheel.start(h, Duration::from_millis(1), 1);
        wheel.cancel(h);
        wheel.cancel(h);
        std::thread::sleep(Duration::from_millis(5));
        assert!(wheel.poll().is_empty());
    }

    #[test]
    fn next_deadline_reflects_the_soonest_live_timer() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let a = wheel.new_handle();
        let b = wheel.new_handle();
        wheel.start(a, Duration::from_secs(10), 1);
        wheel.start(b, Duration::from_millis(1), 2);
        let d = wheel.next_deadline().unwrap();
        assert!(d < Duration::from_secs(1));
    }

    #[test]
    fn empty_wheel_has_no_deadline() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        assert!(wheel.next_deadline().is_none());
    }

    #[test]
    fn is_scheduled_reflects_cancel_state() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let h = wheel.new_handle();
        assert!(!wheel.is_scheduled(h));
        wheel.start(h, Duration::from_secs(1), 1);
        assert!(wheel.is_scheduled(h));
        wheel.cancel(h);
        assert!(!wheel.is_scheduled(h));
    }
}
