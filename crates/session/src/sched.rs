use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use ahash::{HashSet, HashSetExt};

/// Exponential backoff policy for retryable jobs.
///
/// The first retry fires after `delay`; every further one doubles it,
/// saturating at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub delay: Duration,
    pub max_delay: Duration,
}

/// Backoff applied to all server jobs (activation and Update).
pub const SERVER_RETRYABLE_BACKOFF: RetryBackoff = RetryBackoff {
    delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(120),
};

/// Stable identifier of a scheduled job.
///
/// The owner stores it in an `Option` slot; `Scheduler::cancel` takes the
/// slot so a handle can never be used twice. Cancelling a handle whose job
/// has already fired is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// What a fired job asks the scheduler to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is finished and must not run again.
    Done,
    /// Re-enqueue under the job's backoff policy.
    Retry,
}

struct RetryState {
    next_delay: Duration,
    max_delay: Duration,
}

struct Entry<J> {
    when: Instant,
    seq: u64,
    id: u64,
    retry: Option<RetryState>,
    payload: J,
}

impl<J> PartialEq for Entry<J> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<J> Eq for Entry<J> {}

impl<J> PartialOrd for Entry<J> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<J> Ord for Entry<J> {
    // Reversed so the std max-heap pops the earliest deadline first; `seq`
    // keeps same-instant jobs in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A job popped from the queue, ready to run.
///
/// If the body reports `JobOutcome::Retry`, hand the value back to
/// `Scheduler::requeue_retry`; it keeps its original handle so the owner's
/// stored `TaskHandle` stays valid across retries.
pub struct ReadyJob<J> {
    id: u64,
    retry: Option<RetryState>,
    pub payload: J,
}

/// Monotonic-time job queue.
///
/// Single-threaded cooperative: the embedder pops due jobs from one thread
/// and runs each to completion. Cancellation is tombstone-based, so it
/// races safely with a job that is about to fire.
pub struct Scheduler<J> {
    queue: BinaryHeap<Entry<J>>,
    cancelled: HashSet<u64>,
    next_id: u64,
    next_seq: u64,
}

impl<J> Scheduler<J> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
            next_seq: 0,
        }
    }

    /// Schedule a one-shot job after `delay`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, payload: J) -> TaskHandle {
        self.push(now + delay, None, payload)
    }

    /// Schedule a retryable job after `delay` under the given backoff
    /// policy.
    pub fn schedule_retryable(
        &mut self,
        now: Instant,
        delay: Duration,
        backoff: RetryBackoff,
        payload: J,
    ) -> TaskHandle {
        self.push(
            now + delay,
            Some(RetryState {
                next_delay: backoff.delay,
                max_delay: backoff.max_delay,
            }),
            payload,
        )
    }

    fn push(&mut self, when: Instant, retry: Option<RetryState>, payload: J) -> TaskHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.push_with_id(id, when, retry, payload);
        TaskHandle(id)
    }

    fn push_with_id(&mut self, id: u64, when: Instant, retry: Option<RetryState>, payload: J) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry {
            when,
            seq,
            id,
            retry,
            payload,
        });
    }

    /// Cancel the job referenced by the handle slot, clearing the slot.
    ///
    /// Idempotent: an empty slot or a handle whose job already fired is
    /// left alone.
    pub fn cancel(&mut self, handle: &mut Option<TaskHandle>) {
        if let Some(TaskHandle(id)) = handle.take() {
            if self.queue.iter().any(|entry| entry.id == id) {
                self.cancelled.insert(id);
            }
        }
    }

    /// Pop the next job whose deadline has passed, skipping cancelled
    /// entries.
    pub fn pop_due(&mut self, now: Instant) -> Option<ReadyJob<J>> {
        while let Some(head) = self.queue.peek() {
            if head.when > now {
                return None;
            }
            let Some(entry) = self.queue.pop() else {
                return None;
            };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            return Some(ReadyJob {
                id: entry.id,
                retry: entry.retry,
                payload: entry.payload,
            });
        }
        None
    }

    /// Re-enqueue a retryable job under its backoff policy, doubling the
    /// delay for the next round. One-shot jobs are dropped.
    pub fn requeue_retry(&mut self, now: Instant, job: ReadyJob<J>) {
        let ReadyJob { id, retry, payload } = job;
        let Some(state) = retry else {
            return;
        };
        let delay = state.next_delay;
        let next_delay = (state.next_delay * 2).min(state.max_delay);
        self.push_with_id(
            id,
            now + delay,
            Some(RetryState {
                next_delay,
                max_delay: state.max_delay,
            }),
            payload,
        );
    }

    /// Deadline of the earliest live job, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|entry| !self.cancelled.contains(&entry.id))
            .map(|entry| entry.when)
            .min()
    }

    /// Drop every scheduled job.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.cancelled.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .iter()
            .all(|entry| self.cancelled.contains(&entry.id))
    }
}

impl<J> Default for Scheduler<J> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_fire_in_deadline_order() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        sched.schedule(now, Duration::from_secs(2), "late");
        sched.schedule(now, Duration::from_secs(1), "early");

        assert!(sched.pop_due(now).is_none());
        let at = now + Duration::from_secs(2);
        assert_eq!(sched.pop_due(at).unwrap().payload, "early");
        assert_eq!(sched.pop_due(at).unwrap().payload, "late");
        assert!(sched.pop_due(at).is_none());
    }

    #[test]
    fn cancel_is_idempotent_and_races_safely() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        let mut handle = Some(sched.schedule(now, Duration::ZERO, ()));
        sched.cancel(&mut handle);
        assert!(handle.is_none());
        sched.cancel(&mut handle);
        assert!(sched.pop_due(now).is_none());
        assert!(sched.is_empty());
    }

    #[test]
    fn cancelling_a_fired_handle_is_a_no_op() {
        let mut sched = Scheduler::new();
        let now = Instant::now();
        let mut handle = Some(sched.schedule(now, Duration::ZERO, ()));
        assert!(sched.pop_due(now).is_some());
        sched.cancel(&mut handle);
        // A later job must not be eaten by the stale tombstone.
        sched.schedule(now, Duration::ZERO, ());
        assert!(sched.pop_due(now).is_some());
    }

    #[test]
    fn retry_backoff_doubles_up_to_the_cap() {
        let mut sched = Scheduler::new();
        let mut now = Instant::now();
        let backoff = RetryBackoff {
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        };
        let handle = sched.schedule_retryable(now, Duration::ZERO, backoff, ());

        let mut delays = Vec::new();
        for _ in 0..4 {
            let job = sched.pop_due(now).expect("job due");
            sched.requeue_retry(now, job);
            let deadline = sched.next_deadline().unwrap();
            delays.push(deadline - now);
            now = deadline;
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );

        // The handle survived every retry.
        let mut slot = Some(handle);
        sched.cancel(&mut slot);
        assert!(sched.pop_due(now + Duration::from_secs(60)).is_none());
    }
}
