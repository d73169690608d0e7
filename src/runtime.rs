//! Runtime: micro-threads, mailboxes, and the cooperative scheduler
//!
//! Execution is single-threaded and cooperative: a pass hands each
//! runnable thread up to its cycle budget of `step` calls, in ascending
//! thread-id order. The unit of atomicity is one step; suspension only
//! happens between steps. Sleeps are kept on the monotonic clock so
//! wall-clock adjustments never reorder wakes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Unique micro-thread identifier, issued monotonically.
pub type ThreadId = u64;

/// Steps granted to a thread per scheduler pass.
pub type CycleCount = u32;

pub const CYCLES_LOW: CycleCount = 1;
pub const CYCLES_MED: CycleCount = 10;
pub const CYCLES_HI: CycleCount = 100;

/// What one step means for a scheduled interpreter.
pub trait Implementation {
    /// The value currency of the interpreter: results and messages.
    type Value: Clone;
    type Error;

    fn is_resolved(&self) -> bool;

    /// Advance by one atomic action. Returns true iff work was done.
    fn step(&mut self) -> Result<bool, Self::Error>;

    /// The current result; final once resolved.
    fn result(&self) -> Self::Value;

    /// Offered each incoming message before it is queued; return true to
    /// consume it instead.
    fn on_message(&mut self, _message: Self::Value) -> bool {
        false
    }
}

/// How `run_to_completion` schedules the threads around its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threading {
    /// Run only the target thread
    Single,
    /// Run one pass of all threads per iteration
    Multi,
}

/// Wake time on the monotonic clock; `Never` sleeps until woken
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WakeInstant {
    At(Instant),
    Never,
}

/// A cooperative task: identity, cycle budget, mailbox, and one owned
/// implementation.
pub struct Microthread<I: Implementation> {
    pub id: ThreadId,
    /// Watched threads survive the idle sweep after resolving.
    pub watched: bool,
    pub cycles: CycleCount,
    pub mailbox: VecDeque<I::Value>,
    /// Mirror of this thread's entry in the scheduler's sleep set.
    pub sleep_until: Option<WakeInstant>,
    interp: I,
}

impl<I: Implementation> Microthread<I> {
    fn new(id: ThreadId, cycles: CycleCount, interp: I) -> Self {
        Microthread {
            id,
            watched: false,
            cycles,
            mailbox: VecDeque::new(),
            sleep_until: None,
            interp,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.interp.is_resolved()
    }

    pub fn result(&self) -> I::Value {
        self.interp.result()
    }

    pub fn interp(&self) -> &I {
        &self.interp
    }

    pub fn interp_mut(&mut self) -> &mut I {
        &mut self.interp
    }

    /// Dequeue the oldest mailbox message.
    pub fn pop_message(&mut self) -> Option<I::Value> {
        self.mailbox.pop_front()
    }

    /// Offer a message to the implementation, queueing it when the
    /// implementation declines.
    fn deliver(&mut self, message: I::Value) {
        if !self.interp.on_message(message.clone()) {
            self.mailbox.push_back(message);
        }
    }
}

type YieldHook = Box<dyn FnMut(bool, usize)>;

/// The round-robin executor over a set of micro-threads.
pub struct Scheduler<I: Implementation> {
    /// Id-ordered, so a pass visits threads in ascending id order.
    threads: BTreeMap<ThreadId, Microthread<I>>,
    /// At most one wake entry per thread, mirrored in `wake_order`.
    sleeping: HashMap<ThreadId, WakeInstant>,
    wake_order: BTreeSet<(WakeInstant, ThreadId)>,
    thread_counter: ThreadId,
    yield_hook: Option<YieldHook>,
}

impl<I: Implementation> Scheduler<I> {
    pub fn new() -> Self {
        Scheduler {
            threads: BTreeMap::new(),
            sleeping: HashMap::new(),
            wake_order: BTreeSet::new(),
            thread_counter: 0,
            yield_hook: None,
        }
    }

    /// Create a thread from `factory`, granting `cycles` steps per pass.
    /// New threads are not watched.
    pub fn start<F>(&mut self, cycles: CycleCount, factory: F) -> ThreadId
    where
        F: FnOnce(ThreadId) -> I,
    {
        let id = self.thread_counter;
        self.thread_counter += 1;
        let interp = factory(id);
        self.threads.insert(id, Microthread::new(id, cycles, interp));
        id
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Microthread<I>> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Microthread<I>> {
        self.threads.get_mut(&id)
    }

    pub fn has_threads(&self) -> bool {
        !self.threads.is_empty()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Mark a thread as watched so the idle sweep leaves it in place.
    pub fn watch(&mut self, id: ThreadId) -> bool {
        match self.threads.get_mut(&id) {
            Some(thread) => {
                thread.watched = true;
                true
            }
            None => false,
        }
    }

    /// Deliver a message to a thread's mailbox. Returns false when no
    /// such thread exists.
    pub fn send(&mut self, message: I::Value, id: ThreadId) -> bool {
        match self.threads.get_mut(&id) {
            Some(thread) => {
                thread.deliver(message);
                true
            }
            None => false,
        }
    }

    /// Park a thread until `duration` from now.
    pub fn sleep_for(&mut self, id: ThreadId, duration: Duration) -> bool {
        if !self.threads.contains_key(&id) {
            return false;
        }
        self.set_wake(id, WakeInstant::At(Instant::now() + duration));
        true
    }

    /// Park a thread until an explicit `wake`.
    pub fn sleep_forever(&mut self, id: ThreadId) -> bool {
        if !self.threads.contains_key(&id) {
            return false;
        }
        self.set_wake(id, WakeInstant::Never);
        true
    }

    /// Remove any pending wake entry for the thread.
    pub fn wake(&mut self, id: ThreadId) {
        if let Some(at) = self.sleeping.remove(&id) {
            self.wake_order.remove(&(at, id));
        }
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.sleep_until = None;
        }
    }

    pub fn remove_thread(&mut self, id: ThreadId) {
        self.wake(id);
        self.threads.remove(&id);
    }

    /// Hook invoked at the end of every pass with (any unwatched thread
    /// resolved, threads run); hosts use it to sleep or pump an event
    /// loop when nothing ran.
    pub fn set_yield_hook(&mut self, hook: impl FnMut(bool, usize) + 'static) {
        self.yield_hook = Some(Box::new(hook));
    }

    /// Time until the earliest timed wake. `None` when no thread is
    /// sleeping on a deadline; forever-sleepers have no wake time.
    pub fn time_until_next_wake(&self) -> Option<Duration> {
        self.wake_order.iter().find_map(|(at, _)| match at {
            WakeInstant::At(when) => Some(when.saturating_duration_since(Instant::now())),
            WakeInstant::Never => None,
        })
    }

    fn set_wake(&mut self, id: ThreadId, at: WakeInstant) {
        // Keep at most one entry per thread.
        self.wake(id);
        self.sleeping.insert(id, at);
        self.wake_order.insert((at, id));
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.sleep_until = Some(at);
        }
    }

    /// A thread with no wake entry is runnable; a due entry is consumed
    /// and the thread runs; a future (or Never) entry keeps it parked.
    fn is_thread_runnable(&mut self, id: ThreadId, now: Instant) -> bool {
        let at = match self.sleeping.get(&id) {
            Some(at) => *at,
            None => return true,
        };
        match at {
            WakeInstant::At(when) if when <= now => {
                self.wake(id);
                true
            }
            _ => false,
        }
    }

    /// Give one thread up to its cycle budget of steps, stopping early
    /// only when it resolves or loses its run window. Returns true iff at
    /// least one step was taken.
    fn execute_thread(&mut self, id: ThreadId) -> Result<bool, I::Error> {
        let cycles = match self.threads.get(&id) {
            Some(thread) => thread.cycles,
            None => return Ok(false),
        };
        let mut executed = false;
        for _ in 0..cycles {
            if !self.is_thread_runnable(id, Instant::now()) {
                break;
            }
            let thread = match self.threads.get_mut(&id) {
                Some(thread) => thread,
                None => break,
            };
            if thread.interp.is_resolved() {
                break;
            }
            executed |= thread.interp.step()?;
        }
        Ok(executed)
    }

    /// One pass over all threads in ascending id order. Returns how many
    /// threads actually ran. Step errors propagate; the scheduler does
    /// not catch user-code failures.
    pub fn execute_threads(&mut self) -> Result<usize, I::Error> {
        let ids: Vec<ThreadId> = self.threads.keys().copied().collect();
        let mut threads_run = 0;
        let mut unwatched_resolved = false;
        for id in ids {
            let already_resolved = match self.threads.get(&id) {
                Some(thread) => thread.is_resolved(),
                None => continue,
            };
            if already_resolved {
                if let Some(thread) = self.threads.get(&id) {
                    if !thread.watched {
                        unwatched_resolved = true;
                    }
                }
                continue;
            }
            if self.execute_thread(id)? {
                threads_run += 1;
            }
            if let Some(thread) = self.threads.get(&id) {
                if !thread.watched && thread.is_resolved() {
                    unwatched_resolved = true;
                }
            }
        }
        if unwatched_resolved {
            self.idle();
        }
        if let Some(hook) = self.yield_hook.as_mut() {
            hook(unwatched_resolved, threads_run);
        }
        Ok(threads_run)
    }

    /// Drive one thread until it resolves; `Single` steps only that
    /// thread, `Multi` interleaves full passes. The target is marked
    /// watched so the idle sweep cannot reap it mid-loop.
    pub fn run_to_completion(&mut self, id: ThreadId, mode: Threading) -> Result<(), I::Error> {
        if !self.watch(id) {
            return Ok(());
        }
        loop {
            match self.threads.get(&id) {
                Some(thread) if !thread.is_resolved() => {}
                _ => return Ok(()),
            }
            match mode {
                Threading::Single => {
                    self.execute_thread(id)?;
                }
                Threading::Multi => {
                    self.execute_threads()?;
                }
            }
        }
    }

    /// Reap unwatched resolved threads. Runs outside the pass loop so the
    /// iteration above never sees a mutated map.
    fn idle(&mut self) {
        let finished: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, thread)| !thread.watched && thread.is_resolved())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.wake(id);
            self.threads.remove(&id);
        }
    }
}

impl<I: Implementation> Default for Scheduler<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    /// Counts down to zero, one step at a time.
    struct Countdown {
        remaining: u32,
        steps: u32,
    }

    impl Countdown {
        fn new(remaining: u32) -> Self {
            Countdown { remaining, steps: 0 }
        }
    }

    impl Implementation for Countdown {
        type Value = u32;
        type Error = Infallible;

        fn is_resolved(&self) -> bool {
            self.remaining == 0
        }

        fn step(&mut self) -> Result<bool, Infallible> {
            self.remaining -= 1;
            self.steps += 1;
            Ok(true)
        }

        fn result(&self) -> u32 {
            self.steps
        }
    }

    #[test]
    fn thread_ids_are_monotonic() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.start(CYCLES_MED, |_| Countdown::new(1));
        let b = scheduler.start(CYCLES_MED, |_| Countdown::new(1));
        assert!(b > a);
        assert_eq!(scheduler.thread_count(), 2);
    }

    #[test]
    fn a_pass_spends_at_most_the_cycle_budget() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(3, |_| Countdown::new(100));
        scheduler.watch(id);
        assert_eq!(scheduler.execute_threads().unwrap(), 1);
        assert_eq!(scheduler.thread(id).unwrap().result(), 3);
    }

    #[test]
    fn a_pass_stops_at_resolution() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(4));
        scheduler.watch(id);
        scheduler.execute_threads().unwrap();
        let thread = scheduler.thread(id).unwrap();
        assert!(thread.is_resolved());
        assert_eq!(thread.result(), 4);
    }

    #[test]
    fn unwatched_resolved_threads_are_reaped() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(1));
        scheduler.execute_threads().unwrap();
        assert!(scheduler.thread(id).is_none());
        assert!(!scheduler.has_threads());
    }

    #[test]
    fn watched_threads_survive_the_idle_sweep() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(1));
        scheduler.watch(id);
        scheduler.execute_threads().unwrap();
        scheduler.execute_threads().unwrap();
        assert!(scheduler.thread(id).is_some());
    }

    #[test]
    fn send_reports_missing_threads() {
        let mut scheduler: Scheduler<Countdown> = Scheduler::new();
        assert!(!scheduler.send(7, 42));
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        assert!(scheduler.send(7, id));
        assert_eq!(scheduler.thread_mut(id).unwrap().pop_message(), Some(7));
    }

    #[test]
    fn sleeping_threads_do_not_run() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        scheduler.watch(id);
        scheduler.sleep_for(id, Duration::from_secs(60));
        assert_eq!(scheduler.execute_threads().unwrap(), 0);
        assert_eq!(scheduler.thread(id).unwrap().result(), 0);
    }

    #[test]
    fn wake_clears_the_sleep_entry() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        scheduler.watch(id);
        scheduler.sleep_forever(id);
        assert_eq!(scheduler.execute_threads().unwrap(), 0);
        scheduler.wake(id);
        assert!(scheduler.thread(id).unwrap().sleep_until.is_none());
        assert_eq!(scheduler.execute_threads().unwrap(), 1);
        assert!(scheduler.thread(id).unwrap().is_resolved());
    }

    #[test]
    fn a_new_sleep_replaces_the_old_entry() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        scheduler.watch(id);
        scheduler.sleep_forever(id);
        scheduler.sleep_for(id, Duration::from_millis(0));
        // The earlier forever-sleep must not survive the upsert.
        assert_eq!(scheduler.execute_threads().unwrap(), 1);
    }

    #[test]
    fn remove_thread_erases_thread_and_sleep_entry() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        scheduler.sleep_forever(id);
        scheduler.remove_thread(id);
        assert!(!scheduler.has_threads());
        assert!(!scheduler.sleep_for(id, Duration::from_millis(1)));
    }

    #[test]
    fn run_to_completion_single() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(2, |_| Countdown::new(25));
        scheduler.run_to_completion(id, Threading::Single).unwrap();
        let thread = scheduler.thread(id).unwrap();
        assert!(thread.watched);
        assert_eq!(thread.result(), 25);
    }

    #[test]
    fn run_to_completion_multi_drives_other_threads() {
        let mut scheduler = Scheduler::new();
        let slow = scheduler.start(1, |_| Countdown::new(5));
        let target = scheduler.start(1, |_| Countdown::new(5));
        scheduler.watch(slow);
        scheduler.run_to_completion(target, Threading::Multi).unwrap();
        assert!(scheduler.thread(slow).unwrap().is_resolved());
    }

    #[test]
    fn next_wake_tracks_the_earliest_deadline() {
        let mut scheduler = Scheduler::new();
        let a = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        let b = scheduler.start(CYCLES_MED, |_| Countdown::new(5));
        assert!(scheduler.time_until_next_wake().is_none());
        scheduler.sleep_forever(a);
        assert!(scheduler.time_until_next_wake().is_none());
        scheduler.sleep_for(b, Duration::from_secs(60));
        let until = scheduler.time_until_next_wake().unwrap();
        assert!(until <= Duration::from_secs(60));
        assert!(until > Duration::from_secs(50));
    }

    #[test]
    fn yield_hook_sees_every_pass() {
        use std::cell::Cell as StdCell;
        use std::rc::Rc;

        let passes = Rc::new(StdCell::new(0usize));
        let seen = passes.clone();
        let mut scheduler = Scheduler::new();
        scheduler.set_yield_hook(move |_, _| seen.set(seen.get() + 1));
        scheduler.start(CYCLES_MED, |_| Countdown::new(1));
        scheduler.execute_threads().unwrap();
        scheduler.execute_threads().unwrap();
        assert_eq!(passes.get(), 2);
    }
}
