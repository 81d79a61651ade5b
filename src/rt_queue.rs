// src/rt_queue.rs
//
// Control-thread-to-RT-thread command channel. Built on `rtrb`'s lock-free
// SPSC ring (the same crate the reelforge-standalone engine uses for its
// cross-thread command path) rather than a hand-rolled ring: this is
// exactly the data structure `rtrb` exists for, and hand-rolling one here
// would be the "bare stdlib where the ecosystem has a way" anti-pattern.
//
// Commands carry their own prepare/execute/cleanup triple, mirroring the
// old `PlanHandoff` double-buffer idea but generalized to arbitrary
// payloads: `prepare` runs on the control thread (may allocate), `execute`
// runs on the RT thread (must not), and `cleanup` runs back on the control
// thread once the RT thread is done with whatever `execute` displaced.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use rtrb::{Consumer, Producer, RingBuffer};

/// Outcome of attempting to run one command on the RT thread. `CallAgainLater`
/// means the command's `execute` needs more room than is currently free
/// (e.g. a destination `MidiBuffer` is full) --- the queue re-enqueues it at
/// the head rather than dropping it, so ordering with respect to later
/// commands is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Done,
    CallAgainLater,
}

pub trait RtCommand: Send {
    /// Runs on the RT thread as a guard immediately before `execute`.
    /// Returning `true` skips `execute` for this command entirely (it is
    /// not retried) but the command still reaches `cleanup` --- a sync
    /// caller blocked on completion must still be unblocked even if there
    /// turned out to be nothing to do.
    fn prepare(&mut self) -> bool {
        false
    }

    /// Runs on the RT thread. Must not allocate, lock, or block. Returns
    /// the outcome plus the cost to charge against the per-drain budget.
    fn execute(&mut self) -> (CommandOutcome, usize);

    /// Runs on the control thread once this command is fully done: after
    /// `execute` returns `Done`, or `prepare` skipped it. Frees any owned
    /// arguments and signals a waiter blocked on [`RtCommandSender::send_sync`].
    fn cleanup(&mut self) {}
}

pub struct RtCommandQueue<C: RtCommand> {
    _marker: std::marker::PhantomData<C>,
}

impl<C: RtCommand> RtCommandQueue<C> {
    /// Builds a paired sender/receiver over two rings of `capacity`: one
    /// control-thread-to-RT for commands, one RT-to-control for cleanup.
    pub fn new(capacity: usize) -> (RtCommandSender<C>, RtCommandReceiver<C>) {
        let (producer, consumer) = RingBuffer::<C>::new(capacity);
        let (cleanup_tx, cleanup_rx) = RingBuffer::<C>::new(capacity);
        (
            RtCommandSender { producer, cleanup_rx },
            RtCommandReceiver { consumer, cleanup_tx, requeued: None },
        )
    }
}

pub struct RtCommandSender<C: RtCommand> {
    producer: Producer<C>,
    cleanup_rx: Consumer<C>,
}

impl<C: RtCommand> RtCommandSender<C> {
    /// Non-blocking, fire-and-forget push from the control thread. Returns
    /// the command back if the ring is full.
    pub fn try_send(&mut self, command: C) -> Result<(), C> {
        self.producer.push(command).map_err(|e| e.0)
    }

    /// Drains commands the RT thread has finished with, running `cleanup`
    /// on each. Call periodically from the control thread (e.g. once per
    /// poll tick) to keep the cleanup ring from backing up; [`Self::send_sync`]
    /// also drives this internally while it waits.
    pub fn drain_cleanup(&mut self) -> usize {
        let mut n = 0;
        while let Ok(mut command) = self.cleanup_rx.pop() {
            command.cleanup();
            n += 1;
        }
        n
    }

    /// Blocking submission: enqueues `command`, then spin-polls
    /// [`Self::drain_cleanup`] until `is_done` reports true. `is_done`
    /// typically closes over a flag `command`'s own `cleanup` sets, so the
    /// caller blocks on its own command's completion rather than on
    /// whatever cleanup happens to run next.
    pub fn send_sync(&mut self, command: C, mut is_done: impl FnMut() -> bool) -> Result<(), C> {
        self.try_send(command)?;
        while !is_done() {
            self.drain_cleanup();
            std::thread::yield_now();
        }
        Ok(())
    }
}

pub struct RtCommandReceiver<C: RtCommand> {
    consumer: Consumer<C>,
    cleanup_tx: Producer<C>,
    requeued: Option<C>,
}

/// Default per-block cost budget (~100 units). Draining is bounded by
/// accumulated `execute` cost, not command count, so a handful of
/// expensive commands and a flood of cheap ones both stay within one
/// block's worth of RT-thread work; anything left over carries into the
/// next block's drain.
pub const DEFAULT_DRAIN_BUDGET: usize = 100;

impl<C: RtCommand> RtCommandReceiver<C> {
    /// Drains commands from the RT thread until accumulated `execute` cost
    /// reaches `cost_budget`, running each through prepare/execute and
    /// posting it to the cleanup ring once done. A command whose `execute`
    /// returns `CallAgainLater` is held and retried first on the next call,
    /// before any new command from the ring is considered, preserving FIFO
    /// order.
    pub fn drain(&mut self, cost_budget: usize) -> usize {
        let mut spent = 0usize;
        let mut ran = 0usize;

        if let Some(command) = self.requeued.take() {
            match self.step(command) {
                Ok(cost) => {
                    spent += cost;
                    ran += 1;
                }
                Err(command) => {
                    self.requeued = Some(command);
                    return ran;
                }
            }
        }

        while spent < cost_budget {
            let Ok(command) = self.consumer.pop() else {
                break;
            };
            match self.step(command) {
                Ok(cost) => {
                    spent += cost;
                    ran += 1;
                }
                Err(command) => {
                    self.requeued = Some(command);
                    break;
                }
            }
        }

        ran
    }

    /// Runs one command's prepare/execute step and posts it to the cleanup
    /// ring once fully done. `Err` means `CallAgainLater`: the caller must
    /// retry this exact command before taking anything new off the ring.
    fn step(&mut self, mut command: C) -> Result<usize, C> {
        if command.prepare() {
            let _ = self.cleanup_tx.push(command);
            return Ok(0);
        }
        match command.execute() {
            (CommandOutcome::Done, cost) => {
                let _ = self.cleanup_tx.push(command);
                Ok(cost)
            }
            (CommandOutcome::CallAgainLater, _) => Err(command),
        }
    }
}

/// Lock-free double-buffer swap, generalizing the old `PlanHandoff`: the
/// control thread builds a new value off to the side and calls
/// [`SwapPointer::install`]; the RT thread calls [`SwapPointer::current`]
/// once per block. No allocation or locking on either side after
/// construction. The previous value is returned to the control thread by
/// `install` so it can be dropped (or recycled) off the RT thread.
pub struct SwapPointer<T> {
    slot: AtomicPtr<T>,
}

unsafe impl<T: Send> Send for SwapPointer<T> {}
unsafe impl<T: Send> Sync for SwapPointer<T> {}

impl<T> SwapPointer<T> {
    pub fn new(initial: Box<T>) -> Self {
        Self {
            slot: AtomicPtr::new(Box::into_raw(initial)),
        }
    }

    /// Control-thread only. Installs `next`, returning the value that was
    /// previously current so the caller can drop it safely off the RT
    /// thread.
    pub fn install(&self, next: Box<T>) -> Box<T> {
        let new_ptr = Box::into_raw(next);
        let old_ptr = self.slot.swap(new_ptr, Ordering::AcqRel);
        unsafe { Box::from_raw(old_ptr) }
    }

    /// RT-thread only. Borrows the currently-installed value.
    ///
    /// # Safety
    /// The caller must ensure no concurrent `install` frees the pointer
    /// while this borrow is alive; in practice this means the RT thread
    /// must finish using the reference before yielding back to a context
    /// where a control-thread `install` could run and this function must
    /// not be called from more than one RT thread concurrently.
    pub unsafe fn current(&self) -> &T {
        let ptr = self.slot.load(Ordering::Acquire);
        &*ptr
    }

    /// RT-thread only, mutable. Same contract as [`Self::current`], plus:
    /// the RT thread is the sole reader/writer of the pointee between
    /// installs, so a mutable borrow here is sound as long as nothing else
    /// holds a `current()`/`current_mut()` borrow concurrently.
    ///
    /// # Safety
    /// Same obligations as [`Self::current`].
    pub unsafe fn current_mut(&self) -> &mut T {
        let ptr = self.slot.load(Ordering::Acquire);
        &mut *ptr
    }
}

impl<T> Drop for SwapPointer<T> {
    fn drop(&mut self) {
        let ptr = self.slot.load(Ordering::Acquire);
        if !ptr.is_null() {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

/// Paired with [`SwapPointer`] for the common case of swapping a `(pointer,
/// count)` pair atomically --- e.g. an active-voice array and its length ---
/// without a second synchronization point. Generalizes the old
/// `PlanHandoff`'s `read_index: AtomicUsize` into a reusable primitive.
pub struct SwapPointerAndCount<T> {
    inner: SwapPointer<Vec<T>>,
    count: AtomicUsize,
}

impl<T> SwapPointerAndCount<T> {
    pub fn new(initial: Vec<T>) -> Self {
        let count = initial.len();
        Self {
            inner: SwapPointer::new(Box::new(initial)),
            count: AtomicUsize::new(count),
        }
    }

    pub fn install(&self, next: Vec<T>) -> Box<Vec<T>> {
        self.count.store(next.len(), Ordering::Release);
        self.inner.install(Box::new(next))
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// # Safety
    /// Same obligations as [`SwapPointer::current`].
    pub unsafe fn current(&self) -> &[T] {
        self.inner.current().as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountOnce {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        fail_first: bool,
        cost: usize,
        skip: bool,
        cleaned_up: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
    }

    impl CountOnce {
        fn new(calls: std::sync::Arc<std::sync::atomic::AtomicUsize>) -> Self {
            Self { calls, fail_first: false, cost: 1, skip: false, cleaned_up: None }
        }
    }

    impl RtCommand for CountOnce {
        fn prepare(&mut self) -> bool {
            self.skip
        }

        fn execute(&mut self) -> (CommandOutcome, usize) {
            if self.fail_first {
                self.fail_first = false;
                return (CommandOutcome::CallAgainLater, 0);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            (CommandOutcome::Done, self.cost)
        }

        fn cleanup(&mut self) {
            if let Some(flag) = &self.cleaned_up {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn drain_runs_up_to_cost_budget() {
        let (mut tx, mut rx) = RtCommandQueue::<CountOnce>::new(16);
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            tx.try_send(CountOnce::new(calls.clone())).unwrap();
        }
        let ran = rx.drain(3);
        assert_eq!(ran, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let ran2 = rx.drain(10);
        assert_eq!(ran2, 2);
    }

    #[test]
    fn drain_budget_accounts_for_execute_cost_not_command_count() {
        let (mut tx, mut rx) = RtCommandQueue::<CountOnce>::new(16);
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let mut cmd = CountOnce::new(calls.clone());
            cmd.cost = 40;
            tx.try_send(cmd).unwrap();
        }
        // budget 100, cost 40 each: two commands fit (80), the third doesn't.
        let ran = rx.drain(100);
        assert_eq!(ran, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn call_again_later_is_retried_before_new_commands() {
        let (mut tx, mut rx) = RtCommandQueue::<CountOnce>::new(16);
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let mut first = CountOnce::new(calls.clone());
        first.fail_first = true;
        tx.try_send(first).unwrap();
        tx.try_send(CountOnce::new(calls.clone())).unwrap();

        let ran = rx.drain(10);
        // first command's initial execute() returns CallAgainLater and does
        // not count; its retry plus the second command both succeed.
        assert_eq!(ran, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prepare_skip_bypasses_execute_but_still_cleans_up() {
        let (mut tx, mut rx) = RtCommandQueue::<CountOnce>::new(16);
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let cleaned_up = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut cmd = CountOnce::new(calls.clone());
        cmd.skip = true;
        cmd.cleaned_up = Some(cleaned_up.clone());
        tx.try_send(cmd).unwrap();

        let ran = rx.drain(10);
        assert_eq!(ran, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tx.drain_cleanup();
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[test]
    fn send_sync_blocks_until_cleanup_runs() {
        let (mut tx, mut rx) = RtCommandQueue::<CountOnce>::new(16);
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let cleaned_up = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut cmd = CountOnce::new(calls.clone());
        cmd.cleaned_up = Some(cleaned_up.clone());

        // A real sync caller would run `rx.drain` from the RT thread
        // concurrently; here we just run it once before `send_sync` is
        // called, since this test has no second thread. `send_sync`'s
        // internal `drain_cleanup` polling is what actually flips the flag.
        tx.try_send(cmd).unwrap();
        rx.drain(10);
        let flag = cleaned_up.clone();
        tx.send_sync(CountOnce::new(calls.clone()), move || flag.load(Ordering::SeqCst))
            .unwrap();
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[test]
    fn swap_pointer_installs_and_reads() {
        let sp = SwapPointer::new(Box::new(1u32));
        assert_eq!(unsafe { *sp.current() }, 1);
        let old = sp.install(Box::new(2));
        assert_eq!(*old, 1);
        assert_eq!(unsafe { *sp.current() }, 2);
    }

    #[test]
    fn swap_pointer_current_mut_writes_through() {
        let sp = SwapPointer::new(Box::new(1u32));
        unsafe {
            *sp.current_mut() += 41;
        }
        assert_eq!(unsafe { *sp.current() }, 42);
    }

    #[test]
    fn swap_pointer_and_count_tracks_len() {
        let spc = SwapPointerAndCount::new(vec![1, 2, 3]);
        assert_eq!(spc.count(), 3);
        spc.install(vec![4, 5]);
        assert_eq!(spc.count(), 2);
        assert_eq!(unsafe { spc.current() }, &[4, 5]);
    }
}
