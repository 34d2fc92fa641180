use crate::runtime::timer::{Thunk, TimerFlag, TimerQueue, TimerState, TimerTask};
use crossbeam::queue::SegQueue;
use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
    sync::Arc,
    time::{Duration, Instant},
};

// The waker owns this token; readiness events carrying it only interrupt the
// poll. Registration tokens are handed out starting at 1.
const WAKE_TOKEN: Token = Token(0);

// Upper bound on a single poll when no timer is armed, so the loop still
// notices cross-thread wakeups and stop flags at a bounded cadence.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3);

const EVENTS_CAPACITY: usize = 1024;

/// Readiness snapshot delivered to a registered I/O callback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub(crate) readable: bool,
}

pub(crate) type IoCallback = Rc<dyn Fn(Ready)>;

type SendThunk = Box<dyn FnOnce() + Send + 'static>;

// Work injected from other threads. Queues are many-producer; the loop thread
// is the only consumer and drains them into its local queues each iteration.
struct Injector {
    microtasks: SegQueue<SendThunk>,
    immediates: SegQueue<SendThunk>,
    timeouts: SegQueue<(Duration, SendThunk)>,
    waker: Waker,
}

pub(crate) struct LoopInner {
    microtasks: RefCell<VecDeque<Thunk>>,
    immediates: RefCell<VecDeque<Thunk>>,
    timers: RefCell<TimerQueue>,
    io_callbacks: RefCell<HashMap<Token, IoCallback>>,
    refs: Cell<i64>,
    stopped: Cell<bool>,
    next_token: Cell<usize>,
    poll: RefCell<Poll>,
    registry: Registry,
    injector: Arc<Injector>,
}

/// Single-threaded cooperative scheduler with four task classes and a fixed
/// phase order per iteration:
///
/// 1. microtasks drain to empty (including ones enqueued while draining);
/// 2. quiescence check — ref count ≤ 0 with no microtask and no immediate
///    pending ends [`run`](EventLoop::run);
/// 3. I/O poll, bounded by the nearest timer deadline (or a short default);
/// 4. expired timers fire in deadline order, insertion order on ties;
/// 5. ready I/O callbacks run in the poll's reported order;
/// 6. immediates run last.
///
/// Microtask draining is interleaved after every individual timer, I/O
/// callback, and immediate, so a microtask enqueued inside a macrotask always
/// runs before the next macrotask.
///
/// The liveness rule is a reference count: live connections, the listening
/// socket, and every armed timeout each hold one ref. `run` returns once the
/// count reaches zero and nothing is queued.
///
/// Handles are cheap clones sharing one loop; everything executes on the
/// thread that called `run`. Panics inside callbacks are caught at the phase
/// boundary and logged — they never abort the loop.
///
/// # Examples
///
/// ```
/// use uniserve::EventLoop;
/// use std::{cell::RefCell, rc::Rc, time::Duration};
///
/// let lp = EventLoop::new().unwrap();
/// let order = Rc::new(RefCell::new(Vec::new()));
///
/// let o = order.clone();
/// lp.set_timeout(Duration::ZERO, move || o.borrow_mut().push("timeout"));
/// let o = order.clone();
/// lp.next_tick(move || o.borrow_mut().push("tick"));
///
/// lp.run();
/// assert_eq!(*order.borrow(), ["tick", "timeout"]);
/// ```
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop with its own poller. Fails only if the OS refuses the
    /// poll or waker file descriptors.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;

        Ok(Self {
            inner: Rc::new(LoopInner {
                microtasks: RefCell::new(VecDeque::new()),
                immediates: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerQueue::new()),
                io_callbacks: RefCell::new(HashMap::new()),
                refs: Cell::new(0),
                stopped: Cell::new(false),
                next_token: Cell::new(1),
                poll: RefCell::new(poll),
                registry,
                injector: Arc::new(Injector {
                    microtasks: SegQueue::new(),
                    immediates: SegQueue::new(),
                    timeouts: SegQueue::new(),
                    waker,
                }),
            }),
        })
    }

    /// Enqueues a microtask: it runs before any timer, I/O callback, or
    /// immediate, in FIFO order relative to other microtasks.
    pub fn next_tick(&self, thunk: impl FnOnce() + 'static) {
        self.inner.microtasks.borrow_mut().push_back(Box::new(thunk));
        self.wake();
    }

    /// Enqueues a callback for the tail of the iteration, after the I/O poll
    /// and any expired timers.
    pub fn set_immediate(&self, thunk: impl FnOnce() + 'static) {
        self.inner.immediates.borrow_mut().push_back(Box::new(thunk));
        self.wake();
    }

    /// Arms a one-shot timer. The armed timer holds one loop ref, released by
    /// whichever of firing and [`TimerHandle::cancel`] happens first.
    pub fn set_timeout(&self, delay: Duration, thunk: impl FnOnce() + 'static) -> TimerHandle {
        let flag = TimerFlag::armed();
        self.add_ref();
        self.inner.timers.borrow_mut().insert(
            Instant::now() + delay,
            flag.clone(),
            TimerTask::Once(Some(Box::new(thunk))),
        );
        self.wake();
        TimerHandle {
            flag,
            lp: Rc::downgrade(&self.inner),
        }
    }

    /// Arms a repeating timer: after each firing it rearms for `period` from
    /// that moment. The interval holds a single loop ref for its whole
    /// lifetime, released by [`TimerHandle::cancel`].
    pub fn set_interval(&self, period: Duration, callback: impl FnMut() + 'static) -> TimerHandle {
        let flag = TimerFlag::armed();
        self.add_ref();
        self.inner.timers.borrow_mut().insert(
            Instant::now() + period,
            flag.clone(),
            TimerTask::Interval {
                period,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        self.wake();
        TimerHandle {
            flag,
            lp: Rc::downgrade(&self.inner),
        }
    }

    /// Takes one liveness ref, keeping [`run`](EventLoop::run) going.
    pub fn add_ref(&self) {
        self.inner.refs.set(self.inner.refs.get() + 1);
    }

    /// Releases one liveness ref. Balancing is the caller's responsibility; a
    /// count driven below what was taken is a programmer error.
    pub fn unref(&self) {
        self.inner.refs.set(self.inner.refs.get() - 1);
    }

    pub fn ref_count(&self) -> i64 {
        self.inner.refs.get()
    }

    /// Requests an early exit: the current iteration finishes, then `run`
    /// returns regardless of pending work. Callable from loop callbacks.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
        self.wake();
    }

    /// Handle for scheduling work from other threads.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            injector: self.inner.injector.clone(),
        }
    }

    /// Drives the loop until it is quiescent (ref count zero, nothing queued)
    /// or [`stop`](EventLoop::stop) is called.
    pub fn run(&self) {
        let inner = &self.inner;
        loop {
            self.drain_injected();
            self.drain_microtasks();

            if inner.stopped.get() {
                break;
            }
            if inner.refs.get() <= 0
                && inner.microtasks.borrow().is_empty()
                && inner.immediates.borrow().is_empty()
            {
                break;
            }

            let timeout = self.poll_timeout();
            let ready = self.poll_io(timeout);
            self.drain_injected();

            self.fire_timers();
            self.dispatch_io(ready);
            self.run_immediates();

            if inner.stopped.get() {
                break;
            }
        }
        log::debug!("event loop exited (refs={})", inner.refs.get());
    }

    /// Registers an I/O source for readiness callbacks. The source is placed
    /// in non-blocking mode by mio's registration contract.
    pub(crate) fn register(
        &self,
        source: &mut impl Source,
        interest: Interest,
        callback: IoCallback,
    ) -> io::Result<Token> {
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);
        self.inner.registry.register(source, token, interest)?;
        self.inner.io_callbacks.borrow_mut().insert(token, callback);
        Ok(token)
    }

    pub(crate) fn deregister(&self, token: Token, source: &mut impl Source) {
        self.inner.io_callbacks.borrow_mut().remove(&token);
        if let Err(err) = self.inner.registry.deregister(source) {
            log::debug!("deregister of {:?} failed: {}", token, err);
        }
    }

    fn wake(&self) {
        if let Err(err) = self.inner.injector.waker.wake() {
            log::error!("poller wakeup failed: {}", err);
        }
    }

    fn drain_injected(&self) {
        let injector = &self.inner.injector;
        while let Some(thunk) = injector.microtasks.pop() {
            self.inner.microtasks.borrow_mut().push_back(thunk);
        }
        while let Some(thunk) = injector.immediates.pop() {
            self.inner.immediates.borrow_mut().push_back(thunk);
        }
        while let Some((delay, thunk)) = injector.timeouts.pop() {
            let _ = self.set_timeout(delay, thunk);
        }
    }

    fn drain_microtasks(&self) {
        loop {
            let thunk = self.inner.microtasks.borrow_mut().pop_front();
            match thunk {
                Some(thunk) => run_guarded("microtask", thunk),
                None => break,
            }
        }
    }

    fn poll_timeout(&self) -> Duration {
        let inner = &self.inner;
        if !inner.microtasks.borrow().is_empty()
            || !inner.immediates.borrow().is_empty()
            || !inner.injector.microtasks.is_empty()
            || !inner.injector.immediates.is_empty()
        {
            return Duration::ZERO;
        }
        match inner.timers.borrow_mut().next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => DEFAULT_POLL_TIMEOUT,
        }
    }

    fn poll_io(&self, timeout: Duration) -> Vec<(Token, Ready)> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let result = self
            .inner
            .poll
            .borrow_mut()
            .poll(&mut events, Some(timeout));
        if let Err(err) = result {
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("i/o poll failed: {}", err);
            }
            return Vec::new();
        }

        events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| {
                (
                    event.token(),
                    Ready {
                        readable: event.is_readable() || event.is_read_closed(),
                    },
                )
            })
            .collect()
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        // Timers armed by the callbacks below wait for the next iteration.
        let horizon = self.inner.timers.borrow().next_seq();
        loop {
            self.drain_microtasks();
            let entry = self.inner.timers.borrow_mut().pop_due(now, horizon);
            let Some(entry) = entry else { break };

            match entry.task {
                TimerTask::Once(thunk) => {
                    entry.flag.set(TimerState::Fired);
                    self.unref();
                    if let Some(thunk) = thunk {
                        run_guarded("timer", thunk);
                    }
                }
                TimerTask::Interval { period, callback } => {
                    run_guarded("interval", || (&mut *callback.borrow_mut())());
                    if entry.flag.get() == TimerState::Armed {
                        self.inner.timers.borrow_mut().insert(
                            Instant::now() + period,
                            entry.flag,
                            TimerTask::Interval { period, callback },
                        );
                    }
                }
            }
        }
    }

    fn dispatch_io(&self, ready: Vec<(Token, Ready)>) {
        for (token, readiness) in ready {
            // The callback may have been deregistered by an earlier one in
            // the same batch.
            let callback = self.inner.io_callbacks.borrow().get(&token).cloned();
            if let Some(callback) = callback {
                run_guarded("i/o callback", || (*callback)(readiness));
                self.drain_microtasks();
            }
        }
    }

    fn run_immediates(&self) {
        loop {
            let thunk = self.inner.immediates.borrow_mut().pop_front();
            match thunk {
                Some(thunk) => {
                    run_guarded("immediate", thunk);
                    self.drain_microtasks();
                }
                None => break,
            }
        }
    }
}

/// Cancellation handle for [`set_timeout`](EventLoop::set_timeout) and
/// [`set_interval`](EventLoop::set_interval).
#[derive(Clone)]
pub struct TimerHandle {
    flag: Rc<TimerFlag>,
    lp: Weak<LoopInner>,
}

impl TimerHandle {
    /// Cancels the timer and releases its loop ref. Idempotent, and a no-op
    /// once the timer has fired: exactly one of cancellation and firing takes
    /// effect.
    pub fn cancel(&self) {
        if self.flag.get() != TimerState::Armed {
            return;
        }
        self.flag.set(TimerState::Cancelled);
        if let Some(inner) = self.lp.upgrade() {
            inner.refs.set(inner.refs.get() - 1);
        }
    }
}

/// Cross-thread scheduling handle, obtained from
/// [`EventLoop::remote`]. Enqueues go through many-producer queues and wake
/// the poller; the callbacks themselves still run on the loop thread.
#[derive(Clone)]
pub struct RemoteHandle {
    injector: Arc<Injector>,
}

impl RemoteHandle {
    pub fn next_tick(&self, thunk: impl FnOnce() + Send + 'static) {
        self.injector.microtasks.push(Box::new(thunk));
        self.wake();
    }

    pub fn set_immediate(&self, thunk: impl FnOnce() + Send + 'static) {
        self.injector.immediates.push(Box::new(thunk));
        self.wake();
    }

    pub fn set_timeout(&self, delay: Duration, thunk: impl FnOnce() + Send + 'static) {
        self.injector.timeouts.push((delay, Box::new(thunk)));
        self.wake();
    }

    fn wake(&self) {
        if let Err(err) = self.injector.waker.wake() {
            log::error!("poller wakeup failed: {}", err);
        }
    }
}

fn run_guarded(what: &str, thunk: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(thunk)) {
        log::error!("{} panicked: {}", what, panic_message(payload.as_ref()));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
