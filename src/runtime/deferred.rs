use crate::{errors::ServeError, runtime::event_loop::EventLoop};
use std::{cell::RefCell, rc::Rc};

type Waiter<T> = Box<dyn FnOnce(Result<T, ServeError>) + 'static>;

enum State<T> {
    Pending(Vec<Waiter<T>>),
    Settled(Result<T, ServeError>),
}

/// One-shot completion token carrying either a value or a [`ServeError`].
///
/// A deferred settles at most once; later `resolve`/`reject` calls are no-ops.
/// Continuations registered with [`on_settle`](Deferred::on_settle) never run
/// inline: they are enqueued as microtasks on the owning [`EventLoop`], so
/// deferred work interleaves with the loop's phases exactly like
/// [`next_tick`](EventLoop::next_tick).
///
/// Request handlers return `Deferred<()>` ([`DeferredUnit`]) to signal when
/// they are done; rejecting it is how asynchronous handler failures reach the
/// server's recovery path.
///
/// # Examples
///
/// ```no_run
/// use uniserve::{Deferred, EventLoop};
///
/// let lp = EventLoop::new().unwrap();
/// let pending: Deferred<u32> = Deferred::new(&lp);
///
/// pending.on_settle(|result| assert_eq!(result.unwrap(), 7));
/// pending.resolve(7);
/// lp.run();
/// ```
pub struct Deferred<T: Clone + 'static> {
    lp: EventLoop,
    state: Rc<RefCell<State<T>>>,
}

/// The completion token request handlers return.
pub type DeferredUnit = Deferred<()>;

impl<T: Clone + 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            lp: self.lp.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Creates a pending deferred owned by `lp`.
    pub fn new(lp: &EventLoop) -> Self {
        Self {
            lp: lp.clone(),
            state: Rc::new(RefCell::new(State::Pending(Vec::new()))),
        }
    }

    /// Creates an already-resolved deferred.
    pub fn resolved(lp: &EventLoop, value: T) -> Self {
        Self {
            lp: lp.clone(),
            state: Rc::new(RefCell::new(State::Settled(Ok(value)))),
        }
    }

    /// Creates an already-rejected deferred.
    pub fn rejected(lp: &EventLoop, err: ServeError) -> Self {
        Self {
            lp: lp.clone(),
            state: Rc::new(RefCell::new(State::Settled(Err(err)))),
        }
    }

    /// Settles with a value. A no-op if the deferred already settled.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Settles with an error. A no-op if the deferred already settled.
    pub fn reject(&self, err: ServeError) {
        self.settle(Err(err));
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.state.borrow(), State::Settled(_))
    }

    /// Registers a continuation. It runs as a microtask once the deferred
    /// settles (immediately scheduled when it already has).
    pub fn on_settle(&self, callback: impl FnOnce(Result<T, ServeError>) + 'static) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Pending(waiters) => waiters.push(Box::new(callback)),
            State::Settled(result) => {
                let result = result.clone();
                self.lp.next_tick(move || callback(result));
            }
        }
    }

    fn settle(&self, result: Result<T, ServeError>) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Settled(_) => {
                    log::debug!("deferred settled twice; ignoring the later outcome");
                    return;
                }
                State::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Settled(result.clone());
                    waiters
                }
            }
        };

        for waiter in waiters {
            let result = result.clone();
            self.lp.next_tick(move || waiter(result));
        }
    }
}
