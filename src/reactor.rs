//! The single-threaded readiness-and-timer reactor (`Loop`).
//!
//! Built on `mio::Poll` rather than a hand-rolled epoll/self-pipe shim —
//! `mio::Waker` already *is* the self-pipe wakeup this design calls for
//! (see `hdds-team-hdds`'s `transport::tcp::io_thread`, which solves the
//! identical problem the same way).
//!
//! Handlers are reference-counted, interior-mutable trait objects
//! (`Rc<RefCell<dyn Handler>>`): the reactor does not own them, matching
//! the ownership rule in the data model ("the object owning a handler
//! guarantees it outlives any fd attachment"). Because dispatch can be
//! re-entrant (a handler's own `on_readable` re-dispatching a `Message`
//! event derived from what it just read), `Loop::dispatch` never holds a
//! borrow across a handler call, and a handler that is mid-call on its own
//! `RefCell` must use `dispatch_promiscuous` rather than `dispatch` to
//! notify observers of its own derived events — `dispatch` additionally
//! re-enters the fd-specific handler, which would double-borrow `self`.

use mio::{Events, Interest, Poll, Token, Waker};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::Event;
use crate::handler::Handler;

const WAKER_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    AlreadyAttached,
    NotAttached,
    WaitFailed(String),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::AlreadyAttached => write!(f, "fd already attached"),
            ReactorError::NotAttached => write!(f, "fd not attached"),
            ReactorError::WaitFailed(msg) => write!(f, "reactor wait failed: {msg}"),
        }
    }
}

impl std::error::Error for ReactorError {}

type SharedHandler = Rc<RefCell<dyn Handler>>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Box<dyn FnOnce()>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so a BinaryHeap (a max-heap) pops the earliest deadline
        // first; equal deadlines fall back to enqueue order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct LoopInner {
    poll: Poll,
    read_handlers: std::collections::HashMap<Token, SharedHandler>,
    write_handlers: std::collections::HashMap<Token, SharedHandler>,
    registered: HashSet<Token>,
    promiscuous: Vec<(u64, SharedHandler)>,
    next_promiscuous_id: u64,
    timers: BinaryHeap<TimerEntry>,
    next_timer_seq: u64,
    next_token_id: usize,
    waker: Arc<Waker>,
}

/// The reactor. Cheaply `Clone`-able; clones share the same underlying
/// state, since handlers hold a `Loop` to re-enter it (schedule timers,
/// re-dispatch events, register their sockets).
#[derive(Clone)]
pub struct Loop(Rc<RefCell<LoopInner>>);

impl Loop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Loop(Rc::new(RefCell::new(LoopInner {
            poll,
            read_handlers: std::collections::HashMap::new(),
            write_handlers: std::collections::HashMap::new(),
            registered: HashSet::new(),
            promiscuous: Vec::new(),
            next_promiscuous_id: 0,
            timers: BinaryHeap::new(),
            next_timer_seq: 0,
            next_token_id: 0,
            waker,
        }))))
    }

    /// Allocate a fresh, reactor-unique token for a not-yet-registered fd.
    pub fn next_token(&self) -> Token {
        let mut inner = self.0.borrow_mut();
        let id = inner.next_token_id;
        inner.next_token_id += 1;
        Token(id)
    }

    /// A cloneable, thread-safe waker — the cross-thread submission path
    /// the `Worker` façade uses to pull the reactor out of its wait after
    /// enqueuing a command on its channel.
    pub fn waker(&self) -> Arc<Waker> {
        self.0.borrow().waker.clone()
    }

    pub fn attach_read(
        &self,
        token: Token,
        handler: SharedHandler,
        source: &mut dyn mio::event::Source,
    ) -> Result<(), ReactorError> {
        let mut inner = self.0.borrow_mut();
        if inner.read_handlers.contains_key(&token) {
            return Err(ReactorError::AlreadyAttached);
        }
        Self::register_interest(&mut inner, token, source, Interest::READABLE)?;
        inner.read_handlers.insert(token, handler);
        Ok(())
    }

    pub fn attach_write_once(
        &self,
        token: Token,
        handler: SharedHandler,
        source: &mut dyn mio::event::Source,
    ) -> Result<(), ReactorError> {
        let mut inner = self.0.borrow_mut();
        if inner.write_handlers.contains_key(&token) {
            return Err(ReactorError::AlreadyAttached);
        }
        Self::register_interest(&mut inner, token, source, Interest::WRITABLE)?;
        inner.write_handlers.insert(token, handler);
        Ok(())
    }

    fn register_interest(
        inner: &mut LoopInner,
        token: Token,
        source: &mut dyn mio::event::Source,
        interest: Interest,
    ) -> Result<(), ReactorError> {
        let result = if inner.registered.contains(&token) {
            inner.poll.registry().reregister(source, token, interest)
        } else {
            inner.poll.registry().register(source, token, interest)
        };
        result.map_err(|e| ReactorError::WaitFailed(e.to_string()))?;
        inner.registered.insert(token);
        Ok(())
    }

    /// Detach `token`'s bookkeeping from both handler maps. Callers must
    /// deregister and close their own fd afterward — the reactor never
    /// owns the socket.
    pub fn detach(&self, token: Token) -> Option<SharedHandler> {
        let mut inner = self.0.borrow_mut();
        inner.registered.remove(&token);
        let read = inner.read_handlers.remove(&token);
        let write = inner.write_handlers.remove(&token);
        read.or(write)
    }

    pub fn deregister(&self, source: &mut dyn mio::event::Source) {
        let inner = self.0.borrow();
        let _ = inner.poll.registry().deregister(source);
    }

    pub fn attach_promiscuous(&self, handler: SharedHandler) -> u64 {
        let mut inner = self.0.borrow_mut();
        let id = inner.next_promiscuous_id;
        inner.next_promiscuous_id += 1;
        inner.promiscuous.push((id, handler));
        id
    }

    pub fn detach_promiscuous(&self, id: u64) {
        let mut inner = self.0.borrow_mut();
        inner.promiscuous.retain(|(existing, _)| *existing != id);
    }

    /// Enqueue `task` to run after `delay` has elapsed, waking the reactor
    /// if it is currently blocked in `run_once`'s wait.
    pub fn push_work(&self, delay: Duration, task: impl FnOnce() + 'static) {
        let mut inner = self.0.borrow_mut();
        let seq = inner.next_timer_seq;
        inner.next_timer_seq += 1;
        inner.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        let _ = inner.waker.wake();
    }

    /// Deliver `event` to the fd-specific handler (if one is attached for
    /// `event.fd()`) and then to every promiscuous handler, in registration
    /// order. Do not call this from inside a handler method that is
    /// re-dispatching an event about its own fd — use
    /// `dispatch_promiscuous` there instead (see module docs).
    pub fn dispatch(&self, event: Event) {
        let fd_handler = {
            let inner = self.0.borrow();
            inner.read_handlers.get(&event.fd()).cloned()
        };
        if let Some(handler) = fd_handler {
            Self::deliver(&handler, &event);
        }
        self.dispatch_promiscuous(event);
    }

    /// Deliver `event` only to the promiscuous handler set.
    pub fn dispatch_promiscuous(&self, event: Event) {
        let subscribers = {
            let inner = self.0.borrow();
            inner.promiscuous.iter().map(|(_, h)| h.clone()).collect::<Vec<_>>()
        };
        for handler in subscribers {
            Self::deliver(&handler, &event);
        }
    }

    /// Invoke a handler method for `event`, isolating the reactor from a
    /// handler panic: caught and logged at WARN rather than unwinding
    /// through `run_once` and taking the whole reactor thread down with it.
    fn deliver(handler: &SharedHandler, event: &Event) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut h = handler.borrow_mut();
            match event {
                Event::Connected { fd, addr } => h.on_connected(*fd, *addr),
                Event::Readable { fd } => h.on_readable(*fd),
                Event::Writable { fd } => h.on_writable(*fd),
                Event::Read { fd, addr, data } => h.on_read(*fd, *addr, data),
                Event::Message { fd, addr, msg } => h.on_message(*fd, *addr, msg),
                Event::Close { fd, addr } => h.on_close(*fd, *addr),
            }
        }));
        if result.is_err() {
            tracing::warn!(?event, "handler panicked; reactor continuing");
        }
    }

    /// One reactor tick: drain expired timers (earliest deadline first),
    /// wait for readiness bounded by `timeout` or the next timer deadline
    /// (whichever is sooner), then dispatch `Readable`/`Writable` events
    /// for whatever fired.
    pub fn run_once(&self, timeout: Duration) -> Result<(), ReactorError> {
        self.drain_expired_timers();

        let wait = self.next_wait(timeout);

        let mut events = Events::with_capacity(128);
        {
            let mut inner = self.0.borrow_mut();
            if let Err(e) = inner.poll.poll(&mut events, Some(wait)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(ReactorError::WaitFailed(e.to_string()));
            }
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            if event.is_readable() {
                self.fire_readable(token);
            }
            if event.is_writable() {
                self.fire_writable(token);
            }
        }

        // Timers enqueued by the handlers we just ran (e.g. a just-failed
        // connect scheduling a retry) should not wait for the next tick.
        self.drain_expired_timers();
        Ok(())
    }

    fn drain_expired_timers(&self) {
        loop {
            let due = {
                let mut inner = self.0.borrow_mut();
                match inner.timers.peek() {
                    Some(top) if top.deadline <= Instant::now() => {
                        inner.timers.pop().map(|t| t.task)
                    }
                    _ => None,
                }
            };
            match due {
                Some(task) => {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::warn!("delayed work panicked; reactor continuing");
                    }
                }
                None => break,
            }
        }
    }

    fn next_wait(&self, timeout: Duration) -> Duration {
        let inner = self.0.borrow();
        match inner.timers.peek() {
            Some(top) => {
                let until = top.deadline.saturating_duration_since(Instant::now());
                until.min(timeout)
            }
            None => timeout,
        }
    }

    /// Dispatch a `Readable` event through the normal fd-handler +
    /// promiscuous-set path (spec.md §3/§4.2: every dispatched event,
    /// including readiness events, reaches the promiscuous handler set).
    /// `dispatch` itself looks the handler up in `read_handlers`, which is
    /// exactly where a readable fd's handler lives.
    fn fire_readable(&self, token: Token) {
        self.dispatch(Event::Readable { fd: token });
    }

    /// Deliver a `Writable` event to the one-shot handler and to every
    /// promiscuous subscriber, then drop the registration. The handler is
    /// removed from `write_handlers` *before* it runs — not after — so that
    /// a handler which re-registers for writability from inside its own
    /// `on_writable` (a failed non-blocking connect retrying) doesn't have
    /// its fresh registration clobbered by this call's own cleanup.
    fn fire_writable(&self, token: Token) {
        let handler = {
            let mut inner = self.0.borrow_mut();
            inner.write_handlers.remove(&token)
        };
        let event = Event::Writable { fd: token };
        if let Some(handler) = &handler {
            Self::deliver(handler, &event);
        }
        self.dispatch_promiscuous(event);
    }
}
