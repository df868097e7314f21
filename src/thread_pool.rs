use std::sync::Arc;

use log::debug;

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

/// A fixed set of I/O loop threads with round-robin hand-out.
///
/// The pool is driven entirely from the base loop's thread (the acceptor's
/// thread is the sole caller of [`next_loop`](EventLoopThreadPool::next_loop)),
/// so the round-robin cursor needs no synchronization.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    /// Creates an empty pool dispatching to `base_loop` until started.
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Sets the number of I/O loop threads; call before
    /// [`start`](EventLoopThreadPool::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawns the loop threads, running `init` on each loop's own thread.
    /// With zero threads, `init` runs on the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "thread pool already started");
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread = EventLoopThread::new(init.clone(), format!("{}{}", self.name, i));
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }
        debug!("pool {} started {} loop threads", self.name, self.num_threads);

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
    }

    /// Picks the loop for the next connection: round-robin over the pool,
    /// or the base loop when the pool is empty.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let picked = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }
        picked
    }

    /// All loops handing out connections: the pool, or just the base loop.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    /// Whether [`start`](EventLoopThreadPool::start) has run.
    pub fn started(&self) -> bool {
        self.started
    }
}
