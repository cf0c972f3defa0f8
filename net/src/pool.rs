use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::callbacks::ThreadInitCallback;
use crate::error::Error;
use crate::event_loop::EventLoop;

/// A pool of worker event loops, one per thread, handed out round-robin.
///
/// With zero workers the pool degenerates to the base loop: the acceptor and
/// every connection share the caller's thread (single-reactor mode).
pub struct LoopPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: AtomicUsize,
    started: AtomicBool,
    next: AtomicUsize,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopPool {
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> LoopPool {
        LoopPool {
            base_loop,
            name: name.to_string(),
            num_threads: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            loops: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads to spawn at [`start`](LoopPool::start).
    pub fn set_thread_num(&self, n: usize) {
        self.num_threads.store(n, Ordering::Release);
    }

    /// Spawn the workers. Each thread builds its own loop, runs the init
    /// callback, publishes the loop handle back to this thread, and enters
    /// `run()`. Returns once every worker has published (or the first one
    /// failed to come up). With zero workers the init callback runs once on
    /// the base loop.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "loop pool started twice"
        );

        let n = self.num_threads.load(Ordering::Acquire);
        for i in 0..n {
            let thread_name = format!("{}-loop-{}", self.name, i);
            let init = init.clone();
            let (tx, rx) = crossbeam_channel::bounded::<Result<Arc<EventLoop>, Error>>(1);

            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let event_loop = match EventLoop::new() {
                        Ok(event_loop) => event_loop,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    if let Some(init) = &init {
                        init(&event_loop);
                    }
                    let _ = tx.send(Ok(event_loop.clone()));
                    event_loop.run();
                })
                .map_err(|e| Error::ThreadStart(format!("spawn {thread_name}: {e}")))?;
            self.threads.lock().push(handle);

            match rx.recv() {
                Ok(Ok(event_loop)) => self.loops.lock().push(event_loop),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::ThreadStart(format!(
                        "worker {i} exited before publishing its loop"
                    )));
                }
            }
        }

        if n == 0 {
            if let Some(init) = &init {
                init(&self.base_loop);
            }
        }
        info!(name = %self.name, workers = n, "loop pool started");
        Ok(())
    }

    /// The loop the next connection should live on: the base loop when there
    /// are no workers, otherwise strict round-robin over the workers.
    pub fn next(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let i = self.next.fetch_add(1, Ordering::AcqRel) % loops.len();
            loops[i].clone()
        }
    }

    /// Every loop connections can land on: the workers, or the base loop
    /// when the pool is empty.
    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        for event_loop in self.loops.lock().drain(..) {
            event_loop.quit();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        debug!(name = %self.name, "loop pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let pool = LoopPool::new(base.clone(), "t");
        pool.start(None).unwrap();
        for _ in 0..3 {
            assert!(Arc::ptr_eq(&pool.next(), &base));
        }
        assert_eq!(pool.all_loops().len(), 1);
    }

    #[test]
    fn workers_are_handed_out_round_robin() {
        let base = EventLoop::new().unwrap();
        let pool = LoopPool::new(base.clone(), "t");
        pool.set_thread_num(3);
        pool.start(None).unwrap();

        let first: Vec<_> = (0..3).map(|_| pool.next()).collect();
        let distinct: HashSet<_> = first.iter().map(Arc::as_ptr).collect();
        assert_eq!(distinct.len(), 3);
        for event_loop in &first {
            assert!(!Arc::ptr_eq(event_loop, &base));
        }

        // The cycle repeats in the same order.
        let second: Vec<_> = (0..3).map(|_| pool.next()).collect();
        for (a, b) in first.iter().zip(&second) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn init_callback_runs_once_per_worker() {
        let base = EventLoop::new().unwrap();
        let pool = LoopPool::new(base, "t");
        pool.set_thread_num(2);
        let (tx, rx) = crossbeam_channel::unbounded();
        pool.start(Some(Arc::new(move |event_loop: &Arc<EventLoop>| {
            assert!(event_loop.is_in_loop_thread());
            tx.send(()).unwrap();
        })))
        .unwrap();
        assert_eq!(rx.try_iter().count(), 2);
    }
}
