//! Named worker-pool thread group (§4.4).
//!
//! Each pool owns a FIFO ready queue and a set of worker threads. A
//! `crossbeam_channel` is the ready queue *and* the counting semaphore
//! described in `spec.md` §3/§4.4 in one: `send` is "post", a worker's
//! blocking `recv` is "acquire + pop" — the channel never lets a receiver
//! observe more items than were sent, which is exactly the invariant
//! `length(ready_queue) <= posts - acquires` asks for (see `SPEC_FULL.md`
//! §3). Shutdown closes the channel after enqueueing one `Job::Terminate`
//! sentinel per worker, so every packet queued before shutdown began is
//! still delivered to a worker (FIFO) before any worker observes the
//! termination signal.
//!
//! The pool is generic over the item it queues: the server posts
//! [`crate::job_registry::Inbound`] (a packet plus its reply address), but
//! nothing about the pool mechanics cares what it carries.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

/// Construction parameters for one worker pool (§4.4).
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub count: u16,
    pub priority: u8,
    pub os_priority: Option<i32>,
    pub stack_size: usize,
    pub stack_seg: Option<String>,
}

impl WorkerPoolConfig {
    /// A pool with `count` workers and otherwise-default scheduling hints.
    pub fn new(name: impl Into<String>, count: u16) -> Self {
        WorkerPoolConfig {
            name: name.into(),
            count,
            priority: 0,
            os_priority: None,
            stack_size: 0,
            stack_seg: None,
        }
    }
}

enum Job<T> {
    Execute(T),
    Terminate,
}

/// A handle used to enqueue work onto a running pool. Cheap to clone;
/// shared by the dispatcher and by job-continuation logic that hands a
/// packet to a (possibly different) pool.
#[derive(Clone)]
pub struct PoolHandle<T> {
    sender: Sender<Job<T>>,
}

impl<T: Send + 'static> PoolHandle<T> {
    /// Posts an item onto the pool's ready queue (§4.4 "post").
    pub fn dispatch(&self, item: T) {
        // an Err here means every worker has already exited; the item is
        // dropped, matching a pool that no longer exists to receive it.
        let _ = self.sender.send(Job::Execute(item));
    }
}

/// A live worker pool: threads plus the sender half of their shared ready
/// queue.
pub struct WorkerPool<T> {
    config: WorkerPoolConfig,
    sender: Sender<Job<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `config.count` worker threads, each running `handler` for
    /// every item pulled off the ready queue. `config.count == 0` spawns
    /// no threads at all — the caller (the dispatcher, for the default
    /// pool) is then responsible for executing packets in-line (§3
    /// `Server` invariant).
    pub fn start<F>(config: WorkerPoolConfig, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (sender, receiver): (Sender<Job<T>>, Receiver<Job<T>>) = unbounded();
        let handler = std::sync::Arc::new(handler);
        let mut workers = Vec::with_capacity(config.count as usize);

        for id in 0..config.count {
            let receiver = receiver.clone();
            let handler = std::sync::Arc::clone(&handler);
            let pool_name = config.name.clone();
            let mut builder = thread::Builder::new().name(format!("{pool_name}-worker-{id}"));
            if config.stack_size > 0 {
                builder = builder.stack_size(config.stack_size);
            }
            let join = builder
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        match job {
                            Job::Execute(item) => handler(item),
                            Job::Terminate => break,
                        }
                    }
                    debug!("pool {pool_name} worker {id} exiting");
                })
                .expect("failed to spawn worker thread");
            workers.push(join);
        }

        WorkerPool {
            config,
            sender,
            workers,
        }
    }

    /// True when this pool has zero configured worker threads, i.e. the
    /// "default pool serviced in-line by the server thread" case (§3).
    pub fn is_inline(&self) -> bool {
        self.config.count == 0
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// A cheap, cloneable way to post work without holding a reference to
    /// the pool itself.
    pub fn handle(&self) -> PoolHandle<T> {
        PoolHandle {
            sender: self.sender.clone(),
        }
    }

    /// Posts an item directly (equivalent to `self.handle().dispatch(..)`).
    pub fn dispatch(&self, item: T) {
        let _ = self.sender.send(Job::Execute(item));
    }

    /// Enqueues one `Terminate` sentinel per worker, then joins every
    /// thread. Items queued before this call are still processed first
    /// (FIFO), matching §5's cooperative shutdown.
    pub fn shutdown(mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(Job::Terminate);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_ready_queue_processes_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let pool: WorkerPool<u16> = WorkerPool::start(WorkerPoolConfig::new("test", 1), move |msg_id| {
            seen2.lock().unwrap().push(msg_id);
        });
        for id in 1..=5u16 {
            pool.dispatch(id);
        }
        pool.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn pending_packets_drain_before_terminate_sentinel() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let pool: WorkerPool<u16> = WorkerPool::start(WorkerPoolConfig::new("drain", 2), move |_item| {
            count2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
        });
        for id in 1..=10u16 {
            pool.dispatch(id);
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn zero_count_pool_is_inline() {
        let pool: WorkerPool<()> = WorkerPool::start(WorkerPoolConfig::new("default", 0), |_| {});
        assert!(pool.is_inline());
        pool.shutdown();
    }
}
