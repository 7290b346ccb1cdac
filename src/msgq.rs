//! Asynchronous message queues.
//!
//! A [`MessageQueue`] pairs a FIFO with one dedicated worker thread. Producers
//! enqueue without waiting on the consumer; the worker pops one payload at a
//! time and runs the handler outside the lock, so a slow handler (disk I/O for
//! the log file) never stalls the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;

/// Upper bound on how long the worker sleeps with nothing queued.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct State<T> {
    messages: VecDeque<T>,
    /// Popped by the worker but not yet through the handler.
    in_flight: usize,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A named queue with a single consumer thread.
///
/// Dropping the queue closes it: the worker handles whatever is still queued
/// and then exits, and the drop waits for it.
pub struct MessageQueue<T: Send + 'static> {
    name: String,
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> MessageQueue<T> {
    /// Create the queue and start its worker thread.
    pub fn create<F>(name: &str, handler: F) -> Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                messages: VecDeque::new(),
                in_flight: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("msgq-{name}"))
            .spawn(move || run_worker(worker_shared, handler))?;

        tracing::debug!(queue = name, "Created message queue");
        Ok(Self {
            name: name.to_string(),
            shared,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `msg` and wake the worker.
    pub fn enqueue(&self, msg: T) {
        let mut state = self.shared.lock();
        state.messages.push_back(msg);
        self.shared.cond.notify_one();
    }

    /// Messages waiting for the worker.
    pub fn pending(&self) -> usize {
        self.shared.lock().messages.len()
    }

    /// Whether every enqueued message has been fully handled.
    pub fn idle(&self) -> bool {
        let state = self.shared.lock();
        state.messages.is_empty() && state.in_flight == 0
    }
}

impl<T: Send + 'static> Drop for MessageQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_worker<T, F>(shared: Arc<Shared<T>>, mut handler: F)
where
    F: FnMut(T),
{
    loop {
        let msg = {
            let mut state = shared.lock();
            if state.messages.is_empty() && !state.closed {
                state = shared
                    .cond
                    .wait_timeout(state, POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            match state.messages.pop_front() {
                Some(msg) => {
                    state.in_flight += 1;
                    msg
                }
                None if state.closed => break,
                None => continue,
            }
        };
        handler(msg);
        shared.lock().in_flight -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_handler_sees_payload() {
        let (tx, rx) = mpsc::channel();
        let queue = MessageQueue::create("test", move |msg: String| {
            tx.send(msg).unwrap();
        })
        .unwrap();

        queue.enqueue("hello".to_string());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "hello");
    }

    #[test]
    fn test_handler_runs_on_worker_thread() {
        let (tx, rx) = mpsc::channel();
        let queue = MessageQueue::create("thread", move |_: ()| {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        })
        .unwrap();

        queue.enqueue(());
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("msgq-thread"));
    }

    #[test]
    fn test_slow_handler_does_not_block_producer() {
        let queue = MessageQueue::create("slow", |_: u32| {
            thread::sleep(Duration::from_millis(200));
        })
        .unwrap();

        let start = Instant::now();
        for i in 0..5 {
            queue.enqueue(i);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_drop_drains_remaining_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queue = MessageQueue::create("drain", move |n: u32| {
            thread::sleep(Duration::from_millis(5));
            sink.lock().unwrap().push(n);
        })
        .unwrap();

        for n in 0..20 {
            queue.enqueue(n);
        }
        drop(queue);
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_idle_waits_for_running_handler() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let queue = MessageQueue::create("inflight", move |_: ()| {
            thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        queue.enqueue(());
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.pending(), 0);
        assert!(!queue.idle());

        while !queue.idle() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.idle());
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_idle_drop_is_prompt() {
        let queue = MessageQueue::create("idle", |_: ()| {}).unwrap();
        let start = Instant::now();
        drop(queue);
        assert!(start.elapsed() < POLL_INTERVAL);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_fifo_without_loss_or_duplication(
                payloads in prop::collection::vec(any::<u64>(), 0..200),
                producers in 1usize..4,
            ) {
                let seen = Arc::new(Mutex::new(Vec::new()));
                let sink = Arc::clone(&seen);
                let queue = Arc::new(
                    MessageQueue::create("prop", move |msg: (usize, u64)| {
                        sink.lock().unwrap().push(msg);
                    })
                    .unwrap(),
                );

                let chunks: Vec<Vec<u64>> = payloads
                    .chunks(payloads.len().div_ceil(producers).max(1))
                    .map(<[u64]>::to_vec)
                    .collect();
                let handles: Vec<_> = chunks
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(id, chunk)| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for p in chunk {
                                queue.enqueue((id, p));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                drop(Arc::try_unwrap(queue).unwrap());

                let seen = seen.lock().unwrap();
                prop_assert_eq!(seen.len(), payloads.len());
                for (id, chunk) in chunks.iter().enumerate() {
                    let observed: Vec<u64> = seen
                        .iter()
                        .filter(|(p, _)| *p == id)
                        .map(|(_, v)| *v)
                        .collect();
                    prop_assert_eq!(&observed, chunk);
                }
            }
        }
    }
}
