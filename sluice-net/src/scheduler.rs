use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// The process-wide scheduler instance; every session shares it.
pub static SYSTEM: Lazy<TimedSched> = Lazy::new(|| TimedSched::new(num_cpus::get()));

type Action = Box<dyn FnOnce() + Send>;

struct Task {
    action: Action,
    deadline: Instant,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Task {}
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Task {
    // Reverse order: BinaryHeap is a max-heap, we want the earliest deadline
    // on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

/// A delayed-task scheduler running a fixed number of workers.
///
/// Thousands of sessions each repost one `update` action per flush, so the
/// submission side must never serialise on a single receiver: `put` appends
/// to a lock-guarded staging list and pokes a front-desk thread, which hands
/// tasks to workers over an unbuffered channel. Each worker keeps its own
/// deadline-ordered heap and sleeps exactly until its earliest deadline.
///
/// Guarantees: a task runs exactly once unless the scheduler is closed before
/// it is dispatched; a deadline already in the past runs without touching any
/// heap; ordering between equal deadlines is unspecified.
pub struct TimedSched {
    staging: Arc<Mutex<Vec<Task>>>,
    notify_tx: Sender<()>,
    die_tx: Mutex<Option<Sender<()>>>,
}

impl TimedSched {
    pub fn new(parallel: usize) -> Self {
        let staging: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));
        let (notify_tx, notify_rx) = bounded::<()>(1);
        let (die_tx, die_rx) = bounded::<()>(0);
        let (task_tx, task_rx) = bounded::<Task>(0);

        for _ in 0..parallel.max(1) {
            let task_rx = task_rx.clone();
            let die_rx = die_rx.clone();
            thread::spawn(move || worker(task_rx, die_rx));
        }

        {
            let staging = staging.clone();
            let die_rx = die_rx.clone();
            thread::spawn(move || front_desk(staging, notify_rx, task_tx, die_rx));
        }

        TimedSched {
            staging,
            notify_tx,
            die_tx: Mutex::new(Some(die_tx)),
        }
    }

    /// Schedules `action` to run no earlier than `deadline`.
    pub fn put(&self, action: impl FnOnce() + Send + 'static, deadline: Instant) {
        self.staging.lock().push(Task {
            action: Box::new(action),
            deadline,
        });
        let _ = self.notify_tx.try_send(());
    }

    /// Stops dispatch. Tasks already handed to a worker heap but not yet due
    /// are abandoned.
    pub fn close(&self) {
        self.die_tx.lock().take();
    }
}

fn front_desk(
    staging: Arc<Mutex<Vec<Task>>>,
    notify_rx: Receiver<()>,
    task_tx: Sender<Task>,
    die_rx: Receiver<()>,
) {
    loop {
        crossbeam_channel::select! {
            recv(notify_rx) -> _ => {}
            recv(die_rx) -> _ => return,
        }
        let batch = std::mem::take(&mut *staging.lock());
        for task in batch {
            if task.deadline <= Instant::now() {
                // Overdue on arrival: run here rather than bouncing through
                // a worker heap.
                (task.action)();
                continue;
            }
            crossbeam_channel::select! {
                send(task_tx, task) -> _ => {}
                recv(die_rx) -> _ => return,
            }
        }
    }
}

fn worker(task_rx: Receiver<Task>, die_rx: Receiver<()>) {
    let mut heap: BinaryHeap<Task> = BinaryHeap::new();
    loop {
        while let Some(top) = heap.peek() {
            let now = Instant::now();
            if top.deadline <= now {
                let task = heap.pop().unwrap();
                (task.action)();
            } else {
                break;
            }
        }

        match heap.peek() {
            Some(top) => {
                let wait = top.deadline.saturating_duration_since(Instant::now());
                crossbeam_channel::select! {
                    recv(task_rx) -> task => match task {
                        Ok(task) => heap.push(task),
                        Err(_) => return,
                    },
                    recv(die_rx) -> _ => return,
                    default(wait) => {}
                }
            }
            None => {
                crossbeam_channel::select! {
                    recv(task_rx) -> task => match task {
                        Ok(task) => heap.push(task),
                        Err(_) => return,
                    },
                    recv(die_rx) -> _ => return,
                }
            }
        }
    }
}
