use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use crate::observability::{classify_panic_payload, format_panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

static WORKERS: OnceLock<usize> = OnceLock::new();

/// Sets the worker count. Only effective before the first `submit`;
/// returns false when the pool size was already fixed.
pub fn configure(workers: usize) -> bool {
    WORKERS.set(workers.max(1)).is_ok()
}

pub fn submit<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    TaskPool::global().submit(Box::new(job));
}

struct TaskPool {
    tx: Sender<Job>,
}

impl TaskPool {
    fn global() -> &'static Self {
        static POOL: OnceLock<TaskPool> = OnceLock::new();
        POOL.get_or_init(Self::new)
    }

    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let workers = *WORKERS.get_or_init(|| {
            thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(2)
        });
        let shared_rx: Arc<Mutex<Receiver<Job>>> = Arc::new(Mutex::new(rx));
        for idx in 0..workers {
            let worker_rx = Arc::clone(&shared_rx);
            let name = format!("lume-task-{idx}");
            let _ = thread::Builder::new().name(name).spawn(move || {
                loop {
                    let job = {
                        let guard = match worker_rx.lock() {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        match guard.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        let details = classify_panic_payload(payload.as_ref());
                        lume_rt::log::error(&format!(
                            "task panicked: {}",
                            format_panic_message(&details)
                        ));
                    }
                }
            });
        }
        Self { tx }
    }

    fn submit(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}
