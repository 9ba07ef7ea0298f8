//! Worker pool for the loader's file decoding.
//!
//! Not used on the audio thread. Jobs are boxed closures pushed through a
//! crossbeam channel; dropping the pool closes the channel and joins the
//! workers.

use crossbeam_channel::{unbounded, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// `num_threads` defaults to half the logical CPUs, clamped to 1..=4.
    pub fn new(pool_name: &str, num_threads: Option<usize>) -> Self {
        let num_threads = num_threads.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cpus / 2).clamp(1, 4)
        });

        let (tx, rx) = unbounded::<Job>();
        let workers = (0..num_threads)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{}:{}", pool_name, i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        Self {
            jobs: Some(tx),
            workers,
        }
    }

    pub fn add_job(&self, job: impl FnOnce() + Send + 'static) {
        self.jobs
            .as_ref()
            .expect("thread pool already stopped")
            .send(Box::new(job))
            .expect("worker threads gone");
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.jobs.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
