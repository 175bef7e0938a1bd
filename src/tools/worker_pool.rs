//! A small fixed-size thread pool fed through a bounded channel.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::bounded;

/// Worker threads applying one closure to queued items.
///
/// The first error a worker hits is latched; further sends fail fast
/// with it. [complete](Self::complete) must be called to drain the
/// queue and surface that error. Dropping the pool joins all threads.
pub struct WorkerPool<I> {
    workers: Vec<JoinHandle<()>>,
    input: Option<crossbeam_channel::Sender<I>>,
    first_error: Arc<Mutex<Option<String>>>,
}

impl<I: Send + 'static> WorkerPool<I> {
    pub fn new<F>(label: &str, threads: usize, work: F) -> Self
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let (input, queue) = bounded::<I>(threads);
        let first_error = Arc::new(Mutex::new(None));

        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let queue = queue.clone();
            let first_error = Arc::clone(&first_error);
            let work = work.clone();

            let handle = std::thread::Builder::new()
                .name(format!("{} ({})", label, n))
                .spawn(move || {
                    while let Ok(item) = queue.recv() {
                        if let Err(err) = work(item) {
                            let mut guard = first_error.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    }
                })
                .unwrap();
            workers.push(handle);
        }

        WorkerPool {
            workers,
            input: Some(input),
            first_error,
        }
    }

    fn check_error(&self) -> Result<(), Error> {
        let guard = self.first_error.lock().unwrap();
        if let Some(message) = guard.as_ref() {
            return Err(format_err!("{}", message));
        }
        Ok(())
    }

    pub fn send(&self, item: I) -> Result<(), Error> {
        self.check_error()?;
        if self.input.as_ref().unwrap().send(item).is_err() {
            bail!("worker queue closed unexpectedly");
        }
        Ok(())
    }

    /// Close the queue, wait for the workers and report the first
    /// error, if any.
    pub fn complete(mut self) -> Result<(), Error> {
        drop(self.input.take());

        let mut panicked = 0;
        while let Some(handle) = self.workers.pop() {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            bail!("{} worker threads panicked", panicked);
        }

        self.check_error()
    }
}

impl<I> Drop for WorkerPool<I> {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.workers.pop() {
            let _ = handle.join();
        }
    }
}
