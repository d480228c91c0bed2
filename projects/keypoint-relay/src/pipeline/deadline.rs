// Runs calls against a blocking collaborator with a per-call timeout.
//
// The collaborator lives on its own thread. A call that overruns is
// abandoned by the caller; its late result is discarded when it arrives.
// A call that panics retires the engine; later calls report it as gone.

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("{0} is still busy with an earlier frame")]
    Busy(&'static str),
    #[error("{0} engine thread is gone")]
    Disconnected(&'static str),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl StageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout(_) | StageError::Busy(_))
    }
}

/// Returns false when the call panicked and the engine must not be reused.
type Job<E> = Box<dyn FnOnce(&mut E) -> bool + Send>;

pub struct Deadline<E> {
    name: &'static str,
    jobs: Option<Sender<Job<E>>>,
    done: channel::Receiver<()>,
    worker: Option<JoinHandle<()>>,
    dead: Arc<AtomicBool>,
}

impl<E: Send + 'static> Deadline<E> {
    pub fn spawn(name: &'static str, engine: E) -> Result<Self> {
        // Capacity 1: at most one call queued behind a stalled one.
        let (jobs_tx, jobs_rx) = channel::bounded::<Job<E>>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut engine = engine;
                for job in jobs_rx.iter() {
                    if !job(&mut engine) {
                        tracing::error!("{} engine panicked, retiring it", name);
                        break;
                    }
                }
                drop(jobs_rx);
                drop(engine);
                let _ = done_tx.send(());
            })
            .with_context(|| format!("Failed to spawn {} engine thread", name))?;

        Ok(Self {
            name,
            jobs: Some(jobs_tx),
            done: done_rx,
            worker: Some(worker),
            dead: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs `f` on the engine thread and waits at most `timeout` for it,
    /// counting both the wait for a free slot and the call itself.
    pub fn call<R, F>(&self, timeout: Duration, f: F) -> Result<R, StageError>
    where
        R: Send + 'static,
        F: FnOnce(&mut E) -> Result<R> + Send + 'static,
    {
        if self.dead.load(Ordering::Acquire) {
            return Err(StageError::Disconnected(self.name));
        }
        let jobs = self.jobs.as_ref().ok_or(StageError::Disconnected(self.name))?;
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = channel::bounded::<Result<R>>(1);
        let dead = self.dead.clone();
        let job: Job<E> = Box::new(move |engine: &mut E| {
            match catch_unwind(AssertUnwindSafe(|| f(engine))) {
                Ok(result) => {
                    // The caller may have given up already.
                    let _ = reply_tx.send(result);
                    true
                }
                Err(_) => {
                    // Mark before the reply channel closes so the caller
                    // never sees a live engine after a disconnect.
                    dead.store(true, Ordering::Release);
                    drop(reply_tx);
                    false
                }
            }
        });

        jobs.send_deadline(job, deadline).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => StageError::Busy(self.name),
            SendTimeoutError::Disconnected(_) => StageError::Disconnected(self.name),
        })?;

        match reply_rx.recv_deadline(deadline) {
            Ok(result) => result.map_err(StageError::Failed),
            Err(RecvTimeoutError::Timeout) => Err(StageError::Timeout(self.name)),
            Err(RecvTimeoutError::Disconnected) => Err(StageError::Disconnected(self.name)),
        }
    }

    /// Closes the job channel and waits up to `grace` for the engine to be
    /// dropped. A thread still stuck in a call after `grace` is detached.
    pub fn shutdown(mut self, grace: Duration) -> Result<()> {
        self.jobs.take();
        match self.done.recv_timeout(grace) {
            // Disconnected: the thread unwound without signalling; join reports it.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    worker
                        .join()
                        .map_err(|_| anyhow!("{} engine thread panicked", self.name))?;
                }
                if self.dead.load(Ordering::Acquire) {
                    return Err(anyhow!("{} engine panicked during a call", self.name));
                }
                tracing::info!("{} engine shut down", self.name);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.worker.take();
                Err(anyhow!(
                    "{} engine did not shut down within {:?}",
                    self.name,
                    grace
                ))
            }
        }
    }
}

impl<E> Drop for Deadline<E> {
    fn drop(&mut self) {
        // Without an explicit shutdown the engine thread is left to finish
        // on its own once the job channel closes.
        self.jobs.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        calls: u32,
    }

    #[test]
    fn test_call_returns_engine_result() {
        let deadline = Deadline::spawn("counter", Counter { calls: 0 }).unwrap();
        for expected in 1..=3 {
            let calls = deadline
                .call(Duration::from_millis(500), |c: &mut Counter| {
                    c.calls += 1;
                    Ok(c.calls)
                })
                .unwrap();
            assert_eq!(calls, expected);
        }
        deadline.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_engine_error_is_failed() {
        let deadline = Deadline::spawn("failing", ()).unwrap();
        let err = deadline
            .call(Duration::from_millis(500), |_: &mut ()| -> Result<()> {
                anyhow::bail!("model exploded")
            })
            .unwrap_err();
        assert!(matches!(err, StageError::Failed(_)));
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("model exploded"));
    }

    #[test]
    fn test_slow_call_times_out_and_engine_recovers() {
        let deadline = Deadline::spawn("slow", ()).unwrap();

        let start = Instant::now();
        let err = deadline
            .call(Duration::from_millis(20), |_: &mut ()| {
                thread::sleep(Duration::from_millis(150));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StageError::Timeout("slow")));
        assert!(start.elapsed() < Duration::from_millis(140));

        thread::sleep(Duration::from_millis(200));
        let value = deadline
            .call(Duration::from_millis(500), |_: &mut ()| Ok(7))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_panicking_engine_disconnects() {
        let deadline = Deadline::spawn("panicky", ()).unwrap();
        let err = deadline
            .call(Duration::from_millis(500), |_: &mut ()| -> Result<()> {
                panic!("engine crashed")
            })
            .unwrap_err();
        assert!(matches!(err, StageError::Disconnected("panicky")));

        // No sleep needed: the engine is marked dead before the reply closes.
        for _ in 0..3 {
            let err = deadline
                .call(Duration::from_millis(100), |_: &mut ()| Ok(()))
                .unwrap_err();
            assert!(matches!(err, StageError::Disconnected("panicky")));
        }
        let err = deadline.shutdown(Duration::from_millis(500)).unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn test_panicking_call_still_drops_engine() {
        struct Flagged(Arc<AtomicBool>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let deadline = Deadline::spawn("flagged", Flagged(dropped.clone())).unwrap();
        let _ = deadline.call(Duration::from_millis(500), |_: &mut Flagged| -> Result<()> {
            panic!("engine crashed")
        });
        assert!(deadline.shutdown(Duration::from_secs(1)).is_err());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_call_waits_at_most_timeout_overall() {
        let deadline = Deadline::spawn("stalled", ()).unwrap();
        let stall = |ms: u64| {
            move |_: &mut ()| {
                thread::sleep(Duration::from_millis(ms));
                Ok::<(), anyhow::Error>(())
            }
        };

        // First call occupies the engine until ~100 ms.
        let err = deadline.call(Duration::from_millis(20), stall(100)).unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));
        // Second call fills the single queue slot.
        let err = deadline.call(Duration::from_millis(20), stall(200)).unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));

        // Third call waits for the slot and then for its reply; the two
        // waits share one budget.
        let start = Instant::now();
        let err = deadline.call(Duration::from_millis(100), stall(0)).unwrap_err();
        let elapsed = start.elapsed();
        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(170), "{:?}", elapsed);
    }

    #[test]
    fn test_shutdown_drops_engine() {
        struct Flagged(Arc<AtomicBool>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let deadline = Deadline::spawn("flagged", Flagged(dropped.clone())).unwrap();
        deadline.shutdown(Duration::from_secs(1)).unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }
}
