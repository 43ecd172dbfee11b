//! Bounded worker pool for concurrent runs.
//!
//! The job queue is the only state shared between runs. Each job carries its
//! own reply channel, and runs never see each other's data.
use crate::config::types::{ExecutionPolicy, ExecutionResult, ErrorKind, Submission};
use crate::verdict::{Oracle, Verdict};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One submission waiting for a worker
#[derive(Clone, Debug)]
pub struct Job {
    pub name: String,
    pub submission: Submission,
    pub policy: ExecutionPolicy,
    pub oracle: Oracle,
}

/// What a worker produced for one job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evaluation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub verdict: Verdict,
}

impl Evaluation {
    fn internal(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            result: None,
            error: Some(reason.to_string()),
            verdict: Verdict::error(ErrorKind::InternalMonitorFailure, reason),
        }
    }
}

/// Turns a job into an evaluation. Implemented by the harness; tests swap in
/// fakes.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, job: &Job) -> Evaluation;
}

struct Envelope {
    job: Job,
    reply: Sender<Evaluation>,
}

/// Handle on a queued job
pub struct Pending {
    name: String,
    receiver: Receiver<Evaluation>,
}

impl Pending {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the job is evaluated
    pub fn wait(self) -> Evaluation {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Evaluation::internal(&self.name, "worker ended without a result"))
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Envelope>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        workers: usize,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = bounded::<Envelope>(queue_capacity);
        let mut pool = Self {
            sender: Some(sender),
            workers: Vec::with_capacity(workers.max(1)),
        };
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let evaluator = evaluator.clone();
            let handle = thread::Builder::new()
                .name(format!("probebox-worker-{}", index))
                .spawn(move || worker_loop(evaluator.as_ref(), &receiver))?;
            pool.workers.push(handle);
        }
        log::debug!(
            "worker pool started: {} workers, queue {}",
            pool.workers.len(),
            queue_capacity
        );
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job`, blocking while the queue is full. The job comes back
    /// only if the pool is shutting down.
    pub fn submit(&self, job: Job) -> Result<Pending, Job> {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Err(job),
        };
        let (reply, receiver) = bounded(1);
        let name = job.name.clone();
        sender
            .send(Envelope { job, reply })
            .map_err(|e| e.into_inner().job)?;
        Ok(Pending { name, receiver })
    }

    /// Queue `job` unless the queue is full, in which case it is returned
    pub fn try_submit(&self, job: Job) -> Result<Pending, Job> {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Err(job),
        };
        let (reply, receiver) = bounded(1);
        let name = job.name.clone();
        match sender.try_send(Envelope { job, reply }) {
            Ok(()) => Ok(Pending { name, receiver }),
            Err(TrySendError::Full(envelope)) | Err(TrySendError::Disconnected(envelope)) => {
                Err(envelope.job)
            }
        }
    }

    /// Finish queued jobs, then stop the workers
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(evaluator: &dyn Evaluator, jobs: &Receiver<Envelope>) {
    for Envelope { job, reply } in jobs.iter() {
        let evaluation = catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&job)))
            .unwrap_or_else(|_| {
                log::error!("evaluation of '{}' panicked", job.name);
                Evaluation::internal(&job.name, "evaluation panicked")
            });
        let _ = reply.send(evaluation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            submission: Submission::new("c", "/probes/lis.c"),
            policy: ExecutionPolicy::default(),
            oracle: Oracle::NoCrash,
        }
    }

    struct Echo;

    impl Evaluator for Echo {
        fn evaluate(&self, job: &Job) -> Evaluation {
            if job.name == "boom" {
                panic!("evaluator bug");
            }
            Evaluation {
                name: job.name.clone(),
                result: None,
                error: None,
                verdict: Verdict::pass(format!("echo {}", job.name)),
            }
        }
    }

    /// Holds every worker until released, tracking peak concurrency
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        wake: Condvar,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gate {
        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.wake.notify_all();
        }
    }

    impl Evaluator for Gate {
        fn evaluate(&self, job: &Job) -> Evaluation {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.wake.wait(open).unwrap();
            }
            drop(open);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Echo.evaluate(job)
        }
    }

    #[test]
    fn every_job_gets_its_own_answer() {
        let pool = WorkerPool::new(Arc::new(Echo), 3, 8).unwrap();
        let pending: Vec<Pending> = (0..6)
            .map(|i| pool.submit(job(&format!("case-{}", i))).ok().unwrap())
            .collect();
        for (i, pending) in pending.into_iter().enumerate() {
            let evaluation = pending.wait();
            assert_eq!(evaluation.name, format!("case-{}", i));
            assert_eq!(evaluation.verdict.reason, format!("echo case-{}", i));
        }
        pool.shutdown();
    }

    #[test]
    fn full_queue_hands_the_job_back() {
        let gate = Arc::new(Gate::default());
        let pool = WorkerPool::new(gate.clone(), 1, 1).unwrap();

        let first = pool.submit(job("running")).ok().unwrap();
        // wait for the worker to pick it up so the queue is empty again
        while gate.running.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let second = pool.try_submit(job("queued")).ok().unwrap();
        let rejected = pool.try_submit(job("overflow")).err().unwrap();
        assert_eq!(rejected.name, "overflow");

        gate.release();
        assert!(first.wait().verdict.is_pass());
        assert_eq!(second.wait().name, "queued");
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrency_never_exceeds_worker_count() {
        let gate = Arc::new(Gate::default());
        let pool = WorkerPool::new(gate.clone(), 2, 16).unwrap();
        let pending: Vec<Pending> = (0..6)
            .map(|i| pool.submit(job(&format!("j{}", i))).ok().unwrap())
            .collect();
        while gate.running.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        gate.release();
        for pending in pending {
            pending.wait();
        }
        assert_eq!(gate.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_evaluation_becomes_an_error_verdict() {
        let pool = WorkerPool::new(Arc::new(Echo), 1, 4).unwrap();
        let evaluation = pool.submit(job("boom")).ok().unwrap().wait();
        assert_eq!(evaluation.verdict.error_kind, Some(ErrorKind::InternalMonitorFailure));
        // the worker survives
        let evaluation = pool.submit(job("after")).ok().unwrap().wait();
        assert!(evaluation.verdict.is_pass());
    }
}
