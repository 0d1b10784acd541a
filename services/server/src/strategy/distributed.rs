//! # Distributed Worker Pool
//!
//! ## Purpose
//!
//! Fans messages out to a pool of workers and keeps the output in input
//! order, whatever order the workers finish in.
//!
//! ## Architecture Role
//!
//! ```text
//!                    ┌─ outbound thread ───────────────────────────┐
//! input ──pop──▶     │ reserve slot, spawn(checkout → process)     │
//!                    │ push JoinHandle                             │
//!                    └───────────────┬─────────────────────────────┘
//!                                    ▼
//!                     [jobs: J1 J2 J3 ...]   (submission order)
//!                                    │
//!                    ┌─ inbound thread ┴────────────────────────────┐
//! output ◀──push──   │ pop Jn, block_on(Jn)                         │
//!                    └──────────────────────────────────────────────┘
//! ```
//!
//! The inbound thread waits on the oldest job even when younger jobs have
//! already finished. A slow worker therefore stalls the whole stream for as
//! long as it takes; that head-of-line blocking is the cost of the ordering
//! guarantee.
//!
//! ## Worker Limits
//!
//! Every job holds one of `max_workers` slots from submission until its
//! worker is handed back, so at most `max_workers` jobs run and at most
//! `max_workers` workers are alive at once. The outbound thread waits for a
//! free slot before submitting; that wait is plain backpressure and has no
//! deadline. Idle workers go back to the pool after a successful job and are
//! reused; a worker whose job failed is discarded. The acquisition timeout
//! (none when it is zero) bounds connecting a new worker only.

use super::worker::{RemoteWorkerSource, Worker, WorkerSource};
use super::{Processable, StageEnv};
use crate::error::{StageError, StageResult};
use crate::supervisor::ErrorSupervisor;
use channel::{channel, ChannelReceiver, ChannelSender};
use codec::CodecRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use streamgate_config::DistributedSettings;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time;
use tracing::{debug, info, warn};
use types::Message;

pub const STRATEGY_NAME: &str = "distributed";

type Job = JoinHandle<StageResult<Message>>;

/// Bounded set of reusable workers
pub struct WorkerPool {
    source: Arc<dyn WorkerSource>,
    max_workers: usize,
    acquire_timeout: Option<Duration>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Worker>>>,
    live: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        source: Arc<dyn WorkerSource>,
        max_workers: usize,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            source,
            max_workers,
            acquire_timeout,
            slots: Arc::new(Semaphore::new(max_workers)),
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        }
    }

    /// Wait until fewer than `max_workers` jobs are in flight
    pub async fn reserve(&self) -> StageResult<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StageError::worker("worker pool is closed"))
    }

    /// Reuse an idle worker or connect a new one
    ///
    /// Callers hold a slot, so there is always room for one more worker
    /// when none is idle.
    pub async fn checkout(&self) -> StageResult<Box<dyn Worker>> {
        let idle = self.idle.lock().pop();
        if let Some(worker) = idle {
            return Ok(worker);
        }

        let source = self.source.clone();
        let connecting = task::spawn_blocking(move || source.connect());
        let connected = match self.acquire_timeout {
            Some(timeout) => time::timeout(timeout, connecting).await.map_err(|_| {
                StageError::worker(format!("no worker connected within {timeout:?}"))
            })?,
            None => connecting.await,
        };
        let worker = connected
            .map_err(|e| job_failure(&e, "worker connection"))?
            .map_err(|err| match err {
                err @ StageError::Worker(_) => err,
                other => StageError::worker(format!("worker acquisition failed: {other}")),
            })?;

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(live, max = self.max_workers, "Worker added to pool");
        Ok(worker)
    }

    /// Return a healthy worker for reuse
    pub fn release(&self, worker: Box<dyn Worker>) {
        self.idle.lock().push(worker);
    }

    /// Drop a worker whose job failed
    pub fn discard(&self, worker: Box<dyn Worker>) {
        drop(worker);
        self.forget_worker();
    }

    fn forget_worker(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| live.checked_sub(1));
    }

    /// Workers currently connected, idle or busy
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// One job: borrow a worker, run the message through it, give it back
    async fn run_job(
        self: Arc<Self>,
        message: Message,
        slot: OwnedSemaphorePermit,
    ) -> StageResult<Message> {
        let _slot = slot;
        let mut worker = self.checkout().await?;

        let processed = task::spawn_blocking(move || {
            let result = worker.process(message);
            (worker, result)
        })
        .await;
        let (worker, result) = match processed {
            Ok(done) => done,
            Err(e) => {
                self.forget_worker();
                return Err(job_failure(&e, "distributed job"));
            }
        };

        match result {
            Ok(result) => {
                self.release(worker);
                Ok(result)
            }
            Err(err) => {
                self.discard(worker);
                Err(match err {
                    err @ StageError::Worker(_) => err,
                    other => StageError::worker(other.to_string()),
                })
            }
        }
    }
}

fn job_failure(error: &JoinError, what: &str) -> StageError {
    if error.is_panic() {
        StageError::worker(format!("{what} panicked"))
    } else {
        StageError::worker(format!("{what} was cancelled"))
    }
}

/// Order-preserving fan-out over a [`WorkerPool`]
pub struct DistributedPool {
    name: String,
    pool: Arc<WorkerPool>,
    runtime: Handle,
}

impl DistributedPool {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn WorkerSource>,
        max_workers: usize,
        acquire_timeout: Option<Duration>,
        runtime: Handle,
    ) -> Self {
        Self {
            name: name.into(),
            pool: Arc::new(WorkerPool::new(source, max_workers, acquire_timeout)),
            runtime,
        }
    }

    /// Build from a `distributed` stage description
    pub fn from_env(env: &StageEnv<'_>) -> StageResult<Self> {
        let settings = DistributedSettings::from_stage(env.stage)?;
        let server = &env.services.config.distributed;

        let workers = if settings.workers.is_empty() {
            server.workers.clone()
        } else {
            settings.workers.clone()
        };
        if workers.is_empty() {
            return Err(env
                .stage
                .invalid("no worker addresses in the stage or the server configuration")
                .into());
        }

        let codec = env
            .services
            .codec
            .with_registry(Arc::new(CodecRegistry::from_specs(&settings.codecs)));
        let source = RemoteWorkerSource::new(
            workers.clone(),
            settings.worker_pipeline(env.stage)?,
            env.context.header.clone(),
            codec,
            server.connect_timeout(),
        );
        let max_workers = settings.max_workers.unwrap_or(server.max_workers);

        info!(
            stage = %env.stage.name,
            ?workers,
            max_workers,
            "Distributed pool configured"
        );
        Ok(Self::new(
            env.stage.name.clone(),
            Arc::new(source),
            max_workers,
            server.acquire_timeout(),
            env.services.runtime.clone(),
        ))
    }

    /// Blocks the calling thread until a slot is free
    fn reserve(&self) -> StageResult<OwnedSemaphorePermit> {
        self.runtime.block_on(self.pool.reserve())
    }

    fn submit(&self, message: Message, slot: OwnedSemaphorePermit) -> Job {
        self.runtime.spawn(self.pool.clone().run_job(message, slot))
    }

    fn collect(&self, job: Job) -> StageResult<Message> {
        self.runtime
            .block_on(job)
            .map_err(|e| job_failure(&e, "distributed job"))?
    }
}

impl Processable for DistributedPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self: Box<Self>,
        input: ChannelReceiver<Message>,
        output: ChannelSender<Message>,
        supervisor: &ErrorSupervisor,
    ) -> StageResult<()> {
        let (jobs_tx, jobs_rx) = channel::<Job>();
        let this = &*self;

        thread::scope(|scope| -> StageResult<()> {
            let outbound_name = format!("{}-outbound", this.name);
            let outbound_jobs = jobs_tx.clone();
            let outbound_input = input.clone();
            supervisor.spawn_scoped(scope, &outbound_name, (jobs_tx, input), move || {
                let mut submitted = 0u64;
                while let Some(message) = outbound_input.pop() {
                    let slot = this.reserve()?;
                    if outbound_jobs.push(this.submit(message, slot)).is_err() {
                        warn!(stage = %this.name, "Job queue closed, stopping submission");
                        break;
                    }
                    submitted += 1;
                }
                debug!(stage = %this.name, submitted, "All jobs submitted");
                Ok(())
            })?;

            let inbound_name = format!("{}-inbound", this.name);
            let inbound_output = output.clone();
            let inbound_jobs = jobs_rx.clone();
            supervisor.spawn_scoped(scope, &inbound_name, (output, jobs_rx), move || {
                while let Some(job) = inbound_jobs.pop() {
                    let result = this.collect(job)?;
                    if inbound_output.push(result).is_err() {
                        debug!(stage = %this.name, "Downstream closed");
                        break;
                    }
                }
                Ok(())
            })?;
            Ok(())
        })?;

        debug!(
            stage = %self.name,
            live = self.pool.live(),
            idle = self.pool.idle(),
            "Distributed pool finished"
        );
        Ok(())
    }
}
