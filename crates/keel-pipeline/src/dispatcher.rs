//! Per-workload run dispatch.
//!
//! Each workload gets one worker task fed by an unbounded queue, so runs
//! for the same workload never overlap while different workloads proceed
//! independently. With [`SupersedePolicy::Queue`] runs execute in arrival
//! order. With [`SupersedePolicy::Cancel`] a new revision cancels the
//! active run and any older queued ones; only the latest runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_core::config::SupersedePolicy;
use keel_core::{KeelError, KeelResult, Revision};
use keel_state::{PipelineRun, RunId};

use crate::engine::{PipelineEngine, lock};

struct ActiveRun {
    id: RunId,
    cancel: watch::Sender<Option<String>>,
}

struct Worker {
    queue: mpsc::UnboundedSender<PipelineRun>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    engine: Arc<PipelineEngine>,
    policy: SupersedePolicy,
    workers: Mutex<HashMap<String, Worker>>,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(engine: Arc<PipelineEngine>, policy: SupersedePolicy) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            policy,
            workers: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Trigger entrypoint: allocate the next build number for `workload`,
    /// record a pending run and hand it to the workload's worker.
    pub fn on_revision(&self, workload: &str, commit: &str) -> KeelResult<PipelineRun> {
        if *self.shutdown.borrow() {
            return Err(KeelError::Cancelled("dispatcher is shutting down".to_string()));
        }

        let build_number = self
            .engine
            .store()
            .next_sequence(&format!("build:{workload}"))?;
        let run = self
            .engine
            .create_run(Revision::new(workload, commit, build_number))?;

        let mut workers = lock(&self.workers);
        let worker = workers
            .entry(workload.to_string())
            .or_insert_with(|| self.spawn_worker(workload));

        // The worker drains and registers under this lock too, so a new
        // run is either drained by it or sees the older run as active.
        let active = lock(&worker.active);
        if self.policy == SupersedePolicy::Cancel
            && let Some(current) = active.as_ref()
        {
            current
                .cancel
                .send_replace(Some(format!("superseded by build {build_number}")));
            info!(
                %workload,
                run_id = current.id,
                superseded_by = run.id,
                "cancelling superseded run"
            );
        }

        let sent = worker.queue.send(run.clone());
        drop(active);
        if let Err(mpsc::error::SendError(run)) = sent {
            self.engine.cancel_queued(run, "pipeline worker stopped");
            return Err(KeelError::Cancelled(format!(
                "pipeline worker for {workload} stopped"
            )));
        }
        info!(%workload, run_id = run.id, build_number, %commit, "revision queued");
        Ok(run)
    }

    /// Cancel the active run of `workload`. Returns its id if one was active.
    pub fn cancel(&self, workload: &str) -> Option<RunId> {
        let workers = lock(&self.workers);
        let worker = workers.get(workload)?;
        let active = lock(&worker.active);
        let run = active.as_ref()?;
        run.cancel
            .send_replace(Some("cancelled by operator".to_string()));
        info!(%workload, run_id = run.id, "run cancellation requested");
        Some(run.id)
    }

    /// Id of the run currently executing for `workload`.
    pub fn active_run(&self, workload: &str) -> Option<RunId> {
        let workers = lock(&self.workers);
        let worker = workers.get(workload)?;
        let active = lock(&worker.active);
        active.as_ref().map(|a| a.id)
    }

    /// Cancel active runs, mark queued runs cancelled and wait for every
    /// worker to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let workers: Vec<Worker> = lock(&self.workers).drain().map(|(_, w)| w).collect();
        for worker in &workers {
            if let Some(active) = lock(&worker.active).as_ref() {
                active
                    .cancel
                    .send_replace(Some("shutting down".to_string()));
            }
        }
        for worker in workers {
            drop(worker.queue);
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "pipeline worker panicked");
            }
        }
        info!("pipeline dispatcher stopped");
    }

    fn spawn_worker(&self, workload: &str) -> Worker {
        let (queue, rx) = mpsc::unbounded_channel();
        let active = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(worker_loop(
            self.engine.clone(),
            workload.to_string(),
            self.policy,
            rx,
            active.clone(),
            self.shutdown.subscribe(),
        ));
        Worker {
            queue,
            active,
            handle,
        }
    }
}

async fn worker_loop(
    engine: Arc<PipelineEngine>,
    workload: String,
    policy: SupersedePolicy,
    mut queue: mpsc::UnboundedReceiver<PipelineRun>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%workload, "pipeline worker started");
    loop {
        let next = tokio::select! {
            run = queue.recv() => run,
            _ = shutdown.wait_for(|stop| *stop) => None,
        };
        let Some(mut run) = next else { break };

        let (cancel, signal) = watch::channel(None);
        {
            let mut slot = lock(&active);
            if policy == SupersedePolicy::Cancel {
                while let Ok(newer) = queue.try_recv() {
                    let reason = format!("superseded by build {}", newer.revision.build_number);
                    engine.cancel_queued(run, &reason);
                    run = newer;
                }
            }
            *slot = Some(ActiveRun { id: run.id, cancel });
        }
        // Registered before checking, so a concurrent shutdown sees one or the other.
        if *shutdown.borrow() {
            if let Some(current) = lock(&active).as_ref() {
                current.cancel.send_replace(Some("shutting down".to_string()));
            }
        }
        let finished = engine.execute(run, signal).await;
        *lock(&active) = None;
        debug!(%workload, run_id = finished.id, status = ?finished.status, "worker idle");
    }

    queue.close();
    while let Ok(run) = queue.try_recv() {
        engine.cancel_queued(run, "shutting down");
    }
    debug!(%workload, "pipeline worker stopped");
}
