//! Bulk re-encryption after key rotation
//!
//! A run lists the objects in scope, skips those already sealed under the
//! active key, and hands the rest to a fixed pool of workers. Each object is
//! queued exactly once, so no two workers ever touch the same object. A job
//! re-seals every stale field of its object and writes them back in a single
//! conditional update.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reseal_crypto::{PublicKey, ScopeLabel};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::boundary::{UnsealRequest, UnsealService};
use crate::cancel::CancelSignal;
use crate::error::{Classify, FailureKind, ResealError};
use crate::job::{JobState, ReencryptionJob};
use crate::limiter::RateLimiter;
use crate::report::{Outcome, Report, ReportBuilder};
use crate::retry::RetryPolicy;
use crate::store::{BackupSink, ListScope, ObjectStore, StoreError};

/// Run configuration
#[derive(Debug, Clone)]
pub struct ReencryptConfig {
    /// Objects covered by the run
    pub scope: ListScope,
    /// Number of workers
    pub concurrency: usize,
    /// Decrypt and reseal, but never write
    pub dry_run: bool,
    /// Keep going after a fatal per-object error
    pub force: bool,
    /// Save the prior version of each object before overwriting it
    pub backup: bool,
    /// Re-fetch attempts after a version conflict
    pub max_conflict_retries: u32,
    /// Backoff for transient store and boundary failures
    pub retry: RetryPolicy,
    /// Store requests per second across all workers
    pub rate_limit: Option<u32>,
    /// Cancel the run after this long
    pub timeout: Option<Duration>,
}

impl Default for ReencryptConfig {
    fn default() -> Self {
        Self {
            scope: ListScope::AllNamespaces,
            concurrency: 4,
            dry_run: false,
            force: false,
            backup: false,
            max_conflict_retries: 3,
            retry: RetryPolicy::default(),
            rate_limit: None,
            timeout: None,
        }
    }
}

impl ReencryptConfig {
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            scope: ListScope::Namespace(namespace.into()),
            ..Self::default()
        }
    }

    pub fn with_scope(mut self, scope: ListScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, per_second: Option<u32>) -> Self {
        self.rate_limit = per_second;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a job ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Resealed(usize),
    WouldReseal(usize),
    /// Someone else migrated the object after a conflict
    AlreadyCurrent,
    /// Object was deleted after a conflict
    Vanished,
}

pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    unsealer: Arc<dyn UnsealService>,
    backup: Option<Arc<dyn BackupSink>>,
    config: ReencryptConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        unsealer: Arc<dyn UnsealService>,
        config: ReencryptConfig,
    ) -> Self {
        Self {
            store,
            unsealer,
            backup: None,
            config,
        }
    }

    pub fn with_backup(mut self, sink: Arc<dyn BackupSink>) -> Self {
        self.backup = Some(sink);
        self
    }

    pub fn config(&self) -> &ReencryptConfig {
        &self.config
    }

    /// Execute one run. Always returns a report, even when the run aborts.
    pub async fn run(&self, cancel: &CancelSignal) -> Report {
        let report = ReportBuilder::new(self.config.dry_run);
        let (signal, forward) = cancel.child();
        let timer = self.config.timeout.map(|timeout| signal.cancel_after(timeout));

        info!(
            run_id = %report.run_id(),
            scope = ?self.config.scope,
            concurrency = self.config.concurrency,
            dry_run = self.config.dry_run,
            "starting re-encryption run"
        );

        let ctx = Arc::new(RunContext {
            store: Arc::clone(&self.store),
            unsealer: Arc::clone(&self.unsealer),
            backup: self.backup.clone(),
            config: self.config.clone(),
            limiter: self.config.rate_limit.map(RateLimiter::per_second),
            cancel: signal.clone(),
            report,
        });

        let aborted = match ctx.prepare().await {
            Ok(jobs) => {
                ctx.dispatch(jobs).await;
                signal.reason()
            }
            Err(reason) => Some(reason),
        };

        forward.abort();
        if let Some(timer) = timer {
            timer.abort();
        }

        let report = ctx.report.finish(aborted);
        match &report.aborted {
            Some(reason) => error!(run_id = %report.run_id, reason = %reason, "run aborted"),
            None => info!(
                run_id = %report.run_id,
                succeeded = report.totals.succeeded,
                skipped = report.totals.skipped,
                failed = report.totals.failed,
                "run finished"
            ),
        }
        report
    }
}

/// State shared by the workers of one run
struct RunContext {
    store: Arc<dyn ObjectStore>,
    unsealer: Arc<dyn UnsealService>,
    backup: Option<Arc<dyn BackupSink>>,
    config: ReencryptConfig,
    limiter: Option<RateLimiter>,
    cancel: CancelSignal,
    report: ReportBuilder,
}

impl RunContext {
    /// Capture the active key, list, and record skips. `Err` aborts the run.
    async fn prepare(&self) -> Result<Vec<ReencryptionJob>, String> {
        if self.config.backup && self.backup.is_none() && !self.config.dry_run {
            return Err("backup requested but no backup sink is configured".into());
        }

        let active = self
            .active_key()
            .await
            .map_err(|e| format!("cannot determine active key: {e}"))?;
        let active_fp = active.fingerprint().clone();
        debug!(fingerprint = %active_fp.short(), "captured active key");

        let scope = &self.config.scope;
        let mut listed = self
            .store_call(|| self.store.list(scope))
            .await
            .map_err(|e| format!("listing objects failed: {e}"))?;
        listed.sort_by_key(|v| v.object.object_ref());

        let mut jobs = Vec::new();
        for versioned in listed {
            if versioned.object.needs_migration(&active_fp) {
                jobs.push(ReencryptionJob::new(versioned));
            } else {
                debug!(namespace = %versioned.object.namespace, name = %versioned.object.name, "already current");
                self.report.record(Outcome::skipped(
                    &versioned.object.object_ref(),
                    "already sealed under the active key",
                ));
            }
        }
        info!(queued = jobs.len(), "objects need re-encryption");
        Ok(jobs)
    }

    async fn dispatch(self: &Arc<Self>, jobs: Vec<ReencryptionJob>) {
        if jobs.is_empty() {
            return;
        }

        let workers = self.config.concurrency.clamp(1, jobs.len());
        let (tx, rx) = mpsc::channel(jobs.len());
        for job in jobs {
            // Capacity covers every job, so this never waits.
            if tx.send(job).await.is_err() {
                break;
            }
        }
        drop(tx);

        let queue = Arc::new(Mutex::new(rx));
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let ctx = Arc::clone(self);
            let queue = Arc::clone(&queue);
            pool.spawn(async move { ctx.worker(worker, queue).await });
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
                self.cancel.cancel(format!("worker task failed: {e}"));
            }
        }

        // Anything a dead worker left behind
        let mut queue = queue.lock().await;
        while let Ok(job) = queue.try_recv() {
            self.record_aborted(&job);
        }
    }

    async fn worker(&self, worker: usize, queue: Arc<Mutex<mpsc::Receiver<ReencryptionJob>>>) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(mut job) = next else { break };

            if self.cancel.is_cancelled() {
                self.record_aborted(&job);
                continue;
            }

            debug!(worker, object = %job.object, "picked up job");
            let outcome = match self.process(&mut job).await {
                Ok(processed) => {
                    job.enter(JobState::Done);
                    self.success_outcome(&job, processed)
                }
                Err(err) => {
                    let kind = match err.kind() {
                        FailureKind::Transient if self.cancel.is_cancelled() => FailureKind::Aborted,
                        kind => kind,
                    };
                    job.fail(kind, err.to_string());
                    warn!(
                        namespace = %job.object.namespace,
                        name = %job.object.name,
                        kind = %kind,
                        attempts = job.attempts,
                        error = %err,
                        "re-encryption failed"
                    );
                    if kind == FailureKind::Fatal && !self.config.force {
                        self.cancel
                            .cancel(format!("fatal error on {}: {err}", job.object));
                    }
                    Outcome::failed(&job.object, kind, err.to_string(), job.attempts)
                }
            };
            self.report.record(outcome);
        }
    }

    fn success_outcome(&self, job: &ReencryptionJob, processed: Processed) -> Outcome {
        match processed {
            Processed::Resealed(fields) => {
                info!(
                    namespace = %job.object.namespace,
                    name = %job.object.name,
                    fields,
                    attempts = job.attempts,
                    "re-sealed"
                );
                Outcome::succeeded(&job.object, Some(format!("re-sealed {fields} field(s)")), job.attempts)
            }
            Processed::WouldReseal(fields) => Outcome::succeeded(
                &job.object,
                Some(format!("would re-seal {fields} field(s)")),
                job.attempts,
            ),
            Processed::AlreadyCurrent => {
                Outcome::skipped(&job.object, "migrated concurrently by another writer")
            }
            Processed::Vanished => Outcome::skipped(&job.object, "deleted concurrently"),
        }
    }

    fn record_aborted(&self, job: &ReencryptionJob) {
        let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".into());
        self.report.record(Outcome::failed(
            &job.object,
            FailureKind::Aborted,
            format!("not processed: {reason}"),
            job.attempts,
        ));
    }

    /// Decrypt, reseal and conditionally update one object, re-fetching on conflict
    #[instrument(skip_all, fields(namespace = %job.object.namespace, name = %job.object.name))]
    async fn process(&self, job: &mut ReencryptionJob) -> Result<Processed, ResealError> {
        let mut conflicts = 0;
        loop {
            job.enter(JobState::Decrypting);
            let active = self.active_key().await?;
            let object = job.current.object.clone();

            let stale: Vec<String> = object
                .stale_fields(active.fingerprint())
                .map(str::to_string)
                .collect();
            if stale.is_empty() {
                return Ok(Processed::AlreadyCurrent);
            }

            // Every stale field is opened before anything is sealed; a single
            // failure leaves the object untouched.
            // New envelopes are bound to the claim the old one was opened under,
            // never to the label stored in the object.
            let mut opened: Vec<(String, ScopeLabel, Zeroizing<Vec<u8>>)> =
                Vec::with_capacity(stale.len());
            for field in &stale {
                let Some(envelope) = object.encrypted_data.get(field) else {
                    continue;
                };
                let request = UnsealRequest {
                    envelope: envelope.clone(),
                    scope: object.claim_for(envelope),
                };
                let plaintext = self
                    .config
                    .retry
                    .execute(&self.cancel, || self.unsealer.unseal(&request))
                    .await?;
                opened.push((field.clone(), request.scope, plaintext));
            }

            job.enter(JobState::Resealing);
            let mut updated = object.clone();
            for (field, claim, plaintext) in &opened {
                let envelope = reseal_crypto::seal(plaintext, claim, &active)?;
                updated.encrypted_data.insert(field.clone(), envelope);
            }
            drop(opened);

            if self.config.dry_run {
                return Ok(Processed::WouldReseal(stale.len()));
            }

            if let Some(reason) = self.cancel.reason() {
                return Err(ResealError::Aborted(reason));
            }

            job.enter(JobState::Updating);
            if self.config.backup {
                if let Some(sink) = &self.backup {
                    let current = &job.current;
                    self.store_call(|| sink.backup(current))
                        .await
                        .map_err(|e| match e {
                            ResealError::Store(e) => ResealError::Backup(e),
                            other => other,
                        })?;
                }
            }

            let expected = &job.current.version;
            let result = self.store_call(|| self.store.update(&updated, expected)).await;
            match result {
                Ok(version) => {
                    debug!(version = %version, "updated");
                    return Ok(Processed::Resealed(stale.len()));
                }
                Err(ResealError::Store(StoreError::Conflict(_))) => {
                    conflicts += 1;
                    if conflicts > self.config.max_conflict_retries {
                        return Err(ResealError::ConflictRetriesExhausted {
                            attempts: conflicts,
                        });
                    }
                    warn!(attempt = conflicts, "version conflict, re-fetching");
                    let target = &job.object;
                    let fresh = self.store_call(|| self.store.get(target)).await?;
                    match fresh {
                        Some(fresh) => job.current = fresh,
                        None => return Ok(Processed::Vanished),
                    }
                }
                Err(ResealError::Store(StoreError::NotFound(_))) => return Ok(Processed::Vanished),
                Err(e) => return Err(e),
            }
        }
    }

    async fn active_key(&self) -> Result<PublicKey, ResealError> {
        self.config
            .retry
            .execute(&self.cancel, || self.unsealer.active_key())
            .await
            .map_err(ResealError::from)
    }

    /// Rate-limited store request with transient retry
    async fn store_call<T, F, Fut>(&self, mut operation: F) -> Result<T, ResealError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let limiter = self.limiter.as_ref();
        let cancel = &self.cancel;
        self.config
            .retry
            .execute(cancel, || {
                let request = operation();
                async move {
                    if let Some(limiter) = limiter {
                        if !limiter.acquire(cancel).await {
                            return Err(ResealError::Aborted(
                                cancel.reason().unwrap_or_else(|| "cancelled".into()),
                            ));
                        }
                    }
                    request.await.map_err(ResealError::from)
                }
            })
            .await
    }
}
