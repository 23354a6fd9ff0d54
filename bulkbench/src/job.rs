//! One run of the insert → scan → update → verify cycle.
//!
//! ```text
//! INIT → GENERATING → INSERTING → SCANNING_PRE → UPDATING → SCANNING_POST → DONE
//!   └────────────── any fatal error ──────────────────────────────────────→ FAILED
//! ```
//!
//! Inserts run on `threadcount` clients, one store handle each, over
//! disjoint key sub-ranges. The later stages run on the coordinator's own
//! handle and operate on the whole matching row set at once.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, RecvTimeoutError},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use toml::Table;
use tracing::{debug, error, info, warn};

use crate::batch::LoadStats;
use crate::client::{Client, ClientProperties};
use crate::db::DB;
use crate::error::JobError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::workloads::{KeyRange, Workload};
use crate::{scan, update, CoreProperties};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Init,
    Generating,
    Inserting,
    ScanningPre,
    Updating,
    ScanningPost,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Generating => "GENERATING",
            Stage::Inserting => "INSERTING",
            Stage::ScanningPre => "SCANNING_PRE",
            Stage::Updating => "UPDATING",
            Stage::ScanningPost => "SCANNING_POST",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default)]
pub struct JobReport {
    pub inserted: LoadStats,
    pub scanned: usize,
    pub updated: usize,
    pub verified: usize,
    pub timings: Vec<(Stage, Duration)>,
}

struct ClientHandle {
    progress: Arc<AtomicU64>,
    join_handle: JoinHandle<Result<LoadStats, JobError>>,
}

pub struct Job<T: DB, U: Workload> {
    core_props: CoreProperties,
    client_props: ClientProperties,
    props: Table,

    workload: Arc<U>,
    range: KeyRange,
    retry: RetryPolicy,
    abort: Arc<AtomicBool>,

    stage: Stage,
    stage_started: Instant,
    report: JobReport,

    _db: PhantomData<T>,
}

impl<T: DB, U: Workload> Job<T, U> {
    /// Validates the configuration. Performs no I/O.
    pub fn new(
        core_props: CoreProperties,
        client_props: ClientProperties,
        props: Table,
    ) -> Result<Self, JobError> {
        let range = client_props.key_range()?;
        let retry = client_props.retry_policy()?;
        if client_props.batch_size == 0 {
            return Err(JobError::Config("batchsize must be positive".to_string()));
        }
        let workload = U::new(&core_props, &client_props, &props)?;
        Ok(Job {
            core_props,
            client_props,
            props,
            workload: Arc::new(workload),
            range,
            retry,
            abort: Arc::new(AtomicBool::new(false)),
            stage: Stage::Init,
            stage_started: Instant::now(),
            report: JobReport::default(),
            _db: PhantomData,
        })
    }

    #[cfg(test)]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn run(&mut self) -> Result<JobReport, JobError> {
        info!(
            stage = %self.stage,
            table = self.workload.table(),
            start = self.range.start(),
            total = self.range.total(),
            "job starting"
        );
        match self.run_stages() {
            Ok(()) => {
                self.enter(Stage::Done);
                Ok(self.report.clone())
            }
            Err(e) => {
                error!(stage = %self.stage, error = %e, "job failed");
                self.abort.store(true, Ordering::Release);
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }

    fn enter(&mut self, stage: Stage) {
        let elapsed = self.stage_started.elapsed();
        info!(
            from = %self.stage,
            to = %stage,
            elapsed = format_args!("{:.2} s", elapsed.as_secs_f64()),
            "stage transition"
        );
        self.report.timings.push((self.stage, elapsed));
        self.stage = stage;
        self.stage_started = Instant::now();
    }

    fn stage_limit(&self) -> Option<Duration> {
        match self.core_props.max_execution_time {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    fn connect(&self) -> Result<T, JobError> {
        retry_with_backoff(&self.retry, "connect", || T::new(&self.props))
            .map_err(JobError::StoreUnavailable)
    }

    fn run_stages(&mut self) -> Result<(), JobError> {
        let workload = self.workload.clone();
        let table = workload.table().to_string();

        let mut db = self.connect()?;
        retry_with_backoff(&self.retry, "create table", || {
            db.create_table(&table, workload.schema())
        })
        .map_err(|e| {
            if e.is_retryable() {
                JobError::StoreUnavailable(e)
            } else {
                JobError::Config(format!("cannot use table {}: {}", table, e))
            }
        })?;
        let parts = self.range.split(self.core_props.thread_count);
        let mut sessions = Vec::with_capacity(parts.len());
        for _ in &parts {
            sessions.push(self.connect()?);
        }

        self.enter(Stage::Generating);
        let mut clients = Vec::with_capacity(parts.len());
        for (range, session) in parts.into_iter().zip(sessions) {
            clients.push(Client::<T, U>::new(
                self.client_props.clone(),
                session,
                workload.clone(),
                range,
                self.abort.clone(),
            )?);
        }

        self.enter(Stage::Inserting);
        self.report.inserted = self.insert(clients)?;

        self.enter(Stage::ScanningPre);
        let retry = self.retry.clone();
        let (mut db, scanned) = {
            let workload = workload.clone();
            let retry = retry.clone();
            with_deadline(Stage::ScanningPre, self.stage_limit(), move || {
                let rows = scan::predicate_scan(
                    &mut db,
                    workload.table(),
                    &workload.seed_predicate(),
                    &retry,
                    Stage::ScanningPre,
                )?;
                Ok((db, rows))
            })?
        };
        self.report.scanned = scanned.len();
        if workload.seeded() {
            scan::check_coverage(workload.schema(), &scanned, self.range)?;
        } else if scanned.len() as u64 != self.report.inserted.rows {
            warn!(
                scanned = scanned.len(),
                inserted = self.report.inserted.rows,
                predicate = %workload.seed_predicate(),
                "pre-update scan size differs from inserted row count"
            );
        }

        self.enter(Stage::Updating);
        let (db, scanned, updated) = {
            let workload = workload.clone();
            let retry = retry.clone();
            let workers = self.core_props.thread_count as usize;
            let batch_size = self.client_props.batch_size;
            with_deadline(Stage::Updating, self.stage_limit(), move || {
                let updated = update::transform_all(&*workload, &scanned, workers)?;
                update::bulk_update(&mut db, workload.table(), &updated, batch_size, &retry)?;
                Ok((db, scanned, updated))
            })?
        };
        self.report.updated = updated.len();

        self.enter(Stage::ScanningPost);
        self.report.verified = {
            let workload = workload.clone();
            let mut db = db;
            with_deadline(Stage::ScanningPost, self.stage_limit(), move || {
                scan::verify(&mut db, &*workload, &retry, &scanned, &updated)
            })?
        };
        Ok(())
    }

    fn insert(&mut self, clients: Vec<Client<T, U>>) -> Result<LoadStats, JobError> {
        let mut handles = Vec::with_capacity(clients.len());
        for (i, mut client) in clients.into_iter().enumerate() {
            let abort = self.abort.clone();
            let progress = client.progress();
            let range = client.range();
            let join_handle = thread::Builder::new()
                .name(format!("insert-{}", i))
                .spawn(move || {
                    debug!(
                        client = i,
                        start = range.start(),
                        total = range.total(),
                        "client starting"
                    );
                    let result = client.setup_initial_data();
                    if result.is_err() {
                        abort.store(true, Ordering::Release);
                    }
                    result
                });
            match join_handle {
                Ok(join_handle) => handles.push(ClientHandle {
                    progress,
                    join_handle,
                }),
                Err(e) => {
                    self.abort.store(true, Ordering::Release);
                    return Err(e.into());
                }
            }
        }

        self.show_progress(&handles)?;

        let mut stats = LoadStats::default();
        let mut first_error: Option<JobError> = None;
        for handle in handles {
            let result = handle.join_handle.join().unwrap_or(Err(JobError::WorkerPanicked {
                stage: Stage::Inserting,
            }));
            match result {
                Ok(s) => stats += s,
                // The worker that failed first is more useful than the ones it
                // aborted.
                Err(e) => {
                    if matches!(first_error, None | Some(JobError::Aborted { .. })) {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Logs insert progress at each new whole percent until every client has
    /// finished, or fails the stage once the deadline passes.
    fn show_progress(&self, handles: &[ClientHandle]) -> Result<(), JobError> {
        let count = self.range.total() as u64;
        let deadline = self.stage_limit().map(|limit| (limit, Instant::now() + limit));
        let mut prev_percentage = 0u64;
        loop {
            let progress: u64 = handles
                .iter()
                .map(|x| x.progress.load(Ordering::Relaxed))
                .sum();
            let percentage = progress * 100 / count;
            if prev_percentage != percentage {
                info!("  {}% ({}/{})", percentage, progress, count);
                prev_percentage = percentage;
            }
            if handles.iter().all(|x| x.join_handle.is_finished()) {
                return Ok(());
            }
            if let Some((limit, at)) = deadline {
                if Instant::now() >= at {
                    self.abort.store(true, Ordering::Release);
                    return Err(JobError::DeadlineExceeded {
                        stage: Stage::Inserting,
                        limit,
                    });
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Runs `f` to completion, or gives up on it after `limit`. An abandoned
/// call keeps running on its detached thread.
fn with_deadline<R, F>(stage: Stage, limit: Option<Duration>, f: F) -> Result<R, JobError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, JobError> + Send + 'static,
{
    let Some(limit) = limit else {
        return f();
    };
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(stage.to_string().to_lowercase())
        .spawn(move || {
            let _ = tx.send(f());
        })?;
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(JobError::DeadlineExceeded { stage, limit }),
        Err(RecvTimeoutError::Disconnected) => Err(JobError::WorkerPanicked { stage }),
    }
}
