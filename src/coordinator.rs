//! Background parse jobs, one active job per session.
//!
//! A job walks the parse stages on a Tokio task, yielding between stages. Progress is
//! appended to the job's log and broadcast under the same lock, so a subscriber gets
//! the log so far followed by live events with nothing lost or repeated.

use crate::error::ForgeError;
use crate::grid::{RawGrid, Workbook};
use crate::pipeline::{ParseOutcome, ParsePipeline, PartialParse};
use crate::progress::{ParseStage, ProgressEvent};
use crate::report::{KeyFigure, LineItemSeries, TableView};
use futures::stream::{self, Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub const NOT_READY: &str = "not_ready";
pub const JOB_RUNNING: &str = "job_running";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running { stage: ParseStage },
    Completed,
    Failed { code: String, reason: String },
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed { .. })
    }
}

struct JobSlot {
    job_id: String,
    state: JobState,
    log: Vec<ProgressEvent>,
    result: Option<Arc<ParseOutcome>>,
    events: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl JobSlot {
    fn publish(&mut self, event: ProgressEvent) {
        debug!("Job {}: {}", self.job_id, event.to_line());
        self.log.push(event.clone());
        // No receivers is fine; late subscribers read the log.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub session: SessionId,
    pub job_id: Option<String>,
    #[serde(flatten)]
    pub state: JobState,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParseResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodsResponse {
    pub ok: bool,
    pub periods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub table: TableView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub ok: bool,
    /// Metric name → display string, `null` where undefined.
    pub metrics: BTreeMap<String, Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFiguresResponse {
    pub ok: bool,
    pub figures: Vec<KeyFigure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemSeriesResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<LineItemSeries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableResponse {
    fn from_result(result: std::result::Result<TableView, String>) -> Self {
        match result {
            Ok(table) => Self {
                ok: true,
                table,
                error: None,
            },
            Err(error) => Self {
                ok: false,
                table: TableView::default(),
                error: Some(error),
            },
        }
    }
}

/// Events of one job: what happened before subscribing, then live delivery.
pub struct ProgressSubscription {
    pub replay: Vec<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    /// Replayed events followed by live ones, ending after the terminal event.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let finished = self.replay.iter().any(ProgressEvent::is_terminal);
        let live = stream::unfold(
            (self.receiver, finished),
            |(mut receiver, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let terminal = event.is_terminal();
                            return Some((event, (receiver, terminal)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Progress subscriber lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );
        stream::iter(self.replay).chain(live)
    }

    /// Same as [`Self::into_stream`], rendered as plain-text lines.
    pub fn into_lines(self) -> impl Stream<Item = String> + Send + 'static {
        self.into_stream().map(|event| event.to_line())
    }
}

/// Owns the per-session job table and the shared pipeline.
#[derive(Clone)]
pub struct ParseJobCoordinator {
    pipeline: Arc<ParsePipeline>,
    jobs: Arc<Mutex<HashMap<SessionId, JobSlot>>>,
}

impl Default for ParseJobCoordinator {
    fn default() -> Self {
        Self::new(ParsePipeline::default())
    }
}

fn lock_jobs(jobs: &Mutex<HashMap<SessionId, JobSlot>>) -> MutexGuard<'_, HashMap<SessionId, JobSlot>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ParseJobCoordinator {
    pub fn new(pipeline: ParsePipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a parse of `grid` for `session` on a new Tokio task. Outside a Tokio
    /// runtime the start is rejected with `no_runtime`.
    pub fn start_parse(&self, session: impl Into<SessionId>, grid: RawGrid) -> StartParseResponse {
        self.start_job(session.into(), grid, None, CancellationToken::new())
    }

    /// Like [`Self::start_parse`], stopping at the next stage boundary once `cancel`
    /// fires.
    pub fn start_parse_with_cancel(
        &self,
        session: impl Into<SessionId>,
        grid: RawGrid,
        cancel: CancellationToken,
    ) -> StartParseResponse {
        self.start_job(session.into(), grid, None, cancel)
    }

    /// Parses the income statement sheet of `workbook`.
    pub fn start_parse_workbook(
        &self,
        session: impl Into<SessionId>,
        workbook: &Workbook,
    ) -> StartParseResponse {
        let keywords = &self.pipeline.config().workbook.income_sheet_keywords;
        match workbook.select_income_sheet(keywords) {
            Some(sheet) => self.start_job(
                session.into(),
                sheet.grid.clone(),
                Some(sheet.name.clone()),
                CancellationToken::new(),
            ),
            None => StartParseResponse {
                ok: false,
                job_id: None,
                error: Some(ForgeError::EmptyWorkbook.code().to_string()),
            },
        }
    }

    fn start_job(
        &self,
        session: SessionId,
        grid: RawGrid,
        sheet_name: Option<String>,
        cancel: CancellationToken,
    ) -> StartParseResponse {
        let Ok(runtime) = Handle::try_current() else {
            let err = ForgeError::NoRuntime;
            warn!("Cannot start parse for session {}: {}", session, err);
            return StartParseResponse {
                ok: false,
                job_id: None,
                error: Some(err.code().to_string()),
            };
        };

        let job_id = Uuid::new_v4().to_string();
        {
            let mut jobs = lock_jobs(&self.jobs);

            if let Some(slot) = jobs.get(&session) {
                if slot.state.is_running() {
                    let err = ForgeError::JobAlreadyRunning(session.to_string());
                    warn!("{} (job {})", err, slot.job_id);
                    return StartParseResponse {
                        ok: false,
                        job_id: None,
                        error: Some(err.code().to_string()),
                    };
                }
            }

            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            let mut slot = JobSlot {
                job_id: job_id.clone(),
                state: JobState::Running {
                    stage: ParseStage::DetectingPeriods,
                },
                log: Vec::new(),
                result: None,
                events,
                cancel: cancel.clone(),
            };
            slot.publish(ProgressEvent::Started {
                job_id: job_id.clone(),
            });
            // Replaces any finished job and its result.
            jobs.insert(session.clone(), slot);
        }

        info!("Started parse job {} for session {}", job_id, session);

        let task = runtime.spawn(run_job(
            Arc::clone(&self.jobs),
            Arc::clone(&self.pipeline),
            session.clone(),
            job_id.clone(),
            grid,
            sheet_name,
            cancel,
        ));
        runtime.spawn(supervise(Arc::clone(&self.jobs), session, job_id.clone(), task));

        StartParseResponse {
            ok: true,
            job_id: Some(job_id),
            error: None,
        }
    }

    /// Requests cancellation of the session's running job. Returns `false` when no
    /// job is running.
    pub fn cancel(&self, session: impl Into<SessionId>) -> bool {
        let session: SessionId = session.into();
        let jobs = lock_jobs(&self.jobs);
        match jobs.get(&session) {
            Some(slot) if slot.state.is_running() => {
                info!("Cancelling parse job {} for session {}", slot.job_id, session);
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn subscribe(&self, session: impl Into<SessionId>) -> Option<ProgressSubscription> {
        let session: SessionId = session.into();
        let jobs = lock_jobs(&self.jobs);
        jobs.get(&session).map(|slot| ProgressSubscription {
            replay: slot.log.clone(),
            receiver: slot.events.subscribe(),
        })
    }

    /// Waits until the session's current job is Completed or Failed.
    pub async fn wait_for_completion(&self, session: impl Into<SessionId>) -> JobState {
        let session: SessionId = session.into();
        if let Some(subscription) = self.subscribe(session.clone()) {
            let mut events = Box::pin(subscription.into_stream());
            while events.next().await.is_some() {}
        }
        self.job_snapshot(session).state
    }

    pub fn job_snapshot(&self, session: impl Into<SessionId>) -> JobSnapshot {
        let session: SessionId = session.into();
        let jobs = lock_jobs(&self.jobs);
        match jobs.get(&session) {
            Some(slot) => JobSnapshot {
                session,
                job_id: Some(slot.job_id.clone()),
                state: slot.state.clone(),
                log: slot.log.iter().map(ProgressEvent::to_line).collect(),
            },
            None => JobSnapshot {
                session,
                job_id: None,
                state: JobState::Idle,
                log: Vec::new(),
            },
        }
    }

    /// The finished result, or the reason there is none.
    pub fn result(&self, session: impl Into<SessionId>) -> std::result::Result<Arc<ParseOutcome>, String> {
        let session: SessionId = session.into();
        let jobs = lock_jobs(&self.jobs);
        let Some(slot) = jobs.get(&session) else {
            return Err(NOT_READY.to_string());
        };
        match (&slot.state, &slot.result) {
            (JobState::Completed, Some(result)) => Ok(Arc::clone(result)),
            (JobState::Running { .. }, _) => Err(JOB_RUNNING.to_string()),
            (JobState::Failed { code, .. }, _) => Err(format!("failed: {}", code)),
            _ => Err(NOT_READY.to_string()),
        }
    }

    pub fn get_periods(&self, session: impl Into<SessionId>) -> PeriodsResponse {
        match self.result(session) {
            Ok(outcome) => PeriodsResponse {
                ok: true,
                periods: outcome.period_ids(),
                error: None,
            },
            Err(error) => PeriodsResponse {
                ok: false,
                periods: Vec::new(),
                error: Some(error),
            },
        }
    }

    pub fn get_statement_details(&self, session: impl Into<SessionId>) -> TableResponse {
        TableResponse::from_result(self.result(session).map(|outcome| outcome.details_table()))
    }

    pub fn get_statement_for_period(&self, session: impl Into<SessionId>, period: &str) -> TableResponse {
        TableResponse::from_result(self.result(session).and_then(|outcome| {
            outcome
                .statement_table(period)
                .ok_or_else(|| ForgeError::UnknownPeriod(period.to_string()).code().to_string())
        }))
    }

    pub fn get_raw_table(&self, session: impl Into<SessionId>) -> TableResponse {
        TableResponse::from_result(self.result(session).map(|outcome| outcome.raw_table()))
    }

    pub fn get_metrics_for_period(&self, session: impl Into<SessionId>, period: &str) -> MetricsResponse {
        let result = self.result(session).and_then(|outcome| {
            if outcome.has_period(period) {
                Ok(outcome.metric_displays(period).into_iter().collect())
            } else {
                Err(ForgeError::UnknownPeriod(period.to_string()).code().to_string())
            }
        });
        match result {
            Ok(metrics) => MetricsResponse {
                ok: true,
                metrics,
                error: None,
            },
            Err(error) => MetricsResponse {
                ok: false,
                metrics: BTreeMap::new(),
                error: Some(error),
            },
        }
    }

    pub fn get_key_figures(&self, session: impl Into<SessionId>, period: &str) -> KeyFiguresResponse {
        let result = self.result(session).and_then(|outcome| {
            if outcome.has_period(period) {
                Ok(outcome.key_figures(period))
            } else {
                Err(ForgeError::UnknownPeriod(period.to_string()).code().to_string())
            }
        });
        match result {
            Ok(figures) => KeyFiguresResponse {
                ok: true,
                figures,
                error: None,
            },
            Err(error) => KeyFiguresResponse {
                ok: false,
                figures: Vec::new(),
                error: Some(error),
            },
        }
    }

    pub fn get_line_item_series(&self, session: impl Into<SessionId>, label: &str) -> LineItemSeriesResponse {
        let result = self.result(session).and_then(|outcome| {
            outcome
                .line_item_series(label)
                .ok_or_else(|| "unknown_line_item".to_string())
        });
        match result {
            Ok(series) => LineItemSeriesResponse {
                ok: true,
                series: Some(series),
                error: None,
            },
            Err(error) => LineItemSeriesResponse {
                ok: false,
                series: None,
                error: Some(error),
            },
        }
    }
}

/// Applies `update` to the slot if it still belongs to `job_id`.
fn with_slot<F>(jobs: &Mutex<HashMap<SessionId, JobSlot>>, session: &SessionId, job_id: &str, update: F) -> bool
where
    F: FnOnce(&mut JobSlot),
{
    let mut jobs = lock_jobs(jobs);
    match jobs.get_mut(session) {
        Some(slot) if slot.job_id == job_id => {
            update(slot);
            true
        }
        _ => false,
    }
}

fn fail_job(jobs: &Mutex<HashMap<SessionId, JobSlot>>, session: &SessionId, job_id: &str, error: ForgeError) {
    warn!("Parse job {} for session {} failed: {}", job_id, session, error);
    let code = error.code().to_string();
    let reason = error.to_string();
    with_slot(jobs, session, job_id, |slot| {
        slot.state = JobState::Failed {
            code: code.clone(),
            reason: reason.clone(),
        };
        slot.publish(ProgressEvent::Failed { code, reason });
    });
}

/// Fails the job if its task ends without reaching a terminal state (panic or abort).
async fn supervise(
    jobs: Arc<Mutex<HashMap<SessionId, JobSlot>>>,
    session: SessionId,
    job_id: String,
    task: JoinHandle<()>,
) {
    if let Err(join_error) = task.await {
        let still_running = lock_jobs(&jobs)
            .get(&session)
            .map(|slot| slot.job_id == job_id && slot.state.is_running())
            .unwrap_or(false);
        if still_running {
            fail_job(
                &jobs,
                &session,
                &job_id,
                ForgeError::JobFailed(format!("parse task ended abnormally: {}", join_error)),
            );
        }
    }
}

async fn run_job(
    jobs: Arc<Mutex<HashMap<SessionId, JobSlot>>>,
    pipeline: Arc<ParsePipeline>,
    session: SessionId,
    job_id: String,
    grid: RawGrid,
    sheet_name: Option<String>,
    cancel: CancellationToken,
) {
    let mut state = PartialParse::default();

    for stage in ParseStage::ALL {
        tokio::task::yield_now().await;

        if cancel.is_cancelled() {
            fail_job(&jobs, &session, &job_id, ForgeError::Cancelled);
            return;
        }

        if !with_slot(&jobs, &session, &job_id, |slot| {
            slot.state = JobState::Running { stage }
        }) {
            debug!("Parse job {} no longer owns session {}", job_id, session);
            return;
        }

        match pipeline.run_stage(stage, &grid, &mut state) {
            Ok(detail) => {
                with_slot(&jobs, &session, &job_id, |slot| {
                    slot.publish(ProgressEvent::StageCompleted { stage, detail })
                });
            }
            Err(e) => {
                fail_job(&jobs, &session, &job_id, e);
                return;
            }
        }
    }

    match state.finish(sheet_name) {
        Ok(outcome) => {
            let event = ProgressEvent::Completed {
                periods: outcome.detection.periods.len(),
                line_items: outcome.line_item_count(),
                anomalies: outcome.anomalies.len(),
            };
            let outcome = Arc::new(outcome);
            // Result, state and terminal event land together.
            with_slot(&jobs, &session, &job_id, |slot| {
                slot.result = Some(outcome);
                slot.state = JobState::Completed;
                slot.publish(event);
            });
            info!("Parse job {} for session {} completed", job_id, session);
        }
        Err(e) => fail_job(&jobs, &session, &job_id, e),
    }
}
