//! The refinement controller: drives sessions through check, run and repair.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, Instrument};

use super::machine::{can_transition, judge_cycle, CycleVerdict, FailureFingerprint};
use crate::config::EngineConfig;
use crate::diagnostics::{diagnose, ReporterConfig};
use crate::domain::{
    EngineError, EngineResult, ExecutionOutcome, FatalReason, RevisionOrigin, ScriptRevision,
    SessionHistory, SessionId, SessionRecord, SessionState,
};
use crate::export::{export_from_history, ExportBundle};
use crate::generator::{PageSpec, RepairRequest, ScriptGenerator};
use crate::obs;
use crate::sandbox::{
    wait_for_abort, IsolatedRunner, PolicyChecker, PolicyResult, RunRequest, ScriptExecutor,
    WhitelistPolicy, ABORTED_MESSAGE,
};
use crate::store::{SessionStore, StoreError};

/// Loop bounds and reporting settings used by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_iterations: u32,
    pub run_timeout: Duration,
    pub detect_no_progress: bool,
    pub reporter: ReporterConfig,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.refinement.max_iterations,
            run_timeout: config.runner.default_timeout(),
            detect_no_progress: config.refinement.detect_no_progress,
            reporter: config.reporter.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// In-memory position of one session; the store holds the durable copy.
#[derive(Debug)]
struct SessionCursor {
    record: SessionRecord,
    latest: Option<ScriptRevision>,
    /// `latest` has no outcome yet.
    pending: bool,
    last_failure: Option<FailureFingerprint>,
}

impl SessionCursor {
    /// Rebuild from stored history, settling a cycle cut short by a restart.
    fn restore(history: SessionHistory, settings: &EngineSettings) -> Self {
        let pending = !history.is_quiescent();
        let latest = history.revisions.last().cloned();
        let last_failure = match (history.outcomes.last(), latest.as_ref()) {
            (Some(outcome), Some(revision)) if !pending => {
                diagnose(outcome, &settings.reporter).map(|diagnostic| {
                    FailureFingerprint::new(revision.source_digest().clone(), diagnostic)
                })
            }
            _ => None,
        };

        let mut cursor = Self {
            record: history.session,
            latest,
            pending,
            last_failure,
        };
        cursor.settle_interrupted();
        cursor
    }

    /// A cycle that was cut short (process restart or dropped future) leaves
    /// the record in `Checking` or `Running`. Put it where the cycle would
    /// have left it: back to `Drafting` if the revision never got an outcome,
    /// otherwise judged from that outcome.
    fn settle_interrupted(&mut self) {
        if !matches!(
            self.record.state,
            SessionState::Checking | SessionState::Running
        ) {
            return;
        }
        if self.pending {
            self.record.transition(SessionState::Drafting);
        } else if self.last_failure.is_none() {
            self.record.transition(SessionState::Succeeded);
        } else if self.record.iteration_count >= self.record.max_iterations {
            self.record.fail(FatalReason::IterationsExhausted);
        } else {
            self.record.transition(SessionState::NeedsFix);
        }
    }
}

struct SessionSlot {
    abort: watch::Sender<bool>,
    cursor: Mutex<SessionCursor>,
}

impl SessionSlot {
    fn new(cursor: SessionCursor) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            abort,
            cursor: Mutex::new(cursor),
        }
    }

    fn abort_requested(&self) -> bool {
        *self.abort.borrow()
    }
}

fn store_error(err: StoreError) -> EngineError {
    match err {
        StoreError::SessionNotFound(id) => EngineError::SessionNotFound(id),
        other => EngineError::Store(other),
    }
}

/// Coordinates checker, runner, reporter and generator across many
/// concurrent sessions.
///
/// Each session is guarded by its own async mutex, so cycles of one session
/// never interleave while different sessions proceed in parallel (bounded by
/// the runner's worker pool). Abort travels on a per-session `watch` channel
/// that bypasses the mutex.
pub struct RefinementEngine {
    checker: PolicyChecker,
    executor: Arc<dyn ScriptExecutor>,
    generator: Arc<dyn ScriptGenerator>,
    store: Arc<dyn SessionStore>,
    settings: EngineSettings,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl RefinementEngine {
    pub fn new(
        policy: Arc<WhitelistPolicy>,
        executor: Arc<dyn ScriptExecutor>,
        generator: Arc<dyn ScriptGenerator>,
        store: Arc<dyn SessionStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            checker: PolicyChecker::new(policy),
            executor,
            generator,
            store,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with the real [`IsolatedRunner`] built from `config`.
    pub fn from_config(
        config: EngineConfig,
        generator: Arc<dyn ScriptGenerator>,
        store: Arc<dyn SessionStore>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let settings = EngineSettings::from_config(&config);
        let runner = IsolatedRunner::new(config.runner, &config.policy);
        Ok(Self::new(
            Arc::new(config.policy),
            Arc::new(runner),
            generator,
            store,
            settings,
        ))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn checker(&self) -> &PolicyChecker {
        &self.checker
    }

    /// Open a session whose first revision is `initial_code`.
    pub async fn create_session(
        &self,
        url: &str,
        goal: &str,
        initial_code: &str,
    ) -> EngineResult<SessionId> {
        let revision = ScriptRevision::root(initial_code, RevisionOrigin::Initial);
        self.open_session(url, goal, revision).await
    }

    /// Open a session whose first revision comes from the generator.
    pub async fn create_session_from_spec(
        &self,
        url: &str,
        goal: &str,
        page: &PageSpec,
    ) -> EngineResult<SessionId> {
        let source = self.generator.generate(goal, page).await?;
        let revision = ScriptRevision::root(source, RevisionOrigin::Generated);
        self.open_session(url, goal, revision).await
    }

    async fn open_session(
        &self,
        url: &str,
        goal: &str,
        revision: ScriptRevision,
    ) -> EngineResult<SessionId> {
        let record = SessionRecord::new(url, goal, self.settings.max_iterations);
        let id = record.id;
        self.store.create_session(&record).await?;
        self.store.append_revision(id, &revision).await?;

        let cursor = SessionCursor {
            record,
            latest: Some(revision),
            pending: true,
            last_failure: None,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(SessionSlot::new(cursor)));
        obs::emit_session_created(id, url, self.settings.max_iterations);
        Ok(id)
    }

    async fn slot(&self, id: SessionId) -> EngineResult<Arc<SessionSlot>> {
        let cached = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(slot) = cached {
            return Ok(slot);
        }

        let history = self.store.load_history(id).await.map_err(store_error)?;
        let slot = Arc::new(SessionSlot::new(SessionCursor::restore(history, &self.settings)));
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.entry(id).or_insert(slot).clone())
    }

    /// Current session record.
    pub async fn session(&self, id: SessionId) -> EngineResult<SessionRecord> {
        let slot = self.slot(id).await?;
        let mut cursor = slot.cursor.lock().await;
        cursor.settle_interrupted();
        Ok(cursor.record.clone())
    }

    pub async fn state(&self, id: SessionId) -> EngineResult<SessionState> {
        Ok(self.session(id).await?.state)
    }

    /// Check and run the pending revision of a `Drafting` session.
    pub async fn advance(&self, id: SessionId) -> EngineResult<ExecutionOutcome> {
        async {
            let slot = self.slot(id).await?;
            let mut cursor = slot.cursor.lock().await;
            cursor.settle_interrupted();
            if cursor.record.state != SessionState::Drafting || !cursor.pending {
                return Err(invalid_state(&cursor, "advance"));
            }
            self.run_cycle(&slot, &mut cursor).await
        }
        .instrument(obs::session_span(id))
        .await
    }

    /// Ask the generator to repair the failing revision, then run the repair.
    ///
    /// A generator error leaves the session in `NeedsFix` with no new
    /// revision, so the call can be retried.
    pub async fn fix(&self, id: SessionId) -> EngineResult<ExecutionOutcome> {
        async {
            let slot = self.slot(id).await?;
            let mut cursor = slot.cursor.lock().await;
            cursor.settle_interrupted();
            if cursor.record.state != SessionState::NeedsFix {
                return Err(invalid_state(&cursor, "fix"));
            }
            if slot.abort_requested() {
                self.settle_abort(&mut cursor).await?;
                return Err(EngineError::Aborted(id));
            }

            let failing = cursor
                .latest
                .clone()
                .ok_or_else(|| EngineError::Internal(format!("session {id} has no revision")))?;
            let diagnostic = cursor
                .last_failure
                .as_ref()
                .map(|f| f.diagnostic.clone())
                .ok_or_else(|| {
                    EngineError::Internal(format!("session {id} needs a fix but has no diagnostic"))
                })?;
            obs::emit_repair_requested(
                id,
                cursor.record.iteration_count,
                &diagnostic.error_kind.to_string(),
            );

            let request = RepairRequest {
                url: cursor.record.url.clone(),
                goal: cursor.record.goal.clone(),
                failing_source: failing.source_text().to_string(),
                diagnostic,
            };
            let mut abort = slot.abort.subscribe();
            let repaired = tokio::select! {
                biased;
                _ = wait_for_abort(&mut abort) => {
                    self.settle_abort(&mut cursor).await?;
                    return Err(EngineError::Aborted(id));
                }
                repaired = self.generator.repair(&request) => repaired,
            };
            let source = match repaired {
                Ok(source) => source,
                Err(e) => {
                    obs::emit_generator_failed(id, &e);
                    return Err(e.into());
                }
            };

            let revision = ScriptRevision::child_of(&failing, source, RevisionOrigin::Repaired);
            self.enter_revision(&mut cursor, revision, false).await?;
            self.run_cycle(&slot, &mut cursor).await
        }
        .instrument(obs::session_span(id))
        .await
    }

    /// Alias of [`fix`](Self::fix).
    pub async fn request_fix(&self, id: SessionId) -> EngineResult<ExecutionOutcome> {
        self.fix(id).await
    }

    /// Submit caller-written source as the next revision and run it.
    ///
    /// On a terminal session this resumes it: the iteration count restarts
    /// at 1 and a previous abort is cleared.
    pub async fn submit_revision(&self, id: SessionId, code: &str) -> EngineResult<ExecutionOutcome> {
        async {
            let slot = self.slot(id).await?;
            let mut cursor = slot.cursor.lock().await;
            cursor.settle_interrupted();
            let resume = match cursor.record.state {
                SessionState::NeedsFix => false,
                SessionState::Succeeded | SessionState::Fatal => true,
                SessionState::Drafting | SessionState::Checking | SessionState::Running => {
                    return Err(invalid_state(&cursor, "submit a revision"));
                }
            };
            if resume {
                slot.abort.send_replace(false);
            }

            let revision = match &cursor.latest {
                Some(parent) => ScriptRevision::child_of(parent, code, RevisionOrigin::Submitted),
                None => ScriptRevision::root(code, RevisionOrigin::Submitted),
            };
            self.enter_revision(&mut cursor, revision, resume).await?;
            self.run_cycle(&slot, &mut cursor).await
        }
        .instrument(obs::session_span(id))
        .await
    }

    /// Stop the session. An in-flight run is killed and recorded as an
    /// aborted `RuntimeFailure`; an idle session moves straight to `Fatal`.
    /// A `Succeeded` session is left as it is.
    pub async fn abort(&self, id: SessionId) -> EngineResult<()> {
        async {
            let slot = self.slot(id).await?;
            slot.abort.send_replace(true);
            let in_flight = slot.cursor.try_lock().is_err();
            obs::emit_session_aborted(id, in_flight);

            // Waits for an in-flight cycle to unwind; it sees the flag.
            let mut cursor = slot.cursor.lock().await;
            self.settle_abort(&mut cursor).await
        }
        .instrument(obs::session_span(id))
        .await
    }

    /// Full ordered history as persisted by the store.
    pub async fn get_history(&self, id: SessionId) -> EngineResult<SessionHistory> {
        self.store.load_history(id).await.map_err(store_error)
    }

    /// Standalone script for the latest successful revision.
    pub async fn export(&self, id: SessionId) -> EngineResult<ExportBundle> {
        let history = self.get_history(id).await?;
        export_from_history(&history).ok_or(EngineError::NoSuccessfulRevision(id))
    }

    /// Advance and fix until the session is terminal.
    pub async fn run_to_completion(&self, id: SessionId) -> EngineResult<SessionState> {
        loop {
            match self.state(id).await? {
                SessionState::Drafting => {
                    self.advance(id).await?;
                }
                SessionState::NeedsFix => {
                    self.fix(id).await?;
                }
                state @ (SessionState::Succeeded | SessionState::Fatal) => return Ok(state),
                state @ (SessionState::Checking | SessionState::Running) => {
                    return Err(EngineError::InvalidState {
                        session: id,
                        state,
                        operation: "run to completion",
                    });
                }
            }
        }
    }

    async fn persist(&self, cursor: &SessionCursor) -> EngineResult<()> {
        self.store
            .update_session(&cursor.record)
            .await
            .map_err(store_error)
    }

    async fn move_to(&self, cursor: &mut SessionCursor, state: SessionState) -> EngineResult<()> {
        if !can_transition(cursor.record.state, state) {
            return Err(EngineError::Internal(format!(
                "illegal transition {} -> {} for session {}",
                cursor.record.state, state, cursor.record.id
            )));
        }
        cursor.record.transition(state);
        self.persist(cursor).await
    }

    async fn fail(&self, cursor: &mut SessionCursor, reason: FatalReason) -> EngineResult<()> {
        if !can_transition(cursor.record.state, SessionState::Fatal) {
            return Err(EngineError::Internal(format!(
                "illegal transition {} -> fatal for session {}",
                cursor.record.state, cursor.record.id
            )));
        }
        cursor.record.fail(reason);
        self.persist(cursor).await?;
        obs::emit_session_terminal(
            cursor.record.id,
            SessionState::Fatal,
            Some(reason),
            cursor.record.iteration_count,
        );
        Ok(())
    }

    async fn enter_revision(
        &self,
        cursor: &mut SessionCursor,
        revision: ScriptRevision,
        resume: bool,
    ) -> EngineResult<()> {
        self.store
            .append_revision(cursor.record.id, &revision)
            .await
            .map_err(store_error)?;
        if resume {
            cursor.record.iteration_count = 1;
            cursor.last_failure = None;
        } else {
            cursor.record.iteration_count += 1;
        }
        cursor.latest = Some(revision);
        cursor.pending = true;
        self.move_to(cursor, SessionState::Drafting).await
    }

    async fn record_outcome(
        &self,
        cursor: &mut SessionCursor,
        outcome: &ExecutionOutcome,
    ) -> EngineResult<()> {
        self.store
            .append_outcome(cursor.record.id, outcome)
            .await
            .map_err(store_error)?;
        cursor.pending = false;
        Ok(())
    }

    /// Apply a pending abort to a session nobody is cycling. A revision left
    /// without an outcome (never run, or its cycle was dropped) gets the
    /// aborted outcome so the history stays paired.
    async fn settle_abort(&self, cursor: &mut SessionCursor) -> EngineResult<()> {
        if cursor.record.state.is_terminal() {
            return Ok(());
        }
        if cursor.pending {
            if let Some(revision) = cursor.latest.clone() {
                let outcome =
                    ExecutionOutcome::runtime_failure(revision.id(), ABORTED_MESSAGE, None, 0);
                self.record_outcome(cursor, &outcome).await?;
            }
        }
        self.fail(cursor, FatalReason::Aborted).await
    }

    /// One check/run cycle of the pending revision; always leaves the
    /// session quiescent on success.
    async fn run_cycle(
        &self,
        slot: &SessionSlot,
        cursor: &mut SessionCursor,
    ) -> EngineResult<ExecutionOutcome> {
        let id = cursor.record.id;
        let iteration = cursor.record.iteration_count;
        let revision = cursor
            .latest
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("session {id} has no revision")))?;

        if slot.abort_requested() {
            let outcome = ExecutionOutcome::runtime_failure(revision.id(), ABORTED_MESSAGE, None, 0);
            self.record_outcome(cursor, &outcome).await?;
            self.fail(cursor, FatalReason::Aborted).await?;
            return Ok(outcome);
        }

        obs::emit_cycle_started(id, iteration, revision.source_digest().short());
        self.move_to(cursor, SessionState::Checking).await?;

        let checker = self.checker.clone();
        let source = revision.source_text().to_string();
        let verdict = tokio::task::spawn_blocking(move || checker.check(&source))
            .await
            .unwrap_or_else(|e| PolicyResult::ParseError {
                message: format!("policy check failed: {e}"),
                location: crate::domain::SourceLocation::new(1, 1),
            });
        debug!(verdict = %verdict, "policy check finished");

        let outcome = match (verdict.rejection_status(), verdict.to_finding()) {
            (Some(status), Some(finding)) => {
                obs::emit_policy_rejected(id, status, &finding.reason);
                ExecutionOutcome::rejected(revision.id(), status, finding)
            }
            _ if slot.abort_requested() => {
                ExecutionOutcome::runtime_failure(revision.id(), ABORTED_MESSAGE, None, 0)
            }
            _ => {
                self.move_to(cursor, SessionState::Running).await?;
                let request = RunRequest::new(cursor.record.url.clone(), self.settings.run_timeout);
                self.executor
                    .execute(&revision, &request, slot.abort.subscribe())
                    .await
            }
        };

        self.record_outcome(cursor, &outcome).await?;
        obs::emit_cycle_finished(
            id,
            iteration,
            outcome.status,
            outcome.duration_ms,
            outcome.record_count(),
        );

        let fingerprint = diagnose(&outcome, &self.settings.reporter)
            .map(|d| FailureFingerprint::new(revision.source_digest().clone(), d));
        let verdict = if slot.abort_requested() && !outcome.status.is_success() {
            CycleVerdict::Fatal(FatalReason::Aborted)
        } else {
            judge_cycle(
                outcome.status,
                iteration,
                cursor.record.max_iterations,
                cursor.last_failure.as_ref(),
                fingerprint.as_ref(),
                self.settings.detect_no_progress,
            )
        };
        cursor.last_failure = fingerprint;

        match verdict {
            CycleVerdict::Fatal(reason) => self.fail(cursor, reason).await?,
            CycleVerdict::Succeeded => {
                self.move_to(cursor, SessionState::Succeeded).await?;
                obs::emit_session_terminal(id, SessionState::Succeeded, None, iteration);
            }
            CycleVerdict::NeedsFix => self.move_to(cursor, SessionState::NeedsFix).await?,
        }
        Ok(outcome)
    }
}

fn invalid_state(cursor: &SessionCursor, operation: &'static str) -> EngineError {
    EngineError::InvalidState {
        session: cursor.record.id,
        state: cursor.record.state,
        operation,
    }
}
