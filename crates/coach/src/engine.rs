use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use runsync_transport::{
    BoxFuture, CoachTransport, GoalId, MessageId, Role, SendMessageResponse, StreamEvent, Thread,
    ThreadId, TransportError, TransportStreamHandle,
};
use snafu::{IntoError, ResultExt};
use tokio::sync::{mpsc, watch};

use super::error::{
    BusySnafu, NonStreamingSendFailedSnafu, RejectReason, SendRejectedSnafu, SessionError,
    SessionResult, StreamAbortedSnafu, StreamTransportFailedSnafu, ThreadArchiveFailedSnafu,
    ThreadRestoreFailedSnafu,
};
use super::events::SessionEvent;
use super::message::Message;
use super::resolver::ThreadResolver;
use super::session::{CoachSession, Surface, TurnOutcome};
use super::state::{SessionState, SessionTransition};
use super::store::{MessageStore, TurnToken};

/// Whether the bound goal's thread is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadStatus {
    #[default]
    Unbound,
    Resolving,
    /// Resolution finished; the goal may still have no thread yet.
    Ready,
    /// Resolution failed; `reload` retries it.
    Unresolved,
}

/// Observable state of one conversation surface, republished after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub goal_id: Option<GoalId>,
    /// Thread header; its history lives in `messages`.
    pub thread: Option<Thread>,
    pub thread_status: ThreadStatus,
    pub state: SessionState,
    pub messages: Vec<Message>,
    pub input: String,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct SessionCore {
    goal_id: Option<GoalId>,
    thread: Option<Thread>,
    thread_status: ThreadStatus,
    state: SessionState,
    store: MessageStore,
    input: String,
    last_error: Option<String>,
    epoch: u64,
}

impl SessionCore {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            goal_id: self.goal_id,
            thread: self.thread.clone(),
            thread_status: self.thread_status,
            state: self.state.clone(),
            messages: self.store.messages().to_vec(),
            input: self.input.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Starts a new generation; anything captured under the old epoch is discarded.
    fn rebind(&mut self, goal_id: Option<GoalId>, thread_status: ThreadStatus) -> u64 {
        self.epoch = self.epoch.saturating_add(1);
        self.goal_id = goal_id;
        self.thread = None;
        self.thread_status = thread_status;
        self.state = SessionState::Idle;
        self.store.clear();
        self.last_error = None;
        self.epoch
    }

    fn adopt_thread(&mut self, thread: Option<Thread>) {
        match thread {
            Some(mut thread) => {
                self.store
                    .replace_with_server(std::mem::take(&mut thread.messages));
                self.thread = Some(thread);
            }
            None => {
                self.store.clear();
                self.thread = None;
            }
        }
        self.thread_status = ThreadStatus::Ready;
    }

    fn transition(&mut self, transition: SessionTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                self.state = next;
                true
            }
            Err(rejection) => {
                tracing::warn!(?rejection, state = ?self.state, "rejected session transition");
                false
            }
        }
    }
}

/// What a turn captured when it started.
#[derive(Debug, Clone, Copy)]
struct TurnContext {
    turn: TurnToken,
    epoch: u64,
    goal_id: GoalId,
    thread_id: Option<ThreadId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnBranch {
    FoundThread,
    Stream(ThreadId),
    Send(ThreadId),
}

/// A thread archive or restore that holds the surface's thread slot.
#[derive(Debug, Clone, Copy)]
struct ThreadChange {
    goal_id: GoalId,
    thread_id: Option<ThreadId>,
    previous: ThreadStatus,
    epoch: u64,
}

enum FoldStep {
    Continue,
    Completed(TurnOutcome),
    Aborted(String),
    Stale,
}

struct EngineInner {
    transport: Arc<dyn CoachTransport>,
    resolver: ThreadResolver,
    surface: Surface,
    core: Mutex<SessionCore>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Conversation session engine for one surface.
///
/// Cloning yields another handle to the same session. Two surfaces on the same thread
/// use two engines; they never share a message store.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn new(
        transport: Arc<dyn CoachTransport>,
        surface: Surface,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(EngineInner {
                resolver: ThreadResolver::new(Arc::clone(&transport)),
                transport,
                surface,
                core: Mutex::new(SessionCore::default()),
                snapshot_tx,
                events,
            }),
        }
    }

    pub fn surface(&self) -> Surface {
        self.inner.surface
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().store.messages().to_vec()
    }

    pub fn goal(&self) -> Option<GoalId> {
        self.lock().goal_id
    }

    pub fn thread(&self) -> Option<Thread> {
        self.lock().thread.clone()
    }

    pub fn thread_status(&self) -> ThreadStatus {
        self.lock().thread_status
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn dismiss_error(&self) {
        let mut core = self.lock();
        if core.last_error.take().is_some() {
            self.publish(&core);
        }
    }

    pub fn input(&self) -> String {
        self.lock().input.clone()
    }

    pub fn set_input(&self, text: impl Into<String>) {
        let mut core = self.lock();
        core.input = text.into();
        self.publish(&core);
    }

    /// Sends the current input buffer, clearing it once the turn starts.
    pub async fn submit_input(&self) -> SessionResult<TurnOutcome> {
        let text = self.input();
        self.run_turn(&text, true).await
    }

    /// Binds the surface to a goal and loads that goal's active thread.
    ///
    /// Rebinding the goal already bound is a no-op. Turns still in flight for the
    /// previous goal finish on their own; their results are not applied here.
    pub async fn bind_goal(&self, goal_id: GoalId) -> SessionResult<()> {
        let epoch = {
            let mut core = self.lock();
            if core.goal_id == Some(goal_id)
                && matches!(
                    core.thread_status,
                    ThreadStatus::Ready | ThreadStatus::Resolving
                )
            {
                return Ok(());
            }
            let epoch = core.rebind(Some(goal_id), ThreadStatus::Resolving);
            self.publish(&core);
            epoch
        };

        tracing::debug!(goal_id = %goal_id, epoch, surface = self.surface().as_str(), "binding goal");
        let resolved = self.inner.resolver.resolve(goal_id).await;

        let mut core = self.lock();
        if core.epoch != epoch {
            tracing::debug!(goal_id = %goal_id, epoch, "discarding stale goal resolution");
            return Ok(());
        }

        match resolved {
            Ok(thread) => {
                core.adopt_thread(thread);
                self.publish(&core);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(goal_id = %goal_id, error = %error, "failed to resolve goal thread");
                core.thread_status = ThreadStatus::Unresolved;
                core.last_error = Some(error.reason());
                self.publish(&core);
                Err(error)
            }
        }
    }

    /// Re-reads the bound goal's active thread from the server.
    pub async fn reload(&self) -> SessionResult<()> {
        let (goal_id, epoch) = {
            let core = self.lock();
            let Some(goal_id) = core.goal_id else {
                return Ok(());
            };
            if core.state.is_in_flight() || core.thread_status == ThreadStatus::Resolving {
                return BusySnafu { stage: "reload" }.fail();
            }
            (goal_id, core.epoch)
        };

        let resolved = self.inner.resolver.resolve(goal_id).await;

        let mut core = self.lock();
        if core.epoch != epoch || !core.state.is_idle() {
            tracing::debug!(goal_id = %goal_id, epoch, "discarding reload superseded by newer activity");
            return Ok(());
        }

        match resolved {
            Ok(thread) => {
                core.adopt_thread(thread);
                self.publish(&core);
                Ok(())
            }
            Err(error) => {
                tracing::warn!(goal_id = %goal_id, error = %error, "failed to reload goal thread");
                core.last_error = Some(error.reason());
                self.publish(&core);
                Err(error)
            }
        }
    }

    /// Archives the active thread so the next send founds a fresh one.
    ///
    /// Returns the archived thread, or `None` when the goal has no thread yet. Sends are
    /// refused with `ThreadNotReady` until the archive call settles.
    pub async fn archive_thread(&self) -> SessionResult<Option<ThreadId>> {
        let Some(change) = self.claim_thread_slot("archive-thread")? else {
            return Ok(None);
        };
        let Some(thread_id) = change.thread_id else {
            self.release_thread_slot(change, None);
            return Ok(None);
        };

        let archived = self
            .inner
            .transport
            .archive_thread(thread_id)
            .await
            .context(ThreadArchiveFailedSnafu {
                stage: "archive-thread",
                thread_id,
            });

        match archived {
            Ok(()) => {
                let mut core = self.lock();
                if core.epoch == change.epoch {
                    core.adopt_thread(None);
                    self.publish(&core);
                }
                tracing::info!(goal_id = %change.goal_id, thread_id = %thread_id, "archived coaching thread");
                Ok(Some(thread_id))
            }
            Err(error) => {
                tracing::warn!(thread_id = %thread_id, error = %error, "failed to archive thread");
                self.release_thread_slot(change, Some(&error));
                Err(error)
            }
        }
    }

    /// Archived threads of the bound goal, newest first.
    pub async fn archived_threads(&self) -> SessionResult<Vec<Thread>> {
        let Some(goal_id) = self.goal() else {
            return Ok(Vec::new());
        };
        self.inner.resolver.archived(goal_id).await
    }

    /// Restores an archived thread of the bound goal and shows its history on this surface.
    ///
    /// A later `reload` picks the active thread again by creation time.
    pub async fn restore_thread(&self, thread_id: ThreadId) -> SessionResult<()> {
        let Some(change) = self.claim_thread_slot("restore-thread")? else {
            return Ok(());
        };

        let restored = self.restore_and_load(change.goal_id, thread_id).await;
        match restored {
            Ok(thread) => {
                let mut core = self.lock();
                if core.epoch == change.epoch {
                    core.adopt_thread(Some(thread));
                    self.publish(&core);
                }
                tracing::info!(goal_id = %change.goal_id, thread_id = %thread_id, "restored coaching thread");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(thread_id = %thread_id, error = %error, "failed to restore thread");
                self.release_thread_slot(change, Some(&error));
                Err(error)
            }
        }
    }

    async fn restore_and_load(&self, goal_id: GoalId, thread_id: ThreadId) -> SessionResult<Thread> {
        self.inner
            .transport
            .restore_thread(thread_id)
            .await
            .context(ThreadRestoreFailedSnafu {
                stage: "restore-thread",
                thread_id,
            })?;

        let thread = self.inner.resolver.load(goal_id, thread_id).await?;
        if thread.goal_id != goal_id {
            return Err(ThreadRestoreFailedSnafu {
                stage: "check-restored-thread-goal",
                thread_id,
            }
            .into_error(TransportError::Remote {
                stage: "check-restored-thread-goal",
                message: format!("thread belongs to goal {}", thread.goal_id),
            }));
        }
        Ok(thread)
    }

    /// Marks the thread as changing so no turn starts on it; `None` when no goal is bound.
    fn claim_thread_slot(&self, stage: &'static str) -> SessionResult<Option<ThreadChange>> {
        let mut core = self.lock();
        let Some(goal_id) = core.goal_id else {
            return Ok(None);
        };
        if core.state.is_in_flight() || core.thread_status == ThreadStatus::Resolving {
            return BusySnafu { stage }.fail();
        }

        let change = ThreadChange {
            goal_id,
            thread_id: core.thread.as_ref().map(|thread| thread.id),
            previous: core.thread_status,
            epoch: core.epoch,
        };
        core.thread_status = ThreadStatus::Resolving;
        core.last_error = None;
        self.publish(&core);
        Ok(Some(change))
    }

    fn release_thread_slot(&self, change: ThreadChange, error: Option<&SessionError>) {
        let mut core = self.lock();
        if core.epoch != change.epoch {
            return;
        }
        core.thread_status = change.previous;
        if let Some(error) = error {
            core.last_error = Some(error.reason());
        }
        self.publish(&core);
    }

    /// Tears the surface down. Results of turns still in flight are discarded.
    pub fn close(&self) {
        let mut core = self.lock();
        let epoch = core.rebind(None, ThreadStatus::Unbound);
        core.input.clear();
        self.publish(&core);
        tracing::debug!(epoch, surface = self.surface().as_str(), "closed session surface");
    }

    /// Sends one user message and drives its turn to completion or rollback.
    ///
    /// The input buffer is left alone; use [`Self::submit_input`] to send what was typed.
    pub async fn send(&self, text: &str) -> SessionResult<TurnOutcome> {
        self.run_turn(text, false).await
    }

    async fn run_turn(&self, text: &str, from_input: bool) -> SessionResult<TurnOutcome> {
        let content = text.trim();
        let (context, branch) = self.begin_turn(content, from_input)?;

        tracing::debug!(
            goal_id = %context.goal_id,
            turn = context.turn.0,
            epoch = context.epoch,
            ?branch,
            "started turn"
        );

        let result = match branch {
            TurnBranch::FoundThread => self.found_thread(context, content).await,
            TurnBranch::Stream(thread_id) => self.stream_turn(context, thread_id, content).await,
            TurnBranch::Send(thread_id) => self.send_turn(context, thread_id, content).await,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                if self.fail_turn(context, &error) {
                    Err(error)
                } else {
                    Ok(TurnOutcome::Discarded)
                }
            }
        }
    }

    fn begin_turn(
        &self,
        content: &str,
        from_input: bool,
    ) -> SessionResult<(TurnContext, TurnBranch)> {
        if content.is_empty() {
            return SendRejectedSnafu {
                stage: "guard-send",
                reason: RejectReason::EmptyText,
            }
            .fail();
        }

        let mut core = self.lock();
        let Some(goal_id) = core.goal_id else {
            return SendRejectedSnafu {
                stage: "guard-send",
                reason: RejectReason::NoGoalBound,
            }
            .fail();
        };
        if core.thread_status != ThreadStatus::Ready {
            return SendRejectedSnafu {
                stage: "guard-send",
                reason: RejectReason::ThreadNotReady,
            }
            .fail();
        }
        if !core.state.is_idle() {
            return SendRejectedSnafu {
                stage: "guard-send",
                reason: RejectReason::TurnInFlight,
            }
            .fail();
        }

        if from_input {
            core.input.clear();
        }
        core.last_error = None;
        let turn = core.store.begin_turn(content);
        core.transition(SessionTransition::Begin(turn));

        let thread_id = core.thread.as_ref().map(|thread| thread.id);
        let surface = self.surface();
        let branch = match thread_id {
            None => {
                if surface.streams_responses() {
                    core.store.attach_placeholder(turn, false);
                }
                core.transition(SessionTransition::AwaitThread(turn));
                TurnBranch::FoundThread
            }
            Some(thread_id)
                if surface.streams_responses() && self.inner.transport.supports_streaming() =>
            {
                core.store.attach_placeholder(turn, true);
                core.transition(SessionTransition::Stream(turn));
                TurnBranch::Stream(thread_id)
            }
            Some(thread_id) => TurnBranch::Send(thread_id),
        };
        self.publish(&core);

        Ok((
            TurnContext {
                turn,
                epoch: core.epoch,
                goal_id,
                thread_id,
            },
            branch,
        ))
    }

    async fn found_thread(
        &self,
        context: TurnContext,
        content: &str,
    ) -> SessionResult<TurnOutcome> {
        let thread = self.inner.resolver.found(context.goal_id, content).await?;

        let plan_changed = {
            let mut core = self.lock();
            if core.epoch != context.epoch {
                tracing::debug!(
                    goal_id = %context.goal_id,
                    thread_id = %thread.id,
                    "discarding thread creation for a torn-down surface"
                );
                return Ok(TurnOutcome::Discarded);
            }

            core.adopt_thread(Some(thread.clone()));
            core.transition(SessionTransition::Complete(context.turn));
            self.publish(&core);

            core.store
                .messages()
                .iter()
                .rev()
                .find(|message| message.role == Role::Assistant)
                .is_some_and(Message::touches_plan)
        };

        tracing::info!(
            goal_id = %context.goal_id,
            thread_id = %thread.id,
            turn = context.turn.0,
            "created coaching thread"
        );
        let thread_id = thread.id;
        self.emit(SessionEvent::ThreadCreated(thread));
        if plan_changed {
            self.emit(SessionEvent::PlanChanged);
        }
        Ok(TurnOutcome::ThreadCreated { thread_id })
    }

    async fn stream_turn(
        &self,
        context: TurnContext,
        thread_id: ThreadId,
        content: &str,
    ) -> SessionResult<TurnOutcome> {
        let TransportStreamHandle { mut stream, worker } = self
            .inner
            .transport
            .stream_message(thread_id, content)
            .await
            .context(StreamTransportFailedSnafu {
                stage: "open-stream",
                thread_id,
            })?;
        tokio::spawn(worker);

        let mut stale = false;
        while let Some(event) = stream.recv().await {
            if stale {
                continue;
            }

            match self.fold_stream_event(context, event) {
                FoldStep::Continue => {}
                FoldStep::Completed(outcome) => return Ok(outcome),
                FoldStep::Aborted(reason) => {
                    return StreamAbortedSnafu {
                        stage: "fold-stream",
                        thread_id,
                        reason,
                    }
                    .fail();
                }
                FoldStep::Stale => {
                    tracing::debug!(
                        thread_id = %thread_id,
                        turn = context.turn.0,
                        epoch = context.epoch,
                        "draining stream of a torn-down surface"
                    );
                    stale = true;
                }
            }
        }

        if stale {
            return Ok(TurnOutcome::Discarded);
        }
        StreamAbortedSnafu {
            stage: "fold-stream",
            thread_id,
            reason: "stream ended before a terminal event",
        }
        .fail()
    }

    fn fold_stream_event(&self, context: TurnContext, event: StreamEvent) -> FoldStep {
        let mut core = self.lock();
        if core.epoch != context.epoch {
            return FoldStep::Stale;
        }

        match event {
            StreamEvent::Thought { content } => {
                core.store.append_thought(context.turn, &content);
                self.publish(&core);
                tracing::debug!(turn = context.turn.0, len = content.len(), "folded thought");
                FoldStep::Continue
            }
            StreamEvent::Text { content } => {
                core.store.append_text(context.turn, &content);
                self.publish(&core);
                tracing::debug!(turn = context.turn.0, len = content.len(), "folded text");
                FoldStep::Continue
            }
            StreamEvent::Meta {
                user_message_id,
                coach_message_id,
                sessions_affected,
            } => {
                let plan_changed = sessions_affected
                    .as_ref()
                    .is_some_and(|sessions| !sessions.is_empty());
                core.store.reconcile(
                    context.turn,
                    user_message_id,
                    coach_message_id,
                    sessions_affected,
                );
                core.transition(SessionTransition::Complete(context.turn));
                self.publish(&core);
                drop(core);

                self.complete(context, user_message_id, coach_message_id, plan_changed)
            }
            StreamEvent::Error { content } => FoldStep::Aborted(content),
        }
    }

    fn complete(
        &self,
        context: TurnContext,
        user_message_id: MessageId,
        coach_message_id: MessageId,
        plan_changed: bool,
    ) -> FoldStep {
        tracing::info!(
            goal_id = %context.goal_id,
            turn = context.turn.0,
            user_message_id = %user_message_id,
            coach_message_id = %coach_message_id,
            plan_changed,
            "completed turn"
        );
        if plan_changed {
            self.emit(SessionEvent::PlanChanged);
        }
        FoldStep::Completed(TurnOutcome::Completed {
            user_message_id,
            coach_message_id,
        })
    }

    async fn send_turn(
        &self,
        context: TurnContext,
        thread_id: ThreadId,
        content: &str,
    ) -> SessionResult<TurnOutcome> {
        let response = self
            .inner
            .transport
            .send_message(thread_id, content)
            .await
            .context(NonStreamingSendFailedSnafu {
                stage: "send-message",
                thread_id,
            })?;

        let step = self.apply_send_response(context, response);
        match step {
            FoldStep::Completed(outcome) => Ok(outcome),
            FoldStep::Stale | FoldStep::Continue | FoldStep::Aborted(_) => {
                tracing::debug!(
                    thread_id = %thread_id,
                    turn = context.turn.0,
                    "discarding reply for a torn-down surface"
                );
                Ok(TurnOutcome::Discarded)
            }
        }
    }

    fn apply_send_response(&self, context: TurnContext, response: SendMessageResponse) -> FoldStep {
        let mut core = self.lock();
        if core.epoch != context.epoch {
            return FoldStep::Stale;
        }

        let plan_changed = response.touches_plan();
        let user_message_id = response.user_message.id;
        let coach_message_id = response.coach_response.id;
        let mut coach_response = response.coach_response;
        let coach_sessions_empty = coach_response
            .sessions_affected
            .as_ref()
            .is_none_or(|sessions| sessions.is_empty());
        if coach_sessions_empty && response.sessions_modified.is_some() {
            coach_response.sessions_affected = response.sessions_modified;
        }

        core.store
            .replace_turn(context.turn, response.user_message, coach_response);
        core.transition(SessionTransition::Complete(context.turn));
        self.publish(&core);
        drop(core);

        self.complete(context, user_message_id, coach_message_id, plan_changed)
    }

    /// Rolls a failed turn back; returns false when the turn belonged to an old epoch.
    fn fail_turn(&self, context: TurnContext, error: &SessionError) -> bool {
        let reason = error.reason();
        {
            let mut core = self.lock();
            if core.epoch != context.epoch {
                tracing::debug!(
                    turn = context.turn.0,
                    epoch = context.epoch,
                    error = %error,
                    "dropping failure of a torn-down surface"
                );
                return false;
            }

            core.store.rollback(context.turn);
            core.transition(SessionTransition::Fail {
                turn: context.turn,
                reason: reason.clone(),
            });
            core.transition(SessionTransition::ResetToIdle);
            core.last_error = Some(reason.clone());
            self.publish(&core);
        }

        tracing::warn!(
            goal_id = %context.goal_id,
            thread_id = ?context.thread_id.map(|id| id.get()),
            turn = context.turn.0,
            error = %error,
            "send failed, rolled back provisional messages"
        );
        if let Some(kind) = error.failure_kind() {
            self.emit(SessionEvent::SendFailed { kind, reason });
        }
        true
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }

    fn publish(&self, core: &SessionCore) {
        self.inner.snapshot_tx.send_replace(core.snapshot());
    }

    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoachSession for SessionEngine {
    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, SessionResult<TurnOutcome>> {
        Box::pin(SessionEngine::send(self, text))
    }

    fn state(&self) -> SessionState {
        SessionEngine::state(self)
    }

    fn messages(&self) -> Vec<Message> {
        SessionEngine::messages(self)
    }

    fn goal(&self) -> Option<GoalId> {
        SessionEngine::goal(self)
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionEngine")
            .field("surface", &self.inner.surface)
            .finish_non_exhaustive()
    }
}
