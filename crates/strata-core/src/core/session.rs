//! Chat session orchestration.
//!
//! `ChatSession` owns everything one open chat needs: the latest stream
//! snapshot, the knowledge graph, explicitly appended tool events (graph
//! growth and answer validation) and the persisted events loaded on open.
//! All state sits behind one lock that is never held across an await, so
//! graph growth, validation and stream updates may interleave freely while
//! each state change stays atomic.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::graph::{EdgeChange, Graph, GraphError, GraphNode, GraphSnapshot, NodeChange};
use super::jobs::JobRegistry;
use super::layout::LayoutEngine;
use super::message::{Message, MessageKind, MessageStatus, Role, ToolInput, ToolStatus};
use super::persistence::{ChatSummary, Debouncer, ProjectSnapshot, SNAPSHOT_VERSION};
use super::planner;
use super::reconcile::{LiveEvents, reconcile};
use super::services::{
    PersistenceService, ProposalRequest, ProposalResponse, ProposalService, ValidationRequest,
    ValidationResponse, ValidationService, ValidationStatus, Viewport,
};
use super::timeline::{FallbackClock, map_turns, turn_text};
use super::tool_events::{aggregate, upsert_event};
use super::turn::{StreamState, Turn, TurnMetadata};
use crate::config::Config;

/// Job id of the conversation stream in the job registry.
pub const STREAM_JOB: &str = "stream";

const GRAPH_TOOL_NAME: &str = "grow_graph";
const VALIDATION_TOOL_NAME: &str = "validate_answer";
const VALIDATION_CALL_PREFIX: &str = "validate-";

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub proposals: Arc<dyn ProposalService>,
    pub validation: Arc<dyn ValidationService>,
    pub layout: Arc<dyn LayoutEngine>,
    pub viewport: Arc<dyn Viewport>,
    /// `None` keeps the session in memory only.
    pub persistence: Option<Arc<dyn PersistenceService>>,
}

/// What a retry did, or what the caller has to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// The streaming layer should regenerate this turn.
    Regenerate { turn_id: String },
    /// Validation ran again; the refreshed event.
    Validation(Message),
    /// Graph growth ran again; the refreshed event.
    GraphGrowth(Message),
}

#[derive(Debug, Default)]
struct SessionState {
    stream: StreamState,
    persisted_events: Vec<Message>,
    graph_events: Vec<Message>,
    validation_events: Vec<Message>,
    graph: Graph,
    selected_node: Option<String>,
    auto_layout_locked: bool,
    browser_validation_by_url: BTreeMap<String, Value>,
    clock: FallbackClock,
    stream_token: Option<CancellationToken>,
    growth_requests: HashMap<String, ProposalRequest>,
}

impl SessionState {
    fn timeline(&mut self) -> Vec<Message> {
        let base = map_turns(&self.stream, &mut self.clock);
        let aggregated = aggregate(&self.stream, &mut self.clock);
        let live = LiveEvents::new(
            aggregated,
            self.graph_events.clone(),
            self.validation_events.clone(),
        );
        reconcile(base, &self.persisted_events, &live)
    }

    fn turn(&self, turn_id: &str) -> Option<&Turn> {
        self.stream.turns.iter().find(|turn| turn.id == turn_id)
    }
}

struct Growth {
    node_ids: Vec<String>,
    explanation: Option<String>,
}

pub struct ChatSession {
    project: PathBuf,
    chat_id: String,
    config: Config,
    services: SessionServices,
    jobs: JobRegistry,
    debouncer: Option<Debouncer>,
    state: Mutex<SessionState>,
}

impl ChatSession {
    /// Opens a chat, loading its stored snapshot when persistence is set up.
    pub async fn open(
        project: impl Into<PathBuf>,
        chat_id: impl Into<String>,
        config: Config,
        services: SessionServices,
        jobs: JobRegistry,
    ) -> Result<Self> {
        let project = project.into();
        let chat_id = chat_id.into();
        let snapshot = match &services.persistence {
            Some(store) => store
                .load(&project, &chat_id)
                .await
                .with_context(|| format!("load chat {chat_id}"))?,
            None => None,
        };
        Ok(Self::from_snapshot(
            project,
            chat_id,
            snapshot.unwrap_or_default(),
            config,
            services,
            jobs,
        ))
    }

    /// Builds a session from an already loaded snapshot.
    ///
    /// Persisted text rows become the initial turn list; persisted tool
    /// events seed the reconciler.
    pub fn from_snapshot(
        project: impl Into<PathBuf>,
        chat_id: impl Into<String>,
        snapshot: ProjectSnapshot,
        config: Config,
        services: SessionServices,
        jobs: JobRegistry,
    ) -> Self {
        let turns = snapshot.text_messages().map(turn_from_message).collect();
        let persisted_events = snapshot.tool_events().cloned().collect();
        let debouncer = services
            .persistence
            .as_ref()
            .map(|store| Debouncer::new(Arc::clone(store), config.persist_debounce()));

        let state = SessionState {
            stream: StreamState {
                turns,
                ..StreamState::default()
            },
            persisted_events,
            graph: Graph::new(snapshot.nodes, snapshot.edges),
            auto_layout_locked: snapshot.auto_layout_locked,
            browser_validation_by_url: snapshot.browser_validation_by_url,
            ..SessionState::default()
        };

        Self {
            project: project.into(),
            chat_id: chat_id.into(),
            config,
            services,
            jobs,
            debouncer,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn is_busy(&self) -> bool {
        self.jobs.is_busy(&self.project, &self.chat_id)
    }

    // ========================================================================
    // Stream
    // ========================================================================

    /// Turn list the streaming layer should resume from.
    pub fn stream_state(&self) -> StreamState {
        self.lock().stream.clone()
    }

    pub fn apply_stream_update(&self, stream: StreamState) {
        self.lock().stream = stream;
        self.schedule_persist();
    }

    /// Starts a new turn, cancelling the stream of the previous one.
    ///
    /// Graph growth and validation started for earlier turns keep running.
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self.lock().stream_token.replace(token.clone());
        if let Some(previous) = previous {
            debug!(chat = %self.chat_id, "Cancelling previous stream");
            previous.cancel();
            self.jobs.finish(&self.project, &self.chat_id, STREAM_JOB);
        }
        self.jobs.start(&self.project, &self.chat_id, STREAM_JOB);
        token
    }

    pub fn finish_stream(&self) {
        let token = self.lock().stream_token.take();
        if token.is_some() {
            self.jobs.finish(&self.project, &self.chat_id, STREAM_JOB);
        }
        self.schedule_persist();
    }

    /// Reconciled transcript: mapped turns plus every tool event.
    pub fn timeline(&self) -> Vec<Message> {
        self.lock().timeline()
    }

    /// Follow-up work for a finished turn: graph growth and answer
    /// validation, as configured. Returns the resulting tool events.
    pub async fn on_turn_finished(&self, turn_id: &str) -> Vec<Message> {
        let grow = async {
            if self.config.auto_grow_graph {
                self.grow_graph(turn_id).await
            } else {
                None
            }
        };
        let validate = async {
            if self.config.validate_answers {
                self.validate_answer(turn_id).await
            } else {
                None
            }
        };
        let (grown, validated) = tokio::join!(grow, validate);
        grown.into_iter().chain(validated).collect()
    }

    // ========================================================================
    // Graph growth
    // ========================================================================

    /// Asks the proposal service for nodes backing `turn_id` and commits
    /// them. Returns the finished graph event, or `None` when the turn has
    /// no text to grow from.
    pub async fn grow_graph(&self, turn_id: &str) -> Option<Message> {
        let (event, request) = {
            let mut state = self.lock();
            let text = turn_text(state.turn(turn_id)?);
            if text.trim().is_empty() {
                debug!(turn = turn_id, "Skipping graph growth for empty turn");
                return None;
            }

            let selected = state
                .selected_node
                .clone()
                .filter(|id| state.graph.contains(id));
            let summary = selected
                .as_deref()
                .and_then(|id| state.graph.node(id))
                .and_then(GraphNode::label)
                .map(str::to_string);
            let request = ProposalRequest {
                project_path: self.project.clone(),
                response_id: turn_id.to_string(),
                response_text: text,
                selected_node_id: selected,
                selected_node_summary: summary,
                graph: GraphSnapshot::from_graph(&state.graph),
                settings: self.config.proposal_settings(),
            };

            let mut input = ToolInput::new(Some(turn_id.to_string()), Uuid::new_v4().to_string());
            if let Some(selected) = &request.selected_node_id {
                input
                    .extra
                    .insert("selectedNodeId".to_string(), json!(selected));
            }
            let event = Message::tool_event(
                MessageKind::GraphEvent,
                GRAPH_TOOL_NAME,
                input,
                ToolStatus::Running,
                state.clock.now(),
            );
            upsert_event(&mut state.graph_events, event.clone());
            state
                .growth_requests
                .insert(event.id.clone(), request.clone());
            (event, request)
        };

        Some(self.run_graph_growth(event, request).await)
    }

    async fn run_graph_growth(&self, mut event: Message, request: ProposalRequest) -> Message {
        let job_id = format!("graph:{}", event.id);
        self.jobs.start(&self.project, &self.chat_id, &job_id);
        self.schedule_persist();
        info!(chat = %self.chat_id, turn = %request.response_id, "Growing graph");

        let outcome = match self.services.proposals.propose(request.clone()).await {
            Ok(response) => self.commit_proposals(&request, response),
            Err(err) => Err(format!("{err:#}")),
        };

        match &outcome {
            Ok(growth) => {
                let count = growth.node_ids.len();
                event.finish_tool(
                    ToolStatus::Complete,
                    Some(json!({
                        "nodeIds": growth.node_ids,
                        "nodeCount": count,
                        "explanation": growth.explanation,
                    })),
                    None,
                );
                event.content = growth
                    .explanation
                    .clone()
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| format!("Added {count} nodes to the graph"));
                info!(chat = %self.chat_id, nodes = count, "Graph growth finished");
            }
            Err(error) => {
                warn!(chat = %self.chat_id, "Graph growth failed: {error}");
                event.finish_tool(ToolStatus::Failed, None, Some(error.clone()));
                event.content.clone_from(error);
            }
        }
        upsert_event(&mut self.lock().graph_events, event.clone());
        self.jobs.finish(&self.project, &self.chat_id, &job_id);

        if let Ok(growth) = &outcome
            && let Some(first) = growth.node_ids.first()
        {
            self.focus_node(first);
        }
        self.schedule_persist();
        event
    }

    /// Plans and commits a proposal batch against the current graph.
    fn commit_proposals(
        &self,
        request: &ProposalRequest,
        response: ProposalResponse,
    ) -> Result<Growth, String> {
        let mut state = self.lock();
        let placement = planner::plan(
            &state.graph,
            &request.graph,
            &response.nodes,
            Some(&request.response_id),
            self.services.layout.as_ref(),
        )
        .map_err(|err| err.to_string())?;
        let node_ids = planner::commit(&mut state.graph, placement).map_err(|err| err.to_string())?;
        Ok(Growth {
            node_ids,
            explanation: response.explanation,
        })
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Runs a deep-search validation of the answer in `turn_id`.
    ///
    /// The event id is derived from the turn, so validating the same turn
    /// again refreshes one row rather than adding another.
    pub async fn validate_answer(&self, turn_id: &str) -> Option<Message> {
        let (mut event, request) = {
            let mut state = self.lock();
            let index = state.stream.turns.iter().position(|turn| turn.id == turn_id)?;
            let answer = turn_text(&state.stream.turns[index]);
            if answer.trim().is_empty() {
                return None;
            }
            let query = state.stream.turns[..index]
                .iter()
                .rev()
                .find(|turn| turn.role == Role::User)
                .map(turn_text)
                .unwrap_or_default();

            let input = ToolInput::new(
                Some(turn_id.to_string()),
                format!("{VALIDATION_CALL_PREFIX}{turn_id}"),
            )
            .with_fields(&json!({ "query": query }));
            let mut event = Message::tool_event(
                MessageKind::DeepsearchEvent,
                VALIDATION_TOOL_NAME,
                input,
                ToolStatus::Running,
                state.clock.now(),
            );
            if let Some(previous) = state.validation_events.iter().find(|e| e.id == event.id) {
                event.created_at.clone_from(&previous.created_at);
            }
            upsert_event(&mut state.validation_events, event.clone());

            let request = ValidationRequest {
                project_path: self.project.clone(),
                query,
                answer,
                settings: self.config.validation_settings(),
                deep_research: self.config.deep_research,
            };
            (event, request)
        };

        let job_id = format!("validate:{turn_id}");
        self.jobs.start(&self.project, &self.chat_id, &job_id);
        self.schedule_persist();

        match self.services.validation.validate(request).await {
            Ok(response) => apply_validation(&mut event, response),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(chat = %self.chat_id, turn = turn_id, "Validation failed: {error}");
                event.finish_tool(ToolStatus::Failed, None, Some(error.clone()));
                event.content = error;
            }
        }
        debug!(turn = turn_id, status = ?event.tool_status, "Validation finished");

        upsert_event(&mut self.lock().validation_events, event.clone());
        self.jobs.finish(&self.project, &self.chat_id, &job_id);
        self.schedule_persist();
        Some(event)
    }

    // ========================================================================
    // Callbacks from the rendering layer
    // ========================================================================

    /// Re-issues the request behind a transcript row.
    pub async fn retry_message(&self, id: &str) -> Result<RetryAction> {
        let target = self
            .timeline()
            .into_iter()
            .find(|message| message.id == id)
            .with_context(|| format!("No message with id {id}"))?;

        match target.kind {
            MessageKind::Text => {
                if target.role == Role::Assistant && target.status == Some(MessageStatus::Failed) {
                    Ok(RetryAction::Regenerate { turn_id: target.id })
                } else {
                    bail!("Message {id} has not failed")
                }
            }
            MessageKind::DeepsearchEvent => {
                let Some(turn_id) = target
                    .tool_call_id()
                    .and_then(|call| call.strip_prefix(VALIDATION_CALL_PREFIX))
                else {
                    bail!("Only answer validations can be retried, not {id}");
                };
                self.validate_answer(turn_id)
                    .await
                    .map(RetryAction::Validation)
                    .with_context(|| format!("Turn {turn_id} has no answer to validate"))
            }
            MessageKind::GraphEvent => {
                let request = self.lock().growth_requests.get(id).cloned();
                if let Some(request) = request {
                    let mut event = target;
                    event.tool_status = Some(ToolStatus::Running);
                    event.tool_output = None;
                    event.error = None;
                    event.content.clear();
                    upsert_event(&mut self.lock().graph_events, event.clone());
                    return Ok(RetryAction::GraphGrowth(
                        self.run_graph_growth(event, request).await,
                    ));
                }
                let turn_id = target
                    .response_id()
                    .with_context(|| format!("Graph event {id} has no turn"))?
                    .to_string();
                self.grow_graph(&turn_id)
                    .await
                    .map(RetryAction::GraphGrowth)
                    .with_context(|| format!("Turn {turn_id} has no text to grow from"))
            }
            MessageKind::SubagentEvent => bail!("Sub-agent research cannot be retried"),
        }
    }

    /// Centers the canvas on a node. Failures are logged and ignored.
    pub fn focus_node(&self, node_id: &str) {
        if let Err(err) = self.services.viewport.center_on(node_id) {
            warn!(node = node_id, "Failed to focus node: {err:#}");
        }
    }

    /// Node new graph growth hangs off, if any.
    pub fn select_node(&self, node_id: Option<String>) {
        self.lock().selected_node = node_id;
    }

    // ========================================================================
    // Graph
    // ========================================================================

    pub fn graph(&self) -> Graph {
        self.lock().graph.clone()
    }

    pub fn apply_node_changes(&self, changes: Vec<NodeChange>) {
        self.lock().graph.apply_node_changes(changes);
        self.schedule_persist();
    }

    pub fn apply_edge_changes(&self, changes: Vec<EdgeChange>) -> Result<(), GraphError> {
        let result = self.lock().graph.apply_edge_changes(changes);
        self.schedule_persist();
        result
    }

    pub fn set_auto_layout_locked(&self, locked: bool) {
        self.lock().auto_layout_locked = locked;
        self.schedule_persist();
    }

    pub fn record_browser_validation(&self, url: impl Into<String>, result: Value) {
        self.lock()
            .browser_validation_by_url
            .insert(url.into(), result);
        self.schedule_persist();
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn snapshot(&self) -> ProjectSnapshot {
        let mut state = self.lock();
        let chat = state.timeline();
        ProjectSnapshot {
            nodes: state.graph.nodes.clone(),
            edges: state.graph.edges.clone(),
            chat,
            auto_layout_locked: state.auto_layout_locked,
            browser_validation_by_url: state.browser_validation_by_url.clone(),
            version: SNAPSHOT_VERSION,
        }
    }

    /// Schedules a debounced write. Needs a tokio runtime when persistence
    /// is configured.
    fn schedule_persist(&self) {
        if let Some(debouncer) = &self.debouncer {
            debouncer.schedule(&self.project, &self.chat_id, self.snapshot());
        }
    }

    /// Writes any pending snapshot immediately.
    pub async fn flush(&self) -> Result<Option<ChatSummary>> {
        match &self.debouncer {
            Some(debouncer) => debouncer.flush().await,
            None => Ok(None),
        }
    }
}

fn turn_from_message(message: &Message) -> Turn {
    let mut turn = Turn::new(message.id.clone(), message.role).with_text(message.content.clone());
    turn.metadata = TurnMetadata {
        created_at: Some(message.created_at.clone()),
        final_answer: None,
        status: message.status.filter(|status| status.is_terminal()),
        error: message.error.clone(),
    };
    turn
}

fn apply_validation(event: &mut Message, response: ValidationResponse) {
    let sources = response.sources.unwrap_or_default();
    let references = response.references.unwrap_or_default();
    let output = json!({
        "status": response.status,
        "query": response.query,
        "sources": sources,
        "references": references,
    });
    match response.status {
        ValidationStatus::Complete => {
            event.finish_tool(ToolStatus::Complete, Some(output), None);
            event.content = format!("Validated against {} sources", sources.len());
        }
        ValidationStatus::Skipped => {
            event.finish_tool(ToolStatus::Complete, Some(output), None);
            event.content = "Validation skipped".to_string();
        }
        ValidationStatus::Failed => {
            let error = "Validation failed".to_string();
            event.finish_tool(ToolStatus::Failed, Some(output), Some(error.clone()));
            event.content = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    use super::*;
    use crate::core::graph::{Edge, Position};
    use crate::core::layout::FanOutLayout;
    use crate::core::persistence::FileStore;
    use crate::core::services::{NoViewport, Proposal};
    use crate::core::turn::StreamStatus;

    // ------------------------------------------------------------------------
    // Mock collaborators
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct MockProposals {
        nodes: Vec<Proposal>,
        fail: bool,
        gate: Option<Arc<Notify>>,
        requests: Mutex<Vec<ProposalRequest>>,
    }

    #[async_trait]
    impl ProposalService for MockProposals {
        async fn propose(&self, request: ProposalRequest) -> Result<ProposalResponse> {
            self.requests.lock().unwrap().push(request);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(anyhow!("proposal service unavailable"));
            }
            Ok(ProposalResponse {
                nodes: self.nodes.clone(),
                explanation: None,
            })
        }
    }

    struct MockValidation {
        status: ValidationStatus,
        calls: AtomicUsize,
        requests: Mutex<Vec<ValidationRequest>>,
    }

    impl MockValidation {
        fn new(status: ValidationStatus) -> Self {
            Self {
                status,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ValidationService for MockValidation {
        async fn validate(&self, request: ValidationRequest) -> Result<ValidationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let query = request.query.clone();
            self.requests.lock().unwrap().push(request);
            Ok(ValidationResponse {
                status: self.status,
                query: Some(query),
                sources: Some(vec![json!({"url": "https://example.org/paris"})]),
                references: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingViewport {
        centered: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Viewport for RecordingViewport {
        fn center_on(&self, node_id: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow!("canvas not mounted"));
            }
            self.centered.lock().unwrap().push(node_id.to_string());
            Ok(())
        }
    }

    fn proposal(id: &str, parent: &str) -> Proposal {
        Proposal {
            id: Some(id.to_string()),
            title: format!("Insight {id}"),
            excerpt: "Paris is the capital.".to_string(),
            parent_id: parent.to_string(),
            response_id: None,
        }
    }

    fn services(
        proposals: Arc<MockProposals>,
        validation: Arc<MockValidation>,
        viewport: Arc<dyn Viewport>,
    ) -> SessionServices {
        SessionServices {
            proposals,
            validation,
            layout: Arc::new(FanOutLayout::default()),
            viewport,
            persistence: None,
        }
    }

    fn paris_stream(status: StreamStatus) -> StreamState {
        StreamState {
            turns: vec![
                Turn::new("u1", Role::User).with_text("What is the capital of France?"),
                Turn::new("t1", Role::Assistant).with_text("Paris is the capital."),
            ],
            status,
            error: None,
        }
    }

    fn seeded_snapshot() -> ProjectSnapshot {
        ProjectSnapshot {
            nodes: vec![GraphNode::question(
                "sel-node",
                "Capital of France",
                Position::new(0.0, 0.0),
            )],
            ..ProjectSnapshot::default()
        }
    }

    fn session_with(config: Config, services: SessionServices) -> ChatSession {
        let session = ChatSession::from_snapshot(
            "/work/project",
            "c1",
            seeded_snapshot(),
            config,
            services,
            JobRegistry::new(),
        );
        session.apply_stream_update(paris_stream(StreamStatus::Idle));
        session
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.clone()).collect()
    }

    // ------------------------------------------------------------------------
    // Graph growth
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn finished_turn_grows_graph_under_selected_node() {
        let gate = Arc::new(Notify::new());
        let proposals = Arc::new(MockProposals {
            nodes: vec![proposal("n1", "sel-node")],
            gate: Some(Arc::clone(&gate)),
            ..MockProposals::default()
        });
        let viewport = Arc::new(RecordingViewport::default());
        let camera: Arc<dyn Viewport> = Arc::<RecordingViewport>::clone(&viewport);
        let session = session_with(
            Config::default(),
            services(
                Arc::clone(&proposals),
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                camera,
            ),
        );
        session.select_node(Some("sel-node".to_string()));

        let observe_running = async {
            while session.timeline().len() < 3 {
                tokio::task::yield_now().await;
            }
            let timeline = session.timeline();
            assert_eq!(timeline.len(), 3);
            assert_eq!(timeline[1].id, "t1");
            assert_eq!(timeline[2].kind, MessageKind::GraphEvent);
            assert_eq!(timeline[2].tool_status, Some(ToolStatus::Running));
            assert!(session.is_busy());
            gate.notify_one();
        };
        let (events, ()) = tokio::join!(session.on_turn_finished("t1"), observe_running);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.tool_status, Some(ToolStatus::Complete));
        assert_eq!(event.tool_output.as_ref().unwrap()["nodeCount"], 1);
        assert_eq!(event.response_id(), Some("t1"));

        let timeline = session.timeline();
        assert_eq!(timeline[2].id, event.id);
        assert_eq!(timeline[2].tool_status, Some(ToolStatus::Complete));

        let graph = session.graph();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges, vec![Edge::link("sel-node", "n1")]);
        assert!(!session.is_busy());
        assert_eq!(*viewport.centered.lock().unwrap(), vec!["n1".to_string()]);

        let requests = proposals.requests.lock().unwrap();
        assert_eq!(requests[0].selected_node_id.as_deref(), Some("sel-node"));
        assert_eq!(
            requests[0].selected_node_summary.as_deref(),
            Some("Capital of France")
        );
        assert_eq!(requests[0].response_text, "Paris is the capital.");
    }

    #[tokio::test]
    async fn dangling_proposal_fails_event_and_leaves_graph() {
        let proposals = Arc::new(MockProposals {
            nodes: vec![proposal("n1", "X")],
            ..MockProposals::default()
        });
        let session = session_with(
            Config::default(),
            services(
                proposals,
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );
        let before = session.graph();

        let event = session.grow_graph("t1").await.unwrap();
        assert_eq!(event.tool_status, Some(ToolStatus::Failed));
        assert!(event.error.as_deref().unwrap().contains("Unresolved parent"));
        assert_eq!(session.graph(), before);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn service_failure_becomes_failed_event() {
        let proposals = Arc::new(MockProposals {
            fail: true,
            ..MockProposals::default()
        });
        let session = session_with(
            Config::default(),
            services(
                proposals,
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );

        let event = session.grow_graph("t1").await.unwrap();
        assert_eq!(event.tool_status, Some(ToolStatus::Failed));
        assert_eq!(event.content, "proposal service unavailable");
        // The text transcript is untouched.
        let timeline = session.timeline();
        assert_eq!(timeline[1].status, Some(MessageStatus::Complete));
    }

    #[tokio::test]
    async fn empty_turn_does_not_grow() {
        let proposals = Arc::new(MockProposals::default());
        let session = session_with(
            Config::default(),
            services(
                Arc::clone(&proposals),
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );
        let mut stream = paris_stream(StreamStatus::Idle);
        stream.turns.push(Turn::new("t2", Role::Assistant));
        session.apply_stream_update(stream);

        assert!(session.grow_graph("t2").await.is_none());
        assert!(session.grow_graph("missing").await.is_none());
        assert!(proposals.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn viewport_failure_is_ignored() {
        let proposals = Arc::new(MockProposals {
            nodes: vec![proposal("n1", "1")],
            ..MockProposals::default()
        });
        let viewport = Arc::new(RecordingViewport {
            fail: true,
            ..RecordingViewport::default()
        });
        let session = session_with(
            Config::default(),
            services(
                proposals,
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                viewport,
            ),
        );

        let event = session.grow_graph("t1").await.unwrap();
        assert_eq!(event.tool_status, Some(ToolStatus::Complete));
        assert_eq!(session.graph().edges, vec![Edge::link("sel-node", "n1")]);
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn skipped_validation_completes_with_skipped_output() {
        let validation = Arc::new(MockValidation::new(ValidationStatus::Skipped));
        let config = Config {
            auto_grow_graph: false,
            validate_answers: true,
            deep_research: true,
            ..Config::default()
        };
        let session = session_with(
            config,
            services(
                Arc::new(MockProposals::default()),
                Arc::clone(&validation),
                Arc::new(NoViewport),
            ),
        );

        let events = session.on_turn_finished("t1").await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.id, "deepsearch-validate-t1");
        assert_eq!(event.tool_status, Some(ToolStatus::Complete));
        assert_eq!(event.tool_output.as_ref().unwrap()["status"], "skipped");

        let requests = validation.requests.lock().unwrap();
        assert_eq!(requests[0].query, "What is the capital of France?");
        assert_eq!(requests[0].answer, "Paris is the capital.");
        assert!(requests[0].deep_research);
        drop(requests);

        assert_eq!(
            ids(&session.timeline()),
            ["u1", "t1", "deepsearch-validate-t1"]
        );
    }

    #[tokio::test]
    async fn growth_and_validation_run_together() {
        let config = Config {
            validate_answers: true,
            ..Config::default()
        };
        let session = session_with(
            config,
            services(
                Arc::new(MockProposals {
                    nodes: vec![proposal("n1", "sel-node")],
                    ..MockProposals::default()
                }),
                Arc::new(MockValidation::new(ValidationStatus::Failed)),
                Arc::new(NoViewport),
            ),
        );

        let events = session.on_turn_finished("t1").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, MessageKind::GraphEvent);
        assert_eq!(events[0].tool_status, Some(ToolStatus::Complete));
        assert_eq!(events[1].tool_status, Some(ToolStatus::Failed));

        let timeline = session.timeline();
        assert_eq!(timeline.len(), 4);
        assert_eq!(timeline[2].kind, MessageKind::DeepsearchEvent);
        assert_eq!(timeline[3].kind, MessageKind::GraphEvent);
    }

    // ------------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn failed_answer_asks_for_regeneration() {
        let session = session_with(
            Config::default(),
            services(
                Arc::new(MockProposals::default()),
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );
        let mut stream = paris_stream(StreamStatus::Error);
        stream.error = Some("connection reset".to_string());
        session.apply_stream_update(stream);

        let timeline = session.timeline();
        assert_eq!(timeline[1].status, Some(MessageStatus::Failed));
        assert_eq!(timeline[1].error.as_deref(), Some("connection reset"));

        let action = session.retry_message("t1").await.unwrap();
        assert_eq!(
            action,
            RetryAction::Regenerate {
                turn_id: "t1".to_string()
            }
        );
        assert!(session.retry_message("u1").await.is_err());
        assert!(session.retry_message("nope").await.is_err());
    }

    #[tokio::test]
    async fn retrying_validation_refreshes_the_same_row() {
        let validation = Arc::new(MockValidation::new(ValidationStatus::Complete));
        let session = session_with(
            Config::default(),
            services(
                Arc::new(MockProposals::default()),
                Arc::clone(&validation),
                Arc::new(NoViewport),
            ),
        );

        let first = session.validate_answer("t1").await.unwrap();
        let action = session.retry_message(&first.id).await.unwrap();
        let RetryAction::Validation(second) = action else {
            panic!("expected a validation retry");
        };

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(validation.calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.timeline().len(), 3);
    }

    #[tokio::test]
    async fn retrying_graph_event_reuses_stored_request() {
        let proposals = Arc::new(MockProposals {
            fail: true,
            ..MockProposals::default()
        });
        let session = session_with(
            Config::default(),
            services(
                Arc::clone(&proposals),
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );

        let failed = session.grow_graph("t1").await.unwrap();
        let action = session.retry_message(&failed.id).await.unwrap();
        let RetryAction::GraphGrowth(retried) = action else {
            panic!("expected a graph retry");
        };

        assert_eq!(retried.id, failed.id);
        let requests = proposals.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
        drop(requests);
        assert_eq!(session.timeline().len(), 3);
    }

    // ------------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------------

    #[test]
    fn new_turn_cancels_previous_stream() {
        let session = session_with(
            Config::default(),
            services(
                Arc::new(MockProposals::default()),
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );

        let first = session.begin_turn();
        assert!(session.is_busy());
        let second = session.begin_turn();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(
            session.jobs().running_jobs(session.project(), "c1"),
            vec![STREAM_JOB.to_string()]
        );

        session.finish_stream();
        assert!(!session.is_busy());
    }

    #[test]
    fn edge_changes_need_existing_endpoints() {
        let session = session_with(
            Config::default(),
            services(
                Arc::new(MockProposals::default()),
                Arc::new(MockValidation::new(ValidationStatus::Complete)),
                Arc::new(NoViewport),
            ),
        );

        let err = session
            .apply_edge_changes(vec![EdgeChange::Add {
                edge: Edge::link("sel-node", "ghost"),
            }])
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingEndpoint { .. }));

        session.apply_node_changes(vec![NodeChange::Remove {
            id: "sel-node".to_string(),
        }]);
        assert!(session.graph().nodes.is_empty());
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn reopened_chat_keeps_transcript_and_graph() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PersistenceService> = Arc::new(FileStore);
        let mut services = services(
            Arc::new(MockProposals {
                nodes: vec![proposal("n1", "sel-node")],
                ..MockProposals::default()
            }),
            Arc::new(MockValidation::new(ValidationStatus::Complete)),
            Arc::new(NoViewport),
        );
        services.persistence = Some(store);

        FileStore::write(dir.path(), "c1", &seeded_snapshot()).unwrap();
        let session = ChatSession::open(
            dir.path(),
            "c1",
            Config::default(),
            services.clone(),
            JobRegistry::new(),
        )
        .await
        .unwrap();
        session.apply_stream_update(paris_stream(StreamStatus::Idle));
        session.grow_graph("t1").await.unwrap();
        let before = session.timeline();
        let summary = session.flush().await.unwrap().unwrap();
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.title.as_deref(), Some("What is the capital of France?"));

        let reopened =
            ChatSession::open(dir.path(), "c1", Config::default(), services, JobRegistry::new())
                .await
                .unwrap();
        assert_eq!(reopened.stream_state().turns.len(), 2);
        assert_eq!(reopened.timeline(), before);
        assert_eq!(reopened.graph().nodes.len(), 2);
    }
}
