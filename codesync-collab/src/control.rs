//! JSON control channel carried in text frames.
//!
//! Text frames share the connection with the binary sync protocol but are
//! independent of it. Every frame is a tagged object:
//!
//! ```text
//! inbound                               outbound
//! {"type":"edit","content":…}      ──►  {"type":"edit",…}            to other members
//!                                       {"type":"ai_status",…}       to sender, after debounce
//!                                       {"type":"ai_suggestion",…}
//! {"type":"ping"}                  ──►  {"type":"pong"}
//! {"type":"cursor_move","cursor":…}──►  {"type":"cursor_update",…}   to other members
//! {"type":"request_ai_analysis"}   ──►  ai_suggestion | ai_error
//! {"type":"request_optimization"}  ──►  ai_status, optimization_complete | optimization_error
//! ```
//!
//! A frame without `type` is an edit. Malformed JSON and unknown types are
//! dropped. The `connection` welcome precedes the reply to a connection's
//! first text frame, so binary-only clients never see a text frame.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::analysis::{AnalysisService, AnalysisSummary, OptimizationReport, Suggestion};
use crate::debounce::DebounceScheduler;
use crate::protocol::ClientId;
use crate::session::SessionManager;
use crate::storage::{document_id, DocumentStore, StoreError, StoredDocument};

/// Welcome snippets carry at most this many characters of content.
pub const WELCOME_PREVIEW_CHARS: usize = 200;

/// Inbound control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Edit {
        #[serde(default)]
        content: String,
    },
    Ping,
    CursorMove {
        #[serde(default)]
        cursor: Value,
    },
    RequestAiAnalysis {
        #[serde(default)]
        content: String,
    },
    RequestOptimization,
}

impl ControlMessage {
    /// Parse a text frame. Objects without a `type` are edits.
    pub fn parse(text: &str) -> Option<Self> {
        let mut value: Value = serde_json::from_str(text).ok()?;
        let object = value.as_object_mut()?;
        if !object.contains_key("type") {
            object.insert("type".into(), Value::String("edit".into()));
        }
        match serde_json::from_value(value) {
            Ok(message) => Some(message),
            Err(e) => {
                log::debug!("Ignoring control frame: {e}");
                None
            }
        }
    }
}

/// Stored-document summary sent in the welcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: i64,
    pub title: String,
    pub content: String,
}

impl From<&StoredDocument> for DocumentInfo {
    fn from(doc: &StoredDocument) -> Self {
        Self {
            id: doc.id,
            title: doc.title.clone(),
            content: doc.content.chars().take(WELCOME_PREVIEW_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionData {
    pub suggestions: Vec<Suggestion>,
    pub analysis: AnalysisSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationData {
    pub optimization: OptimizationReport,
}

/// Outbound control events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Connection {
        message: String,
        document: Option<DocumentInfo>,
    },
    Pong,
    CursorUpdate {
        cursor: Value,
    },
    Edit {
        content: String,
        user_type: String,
    },
    AiStatus {
        status: String,
        message: String,
    },
    AiSuggestion {
        suggestion_data: SuggestionData,
        /// Milliseconds since epoch
        timestamp: u64,
    },
    AiError {
        message: String,
    },
    OptimizationComplete {
        data: OptimizationData,
    },
    OptimizationError {
        message: String,
    },
}

impl ControlEvent {
    pub fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                log::error!("Failed to encode control event: {e}");
                None
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-connection control state, owned by the connection loop.
#[derive(Debug, Default)]
pub struct ControlState {
    last_content: String,
    welcomed: bool,
}

/// Handles text frames for every connection.
pub struct ControlChannel {
    sessions: Arc<SessionManager>,
    store: Arc<dyn DocumentStore>,
    analysis: Arc<dyn AnalysisService>,
    scheduler: DebounceScheduler,
}

impl ControlChannel {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn DocumentStore>,
        analysis: Arc<dyn AnalysisService>,
        debounce: Duration,
    ) -> Self {
        Self {
            sessions,
            store,
            analysis,
            scheduler: DebounceScheduler::new(debounce),
        }
    }

    pub fn scheduler(&self) -> &DebounceScheduler {
        &self.scheduler
    }

    pub async fn handle_text(&self, client_id: ClientId, state: &mut ControlState, text: &str) {
        let Some(doc_key) = self.sessions.doc_key(client_id) else {
            return;
        };
        if !state.welcomed {
            state.welcomed = true;
            self.welcome(client_id, &doc_key);
        }
        let Some(message) = ControlMessage::parse(text) else {
            return;
        };

        match message {
            ControlMessage::Edit { content } => self.edit(client_id, &doc_key, state, content),
            ControlMessage::Ping => send(&self.sessions, client_id, &ControlEvent::Pong),
            ControlMessage::CursorMove { cursor } => {
                if let Some(frame) = (ControlEvent::CursorUpdate { cursor }).to_message() {
                    self.sessions.broadcast(&doc_key, frame, Some(client_id));
                }
            }
            ControlMessage::RequestAiAnalysis { content } => {
                let task = self.analysis_task(client_id);
                let store = self.store.clone();
                tokio::spawn(async move {
                    let (content, filename) = if content.is_empty() {
                        match load(store.as_ref(), &doc_key) {
                            Ok(Some(doc)) => (doc.content, Some(doc.title)),
                            Ok(None) => {
                                task.send(&ControlEvent::AiError {
                                    message: "Document not found".into(),
                                });
                                return;
                            }
                            Err(e) => {
                                task.send(&ControlEvent::AiError { message: e.to_string() });
                                return;
                            }
                        }
                    } else {
                        (content, None)
                    };
                    task.analyze(&content, filename.as_deref()).await;
                });
            }
            ControlMessage::RequestOptimization => {
                let task = self.analysis_task(client_id);
                let store = self.store.clone();
                tokio::spawn(async move { task.optimize(store.as_ref(), &doc_key).await });
            }
        }
    }

    fn welcome(&self, client_id: ClientId, doc_key: &str) {
        let document = match load(self.store.as_ref(), doc_key) {
            Ok(doc) => doc.as_ref().map(DocumentInfo::from),
            Err(e) => {
                log::error!("Failed to load document {doc_key} for welcome: {e}");
                None
            }
        };
        send(
            &self.sessions,
            client_id,
            &ControlEvent::Connection {
                message: format!("Connected to document {doc_key}"),
                document,
            },
        );
    }

    fn edit(&self, client_id: ClientId, doc_key: &str, state: &mut ControlState, content: String) {
        if content == state.last_content {
            return;
        }
        state.last_content = content.clone();

        if let Some(id) = document_id(doc_key) {
            match self.store.save_content(id, &content) {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => log::debug!("Edit for unknown document {id}"),
                Err(e) => log::error!("Failed to save document {id}: {e}"),
            }
        }

        let relay = ControlEvent::Edit {
            content: content.clone(),
            user_type: "human".into(),
        };
        if let Some(frame) = relay.to_message() {
            self.sessions.broadcast(doc_key, frame, Some(client_id));
        }

        let task = self.analysis_task(client_id);
        self.scheduler.schedule(doc_key, client_id, move || async move {
            task.send(&ControlEvent::AiStatus {
                status: "analyzing".into(),
                message: "AI analyzing...".into(),
            });
            task.analyze(&content, None).await;
        });
    }

    fn analysis_task(&self, client_id: ClientId) -> AnalysisTask {
        AnalysisTask {
            sessions: self.sessions.clone(),
            analysis: self.analysis.clone(),
            client_id,
        }
    }

    /// Cancel the connection's pending analysis.
    pub fn on_disconnect(&self, doc_key: &str, client_id: ClientId) {
        self.scheduler.cancel(doc_key, client_id);
    }
}

fn send(sessions: &SessionManager, client_id: ClientId, event: &ControlEvent) {
    if let Some(frame) = event.to_message() {
        sessions.send_to(client_id, frame);
    }
}

fn load(store: &dyn DocumentStore, doc_key: &str) -> Result<Option<StoredDocument>, StoreError> {
    match document_id(doc_key) {
        Some(id) => store.load(id),
        None => Ok(None),
    }
}

/// Everything a detached analysis needs to reply to its connection.
struct AnalysisTask {
    sessions: Arc<SessionManager>,
    analysis: Arc<dyn AnalysisService>,
    client_id: ClientId,
}

impl AnalysisTask {
    fn send(&self, event: &ControlEvent) {
        send(&self.sessions, self.client_id, event);
    }

    async fn analyze(&self, content: &str, filename: Option<&str>) {
        match self.analysis.analyze(content, filename).await {
            Ok(report) => self.send(&ControlEvent::AiSuggestion {
                suggestion_data: SuggestionData {
                    suggestions: report.suggestions,
                    analysis: report.analysis,
                },
                timestamp: now_millis(),
            }),
            Err(e) => {
                log::warn!("Analysis for client {} failed: {e}", self.client_id);
                self.send(&ControlEvent::AiError { message: e.to_string() });
            }
        }
    }

    async fn optimize(&self, store: &dyn DocumentStore, doc_key: &str) {
        self.send(&ControlEvent::AiStatus {
            status: "optimizing".into(),
            message: "Optimizing code...".into(),
        });
        let doc = match load(store, doc_key) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                self.send(&ControlEvent::OptimizationError {
                    message: "Document not found".into(),
                });
                return;
            }
            Err(e) => {
                self.send(&ControlEvent::OptimizationError { message: e.to_string() });
                return;
            }
        };
        match self.analysis.optimize(&doc.content, Some(&doc.title)).await {
            Ok(optimization) => self.send(&ControlEvent::OptimizationComplete {
                data: OptimizationData { optimization },
            }),
            Err(e) => self.send(&ControlEvent::OptimizationError { message: e.to_string() }),
        }
    }
}
