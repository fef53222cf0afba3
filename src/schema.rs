use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The user's original natural-language request, immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// The language model's actionable restatement of the goal. Created once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub text: String,
    pub formulated_at: DateTime<Utc>,
}

impl Objective {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            formulated_at: Utc::now(),
        }
    }
}

/// A screen element with its bbox already converted to pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedElement {
    pub content: String,
    pub kind: String,
    pub center: (i32, i32),
    pub top_left: (i32, i32),
    pub bottom_right: (i32, i32),
    pub interactive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedContext {
    pub screenshot_ref: String,
    pub elements: Vec<MappedElement>,
    pub captured_at: DateTime<Utc>,
    pub narrative: String,
}

/// What the engine knows about the screen. Degraded stands in when the
/// perception pipeline fails; callers never see an absent context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VisualContext {
    Parsed(ParsedContext),
    Degraded {
        reason: String,
        captured_at: DateTime<Utc>,
    },
}

impl VisualContext {
    pub fn degraded(reason: impl Into<String>) -> Self {
        VisualContext::Degraded {
            reason: reason.into(),
            captured_at: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, VisualContext::Degraded { .. })
    }

    /// Text handed to the language model as the screen description.
    pub fn narrative(&self) -> String {
        match self {
            VisualContext::Parsed(ctx) => ctx.narrative.clone(),
            VisualContext::Degraded { reason, .. } => {
                format!("Screen analysis unavailable ({}). Proceed from general knowledge of the desktop.", reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    CompletedWithFallback,
    Failed,
}

/// One ordered unit of the execution plan. The description is fixed at
/// planning time; only the status moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
}

impl Step {
    pub fn new(index: usize, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionProvenance {
    Model,
    Fallback,
    Emergency,
}

/// Closed union of dispatchable operations. LLM output reaches this type
/// only through `action_schema::normalize_action`, which folds the legacy
/// field-name aliases into these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Click { x: i32, y: i32 },
    Type { text: String },
    Key { key: String },
    KeySequence { keys: String },
    Scroll { amount: i32 },
    /// A kind the model invented. Dispatched as a settle wait, not a failure.
    Unrecognized { raw_kind: String },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Click { .. } => "click",
            ActionKind::Type { .. } => "type",
            ActionKind::Key { .. } => "key",
            ActionKind::KeySequence { .. } => "key_sequence",
            ActionKind::Scroll { .. } => "scroll",
            ActionKind::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Heuristic: did this operation likely change what is on screen?
    /// Used to annotate the cached context as stale, never to trigger
    /// an automatic re-parse.
    pub fn likely_changed_screen(&self) -> bool {
        match self {
            ActionKind::Click { .. } | ActionKind::Type { .. } | ActionKind::Scroll { .. } => true,
            ActionKind::Key { key } => {
                let k = key.to_lowercase();
                k == "enter" || k == "return" || k == "win" || k == "command" || k == "super"
            }
            ActionKind::KeySequence { .. } => true,
            ActionKind::Unrecognized { .. } => false,
        }
    }
}

/// A single resolved, executable OS operation. One per resolution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    pub description: String,
    pub confidence: u8,
    pub provenance: ActionProvenance,
}

impl Action {
    pub fn summary(&self) -> String {
        format!("[{}] {}", self.kind.name(), self.description)
    }
}

/// Append-only trace of one dispatched step. Dropped with the engine at
/// goal end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step_index: usize,
    pub action: Action,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    AcquiringContext,
    Planning,
    Executing,
    Completed,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::AcquiringContext => "acquiring_context",
            EngineState::Planning => "planning",
            EngineState::Executing => "executing",
            EngineState::Completed => "completed",
            EngineState::Failed => "failed",
        }
    }
}
