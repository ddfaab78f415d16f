//! Agent session ledger models.
//!
//! A session tracks one query through the four-stage agent pipeline.
//! Executions and handoffs are append-only rows owned by the session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "sqlx")]
use sqlx::FromRow;

/// One stage of the reasoning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    /// Retrieves relevant memories and builds the context text
    Memory,
    /// Turns the goal and context into a step-by-step plan
    Planner,
    /// Works the plan into an answer and insights
    Reasoner,
    /// Reflects on the answer and picks the insights worth keeping
    Reflector,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Memory => "MEMORY",
            AgentType::Planner => "PLANNER",
            AgentType::Reasoner => "REASONER",
            AgentType::Reflector => "REFLECTOR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MEMORY" => Some(AgentType::Memory),
            "PLANNER" => Some(AgentType::Planner),
            "REASONER" => Some(AgentType::Reasoner),
            "REFLECTOR" => Some(AgentType::Reflector),
            _ => None,
        }
    }

    /// Position of the stage in the pipeline, starting at 0.
    pub fn sequence(&self) -> i64 {
        match self {
            AgentType::Memory => 0,
            AgentType::Planner => 1,
            AgentType::Reasoner => 2,
            AgentType::Reflector => 3,
        }
    }

    /// The stage that consumes this stage's handoff.
    pub fn next(&self) -> Option<AgentType> {
        match self {
            AgentType::Memory => Some(AgentType::Planner),
            AgentType::Planner => Some(AgentType::Reasoner),
            AgentType::Reasoner => Some(AgentType::Reflector),
            AgentType::Reflector => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of an agent session.
///
/// Moves only pending -> running -> {complete, error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// States a session may be in immediately before entering `self`.
    pub fn allowed_predecessors(&self) -> &'static [SessionStatus] {
        match self {
            Self::Pending => &[],
            Self::Running => &[Self::Pending],
            Self::Complete | Self::Error => &[Self::Running],
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Agent session record from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
pub struct AgentSession {
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    pub status: String,
    pub context_memory_ids: Option<String>, // JSON array
    pub resumed_from: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    /// Get status as enum.
    pub fn status_enum(&self) -> Option<SessionStatus> {
        SessionStatus::from_str(&self.status)
    }

    /// Parse context_memory_ids JSON into a vector.
    pub fn context_memory_ids_vec(&self) -> Vec<String> {
        self.context_memory_ids
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.status_enum().is_some_and(|s| s.is_terminal())
    }
}

/// Log entry for one completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
pub struct AgentExecution {
    pub session_id: String,
    pub sequence: i64,
    pub agent_type: String,
    pub output: String, // JSON
    pub created_at: DateTime<Utc>,
}

impl AgentExecution {
    pub fn agent_type_enum(&self) -> Option<AgentType> {
        AgentType::from_str(&self.agent_type)
    }

    pub fn output_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.output).unwrap_or(serde_json::Value::Null)
    }
}

/// Payload passed from one stage to the next, persisted before the next
/// stage starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
pub struct AgentHandoff {
    pub session_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub data: String, // JSON
    pub created_at: DateTime<Utc>,
}

impl AgentHandoff {
    pub fn from_enum(&self) -> Option<AgentType> {
        AgentType::from_str(&self.from_agent)
    }

    pub fn to_enum(&self) -> Option<AgentType> {
        AgentType::from_str(&self.to_agent)
    }

    pub fn data_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or(serde_json::Value::Null)
    }
}
