//! Agent session ledger queries.
//!
//! Sessions are the only rows updated in place, and only their status
//! fields. Executions and handoffs are append-only, one per stage.

use chrono::Utc;
use recall_models::{AgentExecution, AgentHandoff, AgentSession, AgentType, SessionStatus};
use serde_json::Value;

use super::DbPool;
use crate::{Error, Result};

/// Orders handoffs by the pipeline position of their sending stage.
const HANDOFF_STAGE_ORDER: &str = r#"
    CASE from_agent
        WHEN 'MEMORY' THEN 0
        WHEN 'PLANNER' THEN 1
        WHEN 'REASONER' THEN 2
        ELSE 3
    END
"#;

/// Input for creating an agent session.
#[derive(Debug, Clone)]
pub struct CreateAgentSession {
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    pub resumed_from: Option<String>,
}

// ============================================================================
// Session Queries
// ============================================================================

/// Create a new session in the `pending` state.
pub async fn create_agent_session(pool: &DbPool, input: CreateAgentSession) -> Result<AgentSession> {
    let now = Utc::now();

    sqlx::query_as::<_, AgentSession>(
        r#"
        INSERT INTO agent_sessions (session_id, user_id, query, status, resumed_from, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&input.session_id)
    .bind(&input.user_id)
    .bind(&input.query)
    .bind(SessionStatus::Pending.as_str())
    .bind(&input.resumed_from)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

/// Get a session by ID.
pub async fn get_agent_session(pool: &DbPool, session_id: &str) -> Result<AgentSession> {
    sqlx::query_as::<_, AgentSession>("SELECT * FROM agent_sessions WHERE session_id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Agent session not found: {}", session_id)))
}

/// List a user's sessions, most recent first.
pub async fn list_user_sessions(
    pool: &DbPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<AgentSession>> {
    sqlx::query_as::<_, AgentSession>(
        r#"
        SELECT * FROM agent_sessions
        WHERE user_id = ?
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Move a session to `status`.
///
/// Rejects any move not allowed by [`SessionStatus::can_transition_to`].
/// Entering a terminal state stamps `completed_at`; `error` is recorded
/// only when given.
pub async fn update_session_status(
    pool: &DbPool,
    session_id: &str,
    status: SessionStatus,
    error: Option<&str>,
) -> Result<AgentSession> {
    let current = get_agent_session(pool, session_id).await?;
    let from = current.status_enum().ok_or_else(|| {
        Error::Internal(format!("Session {} has unknown status {}", session_id, current.status))
    })?;

    if !from.can_transition_to(status) {
        return Err(Error::InvalidTransition(format!(
            "session {}: {} -> {}",
            session_id, from, status
        )));
    }

    let now = Utc::now();
    let completed_at = status.is_terminal().then_some(now);

    // The status guard makes a concurrent transition lose instead of overwrite.
    sqlx::query_as::<_, AgentSession>(
        r#"
        UPDATE agent_sessions
        SET status = ?, updated_at = ?, completed_at = COALESCE(?, completed_at), error = COALESCE(?, error)
        WHERE session_id = ? AND status = ?
        RETURNING *
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(completed_at)
    .bind(error)
    .bind(session_id)
    .bind(from.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        Error::InvalidTransition(format!(
            "session {} changed state before {} could be applied",
            session_id, status
        ))
    })
}

/// Record the memory ids the MEMORY stage handed on, in rank order.
pub async fn set_context_memories(
    pool: &DbPool,
    session_id: &str,
    memory_ids: &[String],
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE agent_sessions
        SET context_memory_ids = ?, updated_at = ?
        WHERE session_id = ?
        "#,
    )
    .bind(serde_json::to_string(memory_ids)?)
    .bind(Utc::now())
    .bind(session_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Agent session not found: {}", session_id)));
    }

    Ok(())
}

// ============================================================================
// Execution Queries
// ============================================================================

/// Append a stage's output. Each stage runs at most once per session.
pub async fn record_execution(
    pool: &DbPool,
    session_id: &str,
    agent: AgentType,
    output: &Value,
) -> Result<AgentExecution> {
    sqlx::query_as::<_, AgentExecution>(
        r#"
        INSERT INTO agent_executions (session_id, sequence, agent_type, output, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(session_id)
    .bind(agent.sequence())
    .bind(agent.as_str())
    .bind(output.to_string())
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

/// List a session's executions in stage order.
pub async fn list_executions(pool: &DbPool, session_id: &str) -> Result<Vec<AgentExecution>> {
    sqlx::query_as::<_, AgentExecution>(
        r#"
        SELECT * FROM agent_executions
        WHERE session_id = ?
        ORDER BY sequence ASC
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

// ============================================================================
// Handoff Queries
// ============================================================================

/// Append the payload `from` passes to `to`.
pub async fn record_handoff(
    pool: &DbPool,
    session_id: &str,
    from: AgentType,
    to: AgentType,
    data: &Value,
) -> Result<AgentHandoff> {
    sqlx::query_as::<_, AgentHandoff>(
        r#"
        INSERT INTO agent_handoffs (session_id, from_agent, to_agent, data, created_at)
        VALUES (?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(session_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(data.to_string())
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

/// List a session's handoffs in stage order.
pub async fn list_handoffs(pool: &DbPool, session_id: &str) -> Result<Vec<AgentHandoff>> {
    let sql = format!(
        "SELECT * FROM agent_handoffs WHERE session_id = ? ORDER BY {} ASC",
        HANDOFF_STAGE_ORDER
    );

    sqlx::query_as::<_, AgentHandoff>(&sql)
        .bind(session_id)
        .fetch_all(pool)
        .await
        .map_err(Error::Database)
}

/// The furthest handoff a session reached, if any.
pub async fn last_handoff(pool: &DbPool, session_id: &str) -> Result<Option<AgentHandoff>> {
    let sql = format!(
        "SELECT * FROM agent_handoffs WHERE session_id = ? ORDER BY {} DESC LIMIT 1",
        HANDOFF_STAGE_ORDER
    );

    sqlx::query_as::<_, AgentHandoff>(&sql)
        .bind(session_id)
        .fetch_optional(pool)
        .await
        .map_err(Error::Database)
}
