//! Four-stage reasoning pipeline: MEMORY -> PLANNER -> REASONER -> REFLECTOR.
//!
//! Every stage's output is logged as an execution, and the next stage's
//! input is logged as a handoff before that stage starts. A session that
//! failed can therefore be resumed from its last handoff.

use std::sync::Arc;

use recall_models::{
    AgentHandoff, AgentSession, AgentType, MemorySource, NewMemory, SessionStatus,
    INSIGHT_IMPORTANCE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::agents::{
    run_planner, run_reasoner, run_reflector, MemoryStageOutput, MemoryToPlanner,
    PlannerToReasoner, ReasonerToReflector, ReflectorResult,
};
use super::clients::CompletionClient;
use super::extraction::{RecordWriter, StoreOutcome};
use super::retrieval::Retriever;
use crate::db::{self, CreateAgentSession, DbPool};
use crate::error::{Error, Result};

/// Tag carried by every insight written back to memory.
pub const INSIGHT_TAG: &str = "insight";

/// The answer to one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub session_id: String,
    pub result: String,
    pub reflection: String,
    pub key_insights: Vec<String>,
}

/// A session with its executions and handoffs, in stage order.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTrail {
    pub session: AgentSession,
    pub executions: Vec<recall_models::AgentExecution>,
    pub handoffs: Vec<AgentHandoff>,
}

/// Handle on the detached insight write-back of a finished run.
///
/// Dropping it leaves the task running.
pub struct InsightWriteback {
    handle: Option<JoinHandle<StoreOutcome>>,
}

impl InsightWriteback {
    fn none() -> Self {
        Self { handle: None }
    }

    /// Wait for the write-back to finish.
    pub async fn wait(self) -> StoreOutcome {
        match self.handle {
            None => StoreOutcome::default(),
            Some(handle) => handle.await.unwrap_or_else(|e| StoreOutcome {
                stored: Vec::new(),
                errors: vec![format!("Insight write-back task failed: {}", e)],
            }),
        }
    }
}

/// Where a run picks up, carrying that stage's input.
enum Stage {
    Memory,
    Planner(MemoryToPlanner),
    Reasoner(PlannerToReasoner),
    Reflector(ReasonerToReflector),
}

impl Stage {
    /// The stage an existing handoff feeds.
    fn from_handoff(handoff: &AgentHandoff) -> Result<Self> {
        let data = handoff.data_json();
        match handoff.to_enum() {
            Some(AgentType::Planner) => Ok(Stage::Planner(MemoryToPlanner::from_json(&data))),
            Some(AgentType::Reasoner) => Ok(Stage::Reasoner(PlannerToReasoner::from_json(&data))),
            Some(AgentType::Reflector) => {
                Ok(Stage::Reflector(ReasonerToReflector::from_json(&data)))
            }
            _ => Err(Error::Internal(format!(
                "Handoff of session {} targets unknown stage {}",
                handoff.session_id, handoff.to_agent
            ))),
        }
    }
}

/// Runs and resumes agent sessions against the ledger.
#[derive(Clone)]
pub struct Orchestrator {
    db: DbPool,
    llm: Arc<dyn CompletionClient>,
    retriever: Retriever,
    writer: RecordWriter,
}

impl Orchestrator {
    pub fn new(
        db: DbPool,
        llm: Arc<dyn CompletionClient>,
        retriever: Retriever,
        writer: RecordWriter,
    ) -> Self {
        Self {
            db,
            llm,
            retriever,
            writer,
        }
    }

    /// Answer `query` for `user_id`. The insight write-back is detached.
    pub async fn run_pipeline(&self, query: &str, user_id: &str) -> Result<PipelineResult> {
        let (result, _writeback) = self.run_pipeline_with_writeback(query, user_id).await?;
        Ok(result)
    }

    /// Like [`Self::run_pipeline`], also returning the write-back handle.
    pub async fn run_pipeline_with_writeback(
        &self,
        query: &str,
        user_id: &str,
    ) -> Result<(PipelineResult, InsightWriteback)> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidInput("Query is empty".into()));
        }
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput("User id is empty".into()));
        }

        let session = db::create_agent_session(
            &self.db,
            CreateAgentSession {
                session_id: recall_models::new_id(),
                user_id: user_id.to_string(),
                query: query.to_string(),
                resumed_from: None,
            },
        )
        .await?;

        info!(session_id = %session.session_id, user_id, "Created agent session");

        self.drive(session, Stage::Memory).await
    }

    /// Continue an errored session in a new session.
    pub async fn resume_pipeline(&self, session_id: &str) -> Result<PipelineResult> {
        let (result, _writeback) = self.resume_pipeline_with_writeback(session_id).await?;
        Ok(result)
    }

    /// Like [`Self::resume_pipeline`], also returning the write-back handle.
    ///
    /// Executions and handoffs of the stages that finished are copied into
    /// the new session; the run restarts at the stage the last handoff fed.
    pub async fn resume_pipeline_with_writeback(
        &self,
        session_id: &str,
    ) -> Result<(PipelineResult, InsightWriteback)> {
        let old = db::get_agent_session(&self.db, session_id).await?;
        if old.status_enum() != Some(SessionStatus::Error) {
            return Err(Error::InvalidTransition(format!(
                "session {} is {}, only errored sessions can be resumed",
                session_id, old.status
            )));
        }

        let executions = db::list_executions(&self.db, session_id).await?;
        let handoffs = db::list_handoffs(&self.db, session_id).await?;

        let session = db::create_agent_session(
            &self.db,
            CreateAgentSession {
                session_id: recall_models::new_id(),
                user_id: old.user_id.clone(),
                query: old.query.clone(),
                resumed_from: Some(old.session_id.clone()),
            },
        )
        .await?;

        for handoff in &handoffs {
            let Some(from) = handoff.from_enum() else {
                continue;
            };
            if let Some(execution) = executions
                .iter()
                .find(|e| e.agent_type_enum() == Some(from))
            {
                db::record_execution(&self.db, &session.session_id, from, &execution.output_json())
                    .await?;
            }
            if let Some(to) = handoff.to_enum() {
                db::record_handoff(&self.db, &session.session_id, from, to, &handoff.data_json())
                    .await?;
            }
        }

        let context_ids = old.context_memory_ids_vec();
        if !context_ids.is_empty() {
            db::set_context_memories(&self.db, &session.session_id, &context_ids).await?;
        }

        let start = match handoffs.last() {
            Some(handoff) => Stage::from_handoff(handoff)?,
            None => Stage::Memory,
        };

        info!(
            session_id = %session.session_id,
            resumed_from = %old.session_id,
            copied_handoffs = handoffs.len(),
            "Resuming agent session"
        );

        self.drive(session, start).await
    }

    /// The full ledger trail of a session.
    pub async fn trail(&self, session_id: &str) -> Result<SessionTrail> {
        Ok(SessionTrail {
            session: db::get_agent_session(&self.db, session_id).await?,
            executions: db::list_executions(&self.db, session_id).await?,
            handoffs: db::list_handoffs(&self.db, session_id).await?,
        })
    }

    async fn drive(
        &self,
        session: AgentSession,
        start: Stage,
    ) -> Result<(PipelineResult, InsightWriteback)> {
        let session_id = session.session_id.clone();
        db::update_session_status(&self.db, &session_id, SessionStatus::Running, None).await?;

        match self.complete_stages(&session, start).await {
            Ok((result, reflected)) => {
                metrics::counter!("recall_sessions_total", "status" => "complete").increment(1);
                info!(
                    session_id = %session_id,
                    key_insights = reflected.key_insights.len(),
                    "Agent session complete"
                );

                let writeback =
                    self.spawn_writeback(&session_id, &session.user_id, &reflected.key_insights);

                Ok((
                    PipelineResult {
                        session_id,
                        result,
                        reflection: reflected.reflection,
                        key_insights: reflected.key_insights,
                    },
                    writeback,
                ))
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Agent session failed");
                metrics::counter!("recall_sessions_total", "status" => "error").increment(1);

                let message = e.to_string();
                if let Err(mark) = db::update_session_status(
                    &self.db,
                    &session_id,
                    SessionStatus::Error,
                    Some(&message),
                )
                .await
                {
                    warn!(session_id = %session_id, error = %mark, "Failed to mark session as errored");
                }

                Err(e)
            }
        }
    }

    /// Run the remaining stages and mark the session complete. A failure of
    /// either step leaves the session for the error branch of `drive`.
    async fn complete_stages(
        &self,
        session: &AgentSession,
        start: Stage,
    ) -> Result<(String, ReflectorResult)> {
        let outcome = self.run_stages(session, start).await?;
        db::update_session_status(&self.db, &session.session_id, SessionStatus::Complete, None)
            .await?;
        Ok(outcome)
    }

    /// Run from `start` to the end. Returns the reasoner's answer and the
    /// reflection.
    async fn run_stages(
        &self,
        session: &AgentSession,
        start: Stage,
    ) -> Result<(String, ReflectorResult)> {
        let session_id = session.session_id.as_str();
        let mut stage = start;

        loop {
            stage = match stage {
                Stage::Memory => {
                    let memories = self
                        .retriever
                        .retrieve(&session.user_id, &session.query)
                        .await?;
                    let output = MemoryStageOutput::new(memories);
                    self.record(session_id, AgentType::Memory, &output).await?;
                    db::set_context_memories(&self.db, session_id, &output.memory_ids()).await?;

                    info!(session_id, memories = output.memories.len(), "MEMORY stage done");

                    let handoff = MemoryToPlanner {
                        goal: session.query.clone(),
                        context: output.context,
                    };
                    self.handoff(session_id, AgentType::Memory, &handoff).await?;
                    Stage::Planner(handoff)
                }
                Stage::Planner(input) => {
                    let planned = run_planner(self.llm.as_ref(), &input).await?;
                    self.record(session_id, AgentType::Planner, &planned).await?;

                    info!(session_id, steps = planned.plan.len(), "PLANNER stage done");

                    let handoff = PlannerToReasoner::new(&input, &planned);
                    self.handoff(session_id, AgentType::Planner, &handoff).await?;
                    Stage::Reasoner(handoff)
                }
                Stage::Reasoner(input) => {
                    let reasoned = run_reasoner(self.llm.as_ref(), &input).await?;
                    self.record(session_id, AgentType::Reasoner, &reasoned).await?;

                    info!(session_id, insights = reasoned.insights.len(), "REASONER stage done");

                    let handoff = ReasonerToReflector::from(&reasoned);
                    self.handoff(session_id, AgentType::Reasoner, &handoff).await?;
                    Stage::Reflector(handoff)
                }
                Stage::Reflector(input) => {
                    let reflected = run_reflector(self.llm.as_ref(), &input).await?;
                    self.record(session_id, AgentType::Reflector, &reflected).await?;

                    info!(
                        session_id,
                        key_insights = reflected.key_insights.len(),
                        "REFLECTOR stage done"
                    );

                    return Ok((input.result, reflected));
                }
            };
        }
    }

    async fn record<T: Serialize>(&self, session_id: &str, agent: AgentType, output: &T) -> Result<()> {
        let value = serde_json::to_value(output)?;
        db::record_execution(&self.db, session_id, agent, &value).await?;
        metrics::counter!("recall_stage_total", "agent" => agent.as_str()).increment(1);
        Ok(())
    }

    async fn handoff<T: Serialize>(&self, session_id: &str, from: AgentType, data: &T) -> Result<()> {
        let to = from.next().ok_or_else(|| {
            Error::Internal(format!("{} has no following stage", from))
        })?;
        let value: Value = serde_json::to_value(data)?;
        db::record_handoff(&self.db, session_id, from, to, &value).await?;
        Ok(())
    }

    fn spawn_writeback(
        &self,
        session_id: &str,
        user_id: &str,
        insights: &[String],
    ) -> InsightWriteback {
        let inputs: Vec<NewMemory> = insights
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .map(|text| insight_memory(user_id, text))
            .collect();

        if inputs.is_empty() {
            return InsightWriteback::none();
        }

        let writer = self.writer.clone();
        let session_id = session_id.to_string();

        let handle = tokio::spawn(async move {
            match writer.store_records(inputs).await {
                Ok(outcome) => {
                    for err in &outcome.errors {
                        warn!(session_id = %session_id, error = %err, "Insight write-back failed");
                    }
                    info!(session_id = %session_id, stored = outcome.stored.len(), "Insights written back");
                    outcome
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Insight write-back failed");
                    StoreOutcome {
                        stored: Vec::new(),
                        errors: vec![e.to_string()],
                    }
                }
            }
        });

        InsightWriteback {
            handle: Some(handle),
        }
    }
}

/// A reflector insight as a memory input.
pub fn insight_memory(user_id: &str, insight: &str) -> NewMemory {
    NewMemory::new(user_id, format!("INSIGHT: {}", insight))
        .with_source(MemorySource::AgentReflection)
        .with_importance(INSIGHT_IMPORTANCE)
        .with_tags(vec![INSIGHT_TAG.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insight_memory_shape() {
        let input = insight_memory("user-1", "X is Y");
        assert_eq!(input.content, "INSIGHT: X is Y");
        assert_eq!(input.source, MemorySource::AgentReflection);
        assert_eq!(input.importance, 0.8);
        assert_eq!(input.tags, vec!["insight"]);
    }

    #[test]
    fn test_stage_from_handoff() {
        let handoff = AgentHandoff {
            session_id: "s".into(),
            from_agent: "PLANNER".into(),
            to_agent: "REASONER".into(),
            data: r#"{"goal":"g","plan":["a"],"context":"c","plannerReasoning":"r"}"#.into(),
            created_at: chrono::Utc::now(),
        };

        match Stage::from_handoff(&handoff).unwrap() {
            Stage::Reasoner(input) => {
                assert_eq!(input.plan, vec!["a"]);
                assert_eq!(input.planner_reasoning, "r");
            }
            _ => panic!("expected the reasoner stage"),
        }

        let bad = AgentHandoff {
            to_agent: "MEMORY".into(),
            ..handoff
        };
        assert!(Stage::from_handoff(&bad).is_err());
    }

    #[tokio::test]
    async fn test_empty_writeback_resolves_immediately() {
        let outcome = InsightWriteback::none().wait().await;
        assert!(outcome.stored.is_empty());
        assert!(outcome.errors.is_empty());
    }
}
