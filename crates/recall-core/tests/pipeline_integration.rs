//! Pipeline integration tests.
//!
//! Runs the orchestrator against an in-memory ledger, store and scripted
//! LLM, and checks what lands in the ledger and the memory store.

mod common;

use chrono::Utc;
use common::{harness, stage_replies, ScriptedLlm, DIM};
use recall_core::db;
use recall_core::services::agents::{MemoryToPlanner, PlannerToReasoner};
use recall_models::{AgentType, MemoryRecord, MemorySource, NewMemory, SessionStatus};

fn seed(h: &common::Harness, owner: &str, content: &str) -> MemoryRecord {
    let record = MemoryRecord::new(
        NewMemory::new(owner, content),
        recall_embeddings::hash_embed(content, DIM),
        DIM,
    )
    .unwrap();
    h.store.insert(record.clone());
    record
}

#[tokio::test]
async fn test_stages_run_in_order_and_are_logged() {
    let h = harness(ScriptedLlm::new(stage_replies(&[]))).await;
    let memory = seed(&h, "user-1", "User's favorite language is Go");

    let result = h
        .state
        .orchestrator
        .run_pipeline("Which language should I use?", "user-1")
        .await
        .unwrap();

    assert_eq!(result.result, "Use Go");
    assert_eq!(result.reflection, "Solid");
    assert!(result.key_insights.is_empty());

    let executions = db::list_executions(&h.db, &result.session_id).await.unwrap();
    let types: Vec<AgentType> = executions
        .iter()
        .filter_map(|e| e.agent_type_enum())
        .collect();
    assert_eq!(
        types,
        vec![
            AgentType::Memory,
            AgentType::Planner,
            AgentType::Reasoner,
            AgentType::Reflector
        ]
    );

    let handoffs = db::list_handoffs(&h.db, &result.session_id).await.unwrap();
    let edges: Vec<(String, String)> = handoffs
        .iter()
        .map(|h| (h.from_agent.clone(), h.to_agent.clone()))
        .collect();
    assert_eq!(
        edges,
        vec![
            ("MEMORY".to_string(), "PLANNER".to_string()),
            ("PLANNER".to_string(), "REASONER".to_string()),
            ("REASONER".to_string(), "REFLECTOR".to_string()),
        ]
    );

    let session = db::get_agent_session(&h.db, &result.session_id).await.unwrap();
    assert_eq!(session.status_enum(), Some(SessionStatus::Complete));
    assert!(session.completed_at.is_some());
    assert_eq!(session.context_memory_ids_vec(), vec![memory.id.clone()]);
}

#[tokio::test]
async fn test_handoffs_carry_exact_stage_inputs() {
    let h = harness(ScriptedLlm::new(stage_replies(&[]))).await;
    seed(&h, "user-1", "Fact one");
    seed(&h, "user-1", "Fact two");

    let result = h
        .state
        .orchestrator
        .run_pipeline("Plan my week", "user-1")
        .await
        .unwrap();

    let handoffs = db::list_handoffs(&h.db, &result.session_id).await.unwrap();

    let to_planner: MemoryToPlanner = serde_json::from_value(handoffs[0].data_json()).unwrap();
    assert_eq!(to_planner.goal, "Plan my week");
    assert!(to_planner.context.contains("\n\n"));

    let to_reasoner = PlannerToReasoner::from_json(&handoffs[1].data_json());
    assert_eq!(to_reasoner.plan, vec!["Recall preferences", "Recommend"]);
    assert_eq!(to_reasoner.planner_reasoning, "Use what we know");
    assert_eq!(to_reasoner.context, to_planner.context);

    let to_reflector = handoffs[2].data_json();
    assert_eq!(to_reflector["result"], "Use Go");
    assert_eq!(to_reflector["insights"][0], "Go is preferred");

    // The planner prompt is built from its handoff only
    assert!(h.llm.prompt(0).contains("Goal: Plan my week"));
    assert!(h.llm.prompt(1).contains("1. Recall preferences\n2. Recommend"));
    assert!(h.llm.prompt(2).contains("Go is preferred"));

    for options in h.llm.options.lock().unwrap().iter() {
        assert!(options.json);
        assert_eq!(options.temperature, 0.0);
    }
}

#[tokio::test]
async fn test_reflector_insight_is_written_back() {
    let h = harness(ScriptedLlm::new(stage_replies(&["X is Y"]))).await;

    let (result, writeback) = h
        .state
        .orchestrator
        .run_pipeline_with_writeback("What is X?", "user-1")
        .await
        .unwrap();
    assert_eq!(result.key_insights, vec!["X is Y"]);

    let outcome = writeback.wait().await;
    assert_eq!(outcome.stored.len(), 1);
    assert!(outcome.errors.is_empty());

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    let insight = &records[0];
    assert_eq!(insight.source, MemorySource::AgentReflection);
    assert_eq!(insight.importance, 0.8);
    assert!(insight.content.contains("X is Y"));
    assert_eq!(insight.tags, vec!["insight"]);
    assert_eq!(insight.owner_id, "user-1");
}

#[tokio::test]
async fn test_writeback_failure_does_not_fail_answer() {
    let h = harness(ScriptedLlm::new(stage_replies(&["keep me"]))).await;
    *h.store.poison.lock().unwrap() = Some("keep me".to_string());

    let (result, writeback) = h
        .state
        .orchestrator
        .run_pipeline_with_writeback("q", "user-1")
        .await
        .unwrap();

    assert_eq!(result.result, "Use Go");
    let outcome = writeback.wait().await;
    assert!(outcome.stored.is_empty());
    assert_eq!(outcome.errors.len(), 1);

    let session = db::get_agent_session(&h.db, &result.session_id).await.unwrap();
    assert_eq!(session.status, "complete");
}

#[tokio::test]
async fn test_garbage_planner_reply_decodes_to_empty_plan() {
    let h = harness(ScriptedLlm::new([
        "I'd be happy to help! Here's my thinking...".to_string(),
        r#"{"result": "r", "reasoning": "", "insights": []}"#.to_string(),
        r#"{"reflection": "", "keyInsights": []}"#.to_string(),
    ]))
    .await;

    let result = h
        .state
        .orchestrator
        .run_pipeline("goal", "user-1")
        .await
        .unwrap();

    let executions = db::list_executions(&h.db, &result.session_id).await.unwrap();
    let planner = executions[1].output_json();
    assert_eq!(planner["plan"], serde_json::json!([]));
    assert_eq!(planner["reasoning"], "");
}

#[tokio::test]
async fn test_empty_query_creates_no_session() {
    let h = harness(ScriptedLlm::new(Vec::<String>::new())).await;

    let err = h
        .state
        .orchestrator
        .run_pipeline("   ", "user-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");

    assert!(db::list_user_sessions(&h.db, "user-1", 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.llm.call_count(), 0);
}

#[tokio::test]
async fn test_llm_failure_marks_session_errored() {
    let llm = ScriptedLlm::new([r#"{"plan": ["a"], "reasoning": "r"}"#]);
    llm.push_error("provider down");
    let h = harness(llm).await;

    let err = h
        .state
        .orchestrator
        .run_pipeline("goal", "user-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "LLM_ERROR");

    let sessions = db::list_user_sessions(&h.db, "user-1", 10).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.status_enum(), Some(SessionStatus::Error));
    assert!(session.error.as_deref().unwrap_or("").contains("provider down"));

    let executions = db::list_executions(&h.db, &session.session_id).await.unwrap();
    assert_eq!(executions.len(), 2);
    let last = db::last_handoff(&h.db, &session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.to_enum(), Some(AgentType::Reasoner));
}

#[tokio::test]
async fn test_failed_completion_marks_session_errored() {
    let h = harness(ScriptedLlm::new(stage_replies(&["never stored"]))).await;
    sqlx::query(
        "CREATE TRIGGER refuse_complete BEFORE UPDATE OF status ON agent_sessions \
         WHEN NEW.status = 'complete' BEGIN SELECT RAISE(ABORT, 'ledger refused'); END",
    )
    .execute(&h.db)
    .await
    .unwrap();

    let err = h
        .state
        .orchestrator
        .run_pipeline("goal", "user-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "DATABASE_ERROR");

    let session = db::list_user_sessions(&h.db, "user-1", 1).await.unwrap()[0].clone();
    assert_eq!(session.status_enum(), Some(SessionStatus::Error));
    assert!(session.error.as_deref().unwrap_or("").contains("ledger refused"));
    assert!(h.store.records().is_empty());
}

#[tokio::test]
async fn test_resume_continues_from_last_handoff() {
    let llm = ScriptedLlm::new([r#"{"plan": ["a", "b"], "reasoning": "r"}"#]);
    llm.push_error("provider down");
    let h = harness(llm).await;

    h.state
        .orchestrator
        .run_pipeline("goal", "user-1")
        .await
        .unwrap_err();
    let failed = db::list_user_sessions(&h.db, "user-1", 1).await.unwrap()[0].clone();

    // Only the reasoner and reflector run again
    h.llm
        .push(r#"{"result": "done", "reasoning": "rr", "insights": []}"#);
    h.llm.push(r#"{"reflection": "ok", "keyInsights": []}"#);

    let resumed = h
        .state
        .orchestrator
        .resume_pipeline(&failed.session_id)
        .await
        .unwrap();

    assert_ne!(resumed.session_id, failed.session_id);
    assert_eq!(resumed.result, "done");
    assert_eq!(h.llm.call_count(), 4);
    assert!(h.llm.prompt(2).contains("1. a\n2. b"));

    let session = db::get_agent_session(&h.db, &resumed.session_id).await.unwrap();
    assert_eq!(session.resumed_from.as_deref(), Some(failed.session_id.as_str()));
    assert_eq!(session.status, "complete");
    assert_eq!(session.query, "goal");

    let types: Vec<String> = db::list_executions(&h.db, &resumed.session_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.agent_type)
        .collect();
    assert_eq!(types, vec!["MEMORY", "PLANNER", "REASONER", "REFLECTOR"]);

    // The errored session itself is untouched
    let old = db::get_agent_session(&h.db, &failed.session_id).await.unwrap();
    assert_eq!(old.status, "error");
}

#[tokio::test]
async fn test_resume_rejects_non_errored_sessions() {
    let h = harness(ScriptedLlm::new(stage_replies(&[]))).await;

    let done = h
        .state
        .orchestrator
        .run_pipeline("goal", "user-1")
        .await
        .unwrap();

    let err = h
        .state
        .orchestrator
        .resume_pipeline(&done.session_id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TRANSITION");

    let missing = h
        .state
        .orchestrator
        .resume_pipeline("no-such-session")
        .await
        .unwrap_err();
    assert_eq!(missing.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_trail_lists_session_history() {
    let h = harness(ScriptedLlm::new(stage_replies(&[]))).await;
    let started = Utc::now();

    let done = h
        .state
        .orchestrator
        .run_pipeline("goal", "user-1")
        .await
        .unwrap();

    let trail = h.state.orchestrator.trail(&done.session_id).await.unwrap();
    assert_eq!(trail.executions.len(), 4);
    assert_eq!(trail.handoffs.len(), 3);
    assert!(trail.session.created_at >= started - chrono::Duration::seconds(1));

    let json = serde_json::to_value(&trail).unwrap();
    assert_eq!(json["session"]["status"], "complete");
}
