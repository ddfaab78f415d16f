//! Stage contracts for the reasoning pipeline.
//!
//! Each stage reads exactly one typed handoff and produces one typed
//! result. Model replies are decoded tolerantly: a missing, mistyped or
//! unparsable field becomes its empty default, and non-string list items
//! are dropped. Only transport failures are errors.

use recall_llm::{extract_json, ChatMessage, CompletionOptions};
use recall_models::WeightedMemory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::clients::CompletionClient;
use crate::error::Result;

/// Deterministic JSON replies for every stage.
pub fn stage_options() -> CompletionOptions {
    CompletionOptions::json(0.0)
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Blank line between memories.
pub fn build_context(memories: &[WeightedMemory]) -> String {
    memories
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============================================================================
// MEMORY
// ============================================================================

/// What the MEMORY stage logs as its execution output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStageOutput {
    pub memories: Vec<WeightedMemory>,
    pub context: String,
}

impl MemoryStageOutput {
    pub fn new(memories: Vec<WeightedMemory>) -> Self {
        let context = build_context(&memories);
        Self { memories, context }
    }

    pub fn memory_ids(&self) -> Vec<String> {
        self.memories.iter().map(|m| m.id.clone()).collect()
    }
}

/// MEMORY -> PLANNER
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryToPlanner {
    pub goal: String,
    pub context: String,
}

impl MemoryToPlanner {
    pub fn from_json(value: &Value) -> Self {
        Self {
            goal: string_field(value, "goal"),
            context: string_field(value, "context"),
        }
    }
}

// ============================================================================
// PLANNER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannerResult {
    pub plan: Vec<String>,
    pub reasoning: String,
}

impl PlannerResult {
    pub fn from_json(value: &Value) -> Self {
        Self {
            plan: string_list(value, "plan"),
            reasoning: string_field(value, "reasoning"),
        }
    }
}

/// PLANNER -> REASONER
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerToReasoner {
    pub goal: String,
    pub plan: Vec<String>,
    pub context: String,
    pub planner_reasoning: String,
}

impl PlannerToReasoner {
    pub fn new(input: &MemoryToPlanner, planned: &PlannerResult) -> Self {
        Self {
            goal: input.goal.clone(),
            plan: planned.plan.clone(),
            context: input.context.clone(),
            planner_reasoning: planned.reasoning.clone(),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        Self {
            goal: string_field(value, "goal"),
            plan: string_list(value, "plan"),
            context: string_field(value, "context"),
            planner_reasoning: string_field(value, "plannerReasoning"),
        }
    }
}

pub fn planner_messages(input: &MemoryToPlanner) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!(
        r#"You are a Planning Agent. Your job is to create a step-by-step execution plan to achieve a goal.

Given the goal and available context, create a clear, actionable plan.

Context:
{context}

Goal: {goal}

Return a JSON object with:
- "plan": array of step strings
- "reasoning": brief explanation of the plan"#,
        context = input.context,
        goal = input.goal,
    ))]
}

// ============================================================================
// REASONER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasonerResult {
    pub result: String,
    pub reasoning: String,
    pub insights: Vec<String>,
}

impl ReasonerResult {
    pub fn from_json(value: &Value) -> Self {
        Self {
            result: string_field(value, "result"),
            reasoning: string_field(value, "reasoning"),
            insights: string_list(value, "insights"),
        }
    }
}

/// REASONER -> REFLECTOR
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasonerToReflector {
    pub result: String,
    pub reasoning: String,
    pub insights: Vec<String>,
}

impl ReasonerToReflector {
    pub fn from_json(value: &Value) -> Self {
        let decoded = ReasonerResult::from_json(value);
        Self::from(&decoded)
    }
}

impl From<&ReasonerResult> for ReasonerToReflector {
    fn from(reasoned: &ReasonerResult) -> Self {
        Self {
            result: reasoned.result.clone(),
            reasoning: reasoned.reasoning.clone(),
            insights: reasoned.insights.clone(),
        }
    }
}

pub fn reasoner_messages(input: &PlannerToReasoner) -> Vec<ChatMessage> {
    let steps = input
        .plan
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n");

    vec![ChatMessage::user(format!(
        r#"You are a Reasoning Agent. Perform deep analysis and reasoning to achieve the goal.

Context:
{context}

Planner's Reasoning:
{planner_reasoning}

Plan Steps:
{steps}

Goal: {goal}

Return a JSON object with:
- "result": the final reasoned answer/solution
- "reasoning": your detailed reasoning process
- "insights": array of key insights discovered"#,
        context = input.context,
        planner_reasoning = input.planner_reasoning,
        steps = steps,
        goal = input.goal,
    ))]
}

// ============================================================================
// REFLECTOR
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectorResult {
    pub reflection: String,
    pub key_insights: Vec<String>,
}

impl ReflectorResult {
    pub fn from_json(value: &Value) -> Self {
        Self {
            reflection: string_field(value, "reflection"),
            key_insights: string_list(value, "keyInsights"),
        }
    }
}

pub fn reflector_messages(input: &ReasonerToReflector) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!(
        r#"You are a Reflection Agent. Reflect on the reasoning process and extract key learnings.

Result:
{result}

Reasoning Process:
{reasoning}

Insights:
{insights}

Return a JSON object with:
- "reflection": your reflection on the process and outcomes
- "keyInsights": array of the most important insights to remember"#,
        result = input.result,
        reasoning = input.reasoning,
        insights = input.insights.join("\n"),
    ))]
}

// ============================================================================
// Stage calls
// ============================================================================

/// Ask the model and decode its reply, `Null` when nothing parses.
async fn ask(llm: &dyn CompletionClient, stage: &str, messages: Vec<ChatMessage>) -> Result<Value> {
    let reply = llm.complete(&messages, &stage_options()).await?;

    match extract_json(&reply) {
        Some(value) => Ok(value),
        None => {
            warn!(stage, reply_len = reply.len(), "Stage reply was not JSON, using empty result");
            Ok(Value::Null)
        }
    }
}

pub async fn run_planner(llm: &dyn CompletionClient, input: &MemoryToPlanner) -> Result<PlannerResult> {
    let value = ask(llm, "planner", planner_messages(input)).await?;
    let planned = PlannerResult::from_json(&value);
    debug!(steps = planned.plan.len(), "Planner finished");
    Ok(planned)
}

pub async fn run_reasoner(
    llm: &dyn CompletionClient,
    input: &PlannerToReasoner,
) -> Result<ReasonerResult> {
    let value = ask(llm, "reasoner", reasoner_messages(input)).await?;
    let reasoned = ReasonerResult::from_json(&value);
    debug!(insights = reasoned.insights.len(), "Reasoner finished");
    Ok(reasoned)
}

pub async fn run_reflector(
    llm: &dyn CompletionClient,
    input: &ReasonerToReflector,
) -> Result<ReflectorResult> {
    let value = ask(llm, "reflector", reflector_messages(input)).await?;
    let reflected = ReflectorResult::from_json(&value);
    debug!(key_insights = reflected.key_insights.len(), "Reflector finished");
    Ok(reflected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(json!(null))]
    #[case(json!("not an object"))]
    #[case(json!({"plan": "one step", "reasoning": 42}))]
    #[case(json!({}))]
    fn test_planner_garbage_decodes_to_defaults(#[case] value: Value) {
        assert_eq!(PlannerResult::from_json(&value), PlannerResult::default());
    }

    #[test]
    fn test_non_string_items_are_dropped() {
        let value = json!({"result": "r", "insights": ["a", 1, null, "b", {"x": 1}]});
        let reasoned = ReasonerResult::from_json(&value);
        assert_eq!(reasoned.insights, vec!["a", "b"]);
        assert_eq!(reasoned.reasoning, "");
    }

    #[test]
    fn test_reflector_reads_camel_case_key() {
        let value = json!({"reflection": "ok", "keyInsights": ["X is Y"], "key_insights": ["wrong"]});
        let reflected = ReflectorResult::from_json(&value);
        assert_eq!(reflected.key_insights, vec!["X is Y"]);

        let out = serde_json::to_value(&reflected).unwrap();
        assert_eq!(out["keyInsights"][0], "X is Y");
    }

    #[test]
    fn test_planner_handoff_wire_shape() {
        let handoff = PlannerToReasoner::new(
            &MemoryToPlanner {
                goal: "g".into(),
                context: "c".into(),
            },
            &PlannerResult {
                plan: vec!["s1".into()],
                reasoning: "because".into(),
            },
        );

        let value = serde_json::to_value(&handoff).unwrap();
        assert_eq!(
            value,
            json!({"goal": "g", "plan": ["s1"], "context": "c", "plannerReasoning": "because"})
        );
        assert_eq!(PlannerToReasoner::from_json(&value), handoff);
    }

    #[test]
    fn test_reasoner_prompt_numbers_steps() {
        let messages = reasoner_messages(&PlannerToReasoner {
            goal: "ship it".into(),
            plan: vec!["build".into(), "test".into()],
            context: "ctx".into(),
            planner_reasoning: "pr".into(),
        });
        let text = &messages[0].content;
        assert!(text.contains("Plan Steps:\n1. build\n2. test"));
        assert!(text.contains("Goal: ship it"));
        assert!(text.contains("Planner's Reasoning:\npr"));
    }

    #[test]
    fn test_context_joins_with_blank_line() {
        let memory = |text: &str| WeightedMemory {
            id: text.into(),
            text: text.into(),
            timestamp: None,
            similarity_score: 0.0,
            recency_score: 0.0,
            importance: 0.5,
            final_weighted_score: 0.0,
        };
        let out = MemoryStageOutput::new(vec![memory("a"), memory("b")]);
        assert_eq!(out.context, "a\n\nb");
        assert_eq!(out.memory_ids(), vec!["a", "b"]);
        assert_eq!(MemoryStageOutput::new(Vec::new()).context, "");
    }
}
