//! Answer evaluation by a judge model.
//!
//! Evaluators never pass silently: a failed judge call or an unparseable
//! reply yields [`Verdict::Indeterminate`].

use crate::brain::LlmProvider;
use crate::error::RagError;
use crate::rag::DocumentFragment;
use crate::types::{CompletionRequest, Message};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const RELEVANCY_TEMPLATE: &str = "\
Your task is to evaluate if the response for the query is in line with the context information provided.
You have two options to answer. Either YES or NO.
Answer YES, if the response for the query is in line with context information otherwise NO.

Query:
{query}

Response:
{response}

Context:
{context}

Answer:";

const KNOWLEDGE_GAP_TEMPLATE: &str = "\
Does the following response properly indicate that the system doesn't have enough information \
to answer the question, or that the question is outside its knowledge base?

Response to evaluate: \"{response}\"

Answer with only \"true\" or \"false\".";

/// Outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Indeterminate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
            Verdict::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Verdict plus the judge's raw reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationVerdict {
    pub outcome: Verdict,
    pub explanation: String,
    /// Judge calls made to reach this verdict.
    pub attempts: u32,
}

impl EvaluationVerdict {
    pub fn is_pass(&self) -> bool {
        self.outcome == Verdict::Pass
    }

    /// Pass or fail as a boolean; an indeterminate verdict is an error.
    pub fn decisive(&self) -> Result<bool, RagError> {
        match self.outcome {
            Verdict::Pass => Ok(true),
            Verdict::Fail => Ok(false),
            Verdict::Indeterminate => Err(RagError::IndeterminateEvaluation {
                reason: self.explanation.clone(),
            }),
        }
    }
}

/// What gets judged: the question, the material it was answered from and the answer.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub query: String,
    pub fragments: Vec<DocumentFragment>,
    pub answer: String,
}

impl EvaluationRequest {
    pub fn new(
        query: impl Into<String>,
        fragments: Vec<DocumentFragment>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            fragments,
            answer: answer.into(),
        }
    }
}

/// A strategy for judging answers.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> EvaluationVerdict;

    fn name(&self) -> &str;
}

/// Reply classification shared by both judges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Affirmative,
    Negative,
    Unclear,
}

/// First alphabetic word decides: YES/TRUE or NO/FALSE.
fn classify_reply(reply: &str) -> Reply {
    let first = reply
        .split(|c: char| !c.is_ascii_alphabetic())
        .find(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase());
    match first.as_deref() {
        Some("yes") | Some("true") => Reply::Affirmative,
        Some("no") | Some("false") => Reply::Negative,
        _ => Reply::Unclear,
    }
}

/// Ask the judge, re-asking while the reply is unclear.
async fn judge(
    provider: &dyn LlmProvider,
    prompt: &str,
    max_attempts: u32,
    evaluator: &str,
) -> EvaluationVerdict {
    let max_attempts = max_attempts.max(1);
    let mut explanation = String::new();

    for attempt in 1..=max_attempts {
        let request = CompletionRequest {
            messages: vec![Message::user(prompt)],
            temperature: 0.0,
            ..Default::default()
        };
        match provider.complete(request).await {
            Ok(response) => {
                let reply = response.text();
                debug!(evaluator, attempt, reply = %reply.trim(), "Judge replied");
                let outcome = match classify_reply(&reply) {
                    Reply::Affirmative => Some(Verdict::Pass),
                    Reply::Negative => Some(Verdict::Fail),
                    Reply::Unclear => None,
                };
                explanation = reply.trim().to_string();
                if let Some(outcome) = outcome {
                    return EvaluationVerdict {
                        outcome,
                        explanation,
                        attempts: attempt,
                    };
                }
            }
            Err(e) => {
                warn!(evaluator, attempt, error = %e, "Judge call failed");
                explanation = format!("judge call failed: {}", e);
            }
        }
    }

    EvaluationVerdict {
        outcome: Verdict::Indeterminate,
        explanation,
        attempts: max_attempts,
    }
}

/// Judges whether an answer is in line with the retrieved context.
pub struct RelevancyEvaluator {
    judge: Arc<dyn LlmProvider>,
    max_attempts: u32,
}

impl RelevancyEvaluator {
    pub fn new(judge: Arc<dyn LlmProvider>) -> Self {
        Self {
            judge,
            max_attempts: 2,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    fn prompt(request: &EvaluationRequest) -> String {
        let context = request
            .fragments
            .iter()
            .map(|f| f.text.trim())
            .collect::<Vec<_>>()
            .join("\n");
        RELEVANCY_TEMPLATE
            .replace("{query}", request.query.trim())
            .replace("{response}", request.answer.trim())
            .replace("{context}", &context)
    }
}

#[async_trait]
impl Evaluator for RelevancyEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> EvaluationVerdict {
        judge(
            self.judge.as_ref(),
            &Self::prompt(request),
            self.max_attempts,
            self.name(),
        )
        .await
    }

    fn name(&self) -> &str {
        "relevancy"
    }
}

/// Passes when the answer states that the system lacks the information.
pub struct KnowledgeGapEvaluator {
    judge: Arc<dyn LlmProvider>,
    max_attempts: u32,
}

impl KnowledgeGapEvaluator {
    pub fn new(judge: Arc<dyn LlmProvider>) -> Self {
        Self {
            judge,
            max_attempts: 2,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

#[async_trait]
impl Evaluator for KnowledgeGapEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> EvaluationVerdict {
        let prompt = KNOWLEDGE_GAP_TEMPLATE.replace("{response}", request.answer.trim());
        judge(self.judge.as_ref(), &prompt, self.max_attempts, self.name()).await
    }

    fn name(&self) -> &str {
        "knowledge_gap"
    }
}
