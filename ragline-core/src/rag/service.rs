//! The question-answering façade: retrieve, assemble, complete.

use crate::brain::LlmProvider;
use crate::config::{EmptyContextPolicy, RaglineConfig};
use crate::error::RagError;
use crate::rag::completion::{CompletionClient, CompletionResult, CompletionStream};
use crate::rag::embeddings::Embedder;
use crate::rag::evaluation::{EvaluationRequest, EvaluationVerdict, Evaluator};
use crate::rag::index::VectorIndex;
use crate::rag::prompt::{AssembledPrompt, PromptAssembler};
use crate::rag::retriever::{Retriever, VectorRetriever};
use crate::rag::{DocumentFragment, Query};
use crate::types::TokenUsage;
use std::sync::Arc;
use tracing::{debug, info};

/// Returned without calling the model when nothing relevant was retrieved.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I don't have enough information in my knowledge base to answer that question.";

/// Answers questions from indexed documents.
///
/// Holds no per-request state; share it as `Arc<RagService>`. Repeated calls
/// with the same question may return different answers.
pub struct RagService {
    retriever: Arc<dyn Retriever>,
    assembler: PromptAssembler,
    client: CompletionClient,
    top_k: usize,
    system_instruction: String,
    empty_context_policy: EmptyContextPolicy,
}

impl RagService {
    pub fn new(retriever: Arc<dyn Retriever>, client: CompletionClient) -> Self {
        let defaults = crate::config::RagConfig::default();
        Self {
            retriever,
            assembler: PromptAssembler::default(),
            client,
            top_k: 4,
            system_instruction: defaults.system_instruction,
            empty_context_policy: defaults.empty_context_policy,
        }
    }

    /// Wire a service from configuration and explicit collaborators.
    pub fn from_config(
        config: &RaglineConfig,
        provider: Arc<dyn LlmProvider>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        let retriever = VectorRetriever::new(embedder, index)
            .with_min_score(config.retrieval.min_score);
        let temperature = config.rag.temperature.unwrap_or(config.llm.temperature);
        let client = CompletionClient::new(provider, config.retry.clone())
            .with_temperature(temperature)
            .with_max_tokens(config.llm.max_tokens);

        Self::new(Arc::new(retriever), client)
            .with_top_k(config.retrieval.top_k)
            .with_system_instruction(config.rag.system_instruction.clone())
            .with_empty_context_policy(config.rag.empty_context_policy)
            .with_assembler(PromptAssembler::new(config.rag.max_context_chars))
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    pub fn with_empty_context_policy(mut self, policy: EmptyContextPolicy) -> Self {
        self.empty_context_policy = policy;
        self
    }

    pub fn with_assembler(mut self, assembler: PromptAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    /// Answer text only.
    pub async fn query(&self, question: &str) -> Result<String, RagError> {
        Ok(self.query_with_response(question).await?.answer)
    }

    /// Answer plus the fragments it used and token usage.
    pub async fn query_with_response(&self, question: &str) -> Result<CompletionResult, RagError> {
        let (result, _) = self.query_with_context(question).await?;
        Ok(result)
    }

    /// Stream the answer. Retrieval happens before this returns.
    pub async fn query_streaming(&self, question: &str) -> Result<CompletionStream, RagError> {
        match self.prepare(question).await? {
            Prepared::Refuse => Ok(self
                .client
                .fixed_stream(INSUFFICIENT_CONTEXT_ANSWER, Vec::new())),
            Prepared::Ask(prompt) => Ok(self.client.complete_streaming(&prompt)),
        }
    }

    /// Answer, then judge the answer against the retrieved fragments.
    pub async fn query_and_evaluate(
        &self,
        question: &str,
        evaluator: &dyn Evaluator,
    ) -> Result<(CompletionResult, EvaluationVerdict), RagError> {
        let (result, retrieved) = self.query_with_context(question).await?;
        let request = EvaluationRequest::new(question, retrieved, result.answer.clone());
        let verdict = evaluator.evaluate(&request).await;
        info!(
            evaluator = evaluator.name(),
            outcome = %verdict.outcome,
            attempts = verdict.attempts,
            "Answer evaluated"
        );
        Ok((result, verdict))
    }

    /// Answer plus every fragment placed in the prompt, cited or not.
    ///
    /// The second value is what an evaluator should judge against; it is
    /// empty only when nothing relevant was retrieved.
    pub async fn query_with_context(
        &self,
        question: &str,
    ) -> Result<(CompletionResult, Vec<DocumentFragment>), RagError> {
        match self.prepare(question).await? {
            Prepared::Refuse => Ok((
                CompletionResult {
                    answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                    used_fragments: Vec::new(),
                    usage: TokenUsage::default(),
                    model: self.client.model_name().to_string(),
                    finish_reason: Some("no_context".to_string()),
                },
                Vec::new(),
            )),
            Prepared::Ask(prompt) => {
                let result = self.client.complete(&prompt).await?;
                Ok((result, prompt.fragments().to_vec()))
            }
        }
    }

    async fn prepare(&self, question: &str) -> Result<Prepared, RagError> {
        let query = Query::new(question)?;
        let fragments = self.retriever.retrieve(query.as_str(), self.top_k).await?;
        debug!(retrieved = fragments.len(), "Retrieval complete");

        if fragments.is_empty() && self.empty_context_policy == EmptyContextPolicy::Refuse {
            info!("No relevant context; refusing without calling the model");
            return Ok(Prepared::Refuse);
        }
        let prompt = self
            .assembler
            .assemble(&query, &fragments, &self.system_instruction);
        if prompt.omitted() > 0 {
            debug!(omitted = prompt.omitted(), "Fragments left out of the prompt");
        }
        Ok(Prepared::Ask(prompt))
    }
}

enum Prepared {
    Refuse,
    Ask(AssembledPrompt),
}
