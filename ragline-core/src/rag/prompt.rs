//! Grounded prompt assembly.
//!
//! The assembled prompt is a system message (instruction plus grounding
//! rules) followed by a user message holding the context block and the
//! question. Fragments are labelled with their ids so the model can cite them.

use crate::rag::{DocumentFragment, Query};
use crate::types::Message;

/// Rules appended to every system instruction.
pub const GROUNDING_RULES: &str = "\
Answer using only the information in the context below.
Cite every fragment you rely on by its id in square brackets, for example [doc-chunk-0].
If the context is empty or does not contain the answer, say plainly that the information \
is not available in the knowledge base. Do not use outside knowledge and do not guess.";

/// Shown in place of the context block when retrieval found nothing.
pub const NO_CONTEXT_NOTICE: &str = "No relevant context was found for this question.";

/// A prompt ready for the completion backend. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    system: String,
    user: String,
    question: String,
    fragments: Vec<DocumentFragment>,
    omitted: usize,
}

impl AssembledPrompt {
    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    /// Fragments that were placed in the prompt, in retrieval order.
    pub fn fragments(&self) -> &[DocumentFragment] {
        &self.fragments
    }

    /// Retrieved fragments left out because of the context budget.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    pub fn has_context(&self) -> bool {
        !self.fragments.is_empty()
    }

    /// System message followed by user message.
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Builds [`AssembledPrompt`]s within a character budget for fragment text.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    max_context_chars: usize,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self {
            max_context_chars: 12_000,
        }
    }
}

impl PromptAssembler {
    pub fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    /// Combine question, fragments and instruction. Pure.
    ///
    /// Fragments are taken in order until the next one would exceed the
    /// budget. The first fragment is always kept, cut to the budget if needed,
    /// so a non-empty retrieval never turns into an empty context.
    pub fn assemble(
        &self,
        query: &Query,
        fragments: &[DocumentFragment],
        system_instruction: &str,
    ) -> AssembledPrompt {
        let mut included: Vec<DocumentFragment> = Vec::new();
        let mut used_chars = 0;

        for fragment in fragments {
            let len = fragment.text.chars().count();
            if used_chars + len <= self.max_context_chars {
                used_chars += len;
                included.push(fragment.clone());
            } else if included.is_empty() {
                let mut cut = fragment.clone();
                cut.text = fragment.text.chars().take(self.max_context_chars).collect();
                included.push(cut);
                break;
            } else {
                break;
            }
        }
        let omitted = fragments.len() - included.len();

        let mut context = String::from("Context:\n");
        if included.is_empty() {
            context.push_str(NO_CONTEXT_NOTICE);
        } else {
            let blocks: Vec<String> = included
                .iter()
                .map(|f| format!("[{}] (source: {})\n{}", f.id, f.source, f.text.trim()))
                .collect();
            context.push_str(&blocks.join("\n\n"));
        }

        let instruction = system_instruction.trim();
        let system = if instruction.is_empty() {
            GROUNDING_RULES.to_string()
        } else {
            format!("{instruction}\n\n{GROUNDING_RULES}")
        };

        AssembledPrompt {
            system,
            user: format!("{context}\n\nQuestion: {}", query.as_str().trim()),
            question: query.as_str().to_string(),
            fragments: included,
            omitted,
        }
    }
}
