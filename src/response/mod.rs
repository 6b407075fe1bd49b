//! Response builder: prompt assembly, LLM invocation, answer object.
//!
//! Context documents are serialised as `[i] title — source — url` plus the
//! snippet, in rank order, under a token budget estimated at four
//! characters per token. When the budget runs out, whole hits are dropped
//! from the tail first, then the tail of the last surviving snippet.

use std::sync::Arc;

use tracing::debug;

use crate::{
    api_types::{Answer, AnswerBlock, AnswerMetrics, AnswerMode, CacheResult, Citation},
    llm::{ChatMessage, CompletionParams, LlmClient, LlmError},
    observability::metrics,
    sources::{RankedHit, SourceId},
};

/// Token estimate used for the context budget.
const CHARS_PER_TOKEN: usize = 4;

/// A truncated snippet keeps at least this many characters; anything
/// shorter is dropped instead.
const MIN_TRUNCATED_SNIPPET_CHARS: usize = 80;

const TEMPERATURE: f64 = 0.2;

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn max_tokens_for(mode: AnswerMode) -> u32 {
    match mode {
        AnswerMode::Concise => 256,
        AnswerMode::Detailed => 700,
    }
}

fn system_prompt(mode: AnswerMode, with_context: bool) -> String {
    let length_rule = match mode {
        AnswerMode::Concise => "Answer in at most 120 words.",
        AnswerMode::Detailed => {
            "Answer thoroughly in at most 400 words, with concrete steps where applicable."
        }
    };
    if with_context {
        format!(
            "You are an IT-helpdesk assistant. Answer the user's question using only the \
             numbered context documents below. Cite documents inline as [n]. If the context \
             does not contain the answer, say so. {length_rule}"
        )
    } else {
        format!(
            "You are an IT-helpdesk assistant. No internal documentation matched this \
             question, so answer from general knowledge, and begin your answer with: \
             \"I could not find this in the internal knowledge bases, so this is general \
             guidance.\" {length_rule}"
        )
    }
}

/// Context block and the citations for the hits that made it in.
struct AssembledContext {
    block: String,
    citations: Vec<Citation>,
}

fn assemble_context(hits: &[RankedHit], budget_tokens: usize) -> AssembledContext {
    let budget_chars = budget_tokens.saturating_mul(CHARS_PER_TOKEN);
    let mut block = String::new();
    let mut citations = Vec::new();
    let mut used_chars = 0usize;

    for (position, ranked) in hits.iter().enumerate() {
        let index = position + 1;
        let payload = &ranked.hit.payload;
        let header = format!(
            "[{index}] {} — {} — {}\n",
            payload.title, ranked.hit.source, payload.url
        );
        let full_entry_chars = header.chars().count() + payload.snippet.chars().count() + 1;

        let entry = if used_chars + full_entry_chars <= budget_chars {
            format!("{header}{}\n", payload.snippet)
        } else {
            // Tail truncation inside the last surviving hit.
            let remaining = budget_chars.saturating_sub(used_chars + header.chars().count() + 1);
            if remaining < MIN_TRUNCATED_SNIPPET_CHARS {
                break;
            }
            let truncated: String = payload.snippet.chars().take(remaining).collect();
            format!("{header}{truncated}\n")
        };

        used_chars += entry.chars().count();
        block.push_str(&entry);
        citations.push(Citation {
            index,
            source: ranked.hit.source.clone(),
            title: payload.title.clone(),
            url: payload.url.clone(),
        });

        if used_chars >= budget_chars {
            break;
        }
    }

    AssembledContext { block, citations }
}

pub struct ResponseBuilder {
    llm: Arc<LlmClient>,
    context_token_budget: usize,
}

impl ResponseBuilder {
    pub fn new(llm: Arc<LlmClient>, context_token_budget: usize) -> Self {
        Self {
            llm,
            context_token_budget,
        }
    }

    /// Compose the prompt from the ranked hits, invoke the LLM, and build
    /// the final answer object.
    pub async fn build(
        &self,
        question: &str,
        hits: &[RankedHit],
        mode: AnswerMode,
        partial: bool,
        cache_result: CacheResult,
    ) -> Result<Answer, LlmError> {
        let context = assemble_context(hits, self.context_token_budget);
        let with_context = !context.citations.is_empty();

        let mut messages = vec![ChatMessage::system(system_prompt(mode, with_context))];
        if with_context {
            messages.push(ChatMessage::user(format!(
                "Context documents:\n\n{}\n\nQuestion: {question}",
                context.block
            )));
        } else {
            messages.push(ChatMessage::user(question.to_string()));
        }

        debug!(
            context_docs = context.citations.len(),
            context_tokens = estimate_tokens(&context.block),
            mode = mode.as_str(),
            "invoking completion"
        );

        let completion = self
            .llm
            .complete(
                &messages,
                CompletionParams {
                    temperature: TEMPERATURE,
                    max_tokens: max_tokens_for(mode),
                },
            )
            .await?;

        let sources_used = distinct_sources(&context.citations);
        let mut blocks = vec![AnswerBlock::Section {
            heading: None,
            body: completion.text.clone(),
        }];
        if with_context {
            blocks.push(AnswerBlock::Divider);
            blocks.push(AnswerBlock::Section {
                heading: Some("Sources".to_string()),
                body: context
                    .citations
                    .iter()
                    .map(|c| format!("[{}] {} — {}", c.index, c.title, c.url))
                    .collect::<Vec<_>>()
                    .join("\n"),
            });
        }

        metrics::record_answer_built(
            cache_result,
            completion.prompt_tokens,
            completion.completion_tokens,
        );

        Ok(Answer {
            text: completion.text,
            blocks,
            citations: context.citations,
            metrics: AnswerMetrics {
                prompt_tokens: completion.prompt_tokens,
                completion_tokens: completion.completion_tokens,
                sources_used,
                cache_result,
                similarity: None,
                partial,
            },
        })
    }
}

fn distinct_sources(citations: &[Citation]) -> Vec<SourceId> {
    let mut sources = Vec::new();
    for citation in citations {
        if !sources.contains(&citation.source) {
            sources.push(citation.source.clone());
        }
    }
    sources
}
