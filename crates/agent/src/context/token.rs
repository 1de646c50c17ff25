//! Token estimation.
//!
//! A character heuristic (about four characters per token, rounded up)
//! keeps budget arithmetic deterministic without a tokenizer.

use reasonloop_core::provider::CompletionRequest;

/// Role name and delimiters each message adds on the wire.
const MESSAGE_OVERHEAD: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Approximate prompt size of a model call, tool schemas included.
pub fn estimate_request_tokens(request: &CompletionRequest) -> usize {
    let messages: usize = request
        .messages
        .iter()
        .map(|m| MESSAGE_OVERHEAD + estimate_tokens(&m.content))
        .sum();
    let tools: usize = request
        .tools
        .iter()
        .map(|t| estimate_tokens(&t.name) + estimate_tokens(&t.description) + estimate_tokens(&t.parameters.to_string()))
        .sum();
    messages + tools
}
