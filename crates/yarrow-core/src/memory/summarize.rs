//! Recursive summarization for context compaction.
//!
//! The cutoff selector walks the in-context log front-to-back until the
//! truncation token fraction is reached, then adjusts so the retained
//! tail never starts on a user or tool message. The summarizer itself is
//! one more LLM call with a fixed system prompt; when the slice to
//! summarize is itself too large, its prefix is pre-summarized first at
//! an 80 %-scaled ratio.

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::config::LlmConfig;
use crate::error::{AgentError, LlmError};
use crate::llm::types::CompletionRequest;
use crate::llm::CompletionTransport;
use crate::message::{Message, Role};
use crate::tokens::TokenCounter;

/// Fraction of the context window the summarizer input may occupy before
/// it is recursively pre-summarized.
pub const MESSAGE_SUMMARY_WARNING_FRAC: f32 = 0.75;

/// Fraction of the buffer's tokens the compactor aims to fold into the
/// summary.
pub const MESSAGE_SUMMARY_TRUNC_TOKEN_FRAC: f32 = 0.75;

/// Messages at the end of the log that are never summarized; they anchor
/// tool-call exemplars for the next turn.
pub const MESSAGE_SUMMARY_TRUNC_KEEP_N_LAST: usize = 3;

pub const SUMMARY_PROMPT_SYSTEM: &str = r#"Your job is to summarize a history of previous messages in a conversation between an AI persona and a human.
The conversation you are given is a from a fixed context window and may not be complete.
Messages sent by the AI are marked with the 'assistant' role.
The AI 'assistant' can also make calls to functions, whose outputs can be seen in messages with the 'tool' role.
Things the AI says in the message content are considered inner monologue and are not seen by the user.
The only AI messages seen by the user are from when the AI uses 'send_message'.
Messages the user sends are in the 'user' role.
The 'user' role is also used for important system events, such as login events and heartbeat events (heartbeats run the AI's program without user action, allowing the AI to act without prompting from the user sending them a message).
Summarize what happened in the conversation from the perspective of the AI (use the first person).
Keep your summary less than 100 words, do NOT exceed this word limit.
Only output the summary, do NOT include anything else in your output."#;

pub const MESSAGE_SUMMARY_REQUEST_ACK: &str = "Understood, I will respond with a summary of the message (and only the summary, nothing else) once I receive the conversation history. I'm ready.";

fn format_summary_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.text_or_empty()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summarize a message slice with the fixed summarizer prompt.
pub fn summarize_messages<'a>(
    transport: &'a dyn CompletionTransport,
    llm_config: &'a LlmConfig,
    messages: &'a [Message],
) -> BoxFuture<'a, Result<String, AgentError>> {
    async move {
        let counter = TokenCounter::for_model(&llm_config.model);
        let context_window = llm_config.context_window;

        let mut summary_input = format_summary_history(messages);
        let summary_input_tokens = counter.count(&summary_input);
        let budget = (MESSAGE_SUMMARY_WARNING_FRAC * context_window as f32) as usize;

        if summary_input_tokens > budget {
            // Pre-summarize a prefix of the slice, scaled down for good
            // measure, then re-render the input as summary + tail.
            let trunc_ratio =
                (budget as f32 / summary_input_tokens as f32) * 0.8;
            let cutoff = ((messages.len() as f32) * trunc_ratio) as usize;
            let prefix_summary =
                summarize_messages(transport, llm_config, &messages[..cutoff]).await?;
            summary_input = format!(
                "[Summary of {} earlier messages: {}]\n{}",
                cutoff,
                prefix_summary,
                format_summary_history(&messages[cutoff..])
            );
        }

        let request_messages = vec![
            serde_json::json!({"role": "system", "content": SUMMARY_PROMPT_SYSTEM}),
            serde_json::json!({"role": "assistant", "content": MESSAGE_SUMMARY_REQUEST_ACK}),
            serde_json::json!({"role": "user", "content": summary_input}),
        ];
        let request = CompletionRequest::new(llm_config.model.clone(), request_messages);

        let response = transport.create(&request).await?;
        let choice = response
            .choices
            .first()
            .ok_or(AgentError::Llm(LlmError::EmptyResponse))?;
        let summary = choice
            .message
            .content
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or(AgentError::Llm(LlmError::EmptyResponse))?;

        tracing::info!(chars = summary.len(), "summarizer produced summary");
        Ok(summary)
    }
    .boxed()
}

/// Select the exclusive cutoff index for compaction over the full log
/// (index 0 is the system message). Everything in `1..cutoff` is
/// summarized; `cutoff..` is retained.
pub fn choose_cutoff(
    roles: &[Role],
    token_counts: &[usize],
    keep_last: usize,
    trunc_frac: f32,
) -> Result<usize, AgentError> {
    debug_assert_eq!(roles.len(), token_counts.len());
    let len = roles.len();

    let buffer_token_count: usize = token_counts.iter().skip(1).sum();
    let desired_tokens = (buffer_token_count as f32 * trunc_frac) as usize;

    // Candidates exclude the system message and the protected tail.
    let candidate_end = len.saturating_sub(keep_last);
    if candidate_end <= 1 {
        return Err(AgentError::NotEnoughToSummarize { candidates: 0 });
    }

    // Walk front-to-back until the target is crossed; the crossing
    // message itself stays in the retained tail.
    let mut cutoff = candidate_end;
    let mut tokens_so_far = 0;
    for i in 1..candidate_end {
        tokens_so_far += token_counts[i];
        if tokens_so_far > desired_tokens {
            cutoff = i;
            break;
        }
    }

    // Keep the first retained message off a user turn when possible
    // (shift once; if the next is also a user turn, leave it).
    if cutoff < len && roles[cutoff] == Role::User {
        let shifted = cutoff + 1;
        if shifted < len {
            if roles[shifted] == Role::User {
                tracing::debug!(cutoff = shifted, "shifted cutoff still lands on a user turn");
            }
            cutoff = shifted;
        }
    }

    // Never let the retained tail start on a tool message, which would
    // orphan it from its assistant request.
    while cutoff < len && roles[cutoff] == Role::Tool {
        cutoff += 1;
    }

    let to_summarize = cutoff.saturating_sub(1);
    if to_summarize <= 1 {
        return Err(AgentError::NotEnoughToSummarize {
            candidates: to_summarize,
        });
    }
    Ok(cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles_and_counts(entries: &[(Role, usize)]) -> (Vec<Role>, Vec<usize>) {
        entries.iter().map(|(r, c)| (*r, *c)).unzip()
    }

    #[test]
    fn cutoff_walks_to_token_fraction() {
        let (roles, counts) = roles_and_counts(&[
            (Role::System, 100),
            (Role::User, 10),
            (Role::Assistant, 10),
            (Role::User, 10),
            (Role::Assistant, 10),
            (Role::User, 10),
            (Role::Assistant, 10),
            (Role::User, 10),
            (Role::Assistant, 10),
        ]);
        // buffer = 80 tokens, target = 60 -> walk covers indices 1..=7 but
        // the protected tail (3) caps candidates at 1..6.
        let cutoff = choose_cutoff(&roles, &counts, 3, 0.75).unwrap();
        assert!(cutoff >= 2);
        // retained tail keeps at least the protected 3 minus shifts
        assert!(cutoff <= roles.len());
        assert_ne!(roles[cutoff], Role::Tool);
    }

    #[test]
    fn cutoff_never_lands_on_tool() {
        let (roles, counts) = roles_and_counts(&[
            (Role::System, 10),
            (Role::User, 20),
            (Role::Assistant, 20),
            (Role::Tool, 10),
            (Role::Assistant, 5),
            (Role::User, 5),
            (Role::Assistant, 5),
            (Role::User, 5),
        ]);
        // target crosses at the tool message; the cutoff must skip past it
        let cutoff = choose_cutoff(&roles, &counts, 3, 0.6).unwrap();
        assert_eq!(cutoff, 4);
        assert_ne!(roles[cutoff], Role::Tool);
    }

    #[test]
    fn cutoff_shifts_past_single_user() {
        let (roles, counts) = roles_and_counts(&[
            (Role::System, 10),
            (Role::User, 20),
            (Role::Assistant, 20),
            (Role::User, 10),
            (Role::Assistant, 10),
            (Role::User, 5),
            (Role::Assistant, 5),
            (Role::User, 5),
        ]);
        // target crosses at a user message; shift forward once
        let cutoff = choose_cutoff(&roles, &counts, 3, 0.55).unwrap();
        assert_eq!(cutoff, 4);
        assert_ne!(roles[cutoff], Role::User);
    }

    #[test]
    fn too_few_messages_is_an_error() {
        let (roles, counts) = roles_and_counts(&[
            (Role::System, 10),
            (Role::User, 10),
            (Role::Assistant, 10),
        ]);
        let err = choose_cutoff(&roles, &counts, 3, 0.75).unwrap_err();
        assert!(matches!(err, AgentError::NotEnoughToSummarize { .. }));
    }

    #[tokio::test]
    async fn summarizer_returns_model_content() {
        use crate::llm::testing::{assistant_reply, ScriptedTransport};
        use uuid::Uuid;

        let transport =
            ScriptedTransport::new(vec![Ok(assistant_reply("the user said hello", 50))]);
        let llm_config = LlmConfig::new("gpt-4", "http://localhost/v1");
        let agent = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let messages = vec![
            Message::user(agent, owner, "hello"),
            Message::assistant(agent, owner, "hi there"),
        ];

        let summary = summarize_messages(&transport, &llm_config, &messages)
            .await
            .unwrap();
        assert_eq!(summary, "the user said hello");

        // the summarizer request carries the fixed system prompt
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls[0].messages[0]["content"], SUMMARY_PROMPT_SYSTEM);
        assert_eq!(calls[0].messages[1]["content"], MESSAGE_SUMMARY_REQUEST_ACK);
    }

    #[tokio::test]
    async fn oversized_slice_is_presummarized() {
        use crate::llm::testing::{assistant_reply, ScriptedTransport};
        use uuid::Uuid;

        // Window of 100 tokens -> budget 75. Each message is ~100 chars
        // (25 tokens), eight of them exceed the budget.
        let transport = ScriptedTransport::new(vec![
            Ok(assistant_reply("prefix summary", 10)),
            Ok(assistant_reply("full summary", 10)),
        ]);
        let llm_config =
            LlmConfig::new("gpt-4", "http://localhost/v1").with_context_window(100);
        let agent = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let messages: Vec<Message> = (0..8)
            .map(|i| Message::user(agent, owner, format!("{i}{}", "x".repeat(99))))
            .collect();

        let summary = summarize_messages(&transport, &llm_config, &messages)
            .await
            .unwrap();
        assert_eq!(summary, "full summary");
        assert_eq!(transport.call_count(), 2);

        // the second call's input embeds the prefix summary
        let calls = transport.calls.lock().unwrap();
        let final_input = calls[1].messages[2]["content"].as_str().unwrap();
        assert!(final_input.contains("prefix summary"));
    }
}
