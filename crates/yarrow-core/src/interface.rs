//! Agent-to-host event interface.
//!
//! The step engine narrates what it does (monologue, tool transitions,
//! outbound messages) through this trait; the HTTP layer implements it as
//! a queue of SSE frames, tests use the no-op implementation.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::message::Message;

pub trait AgentInterface: Send + Sync {
    /// A user message was accepted into the log.
    fn user_message(&self, msg: &str, msg_obj: &Message);

    /// The agent's private reasoning for this turn.
    fn internal_monologue(&self, msg: &str, msg_obj: &Message);

    /// Tool transitions, prefixed "Running " / "Ran " / "Success: " /
    /// "Error: ".
    fn function_message(&self, msg: &str, msg_obj: &Message);

    /// A user-visible message sent via the send_message tool. The id and
    /// date belong to the assistant message that requested the call.
    fn assistant_message(&self, msg: &str, id: Uuid, date: DateTime<Utc>);

    /// Fatal error; the stream terminates after this.
    fn error(&self, error: &str);

    /// End of a chained run.
    fn step_yield(&self);
}

/// Interface that drops everything (tests, fire-and-forget callers).
pub struct NullInterface;

impl AgentInterface for NullInterface {
    fn user_message(&self, _msg: &str, _msg_obj: &Message) {}
    fn internal_monologue(&self, _msg: &str, _msg_obj: &Message) {}
    fn function_message(&self, _msg: &str, _msg_obj: &Message) {}
    fn assistant_message(&self, _msg: &str, _id: Uuid, _date: DateTime<Utc>) {}
    fn error(&self, _error: &str) {}
    fn step_yield(&self) {}
}

/// One frame of the response stream. `Stop` is the termination sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Value),
    Stop,
}

/// Queueing interface backing the SSE response stream.
pub struct StreamingInterface {
    tx: mpsc::UnboundedSender<Frame>,
}

impl StreamingInterface {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, frame: Frame) {
        // A closed receiver just means the client went away.
        let _ = self.tx.send(frame);
    }

    fn push_with_meta(&self, mut value: Value, id: Uuid, date: DateTime<Utc>) {
        value["id"] = json!(id.to_string());
        value["date"] = json!(date.to_rfc3339());
        self.push(Frame::Data(value));
    }
}

impl AgentInterface for StreamingInterface {
    fn user_message(&self, _msg: &str, _msg_obj: &Message) {
        // Echoing the user's own message back is not part of the stream.
    }

    fn internal_monologue(&self, msg: &str, msg_obj: &Message) {
        self.push_with_meta(
            json!({ "internal_monologue": msg }),
            msg_obj.id,
            msg_obj.created_at,
        );
    }

    fn function_message(&self, msg: &str, msg_obj: &Message) {
        let value = if let Some(rest) = msg.strip_prefix("Running ") {
            json!({ "function_call": rest })
        } else if let Some(rest) = msg.strip_prefix("Ran ") {
            json!({ "function_call": format!("Function call returned: {rest}") })
        } else if let Some(rest) = msg.strip_prefix("Success: ") {
            json!({ "function_return": rest, "status": "success" })
        } else if let Some(rest) = msg.strip_prefix("Error: ") {
            json!({ "function_return": rest, "status": "error" })
        } else {
            json!({ "function_message": msg })
        };
        self.push_with_meta(value, msg_obj.id, msg_obj.created_at);
    }

    fn assistant_message(&self, msg: &str, id: Uuid, date: DateTime<Utc>) {
        self.push_with_meta(json!({ "assistant_message": msg }), id, date);
    }

    fn error(&self, error: &str) {
        self.push(Frame::Data(json!({ "internal_error": error })));
        self.push(Frame::Stop);
    }

    fn step_yield(&self) {
        self.push(Frame::Stop);
    }
}
