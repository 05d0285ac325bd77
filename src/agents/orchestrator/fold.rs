//! Folding of backend events into conversation state

use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::agents::backend::BackendEvent;
use crate::agents::domain::{Conversation, FailureReason, Message, ToolCallInfo};

/// What the run loop should do after an event was applied
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FoldStep {
    Continue,
    Finished,
    Errored {
        reason: FailureReason,
        message: String,
    },
}

/// Per-run folding state. A fresh folder is used for every run, continuations included.
#[derive(Debug, Default)]
pub(crate) struct EventFolder {
    /// Assistant message opened by this run
    run_message: Option<String>,
    /// Buffered argument fragments by tool call id
    args: HashMap<String, String>,
}

impl EventFolder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, conversation: &mut Conversation, event: BackendEvent) -> FoldStep {
        match event {
            BackendEvent::RunStarted { .. }
            | BackendEvent::StepStarted { .. }
            | BackendEvent::StepFinished { .. }
            | BackendEvent::TextMessageEnd { .. } => {}

            BackendEvent::TextMessageStart { message_id } => {
                assistant_message(conversation, &message_id);
                self.run_message = Some(message_id);
            }
            BackendEvent::TextMessageContent { message_id, delta } => {
                assistant_message(conversation, &message_id)
                    .content
                    .push_str(&delta);
            }

            BackendEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_message_id,
            } => {
                let parent = parent_message_id
                    .filter(|id| conversation.message(id).is_some())
                    .or_else(|| self.run_message.clone())
                    .unwrap_or_else(Message::generate_id);
                assistant_message(conversation, &parent)
                    .tool_calls
                    .push(ToolCallInfo::pending(
                        tool_call_id.clone(),
                        tool_call_name,
                        Value::Null,
                    ));
                self.run_message.get_or_insert(parent);
                self.args.insert(tool_call_id, String::new());
            }
            BackendEvent::ToolCallArgs {
                tool_call_id,
                delta,
            } => {
                self.args.entry(tool_call_id).or_default().push_str(&delta);
            }
            BackendEvent::ToolCallEnd { tool_call_id } => {
                let raw = self.args.remove(&tool_call_id).unwrap_or_default();
                match conversation.tool_call_mut(&tool_call_id) {
                    Some(call) => call.arguments = parse_arguments(&raw),
                    None => debug!(tool_call_id = %tool_call_id, "Arguments for unknown tool call dropped"),
                }
            }
            BackendEvent::ToolCallResult {
                tool_call_id,
                content,
                ..
            } => {
                if let Some(call) = conversation.tool_call_mut(&tool_call_id) {
                    call.complete(content);
                }
            }

            BackendEvent::RunFinished { .. } => return FoldStep::Finished,
            BackendEvent::RunError { message, code } => {
                return FoldStep::Errored {
                    reason: FailureReason::from_error_code(code.as_deref()),
                    message,
                }
            }
        }
        FoldStep::Continue
    }
}

/// Assistant message with this id, created at the end of the history if absent
fn assistant_message<'a>(conversation: &'a mut Conversation, id: &str) -> &'a mut Message {
    let index = match conversation.messages.iter().position(|m| m.id == id) {
        Some(index) => index,
        None => {
            conversation.push(Message::assistant(id));
            conversation.messages.len() - 1
        }
    };
    &mut conversation.messages[index]
}

/// Empty arguments are an empty object; unparseable ones are kept as a string
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::domain::Role;
    use crate::domain::ThreadKey;
    use serde_json::json;

    fn conversation() -> Conversation {
        Conversation::new(ThreadKey::new("s", "r", "t"))
    }

    fn tool_start(id: &str, parent: Option<&str>) -> BackendEvent {
        BackendEvent::ToolCallStart {
            tool_call_id: id.into(),
            tool_call_name: "get_time".into(),
            parent_message_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn test_text_deltas_append() {
        let mut conv = conversation();
        let mut folder = EventFolder::new();
        folder.apply(
            &mut conv,
            BackendEvent::TextMessageStart {
                message_id: "m1".into(),
            },
        );
        for delta in ["Hel", "lo"] {
            folder.apply(
                &mut conv,
                BackendEvent::TextMessageContent {
                    message_id: "m1".into(),
                    delta: delta.into(),
                },
            );
        }
        assert_eq!(conv.last_assistant_text(), Some("Hello"));
    }

    #[test]
    fn test_tool_call_attaches_to_run_message_without_parent() {
        let mut conv = conversation();
        let mut folder = EventFolder::new();
        folder.apply(
            &mut conv,
            BackendEvent::TextMessageStart {
                message_id: "m1".into(),
            },
        );
        folder.apply(&mut conv, tool_start("c1", None));
        folder.apply(&mut conv, tool_start("c2", Some("missing")));

        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].tool_calls.len(), 2);
    }

    #[test]
    fn test_tool_call_without_any_message_creates_one() {
        let mut conv = conversation();
        let mut folder = EventFolder::new();
        folder.apply(&mut conv, tool_start("c1", None));
        folder.apply(&mut conv, tool_start("c2", None));

        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, Role::Assistant);
        assert_eq!(conv.pending_tool_calls().len(), 2);
    }

    #[test]
    fn test_arguments_parsed_at_end() {
        let mut conv = conversation();
        let mut folder = EventFolder::new();
        folder.apply(&mut conv, tool_start("c1", None));
        for delta in ["{\"tz\":", "\"UTC\"}"] {
            folder.apply(
                &mut conv,
                BackendEvent::ToolCallArgs {
                    tool_call_id: "c1".into(),
                    delta: delta.into(),
                },
            );
        }
        folder.apply(
            &mut conv,
            BackendEvent::ToolCallEnd {
                tool_call_id: "c1".into(),
            },
        );
        assert_eq!(conv.pending_tool_calls()[0].arguments, json!({"tz": "UTC"}));
    }

    #[test]
    fn test_argument_fallbacks() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("not json"), json!("not json"));
    }

    #[test]
    fn test_terminal_events() {
        let mut conv = conversation();
        let mut folder = EventFolder::new();
        assert_eq!(
            folder.apply(
                &mut conv,
                BackendEvent::RunFinished {
                    thread_id: "t".into(),
                    run_id: "r".into(),
                    result: None,
                }
            ),
            FoldStep::Finished
        );
        assert_eq!(
            folder.apply(
                &mut conv,
                BackendEvent::RunError {
                    message: "slow down".into(),
                    code: Some("rate_limited".into()),
                }
            ),
            FoldStep::Errored {
                reason: FailureReason::RateLimited,
                message: "slow down".into()
            }
        );
    }

    #[test]
    fn test_server_side_tool_result_settles_call() {
        let mut conv = conversation();
        let mut folder = EventFolder::new();
        folder.apply(&mut conv, tool_start("c1", None));
        folder.apply(
            &mut conv,
            BackendEvent::ToolCallResult {
                message_id: "m9".into(),
                tool_call_id: "c1".into(),
                content: "done".into(),
            },
        );
        assert!(conv.pending_tool_calls().is_empty());
    }
}
