//! Server-side Responses session table (spec §4.7): preserves a tool-use
//! loop across HTTP requests, detects duplicate-tool-call loops, and routes
//! `submit_tool_outputs` continuations back to the waiting request.
//!
//! Grounded on `QuotaTracker`'s `RwLock<HashMap<...>>` shape in
//! `other_examples/810357af_first-fluke-cratos__crates-cratos-llm-src-quota-mod.rs.rs`,
//! narrowed to one session-id-keyed entry per row and using a
//! `tokio::sync::oneshot` for the tool-output wait instead of a closure
//! continuation, since nothing else in this gateway needs session state to
//! survive past that single wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::model::{ResponseSession, ToolOutputs};
use crate::translate::unified::{UnifiedMessage, UnifiedRole, UnifiedTool};

/// Last-N-messages window scanned for repeated tool calls, per spec §4.7.
const LOOP_SCAN_WINDOW: usize = 20;
const WARNING_MIN_REPEATS: usize = 3;
const WARNING_MAX_REPEATS: usize = 4;
const INFINITE_LOOP_REPEATS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopCheck {
    Ok,
    Warning(usize),
    InfiniteLoop(usize),
}

/// Finds the longest run of consecutive identical entries in `items`, where
/// "consecutive" is relative to the filtered subsequence passed in (other
/// message roles interleaved in the raw history don't break a run; a
/// differing entry of the same kind does).
fn max_consecutive_run(items: impl Iterator<Item = (String, String)>) -> usize {
    let mut max_run = 0usize;
    let mut current: Option<(String, String)> = None;
    let mut run = 0usize;
    for item in items {
        if current.as_ref() == Some(&item) {
            run += 1;
        } else {
            current = Some(item);
            run = 1;
        }
        max_run = max_run.max(run);
    }
    max_run
}

/// Classifies the worst consecutive-repeat run among assistant tool calls
/// (same name + arguments, back to back within the assistant subsequence)
/// and tool-result payloads (same content, back to back within the tool
/// subsequence) in the last [`LOOP_SCAN_WINDOW`] messages.
pub fn check_duplicate_tool_calls(history: &[UnifiedMessage]) -> LoopCheck {
    let window_start = history.len().saturating_sub(LOOP_SCAN_WINDOW);
    let window = &history[window_start..];

    let assistant_run = max_consecutive_run(
        window
            .iter()
            .filter(|m| m.role == UnifiedRole::Assistant)
            .flat_map(|m| m.tool_calls.iter().map(|c| (c.name.clone(), c.arguments.clone()))),
    );

    let tool_result_run = max_consecutive_run(
        window
            .iter()
            .filter(|m| m.role == UnifiedRole::Tool)
            .map(|m| ("tool_result".to_string(), m.content.as_text())),
    );

    let max_repeats = assistant_run.max(tool_result_run);
    if max_repeats >= INFINITE_LOOP_REPEATS {
        LoopCheck::InfiniteLoop(max_repeats)
    } else if (WARNING_MIN_REPEATS..=WARNING_MAX_REPEATS).contains(&max_repeats) {
        LoopCheck::Warning(max_repeats)
    } else {
        LoopCheck::Ok
    }
}

/// Escalating warning text injected as a system message once a tool-call
/// loop is in the `Warning` range (spec §4.7): wording escalates with the
/// repeat count so a model that ignores the first nudge sees a sharper one.
pub fn escalating_warning_text(repeats: usize) -> String {
    match repeats {
        WARNING_MIN_REPEATS => {
            "You have called the same tool with the same arguments several times in a row. \
             If the previous result didn't help, try a different approach instead of repeating the call."
                .to_string()
        }
        _ => format!(
            "You have now called the same tool with the same arguments {repeats} times in a row. \
             Repeating it again will not produce a different result. Stop and either answer with \
             what you have or try a materially different tool call."
        ),
    }
}

/// In-memory table of live Responses sessions. Entries are not persisted;
/// a process restart drops in-flight tool-use loops, matching spec §4.7's
/// "best-effort, server memory only" scope note.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<ResponseSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn create(
        &self,
        adapter: String,
        base_model: String,
        history: Vec<UnifiedMessage>,
        tools: Vec<UnifiedTool>,
    ) -> String {
        let id = ResponseSession::new_id();
        let session = ResponseSession {
            id: id.clone(),
            adapter,
            base_model,
            history,
            tools,
            outstanding_tool_call_ids: Vec::new(),
            output_tx: None,
            created_at: Instant::now(),
        };
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<ResponseSession>>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    /// Drops sessions older than `max_age`, since an abandoned tool-use loop
    /// otherwise lives in memory forever.
    pub fn sweep_expired(&self, max_age: Duration) {
        let now = Instant::now();
        self.sessions
            .retain(|_, session| match session.try_lock() {
                Ok(s) => now.duration_since(s.created_at) < max_age,
                Err(_) => true,
            });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivers tool outputs to whichever task is waiting on `session`'s
/// `output_tx`. The first writer wins: if the oneshot sender has already
/// been taken (or the continuation raced and lost), the send is a no-op and
/// is logged at debug rather than surfaced as an error, since the legacy
/// `submit_tool_outputs` path and a fresh `/v1/responses` continuation
/// request are both permitted to race for the same session.
pub async fn deliver_tool_outputs(session: &Arc<Mutex<ResponseSession>>, outputs: ToolOutputs) -> bool {
    let mut guard = session.lock().await;
    match guard.output_tx.take() {
        Some(tx) => tx.send(outputs).is_ok(),
        None => {
            tracing::debug!(session_id = %guard.id, "tool outputs delivered with no waiter; dropping");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::unified::UnifiedToolCall;

    fn assistant_with_call(name: &str, args: &str) -> UnifiedMessage {
        let mut m = UnifiedMessage::text(UnifiedRole::Assistant, "");
        m.tool_calls.push(UnifiedToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: args.into(),
        });
        m
    }

    #[test]
    fn three_repeats_is_a_warning() {
        let history = vec![assistant_with_call("search", "{}"); 3];
        assert_eq!(check_duplicate_tool_calls(&history), LoopCheck::Warning(3));
    }

    #[test]
    fn five_repeats_is_infinite_loop() {
        let history = vec![assistant_with_call("search", "{}"); 5];
        assert_eq!(check_duplicate_tool_calls(&history), LoopCheck::InfiniteLoop(5));
    }

    #[test]
    fn distinct_arguments_do_not_count_as_repeats() {
        let history = vec![
            assistant_with_call("search", r#"{"q":"a"}"#),
            assistant_with_call("search", r#"{"q":"b"}"#),
            assistant_with_call("search", r#"{"q":"c"}"#),
        ];
        assert_eq!(check_duplicate_tool_calls(&history), LoopCheck::Ok);
    }

    fn tool_result(content: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::Tool,
            content: crate::translate::unified::UnifiedContent::Text(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: Some("call_1".into()),
        }
    }

    #[test]
    fn non_consecutive_assistant_calls_are_not_flagged() {
        let history = vec![
            assistant_with_call("search", "{}"),
            assistant_with_call("other", "{}"),
            assistant_with_call("search", "{}"),
            assistant_with_call("other", "{}"),
            assistant_with_call("search", "{}"),
        ];
        assert_eq!(check_duplicate_tool_calls(&history), LoopCheck::Ok);
    }

    #[test]
    fn five_identical_tool_results_is_infinite_loop_even_with_distinct_calls() {
        let mut history = Vec::new();
        for i in 0..5 {
            history.push(assistant_with_call("search", &format!("{{\"q\":{i}}}")));
            history.push(tool_result("error: rate limited"));
        }
        assert_eq!(check_duplicate_tool_calls(&history), LoopCheck::InfiniteLoop(5));
    }

    #[test]
    fn tool_results_interleaved_with_assistant_messages_still_count_as_consecutive() {
        let history = vec![
            assistant_with_call("search", "{}"),
            tool_result("ok"),
            assistant_with_call("search", "{}"),
            tool_result("ok"),
            assistant_with_call("search", "{}"),
        ];
        // The assistant subsequence is search,search,search (consecutive
        // within that subsequence) even though tool_result messages sit
        // between them in the raw history.
        assert_eq!(check_duplicate_tool_calls(&history), LoopCheck::Warning(3));
    }

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let store = SessionStore::new();
        let id = store.create("responses".into(), "gpt-4".into(), vec![], vec![]);
        assert!(store.get(&id).is_some());
        store.remove(&id);
        assert!(store.get(&id).is_none());
    }
}
