//! Per-subtask accumulator fed synchronously from the executor callback.

use std::collections::BTreeSet;

use crate::events::{EventPayload, ExecutionEvent, Phase, TabId};

use super::classify;

/// What a closed window reduced to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaptureResult {
    pub output: String,
    pub touched_tabs: Vec<TabId>,
    /// Error text of a `task.fail` seen while the window was open.
    pub failure: Option<String>,
}

#[derive(Debug, Default)]
pub struct CaptureWindow {
    active: bool,
    touched: BTreeSet<TabId>,
    messages: Vec<String>,
    done_texts: Vec<String>,
    /// The most recent action was the terminal "done" action.
    last_action_done: bool,
    failure: Option<String>,
    /// Tabs created or adopted over the whole session.
    session_tabs: BTreeSet<TabId>,
}

impl CaptureWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh window. Session-wide tab tracking is kept.
    pub fn open(&mut self) {
        self.active = true;
        self.touched.clear();
        self.messages.clear();
        self.done_texts.clear();
        self.last_action_done = false;
        self.failure = None;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn touch(&mut self, tab_id: TabId) {
        self.session_tabs.insert(tab_id);
        if self.active {
            self.touched.insert(tab_id);
        }
    }

    pub fn observe(&mut self, event: &ExecutionEvent) {
        if let Some(tab_id) = event.tab_id() {
            self.touch(tab_id);
        }
        if !self.active {
            return;
        }

        match &event.payload {
            EventPayload::Action {
                phase,
                action,
                details,
                is_done,
                ..
            } => {
                let done = *is_done || action.eq_ignore_ascii_case("done");
                match phase {
                    Phase::Start => self.last_action_done = done,
                    Phase::Ok if done || self.last_action_done => {
                        self.push_text(details, true);
                        self.last_action_done = true;
                        return;
                    }
                    Phase::Ok | Phase::Fail => {}
                }
                self.push_text(details, false);
            }
            EventPayload::TaskFail { error, .. } => {
                self.failure = Some(error.clone());
                self.push_text(error, false);
            }
            EventPayload::Streaming { .. } | EventPayload::TabCreated { .. } => {}
            _ => self.push_text(event.details(), false),
        }
    }

    fn push_text(&mut self, text: &str, done: bool) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if done {
            self.done_texts.push(text.to_string());
        }
        self.messages.push(text.to_string());
    }

    /// Close the window and reduce it to one output string.
    pub fn close(&mut self) -> CaptureResult {
        self.active = false;
        let result = CaptureResult {
            output: classify::extract_output(&self.done_texts, &self.messages),
            touched_tabs: self.touched.iter().copied().collect(),
            failure: self.failure.take(),
        };
        self.touched.clear();
        self.messages.clear();
        self.done_texts.clear();
        self.last_action_done = false;
        result
    }

    pub fn session_tabs(&self) -> Vec<TabId> {
        self.session_tabs.iter().copied().collect()
    }
}
