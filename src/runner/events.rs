use serde::Serialize;

use crate::collections::RunnableItem;
use crate::history::ExecutionHistory;
use crate::http::request::ResolvedRequest;
use crate::http::response::ResponseRecord;
use crate::scripts::{ConsoleLevel, ScriptError};
use crate::testing::AssertionResult;

/// Position of the run when an event fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Run id.
    #[serde(rename = "ref")]
    pub reference: String,
    pub position: usize,
    pub iteration: u32,
    pub length: usize,
    pub cycles: u32,
    pub empty: bool,
    pub eof: bool,
    pub bof: bool,
}

impl Cursor {
    pub fn new(reference: impl Into<String>, length: usize, cycles: u32) -> Self {
        let mut cursor = Self {
            reference: reference.into(),
            position: 0,
            iteration: 0,
            length,
            cycles,
            empty: length == 0,
            eof: false,
            bof: true,
        };
        cursor.seek(0, 0);
        cursor
    }

    pub fn seek(&mut self, position: usize, iteration: u32) {
        self.position = position;
        self.iteration = iteration;
        self.bof = position == 0 && iteration == 0;
        self.eof = position + 1 >= self.length && iteration + 1 >= self.cycles;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub id: String,
    pub name: String,
    pub path: String,
}

impl From<&RunnableItem> for ItemRef {
    fn from(item: &RunnableItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            path: item.path(),
        }
    }
}

/// Everything a run reports, in the order it happens. `Done` is always the
/// last event and is sent exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RunEvent {
    Start {
        cursor: Cursor,
    },
    BeforeIteration {
        cursor: Cursor,
    },
    BeforeItem {
        cursor: Cursor,
        item: ItemRef,
    },
    BeforePrerequest {
        cursor: Cursor,
        item: ItemRef,
    },
    Prerequest {
        cursor: Cursor,
        item: ItemRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ScriptError>,
    },
    BeforeRequest {
        cursor: Cursor,
        item: ItemRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        request: Option<ResolvedRequest>,
    },
    Request {
        cursor: Cursor,
        item: ItemRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request: Option<ResolvedRequest>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseRecord>,
        history: ExecutionHistory,
    },
    BeforeTest {
        cursor: Cursor,
        item: ItemRef,
    },
    Test {
        cursor: Cursor,
        item: ItemRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ScriptError>,
    },
    Item {
        cursor: Cursor,
        item: ItemRef,
        skipped: bool,
    },
    Iteration {
        cursor: Cursor,
    },
    Console {
        cursor: Cursor,
        level: ConsoleLevel,
        message: String,
    },
    Assertion {
        cursor: Cursor,
        item: ItemRef,
        assertion: AssertionResult,
    },
    Exception {
        cursor: Cursor,
        item: ItemRef,
        error: ScriptError,
    },
    Pause {
        cursor: Cursor,
    },
    Resume {
        cursor: Cursor,
    },
    Abort {
        cursor: Cursor,
    },
    Done {
        cursor: Cursor,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEvent {
    /// Wire name of the event, e.g. `beforeItem`.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Start { .. } => "start",
            RunEvent::BeforeIteration { .. } => "beforeIteration",
            RunEvent::BeforeItem { .. } => "beforeItem",
            RunEvent::BeforePrerequest { .. } => "beforePrerequest",
            RunEvent::Prerequest { .. } => "prerequest",
            RunEvent::BeforeRequest { .. } => "beforeRequest",
            RunEvent::Request { .. } => "request",
            RunEvent::BeforeTest { .. } => "beforeTest",
            RunEvent::Test { .. } => "test",
            RunEvent::Item { .. } => "item",
            RunEvent::Iteration { .. } => "iteration",
            RunEvent::Console { .. } => "console",
            RunEvent::Assertion { .. } => "assertion",
            RunEvent::Exception { .. } => "exception",
            RunEvent::Pause { .. } => "pause",
            RunEvent::Resume { .. } => "resume",
            RunEvent::Abort { .. } => "abort",
            RunEvent::Done { .. } => "done",
        }
    }

    pub fn cursor(&self) -> &Cursor {
        match self {
            RunEvent::Start { cursor }
            | RunEvent::BeforeIteration { cursor }
            | RunEvent::BeforeItem { cursor, .. }
            | RunEvent::BeforePrerequest { cursor, .. }
            | RunEvent::Prerequest { cursor, .. }
            | RunEvent::BeforeRequest { cursor, .. }
            | RunEvent::Request { cursor, .. }
            | RunEvent::BeforeTest { cursor, .. }
            | RunEvent::Test { cursor, .. }
            | RunEvent::Item { cursor, .. }
            | RunEvent::Iteration { cursor }
            | RunEvent::Console { cursor, .. }
            | RunEvent::Assertion { cursor, .. }
            | RunEvent::Exception { cursor, .. }
            | RunEvent::Pause { cursor }
            | RunEvent::Resume { cursor }
            | RunEvent::Abort { cursor }
            | RunEvent::Done { cursor, .. } => cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_flags() {
        let mut cursor = Cursor::new("run", 2, 2);
        assert!(cursor.bof && !cursor.eof && !cursor.empty);
        cursor.seek(1, 0);
        assert!(!cursor.bof && !cursor.eof);
        cursor.seek(1, 1);
        assert!(cursor.eof);

        let empty = Cursor::new("run", 0, 1);
        assert!(empty.empty && empty.eof && empty.bof);
    }

    #[test]
    fn events_serialize_with_tag_and_ref() {
        let event = RunEvent::Done {
            cursor: Cursor::new("r-1", 1, 1),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "done");
        assert_eq!(json["cursor"]["ref"], "r-1");
        assert!(json.get("error").is_none());
        assert_eq!(event.name(), "done");
    }
}
