//! Command monitoring capture for client entities

use bson::Document;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use unified_common::{CommandEvent, CommandEventHandler};

use crate::error::{RunnerError, RunnerResult};

const OBSERVABLE_EVENTS: &[&str] = &[
    "commandStartedEvent",
    "commandSucceededEvent",
    "commandFailedEvent",
];

/// Commands whose events are hidden unless `observeSensitiveCommands` is set
const SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Records the command events of one client while a test runs
#[derive(Debug)]
pub struct EventRecorder {
    observed: HashSet<&'static str>,
    ignored_commands: HashSet<String>,
    observe_sensitive: bool,
    capturing: AtomicBool,
    /// Request ids whose started event was filtered out, so the matching
    /// succeeded/failed event is filtered too
    hidden_requests: Mutex<HashSet<i32>>,
    events: Mutex<Vec<CommandEvent>>,
}

impl EventRecorder {
    /// `observe` lists event type names; anything other than command events
    /// is rejected.
    pub fn new(
        observe: &[String],
        ignore_commands: &[String],
        observe_sensitive: bool,
    ) -> RunnerResult<Self> {
        let mut observed = HashSet::new();
        for name in observe {
            let known = OBSERVABLE_EVENTS
                .iter()
                .find(|known| **known == name.as_str())
                .ok_or_else(|| RunnerError::UnsupportedEventType(name.clone()))?;
            observed.insert(*known);
        }
        Ok(Self {
            observed,
            ignored_commands: ignore_commands.iter().cloned().collect(),
            observe_sensitive,
            capturing: AtomicBool::new(true),
            hidden_requests: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Stop recording; events published afterwards are dropped
    pub fn stop(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }

    /// Everything captured so far, in publication order
    pub fn events(&self) -> Vec<CommandEvent> {
        self.events.lock().clone()
    }

    /// Command documents of the captured started events
    pub fn started_commands(&self) -> Vec<Document> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CommandEvent::Started(started) => Some(started.command.clone()),
                _ => None,
            })
            .collect()
    }

    fn is_hidden_command(&self, name: &str, command: Option<&Document>) -> bool {
        if self.ignored_commands.contains(name) {
            return true;
        }
        if self.observe_sensitive {
            return false;
        }
        let speculative_auth = matches!(name, "hello" | "isMaster" | "ismaster")
            && command.map(|c| c.contains_key("speculativeAuthenticate")).unwrap_or(false);
        SENSITIVE_COMMANDS.contains(&name) || speculative_auth
    }
}

impl CommandEventHandler for EventRecorder {
    fn handle_command_event(&self, event: CommandEvent) {
        if !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        let hidden = match &event {
            CommandEvent::Started(started) => {
                let hidden = self.is_hidden_command(&started.command_name, Some(&started.command));
                if hidden {
                    self.hidden_requests.lock().insert(started.request_id);
                }
                hidden
            }
            CommandEvent::Succeeded(_) | CommandEvent::Failed(_) => {
                self.hidden_requests.lock().remove(&event.request_id())
                    || self.is_hidden_command(event.command_name(), None)
            }
        };
        if hidden || !self.observed.contains(event.type_name()) {
            return;
        }
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::time::Duration;
    use unified_common::event::{CommandStartedEvent, CommandSucceededEvent};
    use unified_common::ServerAddress;

    fn started(request_id: i32, command: Document) -> CommandEvent {
        let command_name = command.keys().next().cloned().unwrap();
        CommandEvent::Started(CommandStartedEvent {
            command,
            database_name: "db".to_string(),
            command_name,
            request_id,
            connection: ServerAddress::new("localhost", 27017),
        })
    }

    fn succeeded(request_id: i32, command_name: &str) -> CommandEvent {
        CommandEvent::Succeeded(CommandSucceededEvent {
            reply: doc! { "ok": 1 },
            command_name: command_name.to_string(),
            duration: Duration::from_millis(1),
            request_id,
            connection: ServerAddress::new("localhost", 27017),
        })
    }

    fn names(recorder: &EventRecorder) -> Vec<String> {
        recorder
            .events()
            .iter()
            .map(|e| format!("{}:{}", e.type_name(), e.command_name()))
            .collect()
    }

    #[test]
    fn test_only_observed_kinds_are_recorded() {
        let recorder = EventRecorder::new(&["commandStartedEvent".to_string()], &[], false).unwrap();
        recorder.handle_command_event(started(1, doc! { "insert": "coll" }));
        recorder.handle_command_event(succeeded(1, "insert"));
        assert_eq!(names(&recorder), vec!["commandStartedEvent:insert"]);
    }

    #[test]
    fn test_ignored_and_sensitive_commands_are_hidden() {
        let all: Vec<String> = OBSERVABLE_EVENTS.iter().map(|s| s.to_string()).collect();
        let recorder = EventRecorder::new(&all, &["killCursors".to_string()], false).unwrap();
        recorder.handle_command_event(started(1, doc! { "killCursors": "coll" }));
        recorder.handle_command_event(succeeded(1, "killCursors"));
        recorder.handle_command_event(started(2, doc! { "hello": 1, "speculativeAuthenticate": {} }));
        recorder.handle_command_event(succeeded(2, "hello"));
        recorder.handle_command_event(started(3, doc! { "hello": 1 }));
        assert_eq!(names(&recorder), vec!["commandStartedEvent:hello"]);

        let sensitive = EventRecorder::new(&all, &[], true).unwrap();
        sensitive.handle_command_event(started(1, doc! { "saslStart": 1 }));
        assert_eq!(sensitive.events().len(), 1);
    }

    #[test]
    fn test_fail_point_commands_sent_by_a_test_are_recorded() {
        let recorder = EventRecorder::new(&["commandStartedEvent".to_string()], &[], false).unwrap();
        recorder.handle_command_event(started(1, doc! { "configureFailPoint": "failCommand", "mode": "off" }));
        assert_eq!(names(&recorder), vec!["commandStartedEvent:configureFailPoint"]);
    }

    #[test]
    fn test_stop_freezes_the_log() {
        let recorder = EventRecorder::new(&["commandStartedEvent".to_string()], &[], false).unwrap();
        recorder.handle_command_event(started(1, doc! { "find": "coll", "lsid": { "id": 1 } }));
        recorder.stop();
        recorder.handle_command_event(started(2, doc! { "find": "coll" }));
        assert_eq!(recorder.started_commands().len(), 1);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        assert!(matches!(
            EventRecorder::new(&["poolCreatedEvent".to_string()], &[], false),
            Err(RunnerError::UnsupportedEventType(_))
        ));
    }
}
