//! Command monitoring events

use bson::Document;
use std::time::Duration;

use crate::types::ServerAddress;
use crate::Error;

#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    pub command: Document,
    pub database_name: String,
    pub command_name: String,
    pub request_id: i32,
    pub connection: ServerAddress,
}

#[derive(Debug, Clone)]
pub struct CommandSucceededEvent {
    pub reply: Document,
    pub command_name: String,
    pub duration: Duration,
    pub request_id: i32,
    pub connection: ServerAddress,
}

#[derive(Debug, Clone)]
pub struct CommandFailedEvent {
    pub failure: Error,
    pub command_name: String,
    pub duration: Duration,
    pub request_id: i32,
    pub connection: ServerAddress,
}

/// An event published for every command a client sends
#[derive(Debug, Clone)]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    pub fn command_name(&self) -> &str {
        match self {
            CommandEvent::Started(e) => &e.command_name,
            CommandEvent::Succeeded(e) => &e.command_name,
            CommandEvent::Failed(e) => &e.command_name,
        }
    }

    pub fn request_id(&self) -> i32 {
        match self {
            CommandEvent::Started(e) => e.request_id,
            CommandEvent::Succeeded(e) => e.request_id,
            CommandEvent::Failed(e) => e.request_id,
        }
    }

    /// Short name used by the unified format (`commandStartedEvent`, ...)
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandEvent::Started(_) => "commandStartedEvent",
            CommandEvent::Succeeded(_) => "commandSucceededEvent",
            CommandEvent::Failed(_) => "commandFailedEvent",
        }
    }
}

/// Receives command events from a client.
///
/// Handlers are invoked synchronously on the task issuing the command and must
/// not block.
pub trait CommandEventHandler: Send + Sync {
    fn handle_command_event(&self, event: CommandEvent);
}
