//! The `failCommand` fail point, configured per server

use bson::{Bson, Document};
use std::collections::HashMap;

use super::{query, server_error};
use crate::types::ServerAddress;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    AlwaysOn,
    Times(i64),
    Skip(i64),
}

#[derive(Debug, Clone)]
struct FailCommand {
    mode: Mode,
    fail_commands: Vec<String>,
    error_code: Option<i32>,
    error_labels: Vec<String>,
    close_connection: bool,
    app_name: Option<String>,
}

impl FailCommand {
    fn parse(command: &Document) -> Result<Option<Self>> {
        let mode = match command.get("mode") {
            Some(Bson::String(mode)) if mode == "off" => return Ok(None),
            Some(Bson::String(mode)) if mode == "alwaysOn" => Mode::AlwaysOn,
            Some(Bson::Document(mode)) => match (mode.get("times"), mode.get("skip")) {
                (Some(n), _) => Mode::Times(query::as_i64(n).unwrap_or(0)),
                (None, Some(n)) => Mode::Skip(query::as_i64(n).unwrap_or(0)),
                _ => return Err(server_error(2, format!("unsupported fail point mode: {}", mode))),
            },
            other => {
                return Err(server_error(
                    9,
                    format!("invalid fail point mode: {:?}", other),
                ))
            }
        };

        let data = command.get_document("data").cloned().unwrap_or_default();
        let fail_commands: Vec<String> = data
            .get_array("failCommands")
            .map(|names| names.iter().filter_map(Bson::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let error_labels: Vec<String> = data
            .get_array("errorLabels")
            .map(|labels| labels.iter().filter_map(Bson::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Some(Self {
            mode,
            fail_commands,
            error_code: data.get("errorCode").and_then(query::as_i64).map(|c| c as i32),
            error_labels,
            close_connection: data.get_bool("closeConnection").unwrap_or(false),
            app_name: data.get_str("appName").ok().map(str::to_string),
        }))
    }

    fn applies_to(&self, command_name: &str, app_name: Option<&str>) -> bool {
        self.fail_commands.iter().any(|c| c == command_name)
            && self
                .app_name
                .as_deref()
                .map(|wanted| Some(wanted) == app_name)
                .unwrap_or(true)
    }

    fn failure(&self) -> Error {
        let mut error = if self.close_connection {
            Error::network("connection closed by failCommand fail point")
        } else {
            server_error(
                self.error_code.unwrap_or(8),
                "Failing command via 'failCommand' failpoint",
            )
        };
        for label in &self.error_labels {
            error.add_label(label.clone());
        }
        error
    }
}

/// Enabled `failCommand` configurations keyed by server
#[derive(Debug, Default)]
pub(crate) struct FailPoints {
    by_server: HashMap<ServerAddress, FailCommand>,
}

impl FailPoints {
    /// Handles a `configureFailPoint` command sent to `server`
    pub fn configure(&mut self, server: &ServerAddress, command: &Document) -> Result<()> {
        match command.get_str("configureFailPoint") {
            Ok("failCommand") => {}
            Ok(other) => {
                return Err(server_error(2, format!("unknown fail point: {}", other)));
            }
            Err(_) => return Err(server_error(9, "configureFailPoint must be a string")),
        }
        match FailCommand::parse(command)? {
            Some(fail_point) => {
                self.by_server.insert(server.clone(), fail_point);
            }
            None => {
                self.by_server.remove(server);
            }
        }
        Ok(())
    }

    /// Consumes one activation if a fail point targets this command
    pub fn trigger(&mut self, server: &ServerAddress, command_name: &str, app_name: Option<&str>) -> Option<Error> {
        let fail_point = self.by_server.get_mut(server)?;
        if !fail_point.applies_to(command_name, app_name) {
            return None;
        }
        let (fire, exhausted) = match fail_point.mode {
            Mode::AlwaysOn => (true, false),
            Mode::Times(n) if n <= 0 => (false, true),
            Mode::Times(n) => {
                fail_point.mode = Mode::Times(n - 1);
                (true, n == 1)
            }
            Mode::Skip(n) if n > 0 => {
                fail_point.mode = Mode::Skip(n - 1);
                (false, false)
            }
            Mode::Skip(_) => (true, false),
        };
        let failure = fire.then(|| fail_point.failure());
        if exhausted {
            self.by_server.remove(server);
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn server() -> ServerAddress {
        ServerAddress::new("localhost", 27017)
    }

    #[test]
    fn test_times_mode_exhausts() {
        let mut fail_points = FailPoints::default();
        fail_points
            .configure(
                &server(),
                &doc! {
                    "configureFailPoint": "failCommand",
                    "mode": { "times": 1 },
                    "data": { "failCommands": ["insert"], "errorCode": 11600, "errorLabels": ["TransientTransactionError"] },
                },
            )
            .unwrap();

        assert!(fail_points.trigger(&server(), "find", None).is_none());
        let err = fail_points.trigger(&server(), "insert", None).unwrap();
        assert_eq!(err.code(), Some(11600));
        assert!(err.contains_label("TransientTransactionError"));
        assert!(fail_points.trigger(&server(), "insert", None).is_none());
    }

    #[test]
    fn test_skip_and_off() {
        let mut fail_points = FailPoints::default();
        fail_points
            .configure(
                &server(),
                &doc! {
                    "configureFailPoint": "failCommand",
                    "mode": { "skip": 1 },
                    "data": { "failCommands": ["find"], "closeConnection": true },
                },
            )
            .unwrap();
        assert!(fail_points.trigger(&server(), "find", None).is_none());
        assert!(fail_points.trigger(&server(), "find", None).unwrap().is_network_error());

        fail_points
            .configure(&server(), &doc! { "configureFailPoint": "failCommand", "mode": "off" })
            .unwrap();
        assert!(fail_points.trigger(&server(), "find", None).is_none());
    }

    #[test]
    fn test_fail_point_is_scoped_to_server_and_app() {
        let mut fail_points = FailPoints::default();
        fail_points
            .configure(
                &server(),
                &doc! {
                    "configureFailPoint": "failCommand",
                    "mode": "alwaysOn",
                    "data": { "failCommands": ["ping"], "errorCode": 2, "appName": "app" },
                },
            )
            .unwrap();
        let other = ServerAddress::new("localhost", 27018);
        assert!(fail_points.trigger(&other, "ping", Some("app")).is_none());
        assert!(fail_points.trigger(&server(), "ping", None).is_none());
        assert!(fail_points.trigger(&server(), "ping", Some("app")).is_some());
    }

    #[test]
    fn test_unknown_fail_point_rejected() {
        let mut fail_points = FailPoints::default();
        let err = fail_points
            .configure(&server(), &doc! { "configureFailPoint": "hangBeforeCommit", "mode": "alwaysOn" })
            .unwrap_err();
        assert_eq!(err.code(), Some(2));
    }
}
