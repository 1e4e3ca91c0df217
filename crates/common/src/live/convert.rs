//! Translation between the runner's driver types and the `mongodb` crate's

use bson::{Bson, Document};
use mongodb::error::{ErrorKind as DriverErrorKind, WriteFailure};
use mongodb::options::{
    Acknowledgment, ReadConcern as DriverReadConcern, ReadConcernLevel,
    ReadPreference as DriverReadPreference, SelectionCriteria,
    ServerAddress as DriverAddress, WriteConcern as DriverWriteConcern,
};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BulkWriteFailure, CommandError, ErrorKind, IndexedWriteError};
use crate::options::{NamespaceOptions, SessionOptions, TransactionOptions};
use crate::types::{ReadConcern, ReadPreference, ServerAddress, WriteConcern};
use crate::{Error, Result};

const DEFAULT_PORT: u16 = 27017;

/// Driver failure as a runner error, keeping code, code name and labels
pub(crate) fn error(e: mongodb::error::Error) -> Error {
    let mut converted = match e.kind.as_ref() {
        DriverErrorKind::Command(command) => {
            Error::command(command.code, command.code_name.clone(), command.message.clone())
        }
        DriverErrorKind::Write(WriteFailure::WriteError(write)) => {
            Error::new(ErrorKind::Write(CommandError {
                code: write.code,
                code_name: write.code_name.clone().unwrap_or_default(),
                message: write.message.clone(),
            }))
        }
        DriverErrorKind::Write(WriteFailure::WriteConcernError(wc)) => {
            Error::command(wc.code, wc.code_name.clone(), wc.message.clone())
        }
        DriverErrorKind::BulkWrite(failure) => Error::new(ErrorKind::BulkWrite(BulkWriteFailure {
            write_errors: failure
                .write_errors
                .iter()
                .flatten()
                .map(|w| IndexedWriteError {
                    index: w.index,
                    code: w.code,
                    code_name: w.code_name.clone().unwrap_or_default(),
                    message: w.message.clone(),
                })
                .collect(),
            write_concern_error: failure.write_concern_error.as_ref().map(|wc| CommandError {
                code: wc.code,
                code_name: wc.code_name.clone(),
                message: wc.message.clone(),
            }),
            partial_result: None,
        })),
        DriverErrorKind::Io(io) => Error::network(io.to_string()),
        DriverErrorKind::ConnectionPoolCleared { message, .. } => Error::network(message.clone()),
        DriverErrorKind::InvalidArgument { message, .. } => Error::invalid_argument(message.clone()),
        DriverErrorKind::Transaction { message, .. } => Error::transaction(message.clone()),
        DriverErrorKind::SessionsNotSupported => Error::session("sessions are not supported"),
        _ => Error::internal(e.to_string()),
    };
    for label in e.labels() {
        converted.add_label(label.clone());
    }
    converted
}

pub(crate) fn from_driver_address(address: &DriverAddress) -> ServerAddress {
    match address {
        DriverAddress::Tcp { host, port } => {
            ServerAddress::new(host.clone(), port.unwrap_or(DEFAULT_PORT))
        }
        #[allow(unreachable_patterns)]
        other => ServerAddress::new(other.to_string(), 0),
    }
}

pub(crate) fn to_driver_address(address: &ServerAddress) -> DriverAddress {
    DriverAddress::Tcp {
        host: address.host.clone(),
        port: Some(address.port),
    }
}

pub(crate) fn read_concern(read_concern: &ReadConcern) -> DriverReadConcern {
    let level = match read_concern.level.as_str() {
        "local" => ReadConcernLevel::Local,
        "majority" => ReadConcernLevel::Majority,
        "linearizable" => ReadConcernLevel::Linearizable,
        "available" => ReadConcernLevel::Available,
        "snapshot" => ReadConcernLevel::Snapshot,
        other => ReadConcernLevel::Custom(other.to_string()),
    };
    DriverReadConcern::from(level)
}

pub(crate) fn write_concern(write_concern: &WriteConcern) -> Result<DriverWriteConcern> {
    let mut converted = DriverWriteConcern::default();
    converted.w = match &write_concern.w {
        None => None,
        Some(Bson::String(w)) if w == "majority" => Some(Acknowledgment::Majority),
        Some(Bson::String(w)) => Some(Acknowledgment::Custom(w.clone())),
        Some(Bson::Int32(n)) if *n >= 0 => Some(Acknowledgment::Nodes(*n as u32)),
        Some(Bson::Int64(n)) if *n >= 0 => Some(Acknowledgment::Nodes(*n as u32)),
        Some(other) => {
            return Err(Error::invalid_argument(format!("invalid write concern w: {}", other)))
        }
    };
    converted.journal = write_concern.journal;
    converted.w_timeout = write_concern
        .w_timeout_ms
        .map(|ms| Duration::from_millis(ms.max(0) as u64));
    Ok(converted)
}

pub(crate) fn selection_criteria(read_preference: &ReadPreference) -> Result<SelectionCriteria> {
    let options = Default::default();
    let read_preference = match read_preference.mode.as_str() {
        "primary" => DriverReadPreference::Primary,
        "primaryPreferred" => DriverReadPreference::PrimaryPreferred { options },
        "secondary" => DriverReadPreference::Secondary { options },
        "secondaryPreferred" => DriverReadPreference::SecondaryPreferred { options },
        "nearest" => DriverReadPreference::Nearest { options },
        other => {
            return Err(Error::invalid_argument(format!("unknown read preference mode '{}'", other)))
        }
    };
    Ok(SelectionCriteria::ReadPreference(read_preference))
}

/// Selects exactly the server at `target`
pub(crate) fn target(target: &ServerAddress) -> SelectionCriteria {
    let address = to_driver_address(target);
    SelectionCriteria::Predicate(Arc::new(move |server: &mongodb::ServerInfo| {
        server.address() == &address
    }))
}

pub(crate) fn database_options(options: &NamespaceOptions) -> Result<mongodb::options::DatabaseOptions> {
    let mut converted = mongodb::options::DatabaseOptions::default();
    converted.read_concern = options.read_concern.as_ref().map(read_concern);
    converted.write_concern = options.write_concern.as_ref().map(write_concern).transpose()?;
    converted.selection_criteria = options
        .read_preference
        .as_ref()
        .map(selection_criteria)
        .transpose()?;
    Ok(converted)
}

pub(crate) fn collection_options(
    options: &NamespaceOptions,
) -> Result<mongodb::options::CollectionOptions> {
    let mut converted = mongodb::options::CollectionOptions::default();
    converted.read_concern = options.read_concern.as_ref().map(read_concern);
    converted.write_concern = options.write_concern.as_ref().map(write_concern).transpose()?;
    converted.selection_criteria = options
        .read_preference
        .as_ref()
        .map(selection_criteria)
        .transpose()?;
    Ok(converted)
}

pub(crate) fn transaction_options(
    options: &TransactionOptions,
) -> Result<mongodb::options::TransactionOptions> {
    let mut converted = mongodb::options::TransactionOptions::default();
    converted.read_concern = options.read_concern.as_ref().map(read_concern);
    converted.write_concern = options.write_concern.as_ref().map(write_concern).transpose()?;
    converted.selection_criteria = options
        .read_preference
        .as_ref()
        .map(selection_criteria)
        .transpose()?;
    converted.max_commit_time = options
        .max_commit_time_ms
        .map(|ms| Duration::from_millis(ms.max(0) as u64));
    Ok(converted)
}

pub(crate) fn session_options(options: &SessionOptions) -> Result<mongodb::options::SessionOptions> {
    let mut converted = mongodb::options::SessionOptions::builder().build();
    converted.causal_consistency = options.causal_consistency;
    converted.default_transaction_options = options
        .default_transaction_options
        .as_ref()
        .map(transaction_options)
        .transpose()?;
    Ok(converted)
}

/// `uri` with `options` appended to its query string
pub(crate) fn uri_with_options(uri: &str, options: &Document) -> Result<String> {
    let mut uri = uri.to_string();
    for (key, value) in options {
        let value = match value {
            Bson::String(s) => s.clone(),
            Bson::Boolean(b) => b.to_string(),
            Bson::Int32(n) => n.to_string(),
            Bson::Int64(n) => n.to_string(),
            Bson::Double(n) => n.to_string(),
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported value for URI option {}: {}",
                    key, other
                )))
            }
        };
        if uri.contains('?') {
            uri.push('&');
        } else {
            let has_path = uri
                .split_once("://")
                .map(|(_, rest)| rest.contains('/'))
                .unwrap_or(false);
            uri.push_str(if has_path { "?" } else { "/?" });
        }
        uri.push_str(&format!("{}={}", key, value));
    }
    Ok(uri)
}

/// Numeric reply field as a count; missing fields count as zero
pub(crate) fn count(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) => n.max(0.0) as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_uri_options_are_appended() {
        let options = doc! { "appname": "app", "retryWrites": false };
        assert_eq!(
            uri_with_options("mongodb://localhost:27017", &options).unwrap(),
            "mongodb://localhost:27017/?appname=app&retryWrites=false"
        );
        assert_eq!(
            uri_with_options("mongodb://a,b/?replicaSet=rs", &doc! { "w": 1 }).unwrap(),
            "mongodb://a,b/?replicaSet=rs&w=1"
        );
        assert!(uri_with_options("mongodb://a", &doc! { "x": { "y": 1 } }).is_err());
    }

    #[test]
    fn test_write_concern_acknowledgement() {
        let majority = write_concern(&WriteConcern::majority()).unwrap();
        assert_eq!(majority.w, Some(Acknowledgment::Majority));
        let unacknowledged = write_concern(&WriteConcern {
            w: Some(Bson::Int32(0)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(unacknowledged.w, Some(Acknowledgment::Nodes(0)));
        assert!(write_concern(&WriteConcern {
            w: Some(Bson::Boolean(true)),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_driver_errors_keep_code_and_labels() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let converted = error(mongodb::error::Error::from(io));
        assert!(converted.is_network_error());
        assert!(converted.is_client_error());

        let address = ServerAddress::new("localhost", 27018);
        assert_eq!(from_driver_address(&to_driver_address(&address)), address);
    }

    #[test]
    fn test_counts_accept_any_numeric_type() {
        let reply = doc! { "n": 2, "nModified": 1_i64, "x": 1.0 };
        assert_eq!(count(&reply, "n"), 2);
        assert_eq!(count(&reply, "nModified"), 1);
        assert_eq!(count(&reply, "x"), 1);
        assert_eq!(count(&reply, "missing"), 0);
    }
}
