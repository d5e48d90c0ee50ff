use crate::replica::{EntryKind, MembershipChange, ReplicaId, ReplicaMetadata};
use crate::state_machine::ApplyError;
use serde::{Deserialize, Serialize};

/// Command is every mutation the cluster store knows how to replicate. Membership commands travel
/// as configuration log entries, everything else as data entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    PutRecord {
        name: String,
        payload: serde_json::Value,
        /// Optimistic concurrency: the write only applies if the record's current version matches.
        /// `Some(0)` means "must not exist yet".
        expected_version: Option<u64>,
    },
    DeleteRecord {
        name: String,
    },
    PutConnectionString {
        name: String,
        connection_string: ConnectionString,
    },
    RemoveConnectionString {
        name: String,
    },
    AddNode {
        node_id: String,
        address: String,
    },
    RemoveNode {
        node_id: String,
    },
    /// Changes nothing. Used as a read barrier.
    Noop,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ConnectionString {
    /// Points at another cluster of this store.
    Raven {
        topology_discovery_urls: Vec<String>,
        database: String,
    },
    Sql {
        connection_string: String,
        factory_name: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionStringKind {
    Raven,
    Sql,
}

impl ConnectionString {
    pub fn kind(&self) -> ConnectionStringKind {
        match self {
            ConnectionString::Raven { .. } => ConnectionStringKind::Raven,
            ConnectionString::Sql { .. } => ConnectionStringKind::Sql,
        }
    }

    fn validate(&self) -> Result<(), CommandValidationError> {
        match self {
            ConnectionString::Raven {
                topology_discovery_urls,
                database,
            } => {
                if topology_discovery_urls.is_empty() {
                    return Err(CommandValidationError::new("Raven connection string needs at least one url"));
                }
                if topology_discovery_urls.iter().any(|url| url.trim().is_empty()) {
                    return Err(CommandValidationError::new("Raven connection string has an empty url"));
                }
                require_non_empty("database", database)
            }
            ConnectionString::Sql {
                connection_string,
                factory_name,
            } => {
                require_non_empty("connection_string", connection_string)?;
                require_non_empty("factory_name", factory_name)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid command: {0}")]
pub struct CommandValidationError(String);

impl CommandValidationError {
    fn new(message: impl Into<String>) -> Self {
        CommandValidationError(message.into())
    }
}

impl Command {
    /// Rejects malformed commands before they're appended to the log. Commands that pass are
    /// applied deterministically on every member.
    pub fn validate(&self) -> Result<(), CommandValidationError> {
        match self {
            Command::PutRecord { name, payload, .. } => {
                require_name(name)?;
                if payload.is_null() {
                    return Err(CommandValidationError::new("record payload can't be null"));
                }
                Ok(())
            }
            Command::DeleteRecord { name } | Command::RemoveConnectionString { name } => require_name(name),
            Command::PutConnectionString {
                name,
                connection_string,
            } => {
                require_name(name)?;
                connection_string.validate()
            }
            Command::AddNode { node_id, address } => {
                require_non_empty("node_id", node_id)?;
                require_non_empty("address", address)
            }
            Command::RemoveNode { node_id } => require_non_empty("node_id", node_id),
            Command::Noop => Ok(()),
        }
    }

    /// Encodes the command as a log entry payload.
    pub(crate) fn to_log_payload(&self) -> Result<(EntryKind, Vec<u8>), CommandValidationError> {
        match self {
            Command::AddNode { node_id, address } => {
                let change = MembershipChange::Add(ReplicaMetadata::new(ReplicaId::new(node_id.clone()), address.clone()));
                Ok((EntryKind::Configuration, change.encode()))
            }
            Command::RemoveNode { node_id } => {
                let change = MembershipChange::Remove(ReplicaId::new(node_id.clone()));
                Ok((EntryKind::Configuration, change.encode()))
            }
            other => serde_json::to_vec(other)
                .map(|bytes| (EntryKind::Data, bytes))
                .map_err(|e| CommandValidationError::new(e.to_string())),
        }
    }

    /// Inverse of `to_log_payload()`. An empty data entry is the leader's no-op.
    pub(crate) fn from_log_payload(kind: EntryKind, data: &[u8]) -> Result<Command, ApplyError> {
        match kind {
            EntryKind::Data if data.is_empty() => Ok(Command::Noop),
            EntryKind::Data => serde_json::from_slice(data).map_err(|e| ApplyError::Malformed(e.to_string())),
            EntryKind::Configuration => match MembershipChange::decode(data) {
                Ok(MembershipChange::Add(metadata)) => Ok(Command::AddNode {
                    node_id: metadata.replica_id().as_str().to_string(),
                    address: metadata.address().to_string(),
                }),
                Ok(MembershipChange::Remove(replica_id)) => Ok(Command::RemoveNode {
                    node_id: replica_id.into_inner(),
                }),
                Err(e) => Err(ApplyError::Malformed(e.to_string())),
            },
            EntryKind::Snapshot => Err(ApplyError::Malformed("snapshot is not a command".into())),
        }
    }
}

fn require_name(name: &str) -> Result<(), CommandValidationError> {
    require_non_empty("name", name)?;
    if name.chars().any(char::is_control) {
        return Err(CommandValidationError::new("name contains control characters"));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), CommandValidationError> {
    if value.trim().is_empty() {
        return Err(CommandValidationError::new(format!("{} can't be empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_commands_survive_log_encoding() {
        let command = Command::PutConnectionString {
            name: "etl-target".into(),
            connection_string: ConnectionString::Sql {
                connection_string: "Server=db;".into(),
                factory_name: "System.Data.SqlClient".into(),
            },
        };

        let (kind, bytes) = command.to_log_payload().unwrap();
        assert_eq!(kind, EntryKind::Data);
        assert_eq!(Command::from_log_payload(kind, &bytes).unwrap(), command);
    }

    #[test]
    fn membership_commands_become_configuration_entries() {
        let command = Command::AddNode {
            node_id: "D".into(),
            address: "10.0.0.4:9000".into(),
        };

        let (kind, bytes) = command.to_log_payload().unwrap();
        assert_eq!(kind, EntryKind::Configuration);
        assert_eq!(Command::from_log_payload(kind, &bytes).unwrap(), command);
    }

    #[test]
    fn empty_data_entry_is_noop() {
        assert_eq!(Command::from_log_payload(EntryKind::Data, &[]).unwrap(), Command::Noop);
        assert!(matches!(
            Command::from_log_payload(EntryKind::Data, b"{not json"),
            Err(ApplyError::Malformed(_))
        ));
    }

    #[test]
    fn validate_rejects_malformed_payloads() {
        let ok = Command::PutRecord {
            name: "db1".into(),
            payload: json!({"replication_factor": 3}),
            expected_version: None,
        };
        assert!(ok.validate().is_ok());

        let bad = vec![
            Command::PutRecord {
                name: "  ".into(),
                payload: json!({}),
                expected_version: None,
            },
            Command::PutRecord {
                name: "db1".into(),
                payload: serde_json::Value::Null,
                expected_version: None,
            },
            Command::DeleteRecord { name: "a\u{0}b".into() },
            Command::PutConnectionString {
                name: "remote".into(),
                connection_string: ConnectionString::Raven {
                    topology_discovery_urls: vec![],
                    database: "db".into(),
                },
            },
            Command::AddNode {
                node_id: "D".into(),
                address: "".into(),
            },
        ];
        for command in bad {
            assert!(command.validate().is_err(), "{:?} should be rejected", command);
        }

        // Deleting something that may not exist is still a valid command.
        assert!(Command::RemoveConnectionString { name: "missing".into() }.validate().is_ok());
    }
}
