use crate::state_machine::{Command, ConnectionString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A named, versioned document. `version` is the log index of the entry that last wrote it, so
/// every member computes the same version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub payload: serde_json::Value,
    pub version: u64,
}

/// What a successfully applied command did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandOutput {
    Noop,
    RecordWritten { version: u64 },
    RecordDeleted { existed: bool },
    ConnectionStringWritten,
    ConnectionStringRemoved { existed: bool },
    TopologyChanged { version: u64 },
}

/// Deterministic rejection of a committed command. State is left unchanged.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("Record {name:?} is at version {actual:?}, expected {expected}")]
    VersionMismatch {
        name: String,
        expected: u64,
        actual: Option<u64>,
    },
    #[error("Malformed log entry: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct TopologyState {
    members: BTreeMap<String, String>,
    version: u64,
}

/// ClusterState is everything the cluster agrees on. It changes only through `apply()`.
///
/// Clones share structure. A clone costs three reference counts, and `apply()` copies only the
/// collection it changes (keys and record pointers, never payloads) and only while another clone
/// still shares it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ClusterState {
    records: Arc<BTreeMap<String, Arc<DatabaseRecord>>>,
    connection_strings: Arc<BTreeMap<String, ConnectionString>>,
    topology: Arc<TopologyState>,
}

impl ClusterState {
    /// Initial state of a brand new cluster: no data, and the configured members at version 0.
    pub(crate) fn bootstrap(members: impl IntoIterator<Item = (String, String)>) -> Self {
        ClusterState {
            topology: Arc::new(TopologyState {
                members: members.into_iter().collect(),
                version: 0,
            }),
            ..ClusterState::default()
        }
    }

    pub(crate) fn record(&self, name: &str) -> Option<&DatabaseRecord> {
        self.records.get(name).map(Arc::as_ref)
    }

    pub(crate) fn records_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a DatabaseRecord> + 'a {
        self.records
            .range(prefix.to_string()..)
            .take_while(move |(name, _)| name.starts_with(prefix))
            .map(|(_, record)| record.as_ref())
    }

    pub(crate) fn connection_string(&self, name: &str) -> Option<&ConnectionString> {
        self.connection_strings.get(name)
    }

    pub(crate) fn connection_strings(&self) -> impl Iterator<Item = (&String, &ConnectionString)> {
        self.connection_strings.iter()
    }

    pub(crate) fn members(&self) -> &BTreeMap<String, String> {
        &self.topology.members
    }

    pub(crate) fn topology_version(&self) -> u64 {
        self.topology.version
    }

    /// Applies a committed command. Must stay a pure function of (state, index, command): no
    /// clocks, randomness or I/O.
    pub(crate) fn apply(&mut self, index: u64, command: &Command) -> Result<CommandOutput, ApplyError> {
        match command {
            Command::Noop => Ok(CommandOutput::Noop),
            Command::PutRecord {
                name,
                payload,
                expected_version,
            } => {
                let actual = self.records.get(name).map(|r| r.version);
                if let Some(expected) = expected_version {
                    if actual.unwrap_or(0) != *expected {
                        return Err(ApplyError::VersionMismatch {
                            name: name.clone(),
                            expected: *expected,
                            actual,
                        });
                    }
                }

                Arc::make_mut(&mut self.records).insert(
                    name.clone(),
                    Arc::new(DatabaseRecord {
                        name: name.clone(),
                        payload: payload.clone(),
                        version: index,
                    }),
                );
                Ok(CommandOutput::RecordWritten { version: index })
            }
            Command::DeleteRecord { name } => {
                let existed = self.records.contains_key(name);
                if existed {
                    Arc::make_mut(&mut self.records).remove(name);
                }
                Ok(CommandOutput::RecordDeleted { existed })
            }
            Command::PutConnectionString {
                name,
                connection_string,
            } => {
                Arc::make_mut(&mut self.connection_strings).insert(name.clone(), connection_string.clone());
                Ok(CommandOutput::ConnectionStringWritten)
            }
            Command::RemoveConnectionString { name } => {
                let existed = self.connection_strings.contains_key(name);
                if existed {
                    Arc::make_mut(&mut self.connection_strings).remove(name);
                }
                Ok(CommandOutput::ConnectionStringRemoved { existed })
            }
            Command::AddNode { node_id, address } => {
                if self.topology.members.get(node_id) != Some(address) {
                    let topology = Arc::make_mut(&mut self.topology);
                    topology.members.insert(node_id.clone(), address.clone());
                    topology.version += 1;
                }
                Ok(CommandOutput::TopologyChanged {
                    version: self.topology.version,
                })
            }
            Command::RemoveNode { node_id } => {
                if self.topology.members.contains_key(node_id) {
                    let topology = Arc::make_mut(&mut self.topology);
                    topology.members.remove(node_id);
                    topology.version += 1;
                }
                Ok(CommandOutput::TopologyChanged {
                    version: self.topology.version,
                })
            }
        }
    }

    pub(crate) fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn restore(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
