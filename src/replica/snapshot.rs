use crate::commitlog::{Index, StorageError};
use crate::grpc::ProtoSnapshotFile;
use crate::replica::membership::{from_proto_member, to_proto_member};
use crate::replica::peers::ReplicaMetadata;
use crate::replica::Term;
use bytes::Bytes;
use prost::Message;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SnapshotMetadata {
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    /// Committed configuration as of `last_included_index`.
    pub(crate) membership: Vec<ReplicaMetadata>,
}

#[derive(Clone, Debug)]
pub(crate) struct Snapshot {
    pub(crate) metadata: SnapshotMetadata,
    /// Serialized state machine.
    pub(crate) data: Bytes,
}

/// SnapshotStore holds the latest snapshot, and persists it when backed by a directory.
pub(crate) struct SnapshotStore {
    path: Option<PathBuf>,
    latest: Option<Snapshot>,
}

impl SnapshotStore {
    pub(crate) fn volatile() -> Self {
        SnapshotStore {
            path: None,
            latest: None,
        }
    }

    /// Loads the snapshot at `path` if there is one. A checksum mismatch is `Corruption`.
    pub(crate) fn open(path: PathBuf) -> Result<Self, StorageError> {
        let latest = if path.exists() {
            let bytes = fs::read(&path)?;
            Some(decode_snapshot_file(&bytes)?)
        } else {
            None
        };

        Ok(SnapshotStore {
            path: Some(path),
            latest,
        })
    }

    pub(crate) fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub(crate) fn save(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        if let Some(path) = &self.path {
            let bytes = encode_snapshot_file(&snapshot)?;

            let tmp_path = path.with_extension("tmp");
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)?;
        }

        self.latest.replace(snapshot);
        Ok(())
    }
}

fn encode_snapshot_file(snapshot: &Snapshot) -> Result<Vec<u8>, StorageError> {
    let proto = ProtoSnapshotFile {
        last_included_index: snapshot.metadata.last_included_index.as_u64(),
        last_included_term: snapshot.metadata.last_included_term.as_u64(),
        membership: snapshot.metadata.membership.iter().map(to_proto_member).collect(),
        data: snapshot.data.to_vec(),
        data_crc: crc32fast::hash(&snapshot.data),
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    let mut bytes = Vec::with_capacity(proto.encoded_len());
    proto.encode(&mut bytes)?;
    Ok(bytes)
}

fn decode_snapshot_file(bytes: &[u8]) -> Result<Snapshot, StorageError> {
    let proto = ProtoSnapshotFile::decode(bytes)?;
    if crc32fast::hash(&proto.data) != proto.data_crc {
        return Err(StorageError::Corruption(format!(
            "snapshot created at {} fails its checksum",
            proto.created_at
        )));
    }
    let last_included_index = Index::from_u64(proto.last_included_index)
        .ok_or_else(|| StorageError::Corruption("snapshot has last included index 0".into()))?;

    Ok(Snapshot {
        metadata: SnapshotMetadata {
            last_included_index,
            last_included_term: Term::new(proto.last_included_term),
            membership: proto.membership.into_iter().map(from_proto_member).collect(),
        },
        data: Bytes::from(proto.data),
    })
}
