use crate::commitlog::StorageError;
use crate::grpc::{proto_membership_change, ProtoMember, ProtoMembershipChange};
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use prost::Message;

/// MembershipChange is the payload of a configuration log entry. Only one member is added or
/// removed per entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MembershipChange {
    Add(ReplicaMetadata),
    Remove(ReplicaId),
}

impl MembershipChange {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let change = match self {
            MembershipChange::Add(metadata) => proto_membership_change::Change::AddMember(to_proto_member(metadata)),
            MembershipChange::Remove(replica_id) => {
                proto_membership_change::Change::RemoveMember(replica_id.as_str().to_string())
            }
        };
        let proto = ProtoMembershipChange { change: Some(change) };

        let mut bytes = Vec::with_capacity(proto.encoded_len());
        // Vec<u8> grows as needed, so encoding can't run out of space.
        let _ = proto.encode(&mut bytes);
        bytes
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let proto = ProtoMembershipChange::decode(bytes)?;
        match proto.change {
            Some(proto_membership_change::Change::AddMember(member)) => Ok(MembershipChange::Add(from_proto_member(member))),
            Some(proto_membership_change::Change::RemoveMember(replica_id)) => {
                Ok(MembershipChange::Remove(ReplicaId::new(replica_id)))
            }
            None => Err(StorageError::Corruption("configuration entry without a change".into())),
        }
    }
}

pub(crate) fn to_proto_member(metadata: &ReplicaMetadata) -> ProtoMember {
    ProtoMember {
        replica_id: metadata.replica_id().as_str().to_string(),
        address: metadata.address().to_string(),
    }
}

pub(crate) fn from_proto_member(member: ProtoMember) -> ReplicaMetadata {
    ReplicaMetadata::new(ReplicaId::new(member.replica_id), member.address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_empty_change() {
        let proto = ProtoMembershipChange { change: None };
        let mut bytes = Vec::new();
        proto.encode(&mut bytes).unwrap();

        assert!(matches!(
            MembershipChange::decode(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn remove_survives_encoding() {
        let change = MembershipChange::Remove(ReplicaId::new("node-2"));
        assert_eq!(MembershipChange::decode(&change.encode()).unwrap(), change);
    }
}
