use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientStaleTerm,
    ProtoInstallSnapshotError, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess,
    ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoServerMissingPreviousLog,
};
use crate::replica::{
    from_proto_member, AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, EntryKind,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, ReplicaId, RequestVoteError,
    RequestVoteInput, RequestVoteOutput, SnapshotMetadata, Term, WriteAheadLogEntry,
};
use crate::server::RpcServerShutdownSignal;
use bytes::Bytes;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface. The in-process transport calls
/// the same handlers directly.
#[derive(Clone)]
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        match result {
            Ok(()) => slog::info!(logger, "Server has shut down."),
            Err(e) => slog::error!(logger, "Server run() has exited: {:?}", e),
        }
    }

    pub(crate) async fn handle_request_vote(
        &self,
        rpc_request: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let result = match app_result {
            Ok(ok) => proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                vote_granted: ok.vote_granted,
                current_term: ok.current_term.as_u64(),
            }),
            Err(RequestVoteError::LocalIoError(_)) => Self::request_vote_fault("Local IO failure"),
            Err(RequestVoteError::ActorExited) => Self::request_vote_fault("Server internal replica task has exited"),
        };

        ProtoRequestVoteResult { result: Some(result) }
    }

    fn request_vote_fault(message: &str) -> proto_request_vote_result::Result {
        proto_request_vote_result::Result::Err(ProtoRequestVoteError {
            err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                message: message.to_string(),
            })),
        })
    }

    pub(crate) async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let leader_commit_index = Index::from_u64(rpc_request.commit_index);

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            let kind = match EntryKind::from_u8(proto_entry.kind as u8) {
                Some(EntryKind::Snapshot) | None => {
                    return Err(Status::invalid_argument(format!(
                        "Unknown log entry kind {}",
                        proto_entry.kind
                    )))
                }
                Some(kind) => kind,
            };
            new_entries.push(WriteAheadLogEntry {
                term: Term::new(proto_entry.term),
                kind,
                data: proto_entry.data,
            })
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_previous_log_entry,
            leader_commit_index,
            new_entries,
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, 0) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        // Empty
                    })),
                }
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_entry_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: last_log_entry_index.map(|i| i.as_u64()).unwrap_or(0),
                })
            }
            Err(AppendEntriesError::ServerIoError(_)) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Local IO failure".to_string(),
            }),
            Err(AppendEntriesError::ActorExited) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }
    }

    pub(crate) async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = Self::convert_install_snapshot_input(rpc_request)?;
        let app_result = self.local_replica.install_snapshot(app_input).await;
        let rpc_reply = Self::convert_install_snapshot_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_install_snapshot_input(rpc_request: ProtoInstallSnapshotReq) -> Result<InstallSnapshotInput, Status> {
        let (last_included_term, last_included_index) =
            Self::convert_log_entry_metadata(rpc_request.last_included_term, rpc_request.last_included_index)?
                .ok_or_else(|| Status::invalid_argument("Snapshot must include at least one log entry"))?;

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
                membership: rpc_request.membership.into_iter().map(from_proto_member).collect(),
            },
            data: Bytes::from(rpc_request.data),
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                        // Empty
                    })),
                }
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(InstallSnapshotError::ServerIoError(_)) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                })
            }
            Err(InstallSnapshotError::ActorExited) => proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::trace!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::trace!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot from {} through {}",
            rpc_request.client_node_id,
            rpc_request.last_included_index
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::ProtoLogEntry;

    #[test]
    fn log_entry_metadata_must_be_all_or_nothing() {
        assert_eq!(RpcServer::convert_log_entry_metadata(0, 0).unwrap(), None);
        assert_eq!(
            RpcServer::convert_log_entry_metadata(3, 7).unwrap(),
            Some((Term::new(3), Index::new(7)))
        );
        assert!(RpcServer::convert_log_entry_metadata(0, 7).is_err());
        assert!(RpcServer::convert_log_entry_metadata(3, 0).is_err());
    }

    #[test]
    fn append_entries_rejects_unknown_entry_kind() {
        let request = ProtoAppendEntriesReq {
            client_node_id: "node-1".into(),
            term: 2,
            commit_index: 0,
            previous_log_entry_term: 0,
            previous_log_entry_index: 0,
            new_entries: vec![ProtoLogEntry {
                term: 2,
                kind: EntryKind::Snapshot.as_u8() as u32,
                data: vec![],
            }],
        };

        let status = RpcServer::convert_append_entries_input(request).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn missing_log_error_carries_hint() {
        let reply = RpcServer::convert_append_entries_result(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
            last_log_entry_index: Some(Index::new(4)),
        }));

        match reply.result {
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(payload)),
            })) => assert_eq!(payload.last_log_entry_index, 4),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn snapshot_without_entries_is_rejected() {
        let request = ProtoInstallSnapshotReq {
            client_node_id: "node-1".into(),
            term: 2,
            last_included_index: 0,
            last_included_term: 0,
            membership: vec![],
            data: vec![],
        };

        assert!(RpcServer::convert_install_snapshot_input(request).is_err());
    }
}
