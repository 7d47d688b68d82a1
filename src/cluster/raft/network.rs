//! Network transport for Raft communication.
//!
//! Raft RPCs travel over the pub/sub [`Transport`] as request/reply messages.
//! Every node serves its RPCs on `{namespace}.raft.{node id}`; that subject is
//! the `addr` of its [`BasicNode`].

use std::sync::Arc;
use std::time::Duration;

use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{MetadataOp, MetadataResponse};
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::error::{BrokerError, BrokerResult};
use crate::protocol::{decode_envelope, encode_envelope};
use crate::transport::{Transport, TransportError, TransportMessage};

/// Maximum number of hops for forwarded writes.
const MAX_FORWARD_HOPS: u8 = 3;

/// Message types for Raft RPC.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// A metadata proposal forwarded from a non-leader.
    ClientWrite {
        op: MetadataOp,
        /// Term the sender saw; a leader with a newer term rejects the write.
        expected_term: u64,
        forward_hops: u8,
    },
}

/// Error kinds that keep their retry semantics across the wire.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RpcErrorKind {
    LeadershipChanged,
    NotLeader { leader_hint: Option<RaftNodeId> },
    ForwardLoopDetected,
    Internal,
}

impl RpcErrorKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RpcErrorKind::ForwardLoopDetected)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcErrorInfo {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcErrorInfo {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(RpcErrorKind::Internal, e.to_string())
    }
}

/// Response types for Raft RPC.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    ClientWriteOk(MetadataResponse),
    Error(RpcErrorInfo),
}

async fn send_rpc(
    transport: &Arc<dyn Transport>,
    subject: &str,
    message: &RaftRpcMessage,
    timeout: Duration,
) -> Result<RaftRpcResponse, RpcFailure> {
    let payload = encode_envelope(message).map_err(|e| RpcFailure::Codec(e.to_string()))?;
    let reply = transport.request(subject, payload, timeout).await?;
    decode_envelope(&reply.payload).map_err(|e| RpcFailure::Codec(e.to_string()))
}

/// Client-side RPC failure.
#[derive(Debug, thiserror::Error)]
enum RpcFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("raft rpc codec error: {0}")]
    Codec(String),

    #[error("raft rpc failed: {}", .0.message)]
    Remote(RpcErrorInfo),

    #[error("unexpected raft rpc response")]
    Unexpected,
}

impl RpcFailure {
    fn into_rpc_error<E: std::error::Error>(self) -> RPCError<RaftNodeId, BasicNode, E> {
        match &self {
            RpcFailure::Transport(TransportError::NoResponders(_)) => {
                RPCError::Unreachable(Unreachable::new(&self))
            }
            _ => RPCError::Network(NetworkError::new(&self)),
        }
    }
}

/// Forward a metadata proposal to the node serving `subject`.
pub async fn forward_client_write(
    transport: &Arc<dyn Transport>,
    subject: &str,
    op: MetadataOp,
    expected_term: u64,
    forward_hops: u8,
    timeout: Duration,
) -> BrokerResult<MetadataResponse> {
    if forward_hops >= MAX_FORWARD_HOPS {
        return Err(BrokerError::Raft(format!(
            "forward loop detected: request exceeded {} hops",
            MAX_FORWARD_HOPS
        )));
    }
    let message = RaftRpcMessage::ClientWrite {
        op,
        expected_term,
        forward_hops: forward_hops + 1,
    };
    match send_rpc(transport, subject, &message, timeout).await {
        Ok(RaftRpcResponse::ClientWriteOk(response)) => Ok(response),
        Ok(RaftRpcResponse::Error(info)) => Err(BrokerError::Raft(info.message)),
        Ok(_) => Err(BrokerError::Raft(RpcFailure::Unexpected.to_string())),
        Err(e) => Err(BrokerError::Raft(format!("failed to forward to leader: {}", e))),
    }
}

/// Factory for creating Raft network connections.
#[derive(Clone)]
pub struct RaftNetworkFactoryImpl {
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl RaftNetworkFactoryImpl {
    pub fn new(transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Self {
        Self {
            transport,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, _target: RaftNodeId, node: &BasicNode) -> Self::Network {
        RaftNetworkConnection {
            transport: self.transport.clone(),
            subject: node.addr.clone(),
            rpc_timeout: self.rpc_timeout,
        }
    }
}

/// A connection to a remote Raft node.
pub struct RaftNetworkConnection {
    transport: Arc<dyn Transport>,
    subject: String,
    rpc_timeout: Duration,
}

impl RaftNetworkConnection {
    async fn call(&self, message: RaftRpcMessage) -> Result<RaftRpcResponse, RpcFailure> {
        match send_rpc(&self.transport, &self.subject, &message, self.rpc_timeout).await? {
            RaftRpcResponse::Error(info) => Err(RpcFailure::Remote(info)),
            response => Ok(response),
        }
    }
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        match self.call(RaftRpcMessage::AppendEntries(req)).await {
            Ok(RaftRpcResponse::AppendEntries(resp)) => Ok(resp),
            Ok(_) => Err(RpcFailure::Unexpected.into_rpc_error()),
            Err(e) => Err(e.into_rpc_error()),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        match self.call(RaftRpcMessage::Vote(req)).await {
            Ok(RaftRpcResponse::Vote(resp)) => Ok(resp),
            Ok(_) => Err(RpcFailure::Unexpected.into_rpc_error()),
            Err(e) => Err(e.into_rpc_error()),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        match self.call(RaftRpcMessage::InstallSnapshot(req)).await {
            Ok(RaftRpcResponse::InstallSnapshot(resp)) => Ok(resp),
            Ok(_) => Err(RpcFailure::Unexpected.into_rpc_error()),
            Err(e) => Err(e.into_rpc_error()),
        }
    }
}

/// Serves Raft RPCs addressed to this node.
pub struct RaftRpcServer {
    raft: Arc<openraft::Raft<TypeConfig>>,
    transport: Arc<dyn Transport>,
    subject: String,
}

impl RaftRpcServer {
    pub fn new(
        raft: Arc<openraft::Raft<TypeConfig>>,
        transport: Arc<dyn Transport>,
        subject: String,
    ) -> Self {
        Self {
            raft,
            transport,
            subject,
        }
    }

    /// Serve until `shutdown` fires. Each request is handled on its own task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let mut sub = self.transport.subscribe(&self.subject).await?;
        info!(subject = %self.subject, "Raft RPC server listening");

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let raft = self.raft.clone();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_request(raft, transport, msg).await {
                    warn!(error = %e, "Error handling Raft RPC");
                }
            });
        }
        info!(subject = %self.subject, "Raft RPC server stopped");
        Ok(())
    }

    async fn handle_request(
        raft: Arc<openraft::Raft<TypeConfig>>,
        transport: Arc<dyn Transport>,
        msg: TransportMessage,
    ) -> BrokerResult<()> {
        let Some(reply) = msg.reply else {
            debug!(subject = %msg.subject, "Dropping Raft RPC without reply subject");
            return Ok(());
        };
        let message: RaftRpcMessage = decode_envelope(&msg.payload)?;

        let response = match message {
            RaftRpcMessage::AppendEntries(req) => match raft.append_entries(req).await {
                Ok(resp) => RaftRpcResponse::AppendEntries(resp),
                Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RaftRpcMessage::Vote(req) => match raft.vote(req).await {
                Ok(resp) => RaftRpcResponse::Vote(resp),
                Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RaftRpcMessage::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                Ok(resp) => RaftRpcResponse::InstallSnapshot(resp),
                Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RaftRpcMessage::ClientWrite {
                op,
                expected_term,
                forward_hops,
            } => Self::handle_client_write(&raft, op, expected_term, forward_hops).await,
        };

        transport.publish(&reply, encode_envelope(&response)?).await?;
        Ok(())
    }

    /// Accept a forwarded write only as the current leader of a term no newer
    /// than the sender saw. Never forwards again.
    async fn handle_client_write(
        raft: &openraft::Raft<TypeConfig>,
        op: MetadataOp,
        expected_term: u64,
        forward_hops: u8,
    ) -> RaftRpcResponse {
        if forward_hops > MAX_FORWARD_HOPS {
            return RaftRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::ForwardLoopDetected,
                format!("forward loop detected after {} hops", forward_hops),
            ));
        }

        let (current_term, leader, id) = {
            let metrics = raft.metrics();
            let m = metrics.borrow();
            (m.current_term, m.current_leader, m.id)
        };
        if expected_term > 0 && current_term > expected_term {
            warn!(expected_term, current_term, "Rejecting forwarded write from a stale term");
            return RaftRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::LeadershipChanged,
                format!(
                    "stale leader: expected term {} but current term is {}",
                    expected_term, current_term
                ),
            ));
        }
        if leader != Some(id) {
            return RaftRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::NotLeader {
                    leader_hint: leader,
                },
                format!("node {} is not the leader", id),
            ));
        }

        match raft.client_write(op).await {
            Ok(resp) => RaftRpcResponse::ClientWriteOk(resp.data),
            Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    #[test]
    fn test_rpc_message_roundtrip() {
        let msg = RaftRpcMessage::Vote(VoteRequest {
            vote: openraft::Vote::new(1, 42),
            last_log_id: None,
        });
        let bytes = encode_envelope(&msg).unwrap();
        let back: RaftRpcMessage = decode_envelope(&bytes).unwrap();
        match back {
            RaftRpcMessage::Vote(req) => assert_eq!(req.vote.leader_id().voted_for(), Some(42)),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(RpcErrorKind::Internal.is_retryable());
        assert!(RpcErrorKind::NotLeader { leader_hint: None }.is_retryable());
        assert!(!RpcErrorKind::ForwardLoopDetected.is_retryable());
    }

    #[tokio::test]
    async fn test_forward_hop_limit() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let err = forward_client_write(
            &transport,
            "lb.raft.1",
            MetadataOp::Noop,
            1,
            MAX_FORWARD_HOPS,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("forward loop"));
    }

    #[tokio::test]
    async fn test_forward_without_responder() {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        let err = forward_client_write(
            &transport,
            "lb.raft.9",
            MetadataOp::Noop,
            1,
            0,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(err.is_retriable());
    }
}
