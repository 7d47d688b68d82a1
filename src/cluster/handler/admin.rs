//! Stream administration.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{ApiHandler, check_response};
use crate::cluster::raft::{MetadataOp, MetadataResponse, PartitionDescriptor, StreamDescriptor};
use crate::constants::{DEFAULT_PARTITIONS, DEFAULT_REPLICATION_FACTOR, MAX_PARTITIONS_PER_STREAM};
use crate::error::{Result, Status};
use crate::protocol::partition_subject;
use crate::types::{
    CreateStreamRequest, NodeId, PartitionId, PauseStreamRequest, ResumeStreamRequest,
    SetStreamReadonlyRequest,
};

/// Handle a create stream request.
pub(super) async fn handle_create_stream(
    handler: &ApiHandler,
    request: CreateStreamRequest,
) -> Result<()> {
    validate_name(&request.name)?;
    validate_subject(&request.subject)?;
    if request.partitions < 0 || request.partitions > MAX_PARTITIONS_PER_STREAM {
        return Err(Status::invalid_argument(format!(
            "partitions must be between 0 and {}, got {}",
            MAX_PARTITIONS_PER_STREAM, request.partitions
        )));
    }
    if request.replication_factor < 0 {
        return Err(Status::invalid_argument(format!(
            "replication factor must not be negative, got {}",
            request.replication_factor
        )));
    }

    let members = handler.broker.coordinator()?.members().await;
    let stream = build_descriptor(request, &members)?;
    let name = stream.name.clone();
    let partitions = stream.partitions.len();

    match check_response(
        handler
            .broker
            .propose(MetadataOp::CreateStream { stream })
            .await?,
    )? {
        MetadataResponse::StreamCreated { .. } => {
            info!(stream = %name, partitions, "Created stream");
            Ok(())
        }
        MetadataResponse::StreamExists { .. } => {
            debug!(stream = %name, "Stream already exists");
            Err(Status::already_exists(format!("stream already exists: {}", name)))
        }
        other => Err(unexpected(other)),
    }
}

/// Apply defaults and assign replicas round-robin over `members`.
///
/// Partition `p` takes `replication_factor` consecutive members starting at
/// `p`; its first replica leads.
fn build_descriptor(request: CreateStreamRequest, members: &[NodeId]) -> Result<StreamDescriptor> {
    let replication_factor = if request.replication_factor == 0 {
        DEFAULT_REPLICATION_FACTOR
    } else {
        request.replication_factor
    };
    let partitions = if request.partitions == 0 {
        DEFAULT_PARTITIONS
    } else {
        request.partitions
    };
    if replication_factor as usize > members.len() {
        return Err(Status::invalid_argument(format!(
            "replication factor {} exceeds cluster size {}",
            replication_factor,
            members.len()
        )));
    }

    let group = request
        .group
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| request.name.clone());
    let partitions: BTreeMap<PartitionId, PartitionDescriptor> = (0..partitions)
        .map(|id| {
            let replicas: Vec<NodeId> = (0..replication_factor as usize)
                .map(|i| members[(id as usize + i) % members.len()])
                .collect();
            let desc = PartitionDescriptor {
                id,
                stream: request.name.clone(),
                subject: partition_subject(&request.subject, id),
                group: group.clone(),
                replication_factor,
                leader: replicas[0],
                isr: replicas.clone(),
                replicas,
                leader_epoch: 0,
                paused: false,
                readonly: false,
            };
            (id, desc)
        })
        .collect();

    Ok(StreamDescriptor {
        name: request.name,
        subject: request.subject,
        group,
        config: request.config,
        partitions,
    })
}

/// Handle a delete stream request.
pub(super) async fn handle_delete_stream(handler: &ApiHandler, name: &str) -> Result<()> {
    validate_name(name)?;
    let response = handler
        .broker
        .propose(MetadataOp::DeleteStream {
            name: name.to_string(),
        })
        .await?;
    match check_response(response)? {
        MetadataResponse::StreamDeleted { .. } => {
            info!(stream = %name, "Deleted stream");
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

/// Handle a pause request.
pub(super) async fn handle_pause_stream(
    handler: &ApiHandler,
    request: PauseStreamRequest,
) -> Result<()> {
    validate_name(&request.name)?;
    let response = handler
        .broker
        .propose(MetadataOp::PausePartitions {
            stream: request.name.clone(),
            partitions: request.partitions,
            resume_all: request.resume_all,
        })
        .await?;
    check_response(response)?;
    info!(stream = %request.name, resume_all = request.resume_all, "Paused partitions");
    Ok(())
}

/// Handle a set-readonly request.
pub(super) async fn handle_set_stream_readonly(
    handler: &ApiHandler,
    request: SetStreamReadonlyRequest,
) -> Result<()> {
    validate_name(&request.name)?;
    let response = handler
        .broker
        .propose(MetadataOp::SetReadonly {
            stream: request.name.clone(),
            partitions: request.partitions,
            readonly: request.readonly,
        })
        .await?;
    check_response(response)?;
    info!(stream = %request.name, readonly = request.readonly, "Changed readonly flag");
    Ok(())
}

/// Handle a resume request.
pub(super) async fn handle_resume_stream(
    handler: &ApiHandler,
    request: ResumeStreamRequest,
) -> Result<()> {
    validate_name(&request.name)?;
    let response = handler
        .broker
        .propose(MetadataOp::ResumePartitions {
            stream: request.name.clone(),
            partitions: request.partitions,
        })
        .await?;
    if let MetadataResponse::PartitionsUpdated { partitions, .. } = check_response(response)? {
        info!(
            stream = %request.name,
            resumed = ?partitions.iter().map(|p| p.id).collect::<Vec<_>>(),
            "Resumed partitions"
        );
    }
    Ok(())
}

/// Handle a leader change request.
pub(super) async fn handle_change_leader(
    handler: &ApiHandler,
    stream: &str,
    partition: PartitionId,
    leader: NodeId,
) -> Result<()> {
    validate_name(stream)?;
    let response = handler
        .broker
        .propose(MetadataOp::ChangeLeader {
            stream: stream.to_string(),
            partition,
            leader,
        })
        .await?;
    match check_response(response)? {
        MetadataResponse::LeaderChanged { epoch, .. } => {
            info!(stream, partition, leader, epoch, "Changed partition leader");
            Ok(())
        }
        other => Err(unexpected(other)),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Status::invalid_argument("stream name must not be empty"));
    }
    if name.contains(char::is_whitespace) {
        return Err(Status::invalid_argument(format!(
            "stream name must not contain whitespace: {:?}",
            name
        )));
    }
    Ok(())
}

fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(Status::invalid_argument("stream subject must not be empty"));
    }
    if subject.contains(char::is_whitespace) {
        return Err(Status::invalid_argument(format!(
            "stream subject must not contain whitespace: {:?}",
            subject
        )));
    }
    Ok(())
}

fn unexpected(response: MetadataResponse) -> Status {
    Status::internal(format!("unexpected metadata response: {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    #[test]
    fn test_defaults_applied() {
        let stream = build_descriptor(CreateStreamRequest::new("orders", "orders"), &[1]).unwrap();
        assert_eq!(stream.group, "orders");
        assert_eq!(stream.partitions.len(), 1);
        let p = &stream.partitions[&0];
        assert_eq!(p.replication_factor, 1);
        assert_eq!(p.replicas, vec![1]);
        assert_eq!(p.leader, 1);
        assert_eq!(p.subject, "orders");
    }

    #[test]
    fn test_round_robin_assignment() {
        let request = CreateStreamRequest::new("orders.in", "orders")
            .with_partitions(3)
            .with_replication_factor(2);
        let stream = build_descriptor(request, &[1, 2, 3]).unwrap();

        assert_eq!(stream.partitions[&0].replicas, vec![1, 2]);
        assert_eq!(stream.partitions[&1].replicas, vec![2, 3]);
        assert_eq!(stream.partitions[&2].replicas, vec![3, 1]);
        assert_eq!(stream.partitions[&2].leader, 3);
        assert_eq!(stream.partitions[&2].isr, vec![3, 1]);
        assert_eq!(stream.partitions[&1].subject, "orders.in.1");
    }

    #[test]
    fn test_replication_factor_above_cluster_size() {
        let request = CreateStreamRequest::new("orders", "orders").with_replication_factor(3);
        let err = build_descriptor(request, &[1, 2]).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("orders").is_ok());
        assert_eq!(validate_name("").unwrap_err().code, Code::InvalidArgument);
        assert_eq!(validate_name("a b").unwrap_err().code, Code::InvalidArgument);
        assert_eq!(validate_subject("").unwrap_err().code, Code::InvalidArgument);
    }
}
