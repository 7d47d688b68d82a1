//! Stream topology domain.
//!
//! Pure, deterministic state: which streams exist, how their partitions are
//! replicated, who leads each partition and which replicas are in sync. Every
//! node applies the same operations in the same order and ends with the same
//! topology.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::super::commands::{MetadataOp, MetadataResponse};
use super::super::state_machine::TopologyEvent;
use crate::cluster::error::FatalError;
use crate::types::{NodeId, PartitionId, PartitionMetadata, StreamConfig};

/// Replicated description of one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    pub stream: String,
    /// Ingestion subject (`base` or `base.N`).
    pub subject: String,
    /// Queue group of the ingestion subscription.
    pub group: String,
    pub replication_factor: i32,
    pub replicas: Vec<NodeId>,
    pub leader: NodeId,
    pub isr: Vec<NodeId>,
    /// Bumped on every leader change.
    pub leader_epoch: u64,
    pub paused: bool,
    pub readonly: bool,
}

impl PartitionDescriptor {
    pub fn is_replica(&self, node: NodeId) -> bool {
        self.replicas.contains(&node)
    }

    pub fn in_isr(&self, node: NodeId) -> bool {
        self.isr.contains(&node)
    }

    pub fn to_metadata(&self) -> PartitionMetadata {
        PartitionMetadata {
            id: self.id,
            subject: self.subject.clone(),
            leader: self.leader,
            replicas: self.replicas.clone(),
            isr: self.isr.clone(),
            paused: self.paused,
            readonly: self.readonly,
        }
    }

    fn validate(&self, stream: &StreamDescriptor, key: PartitionId) -> Result<(), String> {
        if self.id != key {
            return Err(format!("partition keyed {} has id {}", key, self.id));
        }
        if self.stream != stream.name {
            return Err(format!(
                "partition {} belongs to {:?}, not {:?}",
                self.id, self.stream, stream.name
            ));
        }
        if self.replicas.is_empty() {
            return Err(format!("partition {} has no replicas", self.id));
        }
        let mut sorted = self.replicas.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.replicas.len() {
            return Err(format!("partition {} lists a replica twice", self.id));
        }
        if self.replication_factor as usize != self.replicas.len() {
            return Err(format!(
                "partition {} has replication factor {} but {} replicas",
                self.id,
                self.replication_factor,
                self.replicas.len()
            ));
        }
        if !self.is_replica(self.leader) {
            return Err(format!(
                "partition {} leader {} is not a replica",
                self.id, self.leader
            ));
        }
        if self.isr.iter().any(|r| !self.is_replica(*r)) {
            return Err(format!("partition {} ISR is not a subset of replicas", self.id));
        }
        Ok(())
    }
}

/// Replicated description of one stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub subject: String,
    pub group: String,
    pub config: StreamConfig,
    pub partitions: BTreeMap<PartitionId, PartitionDescriptor>,
}

impl StreamDescriptor {
    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("stream name is empty".to_string());
        }
        if self.subject.is_empty() {
            return Err(format!("stream {:?} has an empty subject", self.name));
        }
        if self.partitions.is_empty() {
            return Err(format!("stream {:?} has no partitions", self.name));
        }
        for (key, partition) in &self.partitions {
            partition.validate(self, *key)?;
        }
        Ok(())
    }

    /// Partitions selected by an operation: all when `ids` is empty.
    fn select(&self, ids: &[PartitionId]) -> Result<Vec<PartitionId>, PartitionId> {
        if ids.is_empty() {
            return Ok(self.partitions.keys().copied().collect());
        }
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.partitions.contains_key(id) {
                return Err(*id);
            }
            if !selected.contains(id) {
                selected.push(*id);
            }
        }
        selected.sort_unstable();
        Ok(selected)
    }
}

type Applied = (MetadataResponse, Vec<TopologyEvent>);

/// State of the stream domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDomainState {
    pub streams: BTreeMap<String, StreamDescriptor>,
}

impl StreamDomainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self, name: &str) -> Option<&StreamDescriptor> {
        self.streams.get(name)
    }

    pub fn partition(&self, stream: &str, id: PartitionId) -> Option<&PartitionDescriptor> {
        self.streams.get(stream)?.partitions.get(&id)
    }

    /// Apply an operation.
    ///
    /// Returns the response plus the topology events the local node must act
    /// on. Fails only for operations that cannot be applied at all; the caller
    /// treats that as fatal.
    pub fn apply(&mut self, op: MetadataOp) -> Result<Applied, FatalError> {
        match op {
            MetadataOp::Noop => Ok((MetadataResponse::Ok, Vec::new())),

            MetadataOp::CreateStream { stream } => {
                stream.validate().map_err(|reason| {
                    FatalError(format!("malformed create-stream operation: {}", reason))
                })?;
                if self.streams.contains_key(&stream.name) {
                    return Ok((
                        MetadataResponse::StreamExists { name: stream.name },
                        Vec::new(),
                    ));
                }
                let name = stream.name.clone();
                self.streams.insert(name.clone(), stream.clone());
                Ok((
                    MetadataResponse::StreamCreated { name },
                    vec![TopologyEvent::StreamCreated(stream)],
                ))
            }

            MetadataOp::DeleteStream { name } => match self.streams.remove(&name) {
                Some(stream) => Ok((
                    MetadataResponse::StreamDeleted { name },
                    vec![TopologyEvent::StreamDeleted(stream)],
                )),
                None => Ok((not_found(name, None), Vec::new())),
            },

            MetadataOp::PausePartitions {
                stream,
                partitions,
                resume_all,
            } => self.update_flags(&stream, &partitions, Some(resume_all), |p| {
                p.paused = true;
            }),

            MetadataOp::SetReadonly {
                stream,
                partitions,
                readonly,
            } => self.update_flags(&stream, &partitions, None, |p| {
                p.readonly = readonly;
            }),

            MetadataOp::ResumePartitions { stream, partitions } => {
                let ids = if partitions.is_empty() {
                    match self.streams.get(&stream) {
                        Some(s) => s
                            .partitions
                            .values()
                            .filter(|p| p.paused)
                            .map(|p| p.id)
                            .collect(),
                        None => return Ok((not_found(stream, None), Vec::new())),
                    }
                } else {
                    partitions
                };
                if ids.is_empty() {
                    return Ok((
                        MetadataResponse::PartitionsUpdated {
                            stream,
                            partitions: Vec::new(),
                        },
                        Vec::new(),
                    ));
                }
                self.update_flags(&stream, &ids, None, |p| {
                    p.paused = false;
                })
            }

            MetadataOp::ChangeLeader {
                stream,
                partition,
                leader,
            } => {
                let Some(p) = self.partition_mut(&stream, partition) else {
                    return Ok((not_found(stream, Some(partition)), Vec::new()));
                };
                if !p.is_replica(leader) {
                    return Ok((
                        rejected(format!("{} is not a replica of {}/{}", leader, stream, partition)),
                        Vec::new(),
                    ));
                }
                if !p.in_isr(leader) {
                    return Ok((
                        rejected(format!("{} is not in the ISR of {}/{}", leader, stream, partition)),
                        Vec::new(),
                    ));
                }
                p.leader = leader;
                p.leader_epoch += 1;
                let epoch = p.leader_epoch;
                let changed = p.clone();
                Ok((
                    MetadataResponse::LeaderChanged {
                        stream: stream.clone(),
                        partition,
                        leader,
                        epoch,
                    },
                    vec![TopologyEvent::PartitionsChanged {
                        stream,
                        partitions: vec![changed],
                        resume_all: None,
                    }],
                ))
            }

            MetadataOp::ShrinkIsr {
                stream,
                partition,
                replica,
                leader_epoch,
            } => self.update_isr(&stream, partition, leader_epoch, |p| {
                if replica == p.leader {
                    return Err(format!("cannot remove leader {} from the ISR", replica));
                }
                if !p.in_isr(replica) {
                    return Err(format!("{} is not in the ISR", replica));
                }
                p.isr.retain(|r| *r != replica);
                Ok(())
            }),

            MetadataOp::ExpandIsr {
                stream,
                partition,
                replica,
                leader_epoch,
            } => self.update_isr(&stream, partition, leader_epoch, |p| {
                if !p.is_replica(replica) {
                    return Err(format!("{} is not a replica", replica));
                }
                if p.in_isr(replica) {
                    return Err(format!("{} is already in the ISR", replica));
                }
                p.isr.push(replica);
                // Keep ISR in replica order so every node stores the same list.
                let order = p.replicas.clone();
                p.isr
                    .sort_by_key(|r| order.iter().position(|x| x == r).unwrap_or(usize::MAX));
                Ok(())
            }),
        }
    }

    fn partition_mut(
        &mut self,
        stream: &str,
        partition: PartitionId,
    ) -> Option<&mut PartitionDescriptor> {
        self.streams.get_mut(stream)?.partitions.get_mut(&partition)
    }

    fn update_flags<F>(
        &mut self,
        stream: &str,
        ids: &[PartitionId],
        resume_all: Option<bool>,
        mut change: F,
    ) -> Result<Applied, FatalError>
    where
        F: FnMut(&mut PartitionDescriptor),
    {
        let Some(s) = self.streams.get_mut(stream) else {
            return Ok((not_found(stream.to_string(), None), Vec::new()));
        };
        let selected = match s.select(ids) {
            Ok(selected) => selected,
            Err(missing) => return Ok((not_found(stream.to_string(), Some(missing)), Vec::new())),
        };

        let mut changed = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(p) = s.partitions.get_mut(&id) {
                change(p);
                changed.push(p.clone());
            }
        }
        Ok((
            MetadataResponse::PartitionsUpdated {
                stream: stream.to_string(),
                partitions: changed.clone(),
            },
            vec![TopologyEvent::PartitionsChanged {
                stream: stream.to_string(),
                partitions: changed,
                resume_all,
            }],
        ))
    }

    fn update_isr<F>(
        &mut self,
        stream: &str,
        partition: PartitionId,
        leader_epoch: u64,
        change: F,
    ) -> Result<Applied, FatalError>
    where
        F: FnOnce(&mut PartitionDescriptor) -> Result<(), String>,
    {
        let Some(p) = self.partition_mut(stream, partition) else {
            return Ok((not_found(stream.to_string(), Some(partition)), Vec::new()));
        };
        if p.leader_epoch != leader_epoch {
            return Ok((
                rejected(format!(
                    "stale leader epoch {} for {}/{} (current {})",
                    leader_epoch, stream, partition, p.leader_epoch
                )),
                Vec::new(),
            ));
        }
        if let Err(reason) = change(p) {
            return Ok((rejected(reason), Vec::new()));
        }
        let changed = p.clone();
        Ok((
            MetadataResponse::IsrUpdated {
                stream: stream.to_string(),
                partition,
                isr: changed.isr.clone(),
            },
            vec![TopologyEvent::PartitionsChanged {
                stream: stream.to_string(),
                partitions: vec![changed],
                resume_all: None,
            }],
        ))
    }
}

fn not_found(stream: String, partition: Option<PartitionId>) -> MetadataResponse {
    MetadataResponse::NotFound { stream, partition }
}

fn rejected(reason: String) -> MetadataResponse {
    MetadataResponse::Rejected { reason }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn descriptor(name: &str, partitions: i32, replicas: &[NodeId]) -> StreamDescriptor {
        let partitions = (0..partitions)
            .map(|id| {
                (
                    id,
                    PartitionDescriptor {
                        id,
                        stream: name.to_string(),
                        subject: crate::protocol::partition_subject(name, id),
                        group: name.to_string(),
                        replication_factor: replicas.len() as i32,
                        replicas: replicas.to_vec(),
                        leader: replicas[0],
                        isr: replicas.to_vec(),
                        leader_epoch: 0,
                        paused: false,
                        readonly: false,
                    },
                )
            })
            .collect();
        StreamDescriptor {
            name: name.to_string(),
            subject: name.to_string(),
            group: name.to_string(),
            config: StreamConfig::default(),
            partitions,
        }
    }

    fn create(state: &mut StreamDomainState, stream: StreamDescriptor) -> MetadataResponse {
        state
            .apply(MetadataOp::CreateStream { stream })
            .unwrap()
            .0
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut state = StreamDomainState::new();
        let d = descriptor("orders", 3, &[1, 2]);
        assert_eq!(
            create(&mut state, d.clone()),
            MetadataResponse::StreamCreated {
                name: "orders".to_string()
            }
        );
        let (resp, events) = state
            .apply(MetadataOp::CreateStream { stream: d.clone() })
            .unwrap();
        assert_eq!(
            resp,
            MetadataResponse::StreamExists {
                name: "orders".to_string()
            }
        );
        assert!(events.is_empty());
        assert_eq!(state.streams.len(), 1);
        assert_eq!(state.stream("orders"), Some(&d));
    }

    #[test]
    fn test_malformed_create_is_fatal() {
        let mut state = StreamDomainState::new();
        let mut d = descriptor("orders", 1, &[1, 2]);
        if let Some(p) = d.partitions.get_mut(&0) {
            p.leader = 9;
        }
        assert!(state.apply(MetadataOp::CreateStream { stream: d }).is_err());
        assert!(state.streams.is_empty());
    }

    #[test]
    fn test_pause_all_when_empty() {
        let mut state = StreamDomainState::new();
        create(&mut state, descriptor("orders", 3, &[1]));
        let (_, events) = state
            .apply(MetadataOp::PausePartitions {
                stream: "orders".to_string(),
                partitions: vec![],
                resume_all: true,
            })
            .unwrap();
        assert!(state.streams["orders"].partitions.values().all(|p| p.paused));
        match &events[0] {
            TopologyEvent::PartitionsChanged {
                partitions,
                resume_all,
                ..
            } => {
                assert_eq!(partitions.len(), 3);
                assert_eq!(*resume_all, Some(true));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_resume_only_paused_partitions() {
        let mut state = StreamDomainState::new();
        create(&mut state, descriptor("orders", 3, &[1]));
        state
            .apply(MetadataOp::PausePartitions {
                stream: "orders".to_string(),
                partitions: vec![0, 2],
                resume_all: false,
            })
            .unwrap();
        let (resp, _) = state
            .apply(MetadataOp::ResumePartitions {
                stream: "orders".to_string(),
                partitions: vec![],
            })
            .unwrap();
        match resp {
            MetadataResponse::PartitionsUpdated { partitions, .. } => {
                let ids: Vec<_> = partitions.iter().map(|p| p.id).collect();
                assert_eq!(ids, vec![0, 2]);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(state.streams["orders"].partitions.values().all(|p| !p.paused));
    }

    #[test]
    fn test_unknown_partition_not_found() {
        let mut state = StreamDomainState::new();
        create(&mut state, descriptor("orders", 1, &[1]));
        let (resp, events) = state
            .apply(MetadataOp::SetReadonly {
                stream: "orders".to_string(),
                partitions: vec![4],
                readonly: true,
            })
            .unwrap();
        assert_eq!(
            resp,
            MetadataResponse::NotFound {
                stream: "orders".to_string(),
                partition: Some(4)
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_change_leader_bumps_epoch() {
        let mut state = StreamDomainState::new();
        create(&mut state, descriptor("orders", 1, &[1, 2]));
        let (resp, _) = state
            .apply(MetadataOp::ChangeLeader {
                stream: "orders".to_string(),
                partition: 0,
                leader: 2,
            })
            .unwrap();
        assert!(matches!(
            resp,
            MetadataResponse::LeaderChanged {
                leader: 2,
                epoch: 1,
                ..
            }
        ));

        let (resp, _) = state
            .apply(MetadataOp::ChangeLeader {
                stream: "orders".to_string(),
                partition: 0,
                leader: 7,
            })
            .unwrap();
        assert!(matches!(resp, MetadataResponse::Rejected { .. }));
    }

    #[test]
    fn test_isr_changes_respect_epoch_and_subset() {
        let mut state = StreamDomainState::new();
        create(&mut state, descriptor("orders", 1, &[1, 2, 3]));

        let (resp, _) = state
            .apply(MetadataOp::ShrinkIsr {
                stream: "orders".to_string(),
                partition: 0,
                replica: 2,
                leader_epoch: 5,
            })
            .unwrap();
        assert!(matches!(resp, MetadataResponse::Rejected { .. }));

        state
            .apply(MetadataOp::ShrinkIsr {
                stream: "orders".to_string(),
                partition: 0,
                replica: 2,
                leader_epoch: 0,
            })
            .unwrap();
        assert_eq!(state.partition("orders", 0).unwrap().isr, vec![1, 3]);

        let (resp, _) = state
            .apply(MetadataOp::ShrinkIsr {
                stream: "orders".to_string(),
                partition: 0,
                replica: 1,
                leader_epoch: 0,
            })
            .unwrap();
        assert!(matches!(resp, MetadataResponse::Rejected { .. }));

        state
            .apply(MetadataOp::ExpandIsr {
                stream: "orders".to_string(),
                partition: 0,
                replica: 2,
                leader_epoch: 0,
            })
            .unwrap();
        assert_eq!(state.partition("orders", 0).unwrap().isr, vec![1, 2, 3]);

        let (resp, _) = state
            .apply(MetadataOp::ExpandIsr {
                stream: "orders".to_string(),
                partition: 0,
                replica: 9,
                leader_epoch: 0,
            })
            .unwrap();
        assert!(matches!(resp, MetadataResponse::Rejected { .. }));
    }

    #[test]
    fn test_delete_stream() {
        let mut state = StreamDomainState::new();
        create(&mut state, descriptor("orders", 1, &[1]));
        let (resp, events) = state
            .apply(MetadataOp::DeleteStream {
                name: "orders".to_string(),
            })
            .unwrap();
        assert!(matches!(resp, MetadataResponse::StreamDeleted { .. }));
        assert!(matches!(events[0], TopologyEvent::StreamDeleted(_)));
        let (resp, _) = state
            .apply(MetadataOp::DeleteStream {
                name: "orders".to_string(),
            })
            .unwrap();
        assert!(matches!(resp, MetadataResponse::NotFound { .. }));
    }
}
