//! Domain-specific state machine components.
//!
//! Each domain provides a state struct holding its data and an `apply`
//! function for deterministic state transitions. The metadata state machine
//! composes them.
//!
//! - **Stream**: streams, partitions, replica sets, leaders, ISR and flags

pub mod stream;

pub use stream::{PartitionDescriptor, StreamDescriptor, StreamDomainState};
