//! Client-side write engines: the RPC stub traits towards masters and data
//! nodes, and the journal write coordinator.

pub mod journal_writer;
pub mod node_client;

pub use journal_writer::JournalWriter;
pub use node_client::{
    CreatedChunk, DataNodeChannelFactory, DataNodeClient, MasterClient, NodeDescriptor,
};
