//! holdnode - a data node for a distributed, content-addressed blob and
//! journal store.
//!
//! The crates underneath split the work the way the processes do:
//!
//! * `hold-api-types` - ids, chunk meta, error codes, configuration.
//! * `hold-tools` - caches, promises, I/O worker queues, leases.
//! * `hold-datastore` - locations, chunks, sessions, block store, caches.
//! * `hold-client` - the journal write coordinator and RPC stub traits.
//!
//! This crate wires those into a node ([`node::DataNode`]) and exposes the
//! verb surface ([`service::DataNodeService`]) that an RPC transport
//! dispatches into. Transport, authentication and cluster orchestration are
//! deliberately not here.

pub mod node;
pub mod service;

pub use node::DataNode;
pub use service::DataNodeService;
