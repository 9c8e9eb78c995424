// Consensus state, protocol handling and the background loops driving them
pub mod apply;
pub mod commit;
pub mod compact;
pub mod election;
pub mod handlers;
pub mod log;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod signal;
pub mod state;
pub mod state_machine;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
