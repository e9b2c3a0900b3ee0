pub mod artifacts;
pub mod cli;
pub mod cvd;
pub mod operation;
pub mod orchestrator;
pub mod rpc_server;
pub mod types;
