//! Core DAG-orchestrator logic: the Attempt state machine, the durable
//! queue, DAG definitions and precondition evaluation, the step executor
//! ("agent"), the scheduler that ties them together, and the gRPC
//! coordinator/worker pair that lets scheduling fan out across machines.
//!
//! `dagctl-cli` is the only thing that wires these into a running process;
//! everything in this crate is a library with no `main`.

pub mod agent;
pub mod attempt;
pub mod coordinator;
pub mod dag;
pub mod queue;
pub mod scheduler;
pub mod worker;
