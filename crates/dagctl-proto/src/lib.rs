//! Generated gRPC types and service traits for the Coordinator protocol.
//!
//! The actual message/service code is produced by `tonic-build` from
//! `proto/coordinator.proto` at build time; this crate just re-exports it
//! under a stable path so `dagctl-core` and `dagctl-cli` don't reach into
//! `OUT_DIR` directly.

pub mod coordinator {
    tonic::include_proto!("dagctl.coordinator.v1");
}

pub use coordinator::{
    CancelAck, CancelDirective, CancelRequest, Heartbeat, LogChunk, NodeUpdate, PollRequest,
    PollResponse, ReportAck, ReportRequest, RunRef, ServerMsg, StreamLogsRequest, Task, WorkerMsg,
    coordinator_client::CoordinatorClient,
    coordinator_server::{Coordinator, CoordinatorServer},
};
