//! The point-to-point RPC boundary between nodes.
//!
//! Implementations may drop, delay, duplicate, or reorder messages; the
//! consensus core treats every error or timeout as a soft failure and
//! retries on its next periodic cycle. The simulation harness provides an
//! in-process implementation with controllable faults; a production
//! transport would frame these RPCs over the wire.

use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;
use crate::Result;

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
