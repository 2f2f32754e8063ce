//! gRPC service implementation for the shard loader.

use std::sync::Arc;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Code, Request, Response, Status};

use crate::proto::shard_loader_server::ShardLoader;
use crate::proto::{
    self, open_session_request, session_info, BoundedEpochs, CloseSessionRequest,
    CloseSessionResponse, ContinuousEpochs, DescribeSessionRequest, ListDatasetsRequest,
    ListDatasetsResponse, NextBatchRequest, OpenSessionRequest, OpenSessionResponse,
    RescanRequest, SampleLocator, SnapshotInfo,
};
use crate::state::ServerState;

use loader_core::{EpochPolicy, LoaderError, OpenRequest, ResumePosition, Snapshot};

/// Maps a loader error to a status code, attaching the session position
/// as metadata when the error carries one.
pub fn status_from_error(err: LoaderError) -> Status {
    let code = match &err {
        LoaderError::Config { .. } | LoaderError::InvalidArgument { .. } => Code::InvalidArgument,
        LoaderError::DatasetNotFound { .. }
        | LoaderError::SnapshotNotFound { .. }
        | LoaderError::SessionNotFound { .. }
        | LoaderError::SessionExpired { .. }
        | LoaderError::SessionClosed { .. } => Code::NotFound,
        LoaderError::SessionBusy { .. } | LoaderError::EmptySnapshot { .. } => {
            Code::FailedPrecondition
        }
        LoaderError::TooManySessions { .. } => Code::ResourceExhausted,
        LoaderError::ReadTimeout { .. } => Code::DeadlineExceeded,
        LoaderError::CorruptIndex { .. } | LoaderError::Io { .. } | LoaderError::SampleRead { .. } => {
            Code::Internal
        }
    };

    let mut status = Status::new(code, err.to_string());
    if let Some(context) = err.context() {
        let metadata = status.metadata_mut();
        if let Ok(value) = context.session_id.parse::<MetadataValue<Ascii>>() {
            metadata.insert("x-session-id", value);
        }
        if let Ok(value) = context.epoch_index.to_string().parse::<MetadataValue<Ascii>>() {
            metadata.insert("x-epoch-index", value);
        }
        if let Ok(value) = context.cursor.to_string().parse::<MetadataValue<Ascii>>() {
            metadata.insert("x-cursor", value);
        }
    }
    if let Some(sample) = err.sample() {
        if let Ok(value) = sample.to_string().parse::<MetadataValue<Ascii>>() {
            status.metadata_mut().insert("x-sample", value);
        }
    }
    status
}

fn require(field: &str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(Status::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

fn snapshot_info(snapshot: &Snapshot, live_snapshots: usize) -> SnapshotInfo {
    SnapshotInfo {
        dataset_id: snapshot.dataset_id().to_string(),
        snapshot_id: snapshot.id().to_string(),
        shard_count: snapshot.shards().len() as u32,
        total_samples: snapshot.total_samples(),
        created_at_ms: snapshot.created_at().timestamp_millis(),
        live_snapshots: live_snapshots as u32,
    }
}

pub struct ShardLoaderService {
    state: Arc<ServerState>,
}

impl ShardLoaderService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl ShardLoader for ShardLoaderService {
    async fn open_session(
        &self,
        request: Request<OpenSessionRequest>,
    ) -> Result<Response<OpenSessionResponse>, Status> {
        let req = request.into_inner();
        require("dataset_id", &req.dataset_id)?;

        let epoch_policy = match req.epoch_policy {
            Some(open_session_request::EpochPolicy::Bounded(b)) => EpochPolicy::Bounded(b.epochs),
            Some(open_session_request::EpochPolicy::Continuous(_)) => EpochPolicy::Continuous,
            None => return Err(Status::invalid_argument("epoch_policy is required")),
        };

        let snapshot = self
            .state
            .catalog
            .resolve(&req.dataset_id, Some(&req.snapshot_id))
            .map_err(status_from_error)?;

        let slot = self
            .state
            .sessions
            .open(
                snapshot,
                OpenRequest {
                    seed: req.seed,
                    batch_size: req.batch_size,
                    epoch_policy,
                    buffer_capacity: req.buffer_capacity,
                    resume: req.resume.map(|r| ResumePosition {
                        epoch_index: r.epoch_index,
                        cursor: r.cursor,
                    }),
                },
            )
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(OpenSessionResponse {
            session_id: slot.id().to_string(),
            snapshot_id: slot.snapshot().id().to_string(),
            total_samples: slot.snapshot().total_samples(),
            buffer_capacity: slot.options().buffer_capacity,
        }))
    }

    async fn next_batch(
        &self,
        request: Request<NextBatchRequest>,
    ) -> Result<Response<proto::Batch>, Status> {
        let req = request.into_inner();
        require("session_id", &req.session_id)?;

        let batch = self
            .state
            .sessions
            .next_batch(&req.session_id, &self.state.assembler)
            .await
            .map_err(status_from_error)?;

        let locators = if req.include_locators {
            batch
                .refs
                .iter()
                .map(|r| SampleLocator {
                    shard: r.shard,
                    offset: r.offset,
                    length: r.length,
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Response::new(proto::Batch {
            samples: batch.samples,
            epoch_index: batch.epoch_index,
            is_epoch_end: batch.is_epoch_end,
            cursor: batch.cursor,
            epoch_boundary: batch.epoch_boundary,
            locators,
        }))
    }

    async fn close_session(
        &self,
        request: Request<CloseSessionRequest>,
    ) -> Result<Response<CloseSessionResponse>, Status> {
        let req = request.into_inner();
        require("session_id", &req.session_id)?;

        let closed = self.state.sessions.close(&req.session_id).await;
        Ok(Response::new(CloseSessionResponse { closed }))
    }

    async fn describe_session(
        &self,
        request: Request<DescribeSessionRequest>,
    ) -> Result<Response<proto::SessionInfo>, Status> {
        let req = request.into_inner();
        require("session_id", &req.session_id)?;

        let info = self
            .state
            .sessions
            .describe(&req.session_id)
            .await
            .map_err(status_from_error)?;

        let epoch_policy = match info.epoch_policy {
            EpochPolicy::Bounded(epochs) => session_info::EpochPolicy::Bounded(BoundedEpochs { epochs }),
            EpochPolicy::Continuous => session_info::EpochPolicy::Continuous(ContinuousEpochs {}),
        };

        Ok(Response::new(proto::SessionInfo {
            session_id: info.session_id,
            dataset_id: info.dataset_id,
            snapshot_id: info.snapshot_id,
            total_samples: info.total_samples,
            seed: info.seed,
            batch_size: info.batch_size,
            epoch_policy: Some(epoch_policy),
            buffer_capacity: info.buffer_capacity,
            epoch_index: info.epoch_index,
            cursor: info.cursor,
            phase: info.phase.as_str().to_string(),
            batches_served: info.batches_served,
            samples_served: info.samples_served,
            created_at_ms: info.created_at.timestamp_millis(),
            idle_ms: info.idle_for.as_millis() as u64,
        }))
    }

    async fn rescan(
        &self,
        request: Request<RescanRequest>,
    ) -> Result<Response<SnapshotInfo>, Status> {
        let req = request.into_inner();
        require("dataset_id", &req.dataset_id)?;

        let snapshot = self
            .state
            .rescan(&req.dataset_id)
            .await
            .map_err(status_from_error)?;
        let live = self
            .state
            .catalog
            .live_snapshots(&req.dataset_id)
            .map_err(status_from_error)?;

        Ok(Response::new(snapshot_info(&snapshot, live)))
    }

    async fn list_datasets(
        &self,
        _request: Request<ListDatasetsRequest>,
    ) -> Result<Response<ListDatasetsResponse>, Status> {
        let catalog = &self.state.catalog;
        let mut datasets = Vec::new();

        for dataset_id in catalog.dataset_ids() {
            // Datasets are scanned at startup, so a missing snapshot only
            // happens while the first scan is still running
            let Ok(snapshot) = catalog.current(&dataset_id) else {
                continue;
            };
            let live = catalog.live_snapshots(&dataset_id).map_err(status_from_error)?;
            datasets.push(snapshot_info(&snapshot, live));
        }

        Ok(Response::new(ListDatasetsResponse { datasets }))
    }
}
