//! gRPC entry point of the control plane.
//!
//! [`AllocdService`] implements the generated [`Allocd`] trait. Every RPC
//! resolves the acting user from request metadata, runs the authorization
//! chain, and then either hands off to an allocation's coordination task or
//! starts a batch stream.
//!
//! ## Responsibilities
//!
//! - Validate requests before any backend is touched.
//! - Wire log streams: fetcher, periodic re-authorization, termination
//!   detection and the forwarding coordinator.
//! - Relay readiness, proxy and rendezvous calls to [`AllocationRegistry`].
//! - Cancel open streams and stop coordination tasks on shutdown.

use super::convert::{log_order_from_proto, task_log_fields_to_proto, task_log_to_proto};
use crate::server::{
    allocation::AllocationRegistry,
    authz::{AuthRecheck, AuthzGateway, AuthzProvider, ExperimentAction},
    backend::{TaskKindSource, TaskLogBackend, TaskStore},
    config::ServerConfig,
    streaming::{
        batch::BatchRequest,
        coordinator::stream_batches,
        fetcher::{
            AuthorizedFetch, TaskLogFieldsFetch, TaskLogsFetch, TaskTerminalCheck, resolve_request,
        },
        filter::build_task_log_filters,
        processor::BatchStreamProcessor,
    },
    telemetry::increment_requests,
};
use allocd_core::{
    Error,
    proto::{
        AllocationAllGatherRequest, AllocationAllGatherResponse, AllocationReadyRequest,
        AllocationReadyResponse, AllocationWaitingRequest, AllocationWaitingResponse,
        GetActiveTasksCountRequest, GetActiveTasksCountResponse,
        PostAllocationProxyAddressRequest, PostAllocationProxyAddressResponse,
        TaskLogsFieldsRequest, TaskLogsFieldsResponse, TaskLogsRequest, TaskLogsResponse,
        allocd_server::Allocd,
    },
    types::{AllocationId, TaskId, TaskKind, TaskState, User, UserId},
};
use core::pin::Pin;
use std::sync::Arc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// Metadata key carrying the numeric id of the acting user.
pub const USER_METADATA_KEY: &str = "x-allocd-user";

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// External systems the service consults.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn TaskStore>,
    pub logs: Arc<dyn TaskLogBackend>,
    pub task_kinds: Arc<dyn TaskKindSource>,
    pub authz: Arc<dyn AuthzProvider>,
}

#[derive(Clone)]
pub struct AllocdService {
    config: ServerConfig,
    registry: AllocationRegistry,
    gateway: AuthzGateway,
    store: Arc<dyn TaskStore>,
    logs: Arc<dyn TaskLogBackend>,
    task_kinds: Arc<dyn TaskKindSource>,
    shutdown_token: CancellationToken,
}

impl AllocdService {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let registry =
            AllocationRegistry::new(config.allocation_queue_size, config.shutdown_timeout);
        let gateway = AuthzGateway::new(
            collaborators.authz,
            Arc::clone(&collaborators.store),
            registry.clone(),
        );

        Self {
            config,
            registry,
            gateway,
            store: collaborators.store,
            logs: collaborators.logs,
            task_kinds: collaborators.task_kinds,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Allocations are registered here by the component that schedules them.
    pub const fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    /// Cancels every open stream, then stops every allocation coordination
    /// task, failing their pending rounds.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.registry.shutdown().await;
    }

    async fn authenticate<T>(&self, req: &Request<T>) -> Result<User, Error> {
        let unauthenticated = |reason: &str| Error::Unauthenticated {
            reason: reason.to_string(),
        };

        let raw = req
            .metadata()
            .get(USER_METADATA_KEY)
            .ok_or_else(|| unauthenticated("missing user metadata"))?;
        let id: UserId = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| unauthenticated("malformed user metadata"))?;

        self.store
            .user_by_id(id)
            .await?
            .ok_or_else(|| unauthenticated("unknown user"))
    }

    fn allocation_id(raw: &str) -> Result<AllocationId, Error> {
        if raw.is_empty() {
            return Err(Error::invalid("allocation id is required"));
        }
        Ok(AllocationId::from(raw))
    }

    fn task_id(raw: &str) -> Result<TaskId, Error> {
        if raw.is_empty() {
            return Err(Error::invalid("task id is required"));
        }
        Ok(TaskId::from(raw))
    }

    async fn running(&self, kind: TaskKind) -> Result<i32, Error> {
        let states = self.task_kinds.task_states(kind).await?;
        let running = states
            .into_iter()
            .filter(|state| *state == TaskState::Running)
            .count();
        Ok(i32::try_from(running).unwrap_or(i32::MAX))
    }
}

#[tonic::async_trait]
impl Allocd for AllocdService {
    type TaskLogsStream = ResponseStream<TaskLogsResponse>;
    type TaskLogsFieldsStream = ResponseStream<TaskLogsFieldsResponse>;

    #[tracing::instrument(skip_all, fields(task_id = %req.get_ref().task_id, follow = req.get_ref().follow))]
    async fn task_logs(
        &self,
        req: Request<TaskLogsRequest>,
    ) -> Result<Response<Self::TaskLogsStream>, Status> {
        increment_requests();

        let msg = req.get_ref();
        if msg.limit < 0 {
            return Err(Error::invalid("limit must be non-negative").into());
        }
        if msg.follow && msg.limit > 0 {
            return Err(Error::invalid("limit must be zero when following").into());
        }
        let task_id = Self::task_id(&msg.task_id)?;
        let filters = build_task_log_filters(msg)?;
        let order = log_order_from_proto(msg.order_by)?;
        let (limit, follow) = (i64::from(msg.limit), msg.follow);

        let user = self.authenticate(&req).await?;
        let actions = vec![ExperimentAction::ViewArtifacts];
        self.gateway
            .can_act_on_task(&user, &task_id, &actions)
            .await?;

        let request =
            resolve_request(self.logs.as_ref(), &task_id, &filters, limit, follow).await?;
        tracing::debug!("streaming up to {} records", request.limit);

        let fetcher = AuthorizedFetch::new(
            TaskLogsFetch::new(Arc::clone(&self.logs), task_id.clone(), filters, order),
            self.gateway.clone(),
            user,
            task_id.clone(),
            actions,
            AuthRecheck::checked_now(self.config.auth_recheck_period),
        );
        let termination = TaskTerminalCheck::new(
            Arc::clone(&self.store),
            task_id,
            self.logs.max_termination_delay(),
        );
        let processor =
            BatchStreamProcessor::new(request, fetcher, termination, self.config.logs_miss_wait)
                .max_batch_size(self.config.logs_batch_size);

        let rx = stream_batches(
            processor,
            self.shutdown_token.child_token(),
            self.config.stream_buffer_size,
            task_log_to_proto,
        );
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    #[tracing::instrument(skip_all, fields(task_id = %req.get_ref().task_id, follow = req.get_ref().follow))]
    async fn task_logs_fields(
        &self,
        req: Request<TaskLogsFieldsRequest>,
    ) -> Result<Response<Self::TaskLogsFieldsStream>, Status> {
        increment_requests();

        let task_id = Self::task_id(&req.get_ref().task_id)?;
        let follow = req.get_ref().follow;

        let user = self.authenticate(&req).await?;
        let actions = vec![ExperimentAction::ViewArtifacts];
        self.gateway
            .can_act_on_task(&user, &task_id, &actions)
            .await?;

        let fetcher = AuthorizedFetch::new(
            TaskLogFieldsFetch::new(Arc::clone(&self.logs), task_id.clone()),
            self.gateway.clone(),
            user,
            task_id.clone(),
            actions,
            AuthRecheck::checked_now(self.config.auth_recheck_period),
        );
        let termination = TaskTerminalCheck::new(
            Arc::clone(&self.store),
            task_id,
            self.logs.max_termination_delay(),
        );
        let poll = self.config.fields_poll_interval;
        let processor =
            BatchStreamProcessor::new(BatchRequest::new(0, follow), fetcher, termination, poll)
                .batch_wait(poll)
                .always_check_termination(true);

        let rx = stream_batches(
            processor,
            self.shutdown_token.child_token(),
            self.config.stream_buffer_size,
            task_log_fields_to_proto,
        );
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    #[tracing::instrument(
        skip_all,
        fields(allocation_id = %req.get_ref().allocation_id, round = %req.get_ref().round)
    )]
    async fn allocation_all_gather(
        &self,
        req: Request<AllocationAllGatherRequest>,
    ) -> Result<Response<AllocationAllGatherResponse>, Status> {
        increment_requests();

        let msg = req.get_ref();
        let allocation = Self::allocation_id(&msg.allocation_id)?;
        let watcher = Uuid::parse_str(&msg.request_uuid)
            .map_err(|e| Error::invalid(format!("malformed request uuid: {e}")))?;
        if msg.num_peers < 1 {
            return Err(Error::invalid("num_peers must be at least 1").into());
        }

        let user = self.authenticate(&req).await?;
        self.gateway.can_edit_allocation(&user, &allocation).await?;

        let msg = req.into_inner();
        let handle = self.registry.get(&allocation)?.handle;
        // Dropping the watch (the client went away) deregisters it.
        let watch = handle
            .watch_all_gather(msg.round, watcher, msg.num_peers, msg.data)
            .await?;
        let data = watch.result().await?;

        tracing::debug!("round released with {} payloads", data.len());
        Ok(Response::new(AllocationAllGatherResponse {
            data: data.to_vec(),
        }))
    }

    #[tracing::instrument(skip_all, fields(allocation_id = %req.get_ref().allocation_id))]
    async fn allocation_ready(
        &self,
        req: Request<AllocationReadyRequest>,
    ) -> Result<Response<AllocationReadyResponse>, Status> {
        increment_requests();

        let allocation = Self::allocation_id(&req.get_ref().allocation_id)?;
        let user = self.authenticate(&req).await?;
        self.gateway.can_edit_allocation(&user, &allocation).await?;

        self.registry.get(&allocation)?.handle.mark_ready().await?;
        Ok(Response::new(AllocationReadyResponse {}))
    }

    #[tracing::instrument(skip_all, fields(allocation_id = %req.get_ref().allocation_id))]
    async fn allocation_waiting(
        &self,
        req: Request<AllocationWaitingRequest>,
    ) -> Result<Response<AllocationWaitingResponse>, Status> {
        increment_requests();

        let allocation = Self::allocation_id(&req.get_ref().allocation_id)?;
        let user = self.authenticate(&req).await?;
        self.gateway.can_edit_allocation(&user, &allocation).await?;

        self.registry.get(&allocation)?.handle.mark_waiting().await?;
        Ok(Response::new(AllocationWaitingResponse {}))
    }

    #[tracing::instrument(skip_all, fields(allocation_id = %req.get_ref().allocation_id))]
    async fn post_allocation_proxy_address(
        &self,
        req: Request<PostAllocationProxyAddressRequest>,
    ) -> Result<Response<PostAllocationProxyAddressResponse>, Status> {
        increment_requests();

        let allocation = Self::allocation_id(&req.get_ref().allocation_id)?;
        let user = self.authenticate(&req).await?;
        self.gateway.can_edit_allocation(&user, &allocation).await?;

        let address = req.into_inner().proxy_address;
        self.registry
            .get(&allocation)?
            .handle
            .set_proxy_address(address)
            .await?;
        Ok(Response::new(PostAllocationProxyAddressResponse {}))
    }

    #[tracing::instrument(skip_all)]
    async fn get_active_tasks_count(
        &self,
        req: Request<GetActiveTasksCountRequest>,
    ) -> Result<Response<GetActiveTasksCountResponse>, Status> {
        increment_requests();

        let user = self.authenticate(&req).await?;
        self.gateway.can_get_active_tasks_count(&user).await?;

        let mut resp = GetActiveTasksCountResponse::default();
        for kind in TaskKind::ALL {
            let count = self.running(kind).await?;
            match kind {
                TaskKind::Notebook => resp.notebooks = count,
                TaskKind::Tensorboard => resp.tensorboards = count,
                TaskKind::Command => resp.commands = count,
                TaskKind::Shell => resp.shells = count,
            }
        }
        Ok(Response::new(resp))
    }
}
