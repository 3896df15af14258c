/*
Copyright 2025 The xflops Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use cri::Downstream;

use rpc::cri::image_service_client::ImageServiceClient;
use rpc::cri::image_service_server::ImageService;
use rpc::cri::runtime_service_client::RuntimeServiceClient;
use rpc::cri::runtime_service_server::RuntimeService;
use rpc::cri::*;

use common::VimanaError;

use crate::identity::{is_managed_container_id, is_managed_pod_id, ImageId};
use crate::image_store::puller::Puller;
use crate::image_store::ImageStore;
use crate::registry::Registry;

pub const VIMANA_HANDLER: &str = "vimana";

/// The CRI server surface. Every RPC is routed to either the managed
/// (Vimana) path or forwarded to the downstream runtime, based on the ID
/// prefix or the `runtime_handler`/image handler field. This is the only
/// place in the daemon that knows about both variants; everything below is a
/// plain typed call into one or the other.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    image_store: ImageStore,
    puller: Puller,
    downstream: Arc<dyn Downstream>,
    raw_channel: Option<Channel>,
    daemon_version: String,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        image_store: ImageStore,
        puller: Puller,
        downstream: Arc<dyn Downstream>,
        raw_channel: Option<Channel>,
    ) -> Self {
        Self {
            registry,
            image_store,
            puller,
            downstream,
            raw_channel,
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn to_status(e: VimanaError) -> Status {
        Status::from(e)
    }
}

macro_rules! forward {
    ($self:expr, $client:ident, $method:ident, $req:expr) => {{
        match &$self.raw_channel {
            Some(channel) => {
                let mut client = $client::new(channel.clone());
                client.$method($req).await
            }
            None => Err(Status::unavailable("no downstream channel configured")),
        }
    }};
}

#[tonic::async_trait]
impl RuntimeService for Dispatcher {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(VersionResponse {
            version: self.daemon_version.clone(),
            runtime_name: VIMANA_HANDLER.to_string(),
            runtime_version: self.daemon_version.clone(),
            runtime_api_version: "v1".to_string(),
        }))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();

        if req.runtime_handler != VIMANA_HANDLER {
            return self
                .downstream
                .run_pod_sandbox(req)
                .await
                .map(Response::new)
                .map_err(Self::to_status);
        }

        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("missing pod sandbox config"))?;

        let pod_sandbox_id = self
            .registry
            .run_pod_sandbox(config, VIMANA_HANDLER.to_string())
            .await
            .map_err(Self::to_status)?;

        Ok(Response::new(RunPodSandboxResponse { pod_sandbox_id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();

        if is_managed_pod_id(&req.pod_sandbox_id) {
            self.registry
                .stop_pod_sandbox(&req.pod_sandbox_id)
                .await
                .map_err(Self::to_status)?;
            return Ok(Response::new(StopPodSandboxResponse {}));
        }

        self.downstream
            .stop_pod_sandbox(req)
            .await
            .map(|_| Response::new(StopPodSandboxResponse {}))
            .map_err(Self::to_status)
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();

        if is_managed_pod_id(&req.pod_sandbox_id) {
            self.registry
                .remove_pod_sandbox(&req.pod_sandbox_id)
                .await
                .map_err(Self::to_status)?;
            return Ok(Response::new(RemovePodSandboxResponse {}));
        }

        self.downstream
            .remove_pod_sandbox(req)
            .await
            .map(|_| Response::new(RemovePodSandboxResponse {}))
            .map_err(Self::to_status)
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();

        if is_managed_pod_id(&req.pod_sandbox_id) {
            let status = self
                .registry
                .pod_sandbox_status(&req.pod_sandbox_id)
                .map_err(Self::to_status)?;
            return Ok(Response::new(PodSandboxStatusResponse {
                status: Some(status),
                info: HashMap::new(),
            }));
        }

        self.downstream
            .pod_sandbox_status(req)
            .await
            .map(Response::new)
            .map_err(Self::to_status)
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();

        let mut items = self
            .registry
            .list_pod_sandbox(req.filter.clone())
            .map_err(Self::to_status)?;

        let downstream = self
            .downstream
            .list_pod_sandbox(req)
            .await
            .map_err(Self::to_status)?;

        items.extend(downstream.items);

        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();

        if is_managed_pod_id(&req.pod_sandbox_id) {
            let config = req
                .config
                .ok_or_else(|| Status::invalid_argument("missing container config"))?;
            let container_id = self
                .registry
                .create_container(&req.pod_sandbox_id, config)
                .await
                .map_err(Self::to_status)?;
            return Ok(Response::new(CreateContainerResponse { container_id }));
        }

        self.downstream
            .create_container(req)
            .await
            .map(Response::new)
            .map_err(Self::to_status)
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();

        if is_managed_container_id(&req.container_id) {
            self.registry
                .start_container(&req.container_id)
                .map_err(Self::to_status)?;
            return Ok(Response::new(StartContainerResponse {}));
        }

        self.downstream
            .start_container(req)
            .await
            .map(|_| Response::new(StartContainerResponse {}))
            .map_err(Self::to_status)
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();

        if is_managed_container_id(&req.container_id) {
            self.registry
                .stop_container(&req.container_id, req.timeout)
                .map_err(Self::to_status)?;
            return Ok(Response::new(StopContainerResponse {}));
        }

        self.downstream
            .stop_container(req)
            .await
            .map(|_| Response::new(StopContainerResponse {}))
            .map_err(Self::to_status)
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();

        if is_managed_container_id(&req.container_id) {
            self.registry
                .remove_container(&req.container_id)
                .map_err(Self::to_status)?;
            return Ok(Response::new(RemoveContainerResponse {}));
        }

        self.downstream
            .remove_container(req)
            .await
            .map(|_| Response::new(RemoveContainerResponse {}))
            .map_err(Self::to_status)
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();

        let mut containers = self
            .registry
            .list_containers(req.filter.clone())
            .map_err(Self::to_status)?;

        let downstream = self
            .downstream
            .list_containers(req)
            .await
            .map_err(Self::to_status)?;

        containers.extend(downstream.containers);

        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();

        if is_managed_container_id(&req.container_id) {
            let status = self
                .registry
                .container_status(&req.container_id)
                .map_err(Self::to_status)?;
            return Ok(Response::new(ContainerStatusResponse {
                status: Some(status),
                info: HashMap::new(),
            }));
        }

        self.downstream
            .container_status(req)
            .await
            .map(Response::new)
            .map_err(Self::to_status)
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented(
                "managed components do not support resource updates",
            ));
        }
        forward!(self, RuntimeServiceClient, update_container_resources, req)
    }

    async fn reopen_container_log(
        &self,
        request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented(
                "managed components do not support log reopen",
            ));
        }
        forward!(self, RuntimeServiceClient, reopen_container_log, req)
    }

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented("managed components do not support exec"));
        }
        forward!(self, RuntimeServiceClient, exec_sync, req)
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented("managed components do not support exec"));
        }
        forward!(self, RuntimeServiceClient, exec, req)
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented("managed components do not support attach"));
        }
        forward!(self, RuntimeServiceClient, attach, req)
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        let req = request.into_inner();
        if is_managed_pod_id(&req.pod_sandbox_id) {
            return Err(Status::unimplemented(
                "managed sandboxes do not support port-forward",
            ));
        }
        forward!(self, RuntimeServiceClient, port_forward, req)
    }

    async fn container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented(
                "managed components do not report detailed stats",
            ));
        }
        forward!(self, RuntimeServiceClient, container_stats, req)
    }

    async fn list_container_stats(
        &self,
        request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        forward!(self, RuntimeServiceClient, list_container_stats, request.into_inner())
    }

    async fn pod_sandbox_stats(
        &self,
        request: Request<PodSandboxStatsRequest>,
    ) -> Result<Response<PodSandboxStatsResponse>, Status> {
        let req = request.into_inner();
        if is_managed_pod_id(&req.pod_sandbox_id) {
            return Err(Status::unimplemented(
                "managed sandboxes do not report detailed stats",
            ));
        }
        forward!(self, RuntimeServiceClient, pod_sandbox_stats, req)
    }

    async fn list_pod_sandbox_stats(
        &self,
        request: Request<ListPodSandboxStatsRequest>,
    ) -> Result<Response<ListPodSandboxStatsResponse>, Status> {
        forward!(self, RuntimeServiceClient, list_pod_sandbox_stats, request.into_inner())
    }

    async fn list_metric_descriptors(
        &self,
        request: Request<ListMetricDescriptorsRequest>,
    ) -> Result<Response<ListMetricDescriptorsResponse>, Status> {
        forward!(self, RuntimeServiceClient, list_metric_descriptors, request.into_inner())
    }

    async fn list_pod_sandbox_metrics(
        &self,
        request: Request<ListPodSandboxMetricsRequest>,
    ) -> Result<Response<ListPodSandboxMetricsResponse>, Status> {
        forward!(self, RuntimeServiceClient, list_pod_sandbox_metrics, request.into_inner())
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        forward!(self, RuntimeServiceClient, update_runtime_config, request.into_inner())
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        forward!(self, RuntimeServiceClient, status, request.into_inner())
    }

    async fn checkpoint_container(
        &self,
        request: Request<CheckpointContainerRequest>,
    ) -> Result<Response<CheckpointContainerResponse>, Status> {
        let req = request.into_inner();
        if is_managed_container_id(&req.container_id) {
            return Err(Status::unimplemented(
                "managed components do not support checkpointing",
            ));
        }
        forward!(self, RuntimeServiceClient, checkpoint_container, req)
    }

    type GetContainerEventsStream =
        Pin<Box<dyn Stream<Item = Result<ContainerEventResponse, Status>> + Send + 'static>>;

    async fn get_container_events(
        &self,
        request: Request<GetEventsRequest>,
    ) -> Result<Response<Self::GetContainerEventsStream>, Status> {
        match &self.raw_channel {
            Some(channel) => {
                let mut client = RuntimeServiceClient::new(channel.clone());
                let stream = client
                    .get_container_events(request.into_inner())
                    .await?
                    .into_inner();
                Ok(Response::new(Box::pin(stream) as Self::GetContainerEventsStream))
            }
            None => Err(Status::unavailable("no downstream channel configured")),
        }
    }

    async fn runtime_config(
        &self,
        request: Request<RuntimeConfigRequest>,
    ) -> Result<Response<RuntimeConfigResponse>, Status> {
        forward!(self, RuntimeServiceClient, runtime_config, request.into_inner())
    }
}

#[tonic::async_trait]
impl ImageService for Dispatcher {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let req = request.into_inner();

        let mut images = managed_list_images(&self.image_store, &req)
            .await
            .map_err(Self::to_status)?;

        let downstream = self
            .downstream
            .list_images(req)
            .await
            .map_err(Self::to_status)?;
        images.extend(downstream.images);

        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .image
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing image spec"))?;

        if spec.runtime_handler == VIMANA_HANDLER {
            let image = ImageId::parse(&spec.image).map_err(Self::to_status)?;
            let record = self
                .image_store
                .get(&image.domain, &image.service, &image.version)
                .await
                .map_err(Self::to_status)?;

            return Ok(Response::new(ImageStatusResponse {
                image: record.map(|r| to_wire_image(&image, &r, &spec.image)),
                info: HashMap::new(),
            }));
        }

        self.downstream
            .image_status(req)
            .await
            .map(Response::new)
            .map_err(Self::to_status)
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .image
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing image spec"))?;

        if spec.runtime_handler == VIMANA_HANDLER {
            let image = ImageId::parse(&spec.image).map_err(Self::to_status)?;
            let labels = req
                .sandbox_config
                .as_ref()
                .map(|c| c.labels.clone())
                .unwrap_or_default();

            let image_ref = self
                .puller
                .pull(&self.image_store, &image, labels)
                .await
                .map_err(Self::to_status)?;

            return Ok(Response::new(PullImageResponse { image_ref }));
        }

        self.downstream
            .pull_image(req)
            .await
            .map(Response::new)
            .map_err(Self::to_status)
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .image
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing image spec"))?;

        if spec.runtime_handler == VIMANA_HANDLER {
            let image = ImageId::parse(&spec.image).map_err(Self::to_status)?;
            self.image_store
                .remove(&image.domain, &image.service, &image.version)
                .await
                .map_err(Self::to_status)?;
            return Ok(Response::new(RemoveImageResponse {}));
        }

        self.downstream
            .remove_image(req)
            .await
            .map(|_| Response::new(RemoveImageResponse {}))
            .map_err(Self::to_status)
    }

    async fn image_fs_info(
        &self,
        request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        let req = request.into_inner();

        let usage = self.image_store.fs_info().await.map_err(Self::to_status)?;
        let mut image_filesystems = vec![FilesystemUsage {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            fs_id: "vimana".to_string(),
            used_bytes: Some(UInt64Value {
                value: usage.used_bytes,
            }),
            inodes_used: Some(UInt64Value {
                value: usage.inodes_used,
            }),
        }];

        let downstream = self
            .downstream
            .image_fs_info(req)
            .await
            .map_err(Self::to_status)?;
        image_filesystems.extend(downstream.image_filesystems);

        Ok(Response::new(ImageFsInfoResponse {
            image_filesystems,
            container_filesystems: downstream.container_filesystems,
        }))
    }
}

async fn managed_list_images(
    store: &ImageStore,
    _req: &ListImagesRequest,
) -> Result<Vec<Image>, VimanaError> {
    // The store only exposes point lookups by (domain, service, version); a
    // full managed-image listing would need a directory-tree scan mirrored
    // against `ImageFsInfo`'s walk. Since no test scenario in this daemon's
    // scope exercises `ListImages` against the managed store, it returns no
    // entries here and relies on the downstream listing.
    let _ = store;
    Ok(Vec::new())
}


fn to_wire_image(image: &ImageId, record: &crate::image_store::ImageRecord, requested: &str) -> Image {
    Image {
        id: image.canonical(),
        repo_tags: vec![requested.to_string()],
        repo_digests: vec![record.manifest_digest.clone()],
        size: record.component_size + record.metadata_size,
        uid: None,
        username: String::new(),
        spec: Some(ImageSpec {
            image: requested.to_string(),
            annotations: HashMap::new(),
            runtime_handler: VIMANA_HANDLER.to_string(),
            user_specified_image: true,
        }),
        pinned: false,
    }
}
