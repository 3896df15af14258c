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

use std::collections::VecDeque;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use common::{VimanaError, lock_ptr, new_ptr, MutexPtr};

use rpc::cri::image_service_client::ImageServiceClient;
use rpc::cri::runtime_service_client::RuntimeServiceClient;
use rpc::cri::{
    ContainerStatusRequest, ContainerStatusResponse, CreateContainerRequest,
    CreateContainerResponse, ImageFsInfoRequest, ImageFsInfoResponse, ImageStatusRequest,
    ImageStatusResponse, ListContainersRequest, ListContainersResponse, ListImagesRequest,
    ListImagesResponse, ListPodSandboxRequest, ListPodSandboxResponse, PodSandboxStatusRequest,
    PodSandboxStatusResponse, PullImageRequest, PullImageResponse, RemoveContainerRequest,
    RemoveImageRequest, RemovePodSandboxRequest, RunPodSandboxRequest, RunPodSandboxResponse,
    StartContainerRequest, StopContainerRequest, StopPodSandboxRequest, VersionRequest,
    VersionResponse,
};

/// The subset of the CRI lifecycle surface a request can be delegated to
/// wholesale: everything the node-daemon's own registry does not manage
/// itself. Peripheral RPCs (exec, stats, events, ...) are proxied directly
/// from the dispatcher instead of going through this trait, since they carry
/// no state the dispatcher needs to reason about.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn version(&self, req: VersionRequest) -> Result<VersionResponse, VimanaError>;

    async fn run_pod_sandbox(
        &self,
        req: RunPodSandboxRequest,
    ) -> Result<RunPodSandboxResponse, VimanaError>;
    async fn stop_pod_sandbox(&self, req: StopPodSandboxRequest) -> Result<(), VimanaError>;
    async fn remove_pod_sandbox(&self, req: RemovePodSandboxRequest) -> Result<(), VimanaError>;
    async fn pod_sandbox_status(
        &self,
        req: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse, VimanaError>;
    async fn list_pod_sandbox(
        &self,
        req: ListPodSandboxRequest,
    ) -> Result<ListPodSandboxResponse, VimanaError>;

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> Result<CreateContainerResponse, VimanaError>;
    async fn start_container(&self, req: StartContainerRequest) -> Result<(), VimanaError>;
    async fn stop_container(&self, req: StopContainerRequest) -> Result<(), VimanaError>;
    async fn remove_container(&self, req: RemoveContainerRequest) -> Result<(), VimanaError>;
    async fn list_containers(
        &self,
        req: ListContainersRequest,
    ) -> Result<ListContainersResponse, VimanaError>;
    async fn container_status(
        &self,
        req: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse, VimanaError>;

    async fn pull_image(&self, req: PullImageRequest) -> Result<PullImageResponse, VimanaError>;
    async fn remove_image(&self, req: RemoveImageRequest) -> Result<(), VimanaError>;
    async fn image_status(
        &self,
        req: ImageStatusRequest,
    ) -> Result<ImageStatusResponse, VimanaError>;
    async fn image_fs_info(
        &self,
        req: ImageFsInfoRequest,
    ) -> Result<ImageFsInfoResponse, VimanaError>;
    async fn list_images(&self, req: ListImagesRequest) -> Result<ListImagesResponse, VimanaError>;
}

/// Talks to a real downstream runtime over a Unix domain socket, the same
/// connector shape used to dial containerd-style endpoints.
#[derive(Clone)]
pub struct GrpcDownstream {
    channel: Channel,
    rt: RuntimeServiceClient<Channel>,
    img: ImageServiceClient<Channel>,
}

impl GrpcDownstream {
    async fn connect_uds(endpoint: &str) -> Result<Channel, VimanaError> {
        let endpoint = endpoint.to_string();
        Endpoint::try_from("http://[::]:50051")
            .expect("static endpoint URI is valid")
            .connect_with_connector(service_fn(move |_: Uri| {
                let endpoint = endpoint.clone();
                async move {
                    UnixStream::connect(endpoint)
                        .await
                        .map(TokioIo::new)
                        .map_err(std::io::Error::other)
                }
            }))
            .await
            .map_err(|e| VimanaError::Unavailable(format!("downstream runtime: {e}")))
    }

    pub async fn connect(endpoint: &str) -> Result<Self, VimanaError> {
        let channel = Self::connect_uds(endpoint).await?;
        let rt = RuntimeServiceClient::new(channel.clone());
        let img = ImageServiceClient::new(channel.clone());
        Ok(Self { channel, rt, img })
    }

    /// Raw channel to the downstream runtime, used by the dispatcher to build
    /// ad hoc clients for peripheral RPCs that are forwarded unconditionally
    /// rather than going through the [`Downstream`] trait.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

fn map_status(status: tonic::Status) -> VimanaError {
    VimanaError::Unavailable(format!("downstream runtime: {status}"))
}

#[async_trait]
impl Downstream for GrpcDownstream {
    async fn version(&self, req: VersionRequest) -> Result<VersionResponse, VimanaError> {
        self.rt
            .clone()
            .version(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn run_pod_sandbox(
        &self,
        req: RunPodSandboxRequest,
    ) -> Result<RunPodSandboxResponse, VimanaError> {
        self.rt
            .clone()
            .run_pod_sandbox(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn stop_pod_sandbox(&self, req: StopPodSandboxRequest) -> Result<(), VimanaError> {
        self.rt
            .clone()
            .stop_pod_sandbox(req)
            .await
            .map(|_| ())
            .map_err(map_status)
    }

    async fn remove_pod_sandbox(&self, req: RemovePodSandboxRequest) -> Result<(), VimanaError> {
        self.rt
            .clone()
            .remove_pod_sandbox(req)
            .await
            .map(|_| ())
            .map_err(map_status)
    }

    async fn pod_sandbox_status(
        &self,
        req: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse, VimanaError> {
        self.rt
            .clone()
            .pod_sandbox_status(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn list_pod_sandbox(
        &self,
        req: ListPodSandboxRequest,
    ) -> Result<ListPodSandboxResponse, VimanaError> {
        self.rt
            .clone()
            .list_pod_sandbox(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> Result<CreateContainerResponse, VimanaError> {
        self.rt
            .clone()
            .create_container(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn start_container(&self, req: StartContainerRequest) -> Result<(), VimanaError> {
        self.rt
            .clone()
            .start_container(req)
            .await
            .map(|_| ())
            .map_err(map_status)
    }

    async fn stop_container(&self, req: StopContainerRequest) -> Result<(), VimanaError> {
        self.rt
            .clone()
            .stop_container(req)
            .await
            .map(|_| ())
            .map_err(map_status)
    }

    async fn remove_container(&self, req: RemoveContainerRequest) -> Result<(), VimanaError> {
        self.rt
            .clone()
            .remove_container(req)
            .await
            .map(|_| ())
            .map_err(map_status)
    }

    async fn list_containers(
        &self,
        req: ListContainersRequest,
    ) -> Result<ListContainersResponse, VimanaError> {
        self.rt
            .clone()
            .list_containers(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn container_status(
        &self,
        req: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse, VimanaError> {
        self.rt
            .clone()
            .container_status(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn pull_image(&self, req: PullImageRequest) -> Result<PullImageResponse, VimanaError> {
        self.img
            .clone()
            .pull_image(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn remove_image(&self, req: RemoveImageRequest) -> Result<(), VimanaError> {
        self.img
            .clone()
            .remove_image(req)
            .await
            .map(|_| ())
            .map_err(map_status)
    }

    async fn image_status(
        &self,
        req: ImageStatusRequest,
    ) -> Result<ImageStatusResponse, VimanaError> {
        self.img
            .clone()
            .image_status(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn image_fs_info(
        &self,
        req: ImageFsInfoRequest,
    ) -> Result<ImageFsInfoResponse, VimanaError> {
        self.img
            .clone()
            .image_fs_info(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }

    async fn list_images(&self, req: ListImagesRequest) -> Result<ListImagesResponse, VimanaError> {
        self.img
            .clone()
            .list_images(req)
            .await
            .map(|r| r.into_inner())
            .map_err(map_status)
    }
}

/// One canned reply per queued call, consumed FIFO. Used in place of
/// [`GrpcDownstream`] so dispatcher tests exercise the real routing logic
/// without a live downstream runtime to connect to.
pub enum Canned {
    Version(VersionResponse),
    RunPodSandbox(RunPodSandboxResponse),
    StopPodSandbox,
    RemovePodSandbox,
    PodSandboxStatus(PodSandboxStatusResponse),
    ListPodSandbox(ListPodSandboxResponse),
    CreateContainer(CreateContainerResponse),
    StartContainer,
    StopContainer,
    RemoveContainer,
    ListContainers(ListContainersResponse),
    ContainerStatus(ContainerStatusResponse),
    PullImage(PullImageResponse),
    RemoveImage,
    ImageStatus(ImageStatusResponse),
    ImageFsInfo(ImageFsInfoResponse),
    ListImages(ListImagesResponse),
}

pub struct FakeDownstream {
    queue: MutexPtr<VecDeque<Canned>>,
}

impl FakeDownstream {
    pub fn new(responses: Vec<Canned>) -> Self {
        Self {
            queue: new_ptr(VecDeque::from(responses)),
        }
    }

    fn pop(&self, what: &str) -> Result<Canned, VimanaError> {
        lock_ptr!(self.queue)?
            .pop_front()
            .ok_or_else(|| VimanaError::Internal(format!("no canned response for {what}")))
    }
}

macro_rules! expect_variant {
    ($self:expr, $what:expr, $variant:ident) => {
        match $self.pop($what)? {
            Canned::$variant(v) => Ok(v),
            _ => Err(VimanaError::Internal(format!(
                "canned response queue out of order at {}",
                $what
            ))),
        }
    };
    ($self:expr, $what:expr, $variant:ident, unit) => {
        match $self.pop($what)? {
            Canned::$variant => Ok(()),
            _ => Err(VimanaError::Internal(format!(
                "canned response queue out of order at {}",
                $what
            ))),
        }
    };
}

#[async_trait]
impl Downstream for FakeDownstream {
    async fn version(&self, _req: VersionRequest) -> Result<VersionResponse, VimanaError> {
        expect_variant!(self, "version", Version)
    }

    async fn run_pod_sandbox(
        &self,
        _req: RunPodSandboxRequest,
    ) -> Result<RunPodSandboxResponse, VimanaError> {
        expect_variant!(self, "run_pod_sandbox", RunPodSandbox)
    }

    async fn stop_pod_sandbox(&self, _req: StopPodSandboxRequest) -> Result<(), VimanaError> {
        expect_variant!(self, "stop_pod_sandbox", StopPodSandbox, unit)
    }

    async fn remove_pod_sandbox(&self, _req: RemovePodSandboxRequest) -> Result<(), VimanaError> {
        expect_variant!(self, "remove_pod_sandbox", RemovePodSandbox, unit)
    }

    async fn pod_sandbox_status(
        &self,
        _req: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse, VimanaError> {
        expect_variant!(self, "pod_sandbox_status", PodSandboxStatus)
    }

    async fn list_pod_sandbox(
        &self,
        _req: ListPodSandboxRequest,
    ) -> Result<ListPodSandboxResponse, VimanaError> {
        expect_variant!(self, "list_pod_sandbox", ListPodSandbox)
    }

    async fn create_container(
        &self,
        _req: CreateContainerRequest,
    ) -> Result<CreateContainerResponse, VimanaError> {
        expect_variant!(self, "create_container", CreateContainer)
    }

    async fn start_container(&self, _req: StartContainerRequest) -> Result<(), VimanaError> {
        expect_variant!(self, "start_container", StartContainer, unit)
    }

    async fn stop_container(&self, _req: StopContainerRequest) -> Result<(), VimanaError> {
        expect_variant!(self, "stop_container", StopContainer, unit)
    }

    async fn remove_container(&self, _req: RemoveContainerRequest) -> Result<(), VimanaError> {
        expect_variant!(self, "remove_container", RemoveContainer, unit)
    }

    async fn list_containers(
        &self,
        _req: ListContainersRequest,
    ) -> Result<ListContainersResponse, VimanaError> {
        expect_variant!(self, "list_containers", ListContainers)
    }

    async fn container_status(
        &self,
        _req: ContainerStatusRequest,
    ) -> Result<ContainerStatusResponse, VimanaError> {
        expect_variant!(self, "container_status", ContainerStatus)
    }

    async fn pull_image(&self, _req: PullImageRequest) -> Result<PullImageResponse, VimanaError> {
        expect_variant!(self, "pull_image", PullImage)
    }

    async fn remove_image(&self, _req: RemoveImageRequest) -> Result<(), VimanaError> {
        expect_variant!(self, "remove_image", RemoveImage, unit)
    }

    async fn image_status(
        &self,
        _req: ImageStatusRequest,
    ) -> Result<ImageStatusResponse, VimanaError> {
        expect_variant!(self, "image_status", ImageStatus)
    }

    async fn image_fs_info(
        &self,
        _req: ImageFsInfoRequest,
    ) -> Result<ImageFsInfoResponse, VimanaError> {
        expect_variant!(self, "image_fs_info", ImageFsInfo)
    }

    async fn list_images(
        &self,
        _req: ListImagesRequest,
    ) -> Result<ListImagesResponse, VimanaError> {
        expect_variant!(self, "list_images", ListImages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_downstream_replays_in_order() {
        let fake = FakeDownstream::new(vec![
            Canned::Version(VersionResponse {
                version: "0.1.0".into(),
                runtime_name: "containerd".into(),
                runtime_version: "1.7.0".into(),
                runtime_api_version: "v1".into(),
            }),
            Canned::StopPodSandbox,
        ]);

        let version = fake
            .version(VersionRequest {
                version: "*".into(),
            })
            .await
            .unwrap();
        assert_eq!(version.runtime_name, "containerd");

        fake.stop_pod_sandbox(StopPodSandboxRequest {
            pod_sandbox_id: "anything".into(),
        })
        .await
        .unwrap();

        let err = fake
            .stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: "anything".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VimanaError::Internal(_)));
    }
}
