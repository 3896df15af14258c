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

use chrono::{DateTime, Utc};

use rpc::cri::{Container, ContainerState as WireContainerState, ContainerStatus, ImageSpec};

use crate::identity::PodIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    #[allow(dead_code)]
    Unknown,
}

impl From<ContainerState> for WireContainerState {
    fn from(value: ContainerState) -> Self {
        match value {
            ContainerState::Created => WireContainerState::ContainerCreated,
            ContainerState::Running => WireContainerState::ContainerRunning,
            ContainerState::Exited => WireContainerState::ContainerExited,
            ContainerState::Unknown => WireContainerState::ContainerUnknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub identity: PodIdentity,
    pub name: String,
    pub image_ref: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub envs: HashMap<String, String>,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
}

impl ContainerRecord {
    pub fn id(&self) -> String {
        self.identity.container_id()
    }

    pub fn pod_id(&self) -> String {
        self.identity.pod_id()
    }

}

impl From<&ContainerRecord> for Container {
    fn from(container: &ContainerRecord) -> Self {
        Container {
            id: container.id(),
            pod_sandbox_id: container.pod_id(),
            metadata: Some(rpc::cri::ContainerMetadata {
                name: container.name.clone(),
                attempt: container.identity.attempt,
            }),
            image: Some(ImageSpec {
                image: container.image_ref.clone(),
                annotations: HashMap::new(),
                runtime_handler: String::new(),
                user_specified_image: true,
            }),
            image_ref: container.image_id.clone(),
            state: WireContainerState::from(container.state) as i32,
            created_at: container.created_at.timestamp_nanos_opt().unwrap_or_default(),
            labels: container.labels.clone(),
            annotations: container.annotations.clone(),
            image_id: container.image_id.clone(),
        }
    }
}

impl From<&ContainerRecord> for ContainerStatus {
    fn from(container: &ContainerRecord) -> Self {
        ContainerStatus {
            id: container.id(),
            metadata: Some(rpc::cri::ContainerMetadata {
                name: container.name.clone(),
                attempt: container.identity.attempt,
            }),
            state: WireContainerState::from(container.state) as i32,
            created_at: container.created_at.timestamp_nanos_opt().unwrap_or_default(),
            started_at: container
                .started_at
                .and_then(|t| t.timestamp_nanos_opt())
                .unwrap_or_default(),
            finished_at: container
                .finished_at
                .and_then(|t| t.timestamp_nanos_opt())
                .unwrap_or_default(),
            exit_code: container.exit_code,
            image: Some(ImageSpec {
                image: container.image_ref.clone(),
                annotations: HashMap::new(),
                runtime_handler: String::new(),
                user_specified_image: true,
            }),
            image_ref: container.image_id.clone(),
            reason: String::new(),
            message: String::new(),
            labels: container.labels.clone(),
            annotations: container.annotations.clone(),
            mounts: vec![],
            log_path: String::new(),
            resources: None,
            image_id: container.image_id.clone(),
        }
    }
}
