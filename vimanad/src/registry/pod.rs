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

use rpc::cri::{PodSandbox, PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus};

use crate::identity::PodIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    SandboxReady,
    SandboxNotReady,
}

impl From<PodState> for PodSandboxState {
    fn from(value: PodState) -> Self {
        match value {
            PodState::SandboxReady => PodSandboxState::SandboxReady,
            PodState::SandboxNotReady => PodSandboxState::SandboxNotReady,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PodMetadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct PodRecord {
    pub identity: PodIdentity,
    pub metadata: PodMetadata,
    pub hostname: String,
    pub runtime_handler: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub state: PodState,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PodRecord {
    pub fn id(&self) -> String {
        self.identity.pod_id()
    }

    pub fn container_id(&self) -> String {
        self.identity.container_id()
    }

    /// `true` if `labels` contains every `(k, v)` pair in `selector`.
    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|lv| lv == v).unwrap_or(false))
    }

}

impl From<&PodRecord> for PodSandbox {
    fn from(pod: &PodRecord) -> Self {
        PodSandbox {
            id: pod.id(),
            metadata: Some(rpc::cri::PodSandboxMetadata {
                name: pod.metadata.name.clone(),
                uid: pod.metadata.uid.clone(),
                namespace: pod.metadata.namespace.clone(),
                attempt: pod.identity.attempt,
            }),
            state: PodSandboxState::from(pod.state) as i32,
            created_at: pod.created_at.timestamp_nanos_opt().unwrap_or_default(),
            labels: pod.labels.clone(),
            annotations: pod.annotations.clone(),
            runtime_handler: pod.runtime_handler.clone(),
        }
    }
}

impl From<&PodRecord> for PodSandboxStatus {
    fn from(pod: &PodRecord) -> Self {
        PodSandboxStatus {
            id: pod.id(),
            metadata: Some(rpc::cri::PodSandboxMetadata {
                name: pod.metadata.name.clone(),
                uid: pod.metadata.uid.clone(),
                namespace: pod.metadata.namespace.clone(),
                attempt: pod.identity.attempt,
            }),
            state: PodSandboxState::from(pod.state) as i32,
            created_at: pod.created_at.timestamp_nanos_opt().unwrap_or_default(),
            network: pod.ip.clone().map(|ip| PodSandboxNetworkStatus {
                ip,
                additional_ips: vec![],
            }),
            linux: None,
            labels: pod.labels.clone(),
            annotations: pod.annotations.clone(),
            runtime_handler: pod.runtime_handler.clone(),
        }
    }
}
