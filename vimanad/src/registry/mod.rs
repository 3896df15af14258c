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

pub mod container;
pub mod pod;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use rpc::cri::{
    Container, ContainerConfig, ContainerFilter, PodSandbox, PodSandboxConfig, PodSandboxFilter,
    PodSandboxState, PodSandboxStatus,
};

use common::{lock_ptr, new_ptr, trace_fn, MutexPtr, VimanaError};

use crate::engine::Engine;
use crate::identity::{ImageId, PodIdentity};
use crate::network::NetworkAllocator;

pub use container::{ContainerRecord, ContainerState};
pub use pod::{PodMetadata, PodRecord, PodState};

const LABEL_DOMAIN: &str = "vimana.host/domain";
const LABEL_SERVICE: &str = "vimana.host/service";
const LABEL_VERSION: &str = "vimana.host/version";

type Triple = (String, String, String);

/// The authoritative in-memory state of every managed pod and container.
/// Mutations take the registry's coarse lock for the duration of a state
/// transition; `*Status`/`List*` snapshot the needed records and release the
/// lock before building a response.
#[derive(Clone)]
pub struct Registry {
    pods: MutexPtr<HashMap<String, PodRecord>>,
    containers: MutexPtr<HashMap<String, ContainerRecord>>,
    attempts: MutexPtr<HashMap<Triple, u32>>,
    network: Arc<NetworkAllocator>,
    engine: Arc<dyn Engine>,
}

fn labels_triple(labels: &HashMap<String, String>) -> Result<Triple, VimanaError> {
    let domain = labels
        .get(LABEL_DOMAIN)
        .ok_or_else(|| VimanaError::InvalidArgument(format!("missing label {LABEL_DOMAIN}")))?
        .clone();
    let service = labels
        .get(LABEL_SERVICE)
        .ok_or_else(|| VimanaError::InvalidArgument(format!("missing label {LABEL_SERVICE}")))?
        .clone();
    let version = labels
        .get(LABEL_VERSION)
        .ok_or_else(|| VimanaError::InvalidArgument(format!("missing label {LABEL_VERSION}")))?
        .clone();
    Ok((domain, service, version))
}

impl Registry {
    pub fn new(network: Arc<NetworkAllocator>, engine: Arc<dyn Engine>) -> Self {
        Self {
            pods: new_ptr(HashMap::new()),
            containers: new_ptr(HashMap::new()),
            attempts: new_ptr(HashMap::new()),
            network,
            engine,
        }
    }

    fn next_attempt(&self, triple: &Triple) -> Result<u32, VimanaError> {
        let mut attempts = lock_ptr!(self.attempts)?;
        let entry = attempts.entry(triple.clone()).or_insert(0);
        let attempt = *entry;
        *entry += 1;
        Ok(attempt)
    }

    pub async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: String,
    ) -> Result<String, VimanaError> {
        trace_fn!("Registry::run_pod_sandbox");

        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| VimanaError::InvalidArgument("missing pod sandbox metadata".into()))?;

        let (domain, service, version) = labels_triple(&config.labels)?;
        let attempt = self.next_attempt(&(domain.clone(), service.clone(), version.clone()))?;
        let identity = PodIdentity::new(domain, service, version, attempt);
        let pod_id = identity.pod_id();

        // IP allocation happens before the record is inserted: on failure no
        // record is persisted, matching the "no partial pod" invariant.
        let ip = self.network.allocate(&pod_id).await?;

        let record = PodRecord {
            identity,
            metadata: PodMetadata {
                name: metadata.name,
                uid: metadata.uid,
                namespace: metadata.namespace,
            },
            hostname: config.hostname,
            runtime_handler,
            labels: config.labels,
            annotations: config.annotations,
            state: PodState::SandboxReady,
            ip: Some(ip),
            created_at: Utc::now(),
        };

        let mut pods = lock_ptr!(self.pods)?;
        pods.insert(pod_id.clone(), record);

        Ok(pod_id)
    }

    pub async fn stop_pod_sandbox(&self, id: &str) -> Result<(), VimanaError> {
        trace_fn!("Registry::stop_pod_sandbox");

        let (already_not_ready, released_ip, container_id) = {
            let mut pods = lock_ptr!(self.pods)?;
            let pod = pods
                .get_mut(id)
                .ok_or_else(|| VimanaError::NotFound(id.to_string()))?;

            if pod.state == PodState::SandboxNotReady {
                (true, None, pod.container_id())
            } else {
                pod.state = PodState::SandboxNotReady;
                (false, pod.ip.take(), pod.container_id())
            }
        };

        if !already_not_ready {
            let mut containers = lock_ptr!(self.containers)?;
            if let Some(container) = containers.get_mut(&container_id) {
                container.state = ContainerState::Exited;
                container.finished_at.get_or_insert(Utc::now());
            }
        }

        if released_ip.is_some() {
            self.network.release(id).await;
        }

        Ok(())
    }

    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<(), VimanaError> {
        trace_fn!("Registry::remove_pod_sandbox");

        let removed = {
            let mut pods = lock_ptr!(self.pods)?;
            pods.remove(id)
        };

        let Some(pod) = removed else {
            return Ok(());
        };

        {
            let mut containers = lock_ptr!(self.containers)?;
            containers.remove(&pod.container_id());
        }

        if pod.ip.is_some() {
            self.network.release(id).await;
        }

        Ok(())
    }

    pub fn pod_sandbox_status(&self, id: &str) -> Result<PodSandboxStatus, VimanaError> {
        trace_fn!("Registry::pod_sandbox_status");

        let pods = lock_ptr!(self.pods)?;
        let pod = pods
            .get(id)
            .ok_or_else(|| VimanaError::NotFound(id.to_string()))?;
        Ok(PodSandboxStatus::from(pod))
    }

    pub fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>, VimanaError> {
        trace_fn!("Registry::list_pod_sandbox");

        let pods = lock_ptr!(self.pods)?;
        let items = pods
            .values()
            .filter(|pod| match &filter {
                None => true,
                Some(f) => {
                    let id_ok = f.id.is_empty() || f.id == pod.id();
                    let state_ok = f
                        .state
                        .as_ref()
                        .map(|s| {
                            PodSandboxState::try_from(s.state).unwrap_or(PodSandboxState::SandboxReady)
                                == PodSandboxState::from(pod.state)
                        })
                        .unwrap_or(true);
                    let labels_ok = pod.matches_labels(&f.label_selector);
                    id_ok && state_ok && labels_ok
                }
            })
            .map(PodSandbox::from)
            .collect();

        Ok(items)
    }

    pub async fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: ContainerConfig,
    ) -> Result<String, VimanaError> {
        trace_fn!("Registry::create_container");

        let identity = {
            let pods = lock_ptr!(self.pods)?;
            let pod = pods.get(pod_sandbox_id).ok_or_else(|| {
                VimanaError::FailedPrecondition(format!("pod {pod_sandbox_id} does not exist"))
            })?;
            if pod.state != PodState::SandboxReady {
                return Err(VimanaError::FailedPrecondition(format!(
                    "pod {pod_sandbox_id} is not ready"
                )));
            }
            pod.identity.clone()
        };

        let container_id = identity.container_id();

        let mut containers = lock_ptr!(self.containers)?;
        if containers.contains_key(&container_id) {
            return Err(VimanaError::FailedPrecondition(format!(
                "pod {pod_sandbox_id} already has a container"
            )));
        }

        let metadata = config
            .metadata
            .ok_or_else(|| VimanaError::InvalidArgument("missing container metadata".into()))?;
        let image = config
            .image
            .ok_or_else(|| VimanaError::InvalidArgument("missing container image".into()))?;

        let image_id = ImageId::parse(&image.image)
            .map(|i| i.canonical())
            .unwrap_or_else(|_| image.image.clone());

        let envs = config
            .envs
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();

        containers.insert(
            container_id.clone(),
            ContainerRecord {
                identity,
                name: metadata.name,
                image_ref: image.image,
                image_id,
                labels: config.labels,
                annotations: config.annotations,
                envs,
                state: ContainerState::Created,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                exit_code: 0,
            },
        );

        Ok(container_id)
    }

    pub fn start_container(&self, id: &str) -> Result<(), VimanaError> {
        trace_fn!("Registry::start_container");

        let image_id = {
            let containers = lock_ptr!(self.containers)?;
            let container = containers
                .get(id)
                .ok_or_else(|| VimanaError::NotFound(id.to_string()))?;

            if container.state != ContainerState::Created {
                return Err(VimanaError::FailedPrecondition(format!(
                    "container {id} is not in Created state"
                )));
            }
            container.image_id.clone()
        };

        self.engine.start(id, &image_id)?;

        let mut containers = lock_ptr!(self.containers)?;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| VimanaError::NotFound(id.to_string()))?;
        container.state = ContainerState::Running;
        container.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn stop_container(&self, id: &str, _timeout: i64) -> Result<(), VimanaError> {
        trace_fn!("Registry::stop_container");

        let mut containers = lock_ptr!(self.containers)?;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| VimanaError::NotFound(id.to_string()))?;

        if container.state == ContainerState::Exited {
            return Ok(());
        }

        container.state = ContainerState::Exited;
        container.finished_at = Some(Utc::now());
        container.exit_code = 0;
        Ok(())
    }

    pub fn remove_container(&self, id: &str) -> Result<(), VimanaError> {
        trace_fn!("Registry::remove_container");

        let mut containers = lock_ptr!(self.containers)?;
        containers.remove(id);
        Ok(())
    }

    pub fn container_status(&self, id: &str) -> Result<rpc::cri::ContainerStatus, VimanaError> {
        trace_fn!("Registry::container_status");

        let containers = lock_ptr!(self.containers)?;
        let container = containers
            .get(id)
            .ok_or_else(|| VimanaError::NotFound(id.to_string()))?;
        Ok(rpc::cri::ContainerStatus::from(container))
    }

    pub fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>, VimanaError> {
        trace_fn!("Registry::list_containers");

        let containers = lock_ptr!(self.containers)?;
        let items = containers
            .values()
            .filter(|c| match &filter {
                None => true,
                Some(f) => {
                    let id_ok = f.id.is_empty() || f.id == c.id();
                    let pod_ok = f.pod_sandbox_id.is_empty() || f.pod_sandbox_id == c.pod_id();
                    let state_ok = f
                        .state
                        .as_ref()
                        .map(|s| {
                            rpc::cri::ContainerState::try_from(s.state)
                                .unwrap_or(rpc::cri::ContainerState::ContainerUnknown)
                                == rpc::cri::ContainerState::from(c.state)
                        })
                        .unwrap_or(true);
                    let labels_ok = f
                        .label_selector
                        .iter()
                        .all(|(k, v)| c.labels.get(k).map(|lv| lv == v).unwrap_or(false));
                    id_ok && pod_ok && state_ok && labels_ok
                }
            })
            .map(Container::from)
            .collect();

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use rpc::cri::{ContainerMetadata, ImageSpec, PodSandboxMetadata};

    use super::*;
    use crate::engine::NoopEngine;

    /// Writes a shell script standing in for a CNI IPAM plugin. Every
    /// invocation is appended to `log_path` as `"<command> <container_id>"`,
    /// so tests can assert how many times `ADD`/`DEL` actually ran.
    async fn logging_ipam_plugin(dir: &std::path::Path, log_path: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("ipam.sh");
        let script = format!(
            r#"#!/bin/sh
echo "$CNI_COMMAND $CNI_CONTAINERID" >> {log}
if [ "$CNI_COMMAND" = "ADD" ]; then
  echo '{{"cniVersion":"1.0.0","ips":[{{"address":"10.1.2.3/24"}}]}}'
else
  echo '{{"cniVersion":"1.0.0"}}'
fi
"#,
            log = log_path.display()
        );
        tokio::fs::write(&path, script).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    async fn test_registry(dir: &std::path::Path, log_path: &std::path::Path) -> Registry {
        test_registry_with_engine(dir, log_path, Arc::new(NoopEngine)).await
    }

    async fn test_registry_with_engine(
        dir: &std::path::Path,
        log_path: &std::path::Path,
        engine: Arc<dyn Engine>,
    ) -> Registry {
        let plugin = logging_ipam_plugin(dir, log_path).await;
        let cidr: ipnetwork::IpNetwork = "10.1.2.0/24".parse().unwrap();
        let network = Arc::new(NetworkAllocator::new(plugin, cidr, "vimana0"));
        Registry::new(network, engine)
    }

    /// Records every `start` invocation instead of actually starting anything,
    /// so tests can assert the engine seam was reached.
    #[derive(Default)]
    struct CountingEngine {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Engine for CountingEngine {
        fn start(&self, _container_id: &str, _image_id: &str) -> Result<(), VimanaError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn pod_config(domain: &str, service: &str, version: &str, extra_labels: &[(&str, &str)]) -> PodSandboxConfig {
        let mut labels = HashMap::new();
        labels.insert(LABEL_DOMAIN.to_string(), domain.to_string());
        labels.insert(LABEL_SERVICE.to_string(), service.to_string());
        labels.insert(LABEL_VERSION.to_string(), version.to_string());
        for (k, v) in extra_labels {
            labels.insert(k.to_string(), v.to_string());
        }
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: service.to_string(),
                uid: format!("uid-{service}"),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            hostname: String::new(),
            labels,
            annotations: HashMap::new(),
            ..Default::default()
        }
    }

    async fn count_calls(log_path: &std::path::Path, command: &str) -> usize {
        match tokio::fs::read_to_string(log_path).await {
            Ok(contents) => contents
                .lines()
                .filter(|line| line.starts_with(command))
                .count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn list_pod_sandbox_filters_by_label_selector() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ipam.log");
        let registry = test_registry(dir.path(), &log_path).await;

        registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "a", "1.0.0", &[("tier", "front")]),
                "vimana".to_string(),
            )
            .await
            .unwrap();
        registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "b", "1.0.0", &[("tier", "back")]),
                "vimana".to_string(),
            )
            .await
            .unwrap();

        let mut selector = HashMap::new();
        selector.insert("tier".to_string(), "front".to_string());
        let filter = PodSandboxFilter {
            id: String::new(),
            state: None,
            label_selector: selector,
        };

        let items = registry.list_pod_sandbox(Some(filter)).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].metadata.as_ref().unwrap().name, "a");
    }

    #[tokio::test]
    async fn list_containers_filters_by_label_selector() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ipam.log");
        let registry = test_registry(dir.path(), &log_path).await;

        let pod_id = registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "svc", "1.0.0", &[]),
                "vimana".to_string(),
            )
            .await
            .unwrap();

        let mut labels = HashMap::new();
        labels.insert("tier".to_string(), "front".to_string());
        registry
            .create_container(
                &pod_id,
                ContainerConfig {
                    metadata: Some(ContainerMetadata {
                        name: "svc".to_string(),
                        attempt: 0,
                    }),
                    image: Some(ImageSpec {
                        image: "127.0.0.1:5000/".to_string() + &"d".repeat(32) + "/7377:1.0.0",
                        ..Default::default()
                    }),
                    labels,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut matching = HashMap::new();
        matching.insert("tier".to_string(), "front".to_string());
        let hit = registry
            .list_containers(Some(ContainerFilter {
                id: String::new(),
                pod_sandbox_id: String::new(),
                state: None,
                label_selector: matching,
            }))
            .unwrap();
        assert_eq!(hit.len(), 1);

        let mut missing = HashMap::new();
        missing.insert("tier".to_string(), "back".to_string());
        let miss = registry
            .list_containers(Some(ContainerFilter {
                id: String::new(),
                pod_sandbox_id: String::new(),
                state: None,
                label_selector: missing,
            }))
            .unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn stop_pod_sandbox_releases_ip_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ipam.log");
        let registry = test_registry(dir.path(), &log_path).await;

        let pod_id = registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "svc", "1.0.0", &[]),
                "vimana".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(count_calls(&log_path, "ADD").await, 1);

        registry.stop_pod_sandbox(&pod_id).await.unwrap();
        // Stopping an already-stopped sandbox must not release the address a
        // second time.
        registry.stop_pod_sandbox(&pod_id).await.unwrap();

        assert_eq!(count_calls(&log_path, "DEL").await, 1);
    }

    #[tokio::test]
    async fn remove_pod_sandbox_after_stop_does_not_release_again() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ipam.log");
        let registry = test_registry(dir.path(), &log_path).await;

        let pod_id = registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "svc", "1.0.0", &[]),
                "vimana".to_string(),
            )
            .await
            .unwrap();

        registry.stop_pod_sandbox(&pod_id).await.unwrap();
        assert_eq!(count_calls(&log_path, "DEL").await, 1);

        registry.remove_pod_sandbox(&pod_id).await.unwrap();
        assert_eq!(count_calls(&log_path, "DEL").await, 1);
    }

    #[tokio::test]
    async fn run_pod_sandbox_stamps_the_requested_runtime_handler() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ipam.log");
        let registry = test_registry(dir.path(), &log_path).await;

        let pod_id = registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "svc", "1.0.0", &[]),
                "vimana".to_string(),
            )
            .await
            .unwrap();

        let status = registry.pod_sandbox_status(&pod_id).unwrap();
        assert_eq!(status.runtime_handler, "vimana");
    }

    #[tokio::test]
    async fn start_container_invokes_the_engine_hook() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("ipam.log");
        let engine = Arc::new(CountingEngine::default());
        let registry = test_registry_with_engine(dir.path(), &log_path, engine.clone()).await;

        let pod_id = registry
            .run_pod_sandbox(
                pod_config(&"d".repeat(32), "svc", "1.0.0", &[]),
                "vimana".to_string(),
            )
            .await
            .unwrap();
        let container_id = registry
            .create_container(
                &pod_id,
                ContainerConfig {
                    metadata: Some(ContainerMetadata {
                        name: "svc".to_string(),
                        attempt: 0,
                    }),
                    image: Some(ImageSpec {
                        image: "127.0.0.1:5000/".to_string() + &"d".repeat(32) + "/7377:1.0.0",
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        registry.start_container(&container_id).unwrap();

        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let status = registry.container_status(&container_id).unwrap();
        assert_eq!(status.state(), rpc::cri::ContainerState::ContainerRunning);
    }
}
