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

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

use common::{trace_fn, VimanaError};

const CNI_VERSION: &str = "1.0.0";
const NETWORK_NAME: &str = "vimana";
const IPAM_TYPE: &str = "host-local";
const DATA_DIR: &str = "/run/cni-ipam-state";

#[derive(Serialize)]
struct Range {
    subnet: String,
}

#[derive(Serialize)]
struct Ipam {
    #[serde(rename = "type")]
    kind: String,
    ranges: Vec<Vec<Range>>,
    #[serde(rename = "dataDir")]
    data_dir: String,
}

#[derive(Serialize)]
struct CniConfig {
    #[serde(rename = "cniVersion")]
    cni_version: String,
    name: String,
    ipam: Ipam,
}

#[derive(Deserialize)]
struct CniIp {
    address: String,
}

#[derive(Deserialize)]
struct CniResult {
    #[serde(default)]
    ips: Vec<CniIp>,
    code: Option<i64>,
    #[serde(default)]
    msg: String,
}

/// Invokes a CNI-style IPAM plugin binary as a one-shot child process per
/// allocation/release, the same shape `host_shim` uses for launching a
/// subprocess and collecting its output, simplified to a request/response
/// call rather than a supervised long-lived instance.
pub struct NetworkAllocator {
    plugin: std::path::PathBuf,
    cidr: IpNetwork,
    interface: String,
    // The plugin keeps its own on-disk database; invoking it concurrently
    // would race against that file, so only one invocation runs at a time.
    invoke_lock: Mutex<()>,
}

impl NetworkAllocator {
    pub fn new(
        plugin: impl Into<std::path::PathBuf>,
        cidr: IpNetwork,
        interface: impl Into<String>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            cidr,
            interface: interface.into(),
            invoke_lock: Mutex::new(()),
        }
    }

    async fn invoke(&self, command: &str, container_id: &str) -> Result<CniResult, VimanaError> {
        let _guard = self.invoke_lock.lock().await;

        let config = CniConfig {
            cni_version: CNI_VERSION.to_string(),
            name: NETWORK_NAME.to_string(),
            ipam: Ipam {
                kind: IPAM_TYPE.to_string(),
                ranges: vec![vec![Range {
                    subnet: self.cidr.to_string(),
                }]],
                data_dir: DATA_DIR.to_string(),
            },
        };
        let stdin_body = serde_json::to_vec(&config)
            .map_err(|e| VimanaError::Internal(format!("encode ipam config: {e}")))?;

        let mut child = Command::new(&self.plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", container_id)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| VimanaError::Internal(format!("spawn ipam plugin: {e}")))?;

        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(&stdin_body)
            .await
            .map_err(|e| VimanaError::Internal(format!("write ipam config: {e}")))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| VimanaError::Internal(format!("ipam plugin exited abnormally: {e}")))?;

        if !output.status.success() {
            return Err(VimanaError::Internal(format!(
                "ipam plugin {command} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| VimanaError::Internal(format!("parse ipam response: {e}")))
    }

    /// Allocates an address for `pod_id`. Fails with `ResourceExhausted` if
    /// the plugin reports no address available.
    pub async fn allocate(&self, pod_id: &str) -> Result<String, VimanaError> {
        trace_fn!("NetworkAllocator::allocate");

        let result = self.invoke("ADD", pod_id).await?;
        if let Some(code) = result.code {
            return Err(VimanaError::ResourceExhausted(format!(
                "ipam plugin returned error {code}: {}",
                result.msg
            )));
        }

        let cidr = result
            .ips
            .first()
            .ok_or_else(|| VimanaError::ResourceExhausted("ipam plugin returned no address".into()))?;

        let address = cidr
            .address
            .split('/')
            .next()
            .unwrap_or(&cidr.address)
            .to_string();

        tracing::debug!(interface = %self.interface, %address, "allocated pod address");

        Ok(address)
    }

    /// Releases the address held by `pod_id`. A missing record is treated as
    /// a warning, not an error, since `DEL` must be idempotent-safe.
    pub async fn release(&self, pod_id: &str) {
        trace_fn!("NetworkAllocator::release");

        if let Err(e) = self.invoke("DEL", pod_id).await {
            warn!("ipam release for {pod_id} reported an error (ignored): {e}");
        }
    }
}
