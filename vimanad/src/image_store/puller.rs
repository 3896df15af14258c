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

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use common::{trace_fn, VimanaError};

use crate::identity::{encode_service_hex, ImageId};

use super::{ImageRecord, ImageStore};

const WASM_CONFIG_MEDIA_TYPE: &str = "application/vnd.wasm.config.v0+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const COMPONENT_LAYER_MEDIA_TYPE: &str = "application/wasm";
const METADATA_LAYER_MEDIA_TYPE: &str = "application/protobuf";

fn verify_digest(bytes: &[u8], digest: &str) -> Result<(), VimanaError> {
    let actual = format!("sha256:{:x}", Sha256::digest(bytes));
    if actual != digest {
        return Err(VimanaError::DataLoss(format!(
            "digest mismatch for {digest}: got {actual}"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Pulls component images from an OCI distribution registry. One-try
/// semantics: the first transport-level response dictates the outcome,
/// matching the registry-client retry policy.
#[derive(Clone)]
pub struct Puller {
    client: reqwest::Client,
    insecure_registries: HashSet<String>,
}

impl Puller {
    pub fn new(insecure_registries: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            insecure_registries: insecure_registries.into_iter().collect(),
        }
    }

    fn base_url(&self, image: &ImageId) -> String {
        let host_port = format!("{}:{}", image.host, image.port);
        let scheme = if self.insecure_registries.contains(&host_port) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{host_port}")
    }

    async fn fetch_manifest(&self, image: &ImageId) -> Result<(Manifest, String), VimanaError> {
        let url = format!(
            "{}/v2/{}/{}/manifests/{}",
            self.base_url(image),
            image.domain,
            encode_service_hex(&image.service),
            image.version
        );

        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.oci.image.manifest.v1+json")
            .send()
            .await
            .map_err(|e| VimanaError::Unavailable(format!("fetch manifest: {e}")))?;

        if !resp.status().is_success() {
            return Err(VimanaError::Unavailable(format!(
                "fetch manifest: registry returned {}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| VimanaError::Unavailable(format!("fetch manifest: {e}")))?;
        let digest = format!("sha256:{:x}", Sha256::digest(&body));

        let manifest = serde_json::from_slice(&body)
            .map_err(|e| VimanaError::InvalidArgument(format!("malformed manifest: {e}")))?;

        Ok((manifest, digest))
    }

    async fn fetch_blob(&self, image: &ImageId, digest: &str) -> Result<Vec<u8>, VimanaError> {
        let url = format!(
            "{}/v2/{}/{}/blobs/{}",
            self.base_url(image),
            image.domain,
            encode_service_hex(&image.service),
            digest
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VimanaError::Unavailable(format!("fetch blob {digest}: {e}")))?;

        if !resp.status().is_success() {
            return Err(VimanaError::Unavailable(format!(
                "fetch blob {digest}: registry returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| VimanaError::Unavailable(format!("fetch blob {digest}: {e}")))?
            .to_vec();

        verify_digest(&bytes, digest)?;

        Ok(bytes)
    }

    fn validate_manifest(manifest: &Manifest) -> Result<(), VimanaError> {
        if manifest.schema_version != 2 {
            return Err(VimanaError::InvalidArgument(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        if manifest.config.media_type != WASM_CONFIG_MEDIA_TYPE
            && manifest.config.media_type != OCI_CONFIG_MEDIA_TYPE
        {
            return Err(VimanaError::InvalidArgument(format!(
                "unsupported config media type {}",
                manifest.config.media_type
            )));
        }
        if manifest.layers.len() != 2 {
            return Err(VimanaError::InvalidArgument(format!(
                "expected exactly two layers, got {}",
                manifest.layers.len()
            )));
        }
        if manifest.layers[0].media_type != COMPONENT_LAYER_MEDIA_TYPE {
            return Err(VimanaError::InvalidArgument(format!(
                "expected first layer {COMPONENT_LAYER_MEDIA_TYPE}, got {}",
                manifest.layers[0].media_type
            )));
        }
        if manifest.layers[1].media_type != METADATA_LAYER_MEDIA_TYPE {
            return Err(VimanaError::InvalidArgument(format!(
                "expected second layer {METADATA_LAYER_MEDIA_TYPE}, got {}",
                manifest.layers[1].media_type
            )));
        }
        Ok(())
    }

    /// Pulls `image` into `store`, returning the canonical image reference.
    /// Pulling the same already-present image a second time performs no
    /// network requests and no writes.
    pub async fn pull(
        &self,
        store: &ImageStore,
        image: &ImageId,
        labels: HashMap<String, String>,
    ) -> Result<String, VimanaError> {
        trace_fn!("Puller::pull");

        let lock = store.lock_for(&image.domain, &image.service, &image.version).await;
        let _guard = lock.lock().await;

        if store
            .get(&image.domain, &image.service, &image.version)
            .await?
            .is_some()
        {
            return Ok(image.canonical());
        }

        let (manifest, manifest_digest) = self.fetch_manifest(image).await?;
        Self::validate_manifest(&manifest)?;

        let component = self.fetch_blob(image, &manifest.layers[0].digest).await?;
        let metadata = self.fetch_blob(image, &manifest.layers[1].digest).await?;

        let record = ImageRecord {
            domain: image.domain.clone(),
            service: image.service.clone(),
            version: image.version.clone(),
            manifest_digest,
            config_digest: manifest.config.digest.clone(),
            component_digest: manifest.layers[0].digest.clone(),
            component_size: manifest.layers[0].size,
            metadata_digest: manifest.layers[1].digest.clone(),
            metadata_size: manifest.layers[1].size,
            labels,
        };

        store.put(&record, &component, &metadata).await?;

        Ok(image.canonical())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn digest_of(bytes: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(bytes))
    }

    async fn respond_once(listener: &TcpListener, content_type: &str, body: &[u8]) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.shutdown().await.unwrap();
    }

    /// Serves one manifest GET followed by two blob GETs, matching the order
    /// `Puller::pull` issues its requests in.
    async fn serve_one_image(manifest: Vec<u8>, component: Vec<u8>, metadata: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            respond_once(&listener, "application/vnd.oci.image.manifest.v1+json", &manifest).await;
            respond_once(&listener, "application/wasm", &component).await;
            respond_once(&listener, "application/protobuf", &metadata).await;
        });

        port
    }

    fn image_at(port: u16) -> ImageId {
        ImageId {
            host: "127.0.0.1".to_string(),
            port,
            domain: "d".repeat(32),
            service: "svc".to_string(),
            version: "1.0.0".to_string(),
        }
    }

    fn manifest_json(component_digest: &str, metadata_digest: &str, component_len: usize, metadata_len: usize) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": WASM_CONFIG_MEDIA_TYPE,
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                "size": 2,
            },
            "layers": [
                {"mediaType": COMPONENT_LAYER_MEDIA_TYPE, "digest": component_digest, "size": component_len},
                {"mediaType": METADATA_LAYER_MEDIA_TYPE, "digest": metadata_digest, "size": metadata_len},
            ],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn pull_then_pull_again_performs_no_second_fetch() {
        let component = b"wasm-bytes".to_vec();
        let metadata = b"meta-bytes".to_vec();
        let manifest = manifest_json(
            &digest_of(&component),
            &digest_of(&metadata),
            component.len(),
            metadata.len(),
        );

        let port = serve_one_image(manifest, component, metadata).await;
        let image = image_at(port);

        let puller = Puller::new(vec![format!("127.0.0.1:{port}")]);
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let first = puller.pull(&store, &image, HashMap::new()).await.unwrap();
        assert_eq!(first, image.canonical());

        // The stub server only answers three requests; a second pull that
        // tried to hit the network again would hang waiting on a fourth
        // accept, so this also proves idempotence.
        let second = puller.pull(&store, &image, HashMap::new()).await.unwrap();
        assert_eq!(second, first);

        let record = store
            .get(&image.domain, &image.service, &image.version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.component_size, 10);
    }

    #[tokio::test]
    async fn tampered_blob_fails_digest_check_and_leaves_no_file() {
        let real_component = b"wasm-bytes".to_vec();
        let metadata = b"meta-bytes".to_vec();
        // Declares a digest that does not match what the server actually sends.
        let manifest = manifest_json(
            &digest_of(b"not-the-real-bytes"),
            &digest_of(&metadata),
            real_component.len(),
            metadata.len(),
        );

        let port = serve_one_image(manifest, real_component, metadata).await;
        let image = image_at(port);

        let puller = Puller::new(vec![format!("127.0.0.1:{port}")]);
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        let err = puller.pull(&store, &image, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, VimanaError::DataLoss(_)));
        assert!(store
            .get(&image.domain, &image.service, &image.version)
            .await
            .unwrap()
            .is_none());
        assert!(!dir.path().join(&image.domain).exists());
    }

    #[test]
    fn validate_manifest_rejects_wrong_layer_count() {
        let manifest: Manifest = serde_json::from_slice(&manifest_json("sha256:a", "sha256:b", 1, 1)).unwrap();
        assert!(Puller::validate_manifest(&manifest).is_ok());

        let mut too_few = manifest;
        too_few.layers.pop();
        assert!(Puller::validate_manifest(&too_few).is_err());
    }

    #[test]
    fn validate_manifest_rejects_bad_schema_version() {
        let mut manifest: Manifest =
            serde_json::from_slice(&manifest_json("sha256:a", "sha256:b", 1, 1)).unwrap();
        manifest.schema_version = 1;
        assert!(Puller::validate_manifest(&manifest).is_err());
    }

    #[test]
    fn verify_digest_catches_mismatch() {
        let bytes = b"hello";
        assert!(verify_digest(bytes, &digest_of(bytes)).is_ok());
        assert!(verify_digest(bytes, "sha256:deadbeef").is_err());
    }
}
