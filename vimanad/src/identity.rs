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

use common::VimanaError;

pub const MANAGED_POD_PREFIX: &str = "p-";
pub const MANAGED_CONTAINER_PREFIX: &str = "c-";

/// The (domain, service, version, attempt) tuple that names a managed pod, and
/// by extension its single container. Pod and container ids are both pure
/// functions of this tuple: `c-X` is always the same text as `p-X` with the
/// prefix swapped, so the bijection holds without being tracked separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodIdentity {
    pub domain: String,
    pub service: String,
    pub version: String,
    pub attempt: u32,
}

/// The part of a `p-`/`c-` id after the two-character prefix, e.g.
/// `D:S@1.2.3#0`. Shared between pod id and container id.
fn suffix(domain: &str, service: &str, version: &str, attempt: u32) -> String {
    format!("{domain}:{service}@{version}#{attempt}")
}

impl PodIdentity {
    pub fn new(domain: impl Into<String>, service: impl Into<String>, version: impl Into<String>, attempt: u32) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            version: version.into(),
            attempt,
        }
    }

    /// The `(domain, service, version)` triple that attempt counters are
    /// allocated under.
    pub fn triple(&self) -> (String, String, String) {
        (self.domain.clone(), self.service.clone(), self.version.clone())
    }

    pub fn pod_id(&self) -> String {
        format!(
            "{MANAGED_POD_PREFIX}{}",
            suffix(&self.domain, &self.service, &self.version, self.attempt)
        )
    }

    pub fn container_id(&self) -> String {
        format!(
            "{MANAGED_CONTAINER_PREFIX}{}",
            suffix(&self.domain, &self.service, &self.version, self.attempt)
        )
    }

    pub fn parse_pod_id(id: &str) -> Result<Self, VimanaError> {
        let rest = id
            .strip_prefix(MANAGED_POD_PREFIX)
            .ok_or_else(|| VimanaError::InvalidArgument(format!("not a managed pod id: {id}")))?;
        Self::parse_suffix(rest)
    }

    pub fn parse_container_id(id: &str) -> Result<Self, VimanaError> {
        let rest = id.strip_prefix(MANAGED_CONTAINER_PREFIX).ok_or_else(|| {
            VimanaError::InvalidArgument(format!("not a managed container id: {id}"))
        })?;
        Self::parse_suffix(rest)
    }

    fn parse_suffix(rest: &str) -> Result<Self, VimanaError> {
        let (domain, rest) = rest
            .split_once(':')
            .ok_or_else(|| VimanaError::InvalidArgument(format!("malformed id suffix: {rest}")))?;
        let (service, rest) = rest
            .rsplit_once('@')
            .ok_or_else(|| VimanaError::InvalidArgument(format!("malformed id suffix: {rest}")))?;
        let (version, attempt) = rest
            .rsplit_once('#')
            .ok_or_else(|| VimanaError::InvalidArgument(format!("malformed id suffix: {rest}")))?;
        let attempt: u32 = attempt
            .parse()
            .map_err(|_| VimanaError::InvalidArgument(format!("bad attempt number: {attempt}")))?;

        Ok(Self::new(domain, service, version, attempt))
    }
}

pub fn is_managed_pod_id(id: &str) -> bool {
    id.starts_with(MANAGED_POD_PREFIX)
}

pub fn is_managed_container_id(id: &str) -> bool {
    id.starts_with(MANAGED_CONTAINER_PREFIX)
}

/// Lowercase hex of the UTF-8 bytes of `service`, with the two nibbles of
/// each byte swapped. Fixed encoding for interop with the image pusher.
pub fn encode_service_hex(service: &str) -> String {
    let mut out = String::with_capacity(service.len() * 2);
    for byte in service.as_bytes() {
        out.push(std::char::from_digit((byte & 0x0f) as u32, 16).expect("nibble"));
        out.push(std::char::from_digit(((byte >> 4) & 0x0f) as u32, 16).expect("nibble"));
    }
    out
}

pub fn decode_service_hex(hex: &str) -> Result<String, VimanaError> {
    let chars: Vec<char> = hex.chars().collect();
    if chars.len() % 2 != 0 {
        return Err(VimanaError::InvalidArgument(format!(
            "odd-length service-hex: {hex}"
        )));
    }

    let mut bytes = Vec::with_capacity(chars.len() / 2);
    for pair in chars.chunks(2) {
        let lo = pair[0]
            .to_digit(16)
            .ok_or_else(|| VimanaError::InvalidArgument(format!("bad service-hex: {hex}")))?;
        let hi = pair[1]
            .to_digit(16)
            .ok_or_else(|| VimanaError::InvalidArgument(format!("bad service-hex: {hex}")))?;
        bytes.push(((hi << 4) | lo) as u8);
    }

    String::from_utf8(bytes)
        .map_err(|_| VimanaError::InvalidArgument(format!("service-hex is not utf8: {hex}")))
}

/// The canonical image id: `host:port/domain/service-hex:version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageId {
    pub host: String,
    pub port: u16,
    pub domain: String,
    pub service: String,
    pub version: String,
}

impl ImageId {
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}/{}/{}:{}",
            self.host,
            self.port,
            self.domain,
            encode_service_hex(&self.service),
            self.version
        )
    }

    pub fn parse(image: &str) -> Result<Self, VimanaError> {
        let bad = || VimanaError::InvalidArgument(format!("unparseable image id: {image}"));

        let mut parts = image.splitn(3, '/');
        let host_port = parts.next().ok_or_else(bad)?;
        let domain = parts.next().ok_or_else(bad)?;
        let service_version = parts.next().ok_or_else(bad)?;

        let (host, port) = host_port.rsplit_once(':').ok_or_else(bad)?;
        let port: u16 = port.parse().map_err(|_| bad())?;

        let (service_hex, version) = service_version.rsplit_once(':').ok_or_else(bad)?;
        let service = decode_service_hex(service_hex)?;

        Ok(Self {
            host: host.to_string(),
            port,
            domain: domain.to_string(),
            service,
            version: version.to_string(),
        })
    }
}
