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

/// The entry point into the Wasm engine that actually executes a component.
/// This is the one seam `Registry::start_container` reaches through, mirroring
/// the role [`cri::Downstream`] plays for the delegate runtime: the registry
/// only knows that *something* answers `start`, not how a component is
/// instantiated or scheduled onto a worker.
pub trait Engine: Send + Sync {
    /// Invoked once, synchronously, before a container transitions to
    /// `Running`. `image_id` is the canonical image reference the container
    /// was created with, which is what a real engine would resolve into a
    /// loaded component.
    fn start(&self, container_id: &str, image_id: &str) -> Result<(), VimanaError>;
}

/// Engine that accepts every start request without doing anything. Used
/// until a real Wasm engine is wired in, and in tests.
pub struct NoopEngine;

impl Engine for NoopEngine {
    fn start(&self, _container_id: &str, _image_id: &str) -> Result<(), VimanaError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_engine_always_succeeds() {
        assert!(NoopEngine.start("c-anything", "host:1/domain/hex:1.0.0").is_ok());
    }
}
