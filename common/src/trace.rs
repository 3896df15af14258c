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

/// Marker trait for the `trace_fn!` call-site logging convention: every
/// public entry point on a subsystem (registry, image store, allocator) logs
/// its own name at `trace` level on entry, so a `RUST_LOG=trace` run reads as
/// a call trace without instrumenting every call site by hand.
pub trait TraceFn {
    fn trace_fn(name: &str);
}

impl<T> TraceFn for T {
    fn trace_fn(name: &str) {
        tracing::trace!("-> {}", name);
    }
}

#[macro_export]
macro_rules! trace_fn {
    ($name:expr) => {
        <() as $crate::trace::TraceFn>::trace_fn($name)
    };
}
