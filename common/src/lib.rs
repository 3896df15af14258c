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

pub mod trace;

use std::sync::Arc;
use thiserror::Error;
use tonic::Status;
use tracing_subscriber::filter::ParseError;

/// Errors surfaced at the CRI boundary. `From<VimanaError> for Status` is the
/// single place the node-daemon's error table (spec §7) is encoded: unknown id
/// -> NotFound, bad state -> FailedPrecondition, exhausted IP pool ->
/// ResourceExhausted, and so on.
#[derive(Error, Debug)]
pub enum VimanaError {
    #[error("'{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    DataLoss(String),

    #[error("{0}")]
    Internal(String),
}

impl From<VimanaError> for Status {
    fn from(value: VimanaError) -> Self {
        match value {
            VimanaError::NotFound(s) => Status::not_found(s),
            VimanaError::FailedPrecondition(s) => Status::failed_precondition(s),
            VimanaError::ResourceExhausted(s) => Status::resource_exhausted(s),
            VimanaError::InvalidArgument(s) => Status::invalid_argument(s),
            VimanaError::Unavailable(s) => Status::unavailable(s),
            VimanaError::DataLoss(s) => Status::data_loss(s),
            VimanaError::Internal(s) => Status::internal(s),
        }
    }
}

impl From<std::io::Error> for VimanaError {
    fn from(value: std::io::Error) -> Self {
        VimanaError::Internal(value.to_string())
    }
}

impl From<ParseError> for VimanaError {
    fn from(value: ParseError) -> Self {
        VimanaError::Internal(value.to_string())
    }
}

pub type MutexPtr<T> = Arc<std::sync::Mutex<T>>;

pub fn new_ptr<T>(t: T) -> MutexPtr<T> {
    Arc::new(std::sync::Mutex::new(t))
}

#[macro_export]
macro_rules! lock_ptr {
    ( $mutex_arc:expr ) => {
        $mutex_arc
            .lock()
            .map_err(|_| $crate::VimanaError::Internal("mutex ptr".to_string()))
    };
}

pub fn init_logger() -> Result<(), VimanaError> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("h2=error".parse()?)
        .add_directive("hyper_util=error".parse()?)
        .add_directive("tower=error".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_from_vimana_error_to_status() {
        let error = VimanaError::NotFound("pod".to_string());
        let status = Status::from(error);
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "pod");

        let error = VimanaError::FailedPrecondition("bad state".to_string());
        let status = Status::from(error);
        assert_eq!(status.code(), Code::FailedPrecondition);

        let error = VimanaError::ResourceExhausted("no ips".to_string());
        let status = Status::from(error);
        assert_eq!(status.code(), Code::ResourceExhausted);

        let error = VimanaError::DataLoss("digest mismatch".to_string());
        let status = Status::from(error);
        assert_eq!(status.code(), Code::DataLoss);
    }
}
