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

mod dispatcher;
mod engine;
mod identity;
mod image_store;
mod network;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ipnetwork::IpNetwork;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

use cri::{Downstream, GrpcDownstream};
use rpc::cri::image_service_server::ImageServiceServer;
use rpc::cri::runtime_service_server::RuntimeServiceServer;

use common::VimanaError;
use dispatcher::Dispatcher;
use engine::NoopEngine;
use image_store::puller::Puller;
use image_store::ImageStore;
use network::NetworkAllocator;
use registry::Registry;

/// Node-local daemon that speaks the Kubernetes Container Runtime Interface
/// and executes WebAssembly components, delegating every request it does not
/// manage itself to a downstream OCI runtime over a Unix domain socket.
#[derive(Parser, Debug)]
#[command(name = "vimanad", about = "CRI runtime for WebAssembly components")]
struct Cli {
    /// Unix domain socket this daemon listens on for CRI requests.
    #[arg(long)]
    incoming: PathBuf,

    /// Unix domain socket of the downstream OCI runtime.
    #[arg(long)]
    downstream: PathBuf,

    /// Root directory of the on-disk component image store.
    #[arg(long = "image-store")]
    image_store: PathBuf,

    /// Comma-separated host:port registries reachable over plain HTTP.
    #[arg(long = "insecure-registries", value_delimiter = ',')]
    insecure_registries: Vec<String>,

    /// Executable invoked as a CNI-style IPAM plugin for address allocation.
    #[arg(long = "ipam-plugin")]
    ipam_plugin: PathBuf,

    /// Network interface exposed to pods.
    #[arg(long = "network-interface")]
    network_interface: String,

    /// CIDR address pool handed to the IPAM plugin.
    #[arg(long = "pod-ips")]
    pod_ips: IpNetwork,
}

#[tokio::main]
async fn main() -> Result<(), VimanaError> {
    common::init_logger()?;

    let cli = Cli::parse();
    info!(?cli, "starting vimanad");

    let network = Arc::new(NetworkAllocator::new(
        cli.ipam_plugin,
        cli.pod_ips,
        cli.network_interface,
    ));
    // No Wasm engine is wired in yet; `StartContainer` still calls through the
    // `Engine` seam so a real one drops in without touching the registry.
    let registry = Registry::new(network, Arc::new(NoopEngine));
    let image_store = ImageStore::new(cli.image_store);
    let puller = Puller::new(cli.insecure_registries);

    let downstream_path = cli
        .downstream
        .to_str()
        .ok_or_else(|| VimanaError::InvalidArgument("--downstream is not valid UTF-8".into()))?;
    let grpc_downstream = GrpcDownstream::connect(downstream_path).await?;
    let raw_channel = grpc_downstream.channel();
    let downstream: Arc<dyn Downstream> = Arc::new(grpc_downstream);

    // Managed pod/container state lives only in memory and does not survive a
    // restart; this call exists purely to learn which ids the downstream
    // runtime already owns, so startup logs make restarts easy to diagnose.
    match downstream
        .list_pod_sandbox(rpc::cri::ListPodSandboxRequest { filter: None })
        .await
    {
        Ok(existing) => info!(count = existing.items.len(), "downstream pods present at startup"),
        Err(e) => tracing::warn!("failed to list downstream pods at startup: {e}"),
    }

    let dispatcher = Dispatcher::new(registry, image_store, puller, downstream, Some(raw_channel));

    if cli.incoming.exists() {
        tokio::fs::remove_file(&cli.incoming).await?;
    }
    let listener = UnixListener::bind(&cli.incoming)?;
    info!(incoming = %cli.incoming.display(), "listening");

    Server::builder()
        .add_service(RuntimeServiceServer::new(dispatcher.clone()))
        .add_service(ImageServiceServer::new(dispatcher))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await
        .map_err(|e| VimanaError::Internal(format!("server exited: {e}")))?;

    Ok(())
}
