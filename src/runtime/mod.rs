use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{ContainerInfo, Event, NetworkInfo};

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Watch the runtime for lifecycle events on the managed network.
    /// Typed events are sent to the provided channel; runs until the
    /// receiving side goes away.
    async fn watch(&self, events: mpsc::Sender<Event>) -> Result<()>;

    /// Resolve a container's identity, namespace pid, exposed ports
    /// and current address on the managed network.
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo>;

    /// Snapshot the managed network's subnet, gateway and membership.
    async fn network_state(&self) -> Result<NetworkInfo>;

    /// Connect a container to the managed network.
    async fn connect_container(&self, container_id: &str) -> Result<()>;
}
