use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, EndpointSettings};
use bollard::network::{ConnectNetworkOptions, InspectNetworkOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::ContainerRuntime;
use crate::error::Error;
use crate::types::{ContainerInfo, Event, NetworkInfo, NetworkMember, PortSpec};

pub struct DockerRuntime {
    docker: Docker,
    network: String,
}

impl DockerRuntime {
    pub fn new(network: String) -> Result<Self> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        let docker =
            Docker::connect_with_local_defaults().context("connecting to Docker daemon")?;
        Ok(Self { docker, network })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn watch(&self, events: mpsc::Sender<Event>) -> Result<()> {
        loop {
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["network"].as_slice()),
                    ("event", ["connect", "disconnect"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));
            info!("Listening for Docker network events...");

            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(raw) => {
                        let event = match Event::try_from(raw) {
                            Ok(event) => event,
                            Err(e) => {
                                debug!("Skipping event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = events.send(event).await {
                            error!("Failed to forward event: {}", e);
                            return Err(anyhow!("Channel closed"));
                        }
                    }
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to resubscribe
                    }
                }
            }

            warn!("Docker event stream ended. Resubscribing in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let detail = match self.docker.inspect_container(container_id, None).await {
            Ok(detail) => detail,
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(Error::UnknownContainer(container_id.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let id = detail.id.clone().unwrap_or_else(|| container_id.to_string());
        let name = detail
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());
        let service = service_name(&detail, &id);
        let pid = detail
            .state
            .as_ref()
            .and_then(|state| state.pid)
            .filter(|pid| *pid > 0);
        let ip = ip_on_network(&detail, &self.network);
        let ports = exposed_ports(&detail);

        Ok(ContainerInfo {
            id,
            name,
            service,
            pid,
            ip,
            ports,
        })
    }

    async fn network_state(&self) -> Result<NetworkInfo> {
        let detail = self
            .docker
            .inspect_network(&self.network, None::<InspectNetworkOptions<String>>)
            .await
            .with_context(|| format!("inspecting network {}", self.network))?;

        let name = detail.name.clone().unwrap_or_else(|| self.network.clone());

        let ipam_config = detail
            .ipam
            .as_ref()
            .and_then(|ipam| ipam.config.as_ref())
            .and_then(|configs| configs.iter().find(|c| c.subnet.is_some()))
            .cloned()
            .ok_or_else(|| anyhow!("network {} has no IPAM subnet", self.network))?;

        let subnet = ipam_config
            .subnet
            .as_deref()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("invalid subnet for network {}", self.network))?;
        let gateway = ipam_config
            .gateway
            .as_deref()
            .and_then(|gateway| gateway.parse().ok());

        let mut members = Vec::new();
        if let Some(containers) = &detail.containers {
            for (container_id, endpoint) in containers {
                // Addresses come back as `addr/prefix`.
                let address = endpoint.ipv4_address.as_deref().unwrap_or_default();
                let address = address.split('/').next().unwrap_or_default();
                match address.parse() {
                    Ok(ip) => members.push(NetworkMember {
                        container_id: container_id.clone(),
                        ip,
                    }),
                    Err(_) => debug!("Member {} has no IPv4 address, skipping", container_id),
                }
            }
        }

        Ok(NetworkInfo {
            name,
            subnet,
            gateway,
            members,
        })
    }

    async fn connect_container(&self, container_id: &str) -> Result<()> {
        info!(
            "Connecting container {} to network {}",
            container_id, self.network
        );
        let options = ConnectNetworkOptions {
            container: container_id,
            endpoint_config: EndpointSettings::default(),
        };
        self.docker
            .connect_network(&self.network, options)
            .await
            .with_context(|| format!("connecting {} to network {}", container_id, self.network))?;
        Ok(())
    }
}

/// Derives the logical service name from the container's image
/// reference: digests and tags are stripped and path separators
/// flattened, so `registry.example.com/team/app:1.2` becomes
/// `registry.example.com-team-app`. Bare image ids fall back to
/// their first 12 hex digits.
fn service_name(detail: &ContainerInspectResponse, container_id: &str) -> String {
    let image = detail
        .config
        .as_ref()
        .and_then(|config| config.image.as_deref())
        .unwrap_or_default();

    if let Some(id) = image.strip_prefix("sha256:") {
        let short: String = id.chars().take(12).collect();
        if !short.is_empty() {
            return short;
        }
    }

    let image = image.split('@').next().unwrap_or(image);
    let image = match image.rsplit_once(':') {
        // A `/` after the last colon means it was a registry port,
        // not a tag.
        Some((name, tag)) if !tag.contains('/') => name,
        _ => image,
    };

    let service = image.replace('/', "-");
    if service.is_empty() {
        container_id.chars().take(12).collect()
    } else {
        service
    }
}

fn ip_on_network(detail: &ContainerInspectResponse, network: &str) -> Option<Ipv4Addr> {
    detail
        .network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .get(network)?
        .ip_address
        .as_deref()
        .and_then(|ip| ip.parse().ok())
}

fn exposed_ports(detail: &ContainerInspectResponse) -> Vec<PortSpec> {
    let mut ports = Vec::new();
    if let Some(exposed) = detail
        .config
        .as_ref()
        .and_then(|config| config.exposed_ports.as_ref())
    {
        for spec in exposed.keys() {
            match spec.parse::<PortSpec>() {
                Ok(port) => ports.push(port),
                Err(e) => warn!("Ignoring exposed port: {}", e),
            }
        }
    }
    ports.sort_by_key(|spec| spec.port);
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use bollard::models::{ContainerConfig, NetworkSettings};
    use std::collections::HashMap;

    fn with_image(image: &str) -> ContainerInspectResponse {
        ContainerInspectResponse {
            config: Some(ContainerConfig {
                image: Some(image.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_name_strips_tags_and_digests() {
        assert_eq!(service_name(&with_image("nginx:latest"), "c0"), "nginx");
        assert_eq!(service_name(&with_image("nginx"), "c0"), "nginx");
        assert_eq!(
            service_name(&with_image("registry.example.com/team/app:1.2"), "c0"),
            "registry.example.com-team-app"
        );
        assert_eq!(
            service_name(&with_image("nginx@sha256:f2b015d9"), "c0"),
            "nginx"
        );
        assert_eq!(
            service_name(&with_image("localhost:5000/app"), "c0"),
            "localhost:5000-app"
        );
    }

    #[test]
    fn service_name_shortens_image_ids() {
        assert_eq!(
            service_name(
                &with_image("sha256:4bcdc3a4c577a80cd089a84cbb7260b042938fd6b1b5b35430cba7e8dcf4d6c1"),
                "c0"
            ),
            "4bcdc3a4c577"
        );
    }

    #[test]
    fn service_name_falls_back_to_the_container_id() {
        assert_eq!(
            service_name(&ContainerInspectResponse::default(), "9f86d081884c7d659a2f"),
            "9f86d081884c"
        );
    }

    #[test]
    fn exposed_ports_are_parsed_and_sorted() {
        let mut exposed = HashMap::new();
        exposed.insert("9000/tcp".to_string(), HashMap::new());
        exposed.insert("80/tcp".to_string(), HashMap::new());
        exposed.insert("53/udp".to_string(), HashMap::new());
        exposed.insert("not-a-port".to_string(), HashMap::new());
        let detail = ContainerInspectResponse {
            config: Some(ContainerConfig {
                exposed_ports: Some(exposed),
                ..Default::default()
            }),
            ..Default::default()
        };

        let ports = exposed_ports(&detail);
        assert_eq!(
            ports,
            vec![
                PortSpec { port: 53, protocol: Protocol::Udp },
                PortSpec { port: 80, protocol: Protocol::Tcp },
                PortSpec { port: 9000, protocol: Protocol::Tcp },
            ]
        );
    }

    #[test]
    fn ip_lookup_is_scoped_to_the_managed_network() {
        let mut networks = HashMap::new();
        networks.insert(
            "lbnet".to_string(),
            EndpointSettings {
                ip_address: Some("10.0.0.2".to_string()),
                ..Default::default()
            },
        );
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.2".to_string()),
                ..Default::default()
            },
        );
        let detail = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(ip_on_network(&detail, "lbnet"), "10.0.0.2".parse().ok());
        assert_eq!(ip_on_network(&detail, "other"), None);
    }

    #[test]
    fn empty_addresses_do_not_parse() {
        let mut networks = HashMap::new();
        networks.insert(
            "lbnet".to_string(),
            EndpointSettings {
                ip_address: Some(String::new()),
                ..Default::default()
            },
        );
        let detail = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ip_on_network(&detail, "lbnet"), None);
    }
}
