//! The service registry: address pool, services and real servers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use log::{debug, info, warn};

use crate::error::Result;
use crate::exec::CommandRunner;
use crate::pool::AddressPool;
use crate::real_server::RealServer;
use crate::service::Service;
use crate::types::{ContainerInfo, NetworkInfo, Protocol};

/// Owns every piece of load-balancing state for one network.
///
/// All mutation funnels through here, one event at a time; services
/// and real servers only ever touch their own sub-state.
pub struct IpvsNet {
    host_iface: String,
    netns_dir: String,
    pool: AddressPool,
    services: HashMap<String, Service>,
    real_servers: HashMap<String, RealServer>,
    /// Containers currently on the network, by id. Kept so membership
    /// checks and disconnects never need a runtime round-trip.
    members: HashMap<String, Ipv4Addr>,
    exec: Arc<dyn CommandRunner>,
}

impl IpvsNet {
    pub fn new(
        subnet: Ipv4Net,
        host_iface: &str,
        netns_dir: &str,
        exec: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            host_iface: host_iface.to_string(),
            netns_dir: netns_dir.to_string(),
            pool: AddressPool::new(subnet),
            services: HashMap::new(),
            real_servers: HashMap::new(),
            members: HashMap::new(),
            exec,
        }
    }

    /// Folds a fresh network snapshot into the pool and member cache:
    /// the gateway and every member address become reserved. Safe to
    /// repeat, reservation is idempotent.
    pub fn reconcile_members(&mut self, info: &NetworkInfo) {
        if let Some(gateway) = info.gateway {
            self.pool.reserve(gateway);
        }
        for member in &info.members {
            self.pool.reserve(member.ip);
            self.members.insert(member.container_id.clone(), member.ip);
        }
    }

    pub fn is_member(&self, container_id: &str) -> bool {
        self.members.contains_key(container_id)
    }

    /// Handles a container joining the network: reserves its address,
    /// brings its service up (allocating the virtual IP on first use)
    /// and adds the container under every tcp port it exposes.
    ///
    /// Containers exposing no ports are not load-balanced and are
    /// ignored entirely. Replays for an already-attached container
    /// change nothing.
    pub async fn add_real_server(&mut self, info: &ContainerInfo) -> Result<()> {
        if info.ports.is_empty() {
            debug!("{} exposes no ports, ignoring", info);
            return Ok(());
        }
        let ip = match info.ip {
            Some(ip) => ip,
            None => {
                warn!("{} has no address on the managed network, skipping", info);
                return Ok(());
            }
        };
        let pid = match info.pid {
            Some(pid) if pid > 0 => pid,
            _ => {
                warn!("{} has no running process, skipping", info);
                return Ok(());
            }
        };

        let exec = Arc::clone(&self.exec);
        self.pool.reserve(ip);
        self.members.insert(info.id.clone(), ip);

        let real = match self.real_servers.entry(info.id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let real = RealServer::bring_up(ip, pid, &self.netns_dir, exec.as_ref()).await;
                entry.insert(real)
            }
        };

        let service = match self.services.entry(info.service.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let vip = self.pool.allocate()?;
                self.pool.reserve(vip);
                info!("Service {} available at {}", info.service, vip);
                let service =
                    Service::bring_up(&info.service, vip, &self.host_iface, exec.as_ref()).await;
                entry.insert(service)
            }
        };

        info!("Adding {} to virtual server at {}", info, service.vip());
        for spec in &info.ports {
            if spec.protocol != Protocol::Tcp {
                debug!("Skipping {}/{} on {}, only tcp is balanced", spec.port, spec.protocol, info);
                continue;
            }
            service.add_real(real, spec.port, exec.as_ref()).await;
        }
        Ok(())
    }

    /// Handles a container leaving the network: detaches it from every
    /// service and frees its address. Containers that never became
    /// real servers are ignored.
    pub async fn remove_real_server(&mut self, container_id: &str) -> Result<()> {
        self.members.remove(container_id);

        let real = match self.real_servers.remove(container_id) {
            Some(real) => real,
            None => {
                debug!("No real server for container {}, ignoring", container_id);
                return Ok(());
            }
        };

        let exec = Arc::clone(&self.exec);
        let rip = real.rip();
        info!("Removing real server {} for container {}", rip, container_id);
        real.remove(&mut self.services, exec.as_ref()).await;
        self.pool.free(rip)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    #[cfg(test)]
    pub fn real_server(&self, container_id: &str) -> Option<&RealServer> {
        self.real_servers.get(container_id)
    }

    #[cfg(test)]
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }
}
