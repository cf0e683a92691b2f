//! A logical service: one virtual IP fronting per-port virtual servers.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use log::info;

use crate::exec::{issue, CommandRunner};
use crate::real_server::RealServer;

/// Interface label for a virtual IP, the address as flat hex.
///
/// Labels become part of interface names (`eth0:<label>`,
/// `lo:<label>`), which the kernel caps at 15 bytes; eight hex digits
/// always fit and stay unique per address.
pub fn vip_label(vip: Ipv4Addr) -> String {
    format!("{:08x}", u32::from(vip))
}

/// One service name's virtual IP and the real servers balanced under
/// each of its ports.
///
/// Port entries exist only while at least one real server is attached;
/// the service itself, and its virtual IP, outlive the last member.
pub struct Service {
    name: String,
    vip: Ipv4Addr,
    virtual_servers: BTreeMap<u16, Vec<Ipv4Addr>>,
}

impl Service {
    /// Binds the virtual IP on the host's external interface and
    /// routes it there. Called exactly once per service name.
    pub async fn bring_up(
        name: &str,
        vip: Ipv4Addr,
        iface: &str,
        exec: &dyn CommandRunner,
    ) -> Self {
        let label = vip_label(vip);
        issue(
            exec,
            format!("ip addr add {}/32 dev {} label {}:{}", vip, iface, iface, label),
        )
        .await;
        issue(
            exec,
            format!("route add -host {} dev {}:{}", vip, iface, label),
        )
        .await;
        Self {
            name: name.to_string(),
            vip,
            virtual_servers: BTreeMap::new(),
        }
    }

    /// Adds a real server under one port, creating the port's virtual
    /// server on first use. Re-adding an existing member is a no-op.
    pub async fn add_real(&mut self, real: &mut RealServer, port: u16, exec: &dyn CommandRunner) {
        let vip = self.vip;
        let rip = real.rip();

        if !self.virtual_servers.contains_key(&port) {
            info!("Creating virtual server at {}:{}", vip, port);
            issue(exec, format!("ipvsadm -A -t {}:{} -s rr", vip, port)).await;
            self.virtual_servers.insert(port, Vec::new());
        }

        let members = self.virtual_servers.entry(port).or_default();
        if !members.contains(&rip) {
            issue(
                exec,
                format!("ipvsadm -a -t {}:{} -r {} -g -w 1", vip, port, rip),
            )
            .await;
            members.push(rip);
        }

        real.attach_to(self, exec).await;
    }

    /// Removes a real server from every port it is balanced under.
    /// A port left with no members has its virtual server destroyed.
    pub async fn detach(&mut self, real: &RealServer, exec: &dyn CommandRunner) {
        let vip = self.vip;
        let rip = real.rip();
        let ports: Vec<u16> = self
            .virtual_servers
            .iter()
            .filter(|(_, members)| members.contains(&rip))
            .map(|(port, _)| *port)
            .collect();

        for port in ports {
            issue(exec, format!("ipvsadm -d -t {}:{} -r {}", vip, port, rip)).await;
            let empty = match self.virtual_servers.get_mut(&port) {
                Some(members) => {
                    members.retain(|member| *member != rip);
                    members.is_empty()
                }
                None => false,
            };
            if empty {
                info!("Destroying virtual server at {}:{}", vip, port);
                issue(exec, format!("ipvsadm -D -t {}:{}", vip, port)).await;
                self.virtual_servers.remove(&port);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vip(&self) -> Ipv4Addr {
        self.vip
    }

    #[cfg(test)]
    pub fn has_port(&self, port: u16) -> bool {
        self.virtual_servers.contains_key(&port)
    }

    #[cfg(test)]
    pub fn members(&self, port: u16) -> Option<&[Ipv4Addr]> {
        self.virtual_servers.get(&port).map(Vec::as_slice)
    }
}
