//! One backend container's namespace and service attachments.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use crate::exec::{issue, CommandRunner};
use crate::service::{vip_label, Service};

/// A container acting as a backend, addressed by its namespace pid.
///
/// Exists only while its container is a connected member of the
/// managed network. Tracks which services it carries so removal can
/// unwind every attachment.
pub struct RealServer {
    rip: Ipv4Addr,
    pid: i64,
    attached: BTreeSet<String>,
}

impl RealServer {
    /// Exposes the container's network namespace to the host and
    /// silences ARP on its loopback, so virtual IPs can be bound
    /// there without the container answering for them on the wire.
    /// Safe to repeat; the symlink is replaced, not duplicated.
    pub async fn bring_up(
        rip: Ipv4Addr,
        pid: i64,
        netns_dir: &str,
        exec: &dyn CommandRunner,
    ) -> Self {
        issue(
            exec,
            format!("ln -sfn /proc/{}/ns/net {}/{}", pid, netns_dir, pid),
        )
        .await;
        issue(
            exec,
            format!("ip netns exec {} ip link set dev lo arp off", pid),
        )
        .await;
        Self {
            rip,
            pid,
            attached: BTreeSet::new(),
        }
    }

    fn in_namespace(&self, command: &str) -> String {
        format!("ip netns exec {} {}", self.pid, command)
    }

    /// Binds the service's virtual IP on this container's loopback so
    /// direct-routed traffic for the VIP is accepted locally. No-op
    /// when already attached.
    pub async fn attach_to(&mut self, service: &Service, exec: &dyn CommandRunner) {
        if self.attached.contains(service.name()) {
            return;
        }
        let vip = service.vip();
        let label = vip_label(vip);
        issue(
            exec,
            self.in_namespace(&format!("ip addr add {}/32 dev lo label lo:{}", vip, label)),
        )
        .await;
        issue(
            exec,
            self.in_namespace(&format!("route add -host {} dev lo:{}", vip, label)),
        )
        .await;
        self.attached.insert(service.name().to_string());
    }

    /// Pulls this backend out of all of the service's virtual servers.
    /// Unconditional; detaching when not attached is a no-op.
    pub async fn detach_from(&mut self, service: &mut Service, exec: &dyn CommandRunner) {
        service.detach(self, exec).await;
        self.attached.remove(service.name());
    }

    /// Detaches from every attached service and discards the backend.
    pub async fn remove(
        mut self,
        services: &mut HashMap<String, Service>,
        exec: &dyn CommandRunner,
    ) {
        // Detaching mutates the attached set, so walk a copy.
        let names: Vec<String> = self.attached.iter().cloned().collect();
        for name in names {
            if let Some(service) = services.get_mut(&name) {
                self.detach_from(service, exec).await;
            }
        }
    }

    pub fn rip(&self) -> Ipv4Addr {
        self.rip
    }

    #[cfg(test)]
    pub fn pid(&self) -> i64 {
        self.pid
    }

    #[cfg(test)]
    pub fn is_attached_to(&self, service: &str) -> bool {
        self.attached.contains(service)
    }
}
