//! Startup reconciliation and the event loop.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::exec::CommandRunner;
use crate::registry::IpvsNet;
use crate::runtime::ContainerRuntime;
use crate::types::{Event, EventAction, EventKind};

pub struct Orchestrator {
    dispatcher: Dispatcher,
    registry: Arc<Mutex<IpvsNet>>,
}

impl Orchestrator {
    /// Builds the registry from the network's current state, joins the
    /// daemon's own container to the network when needed, attaches the
    /// members that are already there and wires up the event handlers.
    ///
    /// The event watcher should already be running at this point;
    /// everything here is idempotent, so an event that also shows up
    /// as an existing member is absorbed.
    pub async fn bootstrap(
        self_id: &str,
        cfg: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        exec: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let mut state = runtime
            .network_state()
            .await
            .context("resolving the managed network")?;
        info!(
            "Managing network {} with subnet {}",
            state.name, state.subnet
        );

        let mut net = IpvsNet::new(state.subnet, &cfg.host_iface, &cfg.netns_dir, exec);
        net.reconcile_members(&state);

        // Join our own container so the host-side rules can reach the
        // backends over the managed network.
        let own = runtime
            .inspect(self_id)
            .await
            .with_context(|| format!("inspecting own container {}", self_id))?;
        if !net.is_member(&own.id) {
            info!("Connecting {} to network {}", own, state.name);
            runtime.connect_container(&own.id).await?;
            state = runtime.network_state().await?;
            net.reconcile_members(&state);
        }

        // Attach everything that joined before we started watching.
        for member in &state.members {
            if member.container_id == own.id {
                continue;
            }
            let info = match runtime.inspect(&member.container_id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Skipping member {}: {:#}", member.container_id, e);
                    continue;
                }
            };
            if let Err(e) = net.add_real_server(&info).await {
                warn!("Failed to attach {}: {}", info, e);
            }
        }

        let registry = Arc::new(Mutex::new(net));
        let mut dispatcher = Dispatcher::new();
        subscribe_handlers(
            &mut dispatcher,
            &state.name,
            Arc::clone(&registry),
            runtime,
        );

        Ok(Self {
            dispatcher,
            registry,
        })
    }

    /// Consumes events until the stream closes or shutdown is
    /// signalled. Every event is processed to completion before the
    /// next one; shutdown is honored only between events, never
    /// halfway through one.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Stopping event loop");
                    return Ok(());
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            debug!("Event: {:?} {:?} on {}", event.kind, event.action, event.name);
                            self.dispatcher.dispatch(&event).await;
                        }
                        None => return Err(anyhow!("event stream closed")),
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> Arc<Mutex<IpvsNet>> {
        Arc::clone(&self.registry)
    }
}

fn subscribe_handlers(
    dispatcher: &mut Dispatcher,
    network: &str,
    registry: Arc<Mutex<IpvsNet>>,
    runtime: Arc<dyn ContainerRuntime>,
) {
    let connect_network = network.to_string();
    let connect_registry = Arc::clone(&registry);
    dispatcher.subscribe(
        EventKind::Network,
        &[EventAction::Connect],
        Box::new(move |event| {
            let network = connect_network.clone();
            let registry = Arc::clone(&connect_registry);
            let runtime = Arc::clone(&runtime);
            Box::pin(async move {
                if event.name != network {
                    return Ok(());
                }
                let info = match runtime.inspect(&event.container).await {
                    Ok(info) => info,
                    Err(e) => {
                        warn!("Cannot inspect container {}: {:#}", event.container, e);
                        return Ok(());
                    }
                };
                registry.lock().await.add_real_server(&info).await?;
                Ok(())
            })
        }),
    );

    let disconnect_network = network.to_string();
    dispatcher.subscribe(
        EventKind::Network,
        &[EventAction::Disconnect],
        Box::new(move |event| {
            let network = disconnect_network.clone();
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                if event.name != network {
                    return Ok(());
                }
                registry
                    .lock()
                    .await
                    .remove_real_server(&event.container)
                    .await?;
                Ok(())
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use crate::types::{ContainerInfo, NetworkInfo, NetworkMember};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    struct MockRuntime {
        network: StdMutex<NetworkInfo>,
        containers: HashMap<String, ContainerInfo>,
        connected: StdMutex<Vec<String>>,
    }

    impl MockRuntime {
        fn new(members: &[&str]) -> Self {
            let mut containers = HashMap::new();
            containers.insert("self-id".to_string(), plain("self-id", "ipvsnet", "10.0.0.9"));
            containers.insert(
                "a".to_string(),
                backend("a", "web", "10.0.0.2", 101, &["80/tcp"]),
            );
            containers.insert(
                "b".to_string(),
                backend("b", "api", "10.0.0.3", 102, &["9000/tcp"]),
            );

            let network = NetworkInfo {
                name: "lbnet".into(),
                subnet: "10.0.0.0/24".parse().unwrap(),
                gateway: Some("10.0.0.1".parse().unwrap()),
                members: members
                    .iter()
                    .map(|id| NetworkMember {
                        container_id: id.to_string(),
                        ip: containers[*id].ip.unwrap(),
                    })
                    .collect(),
            };

            Self {
                network: StdMutex::new(network),
                containers,
                connected: StdMutex::new(Vec::new()),
            }
        }

        fn connected(&self) -> Vec<String> {
            self.connected.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn watch(&self, _events: mpsc::Sender<Event>) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
            self.containers
                .get(container_id)
                .cloned()
                .ok_or_else(|| crate::error::Error::UnknownContainer(container_id.into()).into())
        }

        async fn network_state(&self) -> Result<NetworkInfo> {
            Ok(self.network.lock().unwrap().clone())
        }

        async fn connect_container(&self, container_id: &str) -> Result<()> {
            self.connected.lock().unwrap().push(container_id.to_string());
            let ip = self.containers[container_id].ip.unwrap();
            self.network.lock().unwrap().members.push(NetworkMember {
                container_id: container_id.to_string(),
                ip,
            });
            Ok(())
        }
    }

    fn plain(id: &str, service: &str, ip: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.into(),
            name: format!("{}-0", service),
            service: service.into(),
            pid: Some(1),
            ip: ip.parse().ok(),
            ports: Vec::new(),
        }
    }

    fn backend(id: &str, service: &str, ip: &str, pid: i64, ports: &[&str]) -> ContainerInfo {
        ContainerInfo {
            ports: ports.iter().map(|p| p.parse().unwrap()).collect(),
            pid: Some(pid),
            ..plain(id, service, ip)
        }
    }

    fn network_event(action: EventAction, network: &str, container: &str) -> Event {
        Event {
            kind: EventKind::Network,
            action,
            name: network.into(),
            container: container.into(),
        }
    }

    async fn bootstrap(runtime: &Arc<MockRuntime>) -> Orchestrator {
        Orchestrator::bootstrap(
            "self-id",
            &Config::default(),
            Arc::clone(runtime) as Arc<dyn ContainerRuntime>,
            Arc::new(RecordingRunner::new()),
        )
        .await
        .unwrap()
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn bootstrap_attaches_existing_members() {
        let runtime = Arc::new(MockRuntime::new(&["self-id", "a"]));
        let orchestrator = bootstrap(&runtime).await;

        let registry = orchestrator.registry();
        let net = registry.lock().await;
        assert!(runtime.connected().is_empty());
        assert_eq!(net.service("web").unwrap().vip(), addr("10.0.0.254"));
        assert_eq!(net.service("web").unwrap().members(80).unwrap(), [addr("10.0.0.2")]);
        // The daemon's own container is not a backend.
        assert!(net.real_server("self-id").is_none());
    }

    #[tokio::test]
    async fn bootstrap_joins_the_network_when_absent() {
        let runtime = Arc::new(MockRuntime::new(&["a"]));
        let orchestrator = bootstrap(&runtime).await;

        assert_eq!(runtime.connected(), vec!["self-id"]);
        let registry = orchestrator.registry();
        let net = registry.lock().await;
        assert!(net.is_member("self-id"));
        assert!(net.pool().is_reserved(addr("10.0.0.9")));
    }

    #[tokio::test]
    async fn run_applies_connect_and_disconnect_events() {
        let runtime = Arc::new(MockRuntime::new(&["self-id"]));
        let orchestrator = bootstrap(&runtime).await;
        let registry = orchestrator.registry();

        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(rx, shutdown_rx));

        tx.send(network_event(EventAction::Connect, "lbnet", "b"))
            .await
            .unwrap();
        tx.send(network_event(EventAction::Disconnect, "lbnet", "b"))
            .await
            .unwrap();
        // Unknown containers are skipped without stopping the loop.
        tx.send(network_event(EventAction::Connect, "lbnet", "ghost"))
            .await
            .unwrap();
        tx.send(network_event(EventAction::Connect, "elsewhere", "a"))
            .await
            .unwrap();
        drop(tx);

        // With the senders gone the loop drains and reports the closed
        // stream.
        assert!(handle.await.unwrap().is_err());

        let net = registry.lock().await;
        let api = net.service("api").unwrap();
        assert_eq!(api.vip(), addr("10.0.0.254"));
        assert!(!api.has_port(9000));
        assert!(!net.pool().is_reserved(addr("10.0.0.3")));
        // The event for another network never reached the registry.
        assert!(net.service("web").is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_cleanly() {
        let runtime = Arc::new(MockRuntime::new(&["self-id"]));
        let orchestrator = bootstrap(&runtime).await;

        let (_tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(rx, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
