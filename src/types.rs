//! Typed views of the container runtime's payloads.
//!
//! Raw Docker messages are validated into these structures at the
//! runtime boundary, so the rest of the daemon never digs through
//! optional maps. Conversion failures surface as
//! [`Error::MalformedEvent`](crate::error::Error::MalformedEvent)
//! before an event reaches any handler.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use bollard::models::{EventMessage, EventMessageTypeEnum};
use ipnet::Ipv4Net;

use crate::error::Error;

/// A container lifecycle event on the managed network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub action: EventAction,
    /// Name of the resource the event belongs to. For network events
    /// this is the network name.
    pub name: String,
    /// Id of the container involved in the event.
    pub container: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Container,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Connect,
    Disconnect,
}

impl TryFrom<EventMessage> for Event {
    type Error = Error;

    fn try_from(msg: EventMessage) -> Result<Self, Error> {
        let kind = match msg.typ {
            Some(EventMessageTypeEnum::NETWORK) => EventKind::Network,
            Some(EventMessageTypeEnum::CONTAINER) => EventKind::Container,
            other => {
                return Err(Error::MalformedEvent(format!(
                    "unsupported event type {:?}",
                    other
                )))
            }
        };

        let action = match msg.action.as_deref().unwrap_or_default() {
            "connect" => EventAction::Connect,
            "disconnect" => EventAction::Disconnect,
            other => {
                return Err(Error::MalformedEvent(format!(
                    "unsupported action `{}`",
                    other
                )))
            }
        };

        let actor = msg
            .actor
            .ok_or_else(|| Error::MalformedEvent("event without actor".into()))?;
        let attributes = actor.attributes.unwrap_or_default();

        let (name, container) = match kind {
            EventKind::Network => {
                let name = attribute(&attributes, "name")?;
                let container = attribute(&attributes, "container")?;
                (name, container)
            }
            EventKind::Container => {
                let container = actor
                    .id
                    .ok_or_else(|| Error::MalformedEvent("container event without id".into()))?;
                let name = attributes
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| container.clone());
                (name, container)
            }
        };

        Ok(Event {
            kind,
            action,
            name,
            container,
        })
    }
}

fn attribute(attributes: &HashMap<String, String>, key: &str) -> Result<String, Error> {
    attributes
        .get(key)
        .cloned()
        .ok_or_else(|| Error::MalformedEvent(format!("event without `{}` attribute", key)))
}

/// Everything the daemon needs to know about one container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Logical service name, derived from the container's image
    /// reference by the runtime adapter.
    pub service: String,
    /// Host-side pid of the container's init process, when running.
    pub pid: Option<i64>,
    /// The container's address on the managed network, when connected.
    pub ip: Option<Ipv4Addr>,
    pub ports: Vec<PortSpec>,
}

impl fmt::Display for ContainerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.service, self.name)
    }
}

/// One exposed port, parsed from Docker's `port/protocol` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = s
            .split_once('/')
            .ok_or_else(|| format!("missing protocol in `{}`", s))?;
        let port = port
            .parse()
            .map_err(|_| format!("invalid port in `{}`", s))?;
        let protocol = match protocol {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => return Err(format!("unsupported protocol `{}`", other)),
        };
        Ok(PortSpec { port, protocol })
    }
}

/// A snapshot of the managed network's configuration and membership.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub name: String,
    pub subnet: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub members: Vec<NetworkMember>,
}

#[derive(Debug, Clone)]
pub struct NetworkMember {
    pub container_id: String,
    pub ip: Ipv4Addr,
}
