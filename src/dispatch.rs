//! Event subscription and delivery.

use futures_util::future::BoxFuture;
use log::warn;

use crate::types::{Event, EventAction, EventKind};

pub type Handler = Box<dyn FnMut(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Subscription {
    kind: EventKind,
    actions: Vec<EventAction>,
    handler: Handler,
}

/// Routes events to the handlers subscribed to their kind and action.
#[derive(Default)]
pub struct Dispatcher {
    subscriptions: Vec<Subscription>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, actions: &[EventAction], handler: Handler) {
        self.subscriptions.push(Subscription {
            kind,
            actions: actions.to_vec(),
            handler,
        });
    }

    /// Delivers an event to every matching handler, in subscription
    /// order. Each handler runs to completion before the next one; a
    /// failing handler is logged and does not block delivery to the
    /// rest.
    pub async fn dispatch(&mut self, event: &Event) {
        for sub in self.subscriptions.iter_mut() {
            if sub.kind == event.kind && sub.actions.contains(&event.action) {
                if let Err(e) = (sub.handler)(event.clone()).await {
                    warn!("Handler failed on {:?} event: {:#}", event.action, e);
                }
            }
        }
    }
}
