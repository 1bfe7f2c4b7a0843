use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use strata_core::{ChangeEvent, SubscriptionId};
use strata_engine::{ContextService, Subscription};

use crate::client::{ClientId, ClientRegistry};

/// Frame pushed to a client for each delivered change event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub subscription_id: &'a SubscriptionId,
    pub event: &'a ChangeEvent,
}

pub fn serialize_event(subscription_id: &SubscriptionId, event: &ChangeEvent) -> Option<String> {
    serde_json::to_string(&WireEvent {
        frame_type: "event",
        subscription_id,
        event,
    })
    .ok()
}

/// Forward one subscription's events to a WebSocket client until the
/// subscription is closed or the client disconnects.
pub fn forward_subscription(
    service: Arc<ContextService>,
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
    subscription: Subscription,
) -> tokio::task::JoinHandle<()> {
    let Subscription { id, mut receiver, .. } = subscription;
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Some(frame) = serialize_event(&id, &event) else { continue };
                    if !registry.send_to(&client_id, frame).await && !registry.contains(&client_id) {
                        tracing::debug!(subscription = %id, client_id = %client_id, "client gone, closing subscription");
                        service.unsubscribe(&id);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(subscription = %id, skipped = n, "subscriber lagged, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!(subscription = %id, "subscription closed");
                    break;
                }
            }
        }
    })
}
