use super::{Delivery, Endpoint, EnvelopeSender, RetryPolicy};
use crate::envelope::Envelope;
use crate::outbox::Outbox;
use std::sync::Arc;
use tracing::{debug, error};

/// Send façade: a failed send lands in the outbox, a successful one
/// kicks off a resend sweep.
#[derive(Clone)]
pub struct Messenger {
    sender: Arc<dyn EnvelopeSender>,
    policy: RetryPolicy,
    outbox: Option<Arc<Outbox>>,
}

impl Messenger {
    pub fn new(sender: Arc<dyn EnvelopeSender>, policy: RetryPolicy) -> Self {
        Self {
            sender,
            policy,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: Arc<Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn outbox(&self) -> Option<&Arc<Outbox>> {
        self.outbox.as_ref()
    }

    pub async fn send(&self, endpoint: &Endpoint, envelope: &Envelope) -> Delivery {
        let delivery = self.sender.send(endpoint, envelope, &self.policy).await;

        let Some(outbox) = &self.outbox else {
            return delivery;
        };

        match delivery {
            Delivery::Delivered { .. } => {
                outbox.trigger_resend();
            }
            Delivery::Failed { .. } | Delivery::Cancelled => {
                match outbox.persist(endpoint, envelope) {
                    Ok(true) => debug!(
                        endpoint = %endpoint,
                        envelope_id = %envelope.id,
                        "Undelivered envelope stored in outbox"
                    ),
                    Ok(false) => {}
                    Err(e) => error!(
                        endpoint = %endpoint,
                        envelope_id = %envelope.id,
                        error = %e,
                        "Failed to store undelivered envelope"
                    ),
                }
            }
        }

        delivery
    }
}
