use super::{Delivery, Endpoint, EnvelopeSender, RetryPolicy};
use crate::envelope::Envelope;
use crate::observability::ScalerMetrics;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// TCP implementation of [`EnvelopeSender`]
#[derive(Clone)]
pub struct TcpTransport {
    shutdown: ShutdownSignal,
    metrics: ScalerMetrics,
}

impl TcpTransport {
    /// Transport whose retry sleeps end early once `shutdown` fires
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            metrics: ScalerMetrics::new(),
        }
    }

    async fn attempt(&self, endpoint: &Endpoint, line: &[u8], timeout: Duration) -> io::Result<()> {
        let write = async {
            let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            stream.write_all(line).await?;
            stream.flush().await?;
            stream.shutdown().await
        };

        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))?
    }
}

#[async_trait]
impl EnvelopeSender for TcpTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
        policy: &RetryPolicy,
    ) -> Delivery {
        let line = match envelope.encode_line() {
            Ok(line) => line,
            Err(e) => {
                error!(envelope_id = %envelope.id, error = %e, "Failed to encode envelope");
                self.metrics.inc_delivery_failed();
                return Delivery::Failed { attempts: 0 };
            }
        };

        let mut shutdown = self.shutdown.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(endpoint, line.as_bytes(), policy.timeout).await {
                Ok(()) => {
                    debug!(
                        endpoint = %endpoint,
                        kind = %envelope.kind(),
                        envelope_id = %envelope.id,
                        attempts,
                        "Envelope delivered"
                    );
                    return Delivery::Delivered { attempts };
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        kind = %envelope.kind(),
                        attempt = attempts,
                        error = %e,
                        "Send attempt failed"
                    );
                }
            }

            if attempts > policy.retry_max {
                self.metrics.inc_delivery_failed();
                return Delivery::Failed { attempts };
            }

            if !shutdown.sleep(policy.retry_interval).await {
                debug!(endpoint = %endpoint, "Shutdown during retry backoff");
                return Delivery::Cancelled;
            }
        }
    }
}
