pub mod notify;
pub mod status;
pub mod thresholds;

use anyhow::{bail, Result};
use std::time::Duration;
use tier_lib::{
    transport::{Endpoint, EnvelopeSender, RetryPolicy, TcpTransport},
    Envelope, ShutdownSignal,
};

/// Send one envelope to the manager, failing when every attempt failed
pub async fn deliver(manager: &Endpoint, envelope: &Envelope) -> Result<()> {
    let policy = RetryPolicy {
        retry_max: 2,
        retry_interval: Duration::from_secs(1),
        timeout: Duration::from_secs(5),
    };
    let transport = TcpTransport::new(ShutdownSignal::never());

    match transport.send(manager, envelope, &policy).await {
        delivery if delivery.is_delivered() => Ok(()),
        delivery => bail!(
            "Could not deliver {} notice to {} ({:?})",
            envelope.kind(),
            manager,
            delivery
        ),
    }
}

/// Parse `host:port`
pub fn parse_endpoint(address: &str) -> Result<Endpoint> {
    let Some((host, port)) = address.rsplit_once(':') else {
        bail!("Manager address must be host:port, got {}", address);
    };
    if host.is_empty() {
        bail!("Manager address has an empty host: {}", address);
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| anyhow::anyhow!("Invalid manager port in {}", address))?;
    Ok(Endpoint::new(host, port))
}
