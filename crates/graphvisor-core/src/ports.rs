//! Best-effort discovery of free local ports.
//!
//! A port counts as free when a TCP connect to `localhost` fails. Nothing is
//! reserved, so another process may bind a port between the probe and the
//! engine's own bind. The start step is retried to absorb that race.

use crate::config::{PortRange, PortStrategy};
use crate::error::SupervisorError;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Check whether nothing accepts connections on `localhost:port`
pub async fn port_available(port: u16, probe_timeout: Duration) -> bool {
    match tokio::time::timeout(probe_timeout, TcpStream::connect(("localhost", port))).await {
        Ok(Ok(_stream)) => false,
        Ok(Err(_)) | Err(_) => true,
    }
}

/// Find the first `count` free ports of `range`, in ascending order
pub async fn find_ports(range: &PortRange, count: usize) -> Result<Vec<u16>, SupervisorError> {
    find_ports_with_timeout(range, count, DEFAULT_PROBE_TIMEOUT).await
}

async fn find_ports_with_timeout(
    range: &PortRange,
    count: usize,
    probe_timeout: Duration,
) -> Result<Vec<u16>, SupervisorError> {
    let mut found = Vec::with_capacity(count);
    if count == 0 {
        return Ok(found);
    }

    for port in range.iter() {
        if port_available(port, probe_timeout).await {
            found.push(port);
            if found.len() == count {
                return Ok(found);
            }
        } else {
            debug!(port, "Port in use");
        }
    }

    Err(SupervisorError::PortExhaustion {
        start: range.start,
        end: range.end,
        count,
    })
}

/// Hands out a port assignment per start attempt
#[derive(Debug, Clone)]
pub struct PortAllocator {
    strategy: PortStrategy,
    probe_timeout: Duration,
}

impl PortAllocator {
    pub fn new(strategy: PortStrategy) -> Self {
        Self {
            strategy,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn strategy(&self) -> &PortStrategy {
        &self.strategy
    }

    pub async fn allocate(&self, count: usize) -> Result<Vec<u16>, SupervisorError> {
        let ports = match &self.strategy {
            PortStrategy::Dynamic(range) => {
                find_ports_with_timeout(range, count, self.probe_timeout).await?
            }
            PortStrategy::Fixed(ports) => {
                if ports.len() < count {
                    return Err(SupervisorError::Configuration(format!(
                        "{count} ports needed but only {} are configured",
                        ports.len()
                    )));
                }
                ports[..count].to_vec()
            }
        };
        info!(?ports, "Allocated ports");
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn occupy(ports: &[u16]) -> Vec<TcpListener> {
        let mut listeners = Vec::new();
        for port in ports {
            listeners.push(TcpListener::bind(("127.0.0.1", *port)).await.unwrap());
        }
        listeners
    }

    #[tokio::test]
    async fn test_skips_occupied_ports() {
        let _held = occupy(&[48104, 48106, 48108]).await;
        let range = PortRange::new(48104, 48108).unwrap();

        let ports = find_ports(&range, 2).await.unwrap();
        assert_eq!(ports, vec![48105, 48107]);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let _held = occupy(&[48114, 48116, 48118]).await;
        let range = PortRange::new(48114, 48118).unwrap();

        let error = find_ports(&range, 3).await.unwrap_err();
        assert!(matches!(
            error,
            SupervisorError::PortExhaustion {
                start: 48114,
                end: 48118,
                count: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_zero_ports() {
        let range = PortRange::new(48120, 48121).unwrap();
        assert!(find_ports(&range, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_strategy() {
        let allocator = PortAllocator::new(PortStrategy::Fixed(vec![8080, 8081]));
        assert_eq!(allocator.allocate(1).await.unwrap(), vec![8080]);
        assert_eq!(allocator.allocate(2).await.unwrap(), vec![8080, 8081]);
        assert!(allocator.allocate(3).await.is_err());
    }

    #[tokio::test]
    async fn test_port_available_reflects_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_available(port, DEFAULT_PROBE_TIMEOUT).await);

        drop(listener);
        assert!(port_available(port, DEFAULT_PROBE_TIMEOUT).await);
    }
}
