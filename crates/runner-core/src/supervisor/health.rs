//! Health checks that gate a supervised process into `running`.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Answers whether the supervised process is ready to serve.
///
/// # Object Safety
///
/// Object-safe; the supervisor holds an `Arc<dyn HealthChecker>`.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn HealthChecker) {}
};

/// Healthy as soon as a TCP connection to `host:port` succeeds.
#[derive(Debug, Clone)]
pub struct TcpHealthCheck {
    address: String,
    connect_timeout: Duration,
}

impl TcpHealthCheck {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{host}:{port}"),
            connect_timeout: Duration::from_secs(1),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl HealthChecker for TcpHealthCheck {
    async fn check(&self) -> Result<()> {
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .with_context(|| format!("timed out connecting to {}", self.address))?
            .with_context(|| format!("cannot connect to {}", self.address))?;
        Ok(())
    }
}

/// For processes without a readiness signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthChecker for AlwaysHealthy {
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<F, Fut> HealthChecker for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn check(&self) -> Result<()> {
        (self)().await
    }
}
