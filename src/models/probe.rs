//! Connectivity check against the model hub, run before a download starts so
//! an offline machine gets an immediate, readable error instead of a slow
//! transport failure halfway through.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Ok if the remote asset host is reachable, `NetworkUnavailable` otherwise.
    async fn check(&self) -> AppResult<()>;
}

/// Short-timeout HTTP HEAD against the hub.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> AppResult<()> {
        let result = self
            .client
            .head(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => {
                debug!(url = %self.url, "Model hub reachable");
                Ok(())
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "Model hub unreachable");
                Err(AppError::NetworkUnavailable(format!(
                    "We cannot reach {}. Most likely you are not connected to the internet.",
                    self.url
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_unreachable_host_fails_fast() {
        // nothing listens on port 9 of the loopback interface
        let probe = HttpProbe::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let started = Instant::now();
        let result = probe.check().await;
        assert!(matches!(result, Err(AppError::NetworkUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
