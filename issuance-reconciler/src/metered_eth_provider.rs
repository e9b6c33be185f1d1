// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::ReconcilerMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// HTTP JSON-RPC transport that records per-method query counts and latency.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<ReconcilerMetrics>,
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics
            .eth_rpc_queries
            .with_label_values(&[method])
            .inc();
        let _guard = self
            .metrics
            .eth_rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();

        let result = self.inner.request(method, params).await;

        match &result {
            Ok(_) => self.metrics.eth_node_connected.set(1),
            Err(_) => self.metrics.eth_node_connected.set(0),
        }
        result
    }
}

impl MeteredEthHttpProvider {
    /// Every request on the underlying HTTP client is bounded by `request_timeout`.
    pub fn new(
        url: Url,
        request_timeout: Duration,
        metrics: Arc<ReconcilerMetrics>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            inner: Http::new_with_client(url, client),
            metrics,
        })
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    request_timeout: Duration,
    metrics: Arc<ReconcilerMetrics>,
) -> anyhow::Result<Provider<MeteredEthHttpProvider>> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, request_timeout, metrics)?;
    Ok(Provider::new(http_provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::Middleware;

    #[tokio::test]
    async fn test_metered_eth_provider() {
        let metrics = Arc::new(ReconcilerMetrics::new_for_testing());
        let provider = new_metered_eth_provider(
            "http://localhost:9876",
            Duration::from_millis(500),
            metrics.clone(),
        )
        .unwrap();

        assert_eq!(
            metrics
                .eth_rpc_queries
                .get_metric_with_label_values(&["eth_blockNumber"])
                .unwrap()
                .get(),
            0
        );

        provider.get_block_number().await.unwrap_err(); // nothing listens on this port

        assert_eq!(
            metrics
                .eth_rpc_queries
                .get_metric_with_label_values(&["eth_blockNumber"])
                .unwrap()
                .get(),
            1
        );
        assert_eq!(
            metrics
                .eth_rpc_queries_latency
                .get_metric_with_label_values(&["eth_blockNumber"])
                .unwrap()
                .get_sample_count(),
            1
        );
        assert_eq!(metrics.eth_node_connected.get(), 0);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let metrics = Arc::new(ReconcilerMetrics::new_for_testing());
        assert!(new_metered_eth_provider("not a url", Duration::from_secs(1), metrics).is_err());
    }
}
