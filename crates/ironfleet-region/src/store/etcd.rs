//! etcd backend
//!
//! Connects with exponential backoff, then maps the backend operations onto
//! plain gets/puts and a single-compare transaction for CAS writes.

use super::{Backend, RawEntry, StoreError};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EtcdOptions {
    pub endpoints: Vec<String>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_max_elapsed: Duration,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            backoff_max_elapsed: Duration::from_secs(120),
        }
    }
}

pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    pub async fn connect(options: &EtcdOptions) -> Result<Self, StoreError> {
        let backoff = ExponentialBackoff {
            initial_interval: options.backoff_initial,
            max_interval: options.backoff_max,
            max_elapsed_time: Some(options.backoff_max_elapsed),
            ..Default::default()
        };
        let endpoints = options.endpoints.clone();

        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        Ok(Self { client })
    }
}

fn entry(kv: &etcd_client::KeyValue) -> Result<RawEntry, StoreError> {
    Ok(RawEntry {
        key: kv.key_str()?.to_string(),
        value: kv.value_str()?.to_string(),
        revision: kv.mod_revision(),
    })
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn get(&self, key: &str) -> Result<Option<RawEntry>, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        resp.kvs().first().map(entry).transpose()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RawEntry>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        resp.kvs().iter().map(entry).collect()
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_revision: i64,
        value: String,
    ) -> Result<bool, StoreError> {
        let compare = if expected_revision == 0 {
            Compare::version(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected_revision)
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn health(&self) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.status().await?;
        Ok(())
    }
}
