use etcd_client::{Client, Compare, CompareOp, KvClient, Txn, TxnOp, TxnResponse};

use super::{Coordinator, SessionError, Versioned};

/// [`Coordinator`] backed by an etcd cluster.
///
/// Conditional writes are etcd transactions comparing `create_revision`
/// (absent keys) or `mod_revision` (unchanged keys).
#[derive(Clone)]
pub struct EtcdCoordinator {
    kv: KvClient,
}

impl std::fmt::Debug for EtcdCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordinator").finish_non_exhaustive()
    }
}

impl EtcdCoordinator {
    /// Connect to the cluster.
    #[tracing::instrument]
    pub async fn connect(endpoints: &[String]) -> Result<Self, SessionError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(SessionError::backend)?;
        Ok(Self {
            kv: client.kv_client(),
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, SessionError> {
        let mut kv = self.kv.clone();
        kv.txn(txn).await.map_err(SessionError::backend)
    }
}

fn written_revision(response: &TxnResponse) -> Option<i64> {
    if !response.succeeded() {
        return None;
    }
    response.header().map(|header| header.revision())
}

#[async_trait::async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, SessionError> {
        let mut kv = self.kv.clone();
        let response = kv.get(key, None).await.map_err(SessionError::backend)?;

        Ok(response.kvs().first().map(|entry| Versioned {
            value: entry.value().to_vec(),
            revision: entry.mod_revision(),
        }))
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<Option<i64>, SessionError> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        Ok(written_revision(&self.txn(txn).await?))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        revision: i64,
        value: Vec<u8>,
    ) -> Result<Option<i64>, SessionError> {
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, revision)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        Ok(written_revision(&self.txn(txn).await?))
    }

    async fn compare_and_delete(&self, key: &str, revision: i64) -> Result<bool, SessionError> {
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, revision)])
            .and_then(vec![TxnOp::delete(key, None)]);
        Ok(self.txn(txn).await?.succeeded())
    }
}
