//! Exchange protocol wire contract and transport boundary.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::RepartitionerHandle;
use crate::ids::{CandidateVertex, HostId, UnitId};

/// An exchange offer from one host to another: the initiator's candidate set
/// toward the receiver plus a load snapshot for imbalance accounting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptExchangeRequest {
    pub sending_host: HostId,
    pub exchange_set: Vec<CandidateVertex>,
    pub activation_count_snapshot: i64,
}

/// Responder's verdict on an exchange offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptExchangeResponse {
    /// The exchange concluded; `accepted_units` were taken from the sender's
    /// offer, `given_units` travel the other way.
    Success {
        accepted_units: Vec<UnitId>,
        given_units: Vec<UnitId>,
    },
    /// The receiver finished another exchange too recently.
    ExchangedRecently,
    /// The receiver is concurrently initiating toward the sender and lost
    /// the address tie-break, so the sender's round must yield.
    MutualExchangeAttempt,
}

/// Delivery of exchange requests between hosts.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn accept_exchange(
        &self,
        target: HostId,
        request: AcceptExchangeRequest,
    ) -> anyhow::Result<AcceptExchangeResponse>;
}

/// Routes exchange requests between engines living in the same process, for
/// tests and the workload simulator.
pub struct InProcessTransport {
    routes: RwLock<HashMap<HostId, RepartitionerHandle>>,
    rpc_timeout: Duration,
}

impl InProcessTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            rpc_timeout,
        }
    }

    pub fn register(&self, handle: RepartitionerHandle) {
        self.routes
            .write()
            .expect("routes lock poisoned")
            .insert(handle.host(), handle);
    }

    pub fn deregister(&self, host: HostId) {
        self.routes
            .write()
            .expect("routes lock poisoned")
            .remove(&host);
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ExchangeTransport for InProcessTransport {
    async fn accept_exchange(
        &self,
        target: HostId,
        request: AcceptExchangeRequest,
    ) -> anyhow::Result<AcceptExchangeResponse> {
        let handle = self
            .routes
            .read()
            .expect("routes lock poisoned")
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no route to {target}"))?;

        tokio::time::timeout(self.rpc_timeout, handle.accept_exchange(request))
            .await
            .map_err(|_| anyhow::anyhow!("exchange request to {target} timed out"))?
    }
}
