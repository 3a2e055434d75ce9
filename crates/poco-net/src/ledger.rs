//! Ledger event boundary.
//!
//! The compute ledger lives outside this crate; connections only carry
//! its events around. [`ServiceDirectory`] folds a stream of them into
//! lookup tables so a node knows which providers and jobs exist. No
//! scheduling decisions happen here.

use std::collections::HashMap;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PocoNetError;
use crate::Address;

/// Ledger-originated events a node observes, historical or live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LedgerEvent {
    NewService {
        provider: Address,
        endpoint: String,
    },
    ServiceUpdate {
        provider: Address,
        endpoint: String,
        online: bool,
    },
    NewJob {
        job_id: String,
        owner: Address,
    },
    SubmitJob {
        job_id: String,
        provider: Address,
    },
}

impl LedgerEvent {
    /// Decode an event carried as a message payload.
    pub fn from_value(value: &Value) -> Result<Self, PocoNetError> {
        serde_json::from_value(value.clone())
            .map_err(|_| PocoNetError::protocol("malformed ledger event"))
    }
}

/// A provider's advertised service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub provider: Address,
    pub endpoint: String,
    pub online: bool,
}

/// A job and, once submitted, the provider working it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub owner: Address,
    pub provider: Option<Address>,
}

/// In-memory fold of the ledger event stream.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: HashMap<Address, ServiceRecord>,
    jobs: HashMap<String, JobRecord>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the tables. A new service starts online; an
    /// update replaces the record wholesale.
    pub fn apply(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::NewService { provider, endpoint } => {
                self.services.insert(
                    provider.clone(),
                    ServiceRecord { provider, endpoint, online: true },
                );
            }
            LedgerEvent::ServiceUpdate { provider, endpoint, online } => {
                self.services.insert(
                    provider.clone(),
                    ServiceRecord { provider, endpoint, online },
                );
            }
            LedgerEvent::NewJob { job_id, owner } => {
                self.jobs.insert(
                    job_id.clone(),
                    JobRecord { job_id, owner, provider: None },
                );
            }
            LedgerEvent::SubmitJob { job_id, provider } => {
                match self.jobs.get_mut(&job_id) {
                    Some(job) => job.provider = Some(provider),
                    None => tracing::debug!(%job_id, "submission for an unknown job ignored"),
                }
            }
        }
    }

    /// Fold a whole stream in arrival order, typically historical
    /// events first and live ones after.
    pub async fn apply_stream<S>(&mut self, stream: S)
    where
        S: Stream<Item = LedgerEvent>,
    {
        futures_util::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            self.apply(event);
        }
    }

    pub fn service(&self, provider: &Address) -> Option<&ServiceRecord> {
        self.services.get(provider)
    }

    pub fn job(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn online_services(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values().filter(|s| s.online)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}
