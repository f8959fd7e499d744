//! Response-schema fingerprint history per endpoint.
//!
//! Only the latest fingerprint per endpoint is cached in memory. A change
//! appends a new versioned [`SchemaRecord`]; every change is flagged as
//! breaking since fingerprints carry no structure to diff.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::intake::EndpointKey;
use crate::storage::Store;

/// One version of an endpoint's response schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub endpoint: EndpointKey,
    pub fingerprint: String,
    pub version: u32,
    pub breaking_change: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of observing a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaObservation {
    /// First fingerprint ever stored for the endpoint.
    First { version: u32 },
    Unchanged { version: u32 },
    Changed {
        previous_fingerprint: String,
        previous_version: u32,
        fingerprint: String,
        version: u32,
    },
}

impl SchemaObservation {
    pub fn changed(&self) -> bool {
        matches!(self, SchemaObservation::Changed { .. })
    }
}

#[derive(Debug, Clone)]
struct Latest {
    fingerprint: String,
    version: u32,
}

pub struct SchemaTracker {
    store: Store,
    latest: DashMap<EndpointKey, Latest>,
}

impl SchemaTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            latest: DashMap::new(),
        }
    }

    /// Compare `fingerprint` against the endpoint's latest version and record it.
    pub fn observe(&self, endpoint: &EndpointKey, fingerprint: &str, now: DateTime<Utc>) -> Result<SchemaObservation> {
        let cached = self.latest.get(endpoint).map(|entry| entry.value().clone());
        let latest = match cached {
            Some(latest) => Some(latest),
            // Cache miss: seed from the newest stored version, if any.
            None => self.store.latest_schema(endpoint)?.map(|record| Latest {
                fingerprint: record.fingerprint,
                version: record.version,
            }),
        };

        let observation = match latest {
            None => {
                self.store.append_schema(&SchemaRecord {
                    endpoint: endpoint.clone(),
                    fingerprint: fingerprint.to_string(),
                    version: 1,
                    breaking_change: false,
                    first_seen: now,
                    last_seen: now,
                })?;
                info!(endpoint = %endpoint, fingerprint, "first schema version recorded");
                SchemaObservation::First { version: 1 }
            }
            Some(latest) if latest.fingerprint == fingerprint => {
                self.store.touch_schema(endpoint, latest.version, now)?;
                SchemaObservation::Unchanged { version: latest.version }
            }
            Some(latest) => {
                let version = latest.version + 1;
                self.store.append_schema(&SchemaRecord {
                    endpoint: endpoint.clone(),
                    fingerprint: fingerprint.to_string(),
                    version,
                    breaking_change: true,
                    first_seen: now,
                    last_seen: now,
                })?;
                info!(
                    endpoint = %endpoint,
                    old = %latest.fingerprint,
                    new = fingerprint,
                    version,
                    "schema fingerprint changed"
                );
                SchemaObservation::Changed {
                    previous_fingerprint: latest.fingerprint,
                    previous_version: latest.version,
                    fingerprint: fingerprint.to_string(),
                    version,
                }
            }
        };

        let version = match &observation {
            SchemaObservation::First { version }
            | SchemaObservation::Unchanged { version }
            | SchemaObservation::Changed { version, .. } => *version,
        };
        self.latest.insert(
            endpoint.clone(),
            Latest {
                fingerprint: fingerprint.to_string(),
                version,
            },
        );
        Ok(observation)
    }
}
