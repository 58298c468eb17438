//! Predictor Registry
//!
//! Append-only catalogue of predictor versions. Each content type has its own monotonic
//! version sequence; a capability may back at most one non-retired predictor at a time.
//! Registration holds the write lock across version assignment and insertion, so two
//! concurrent registrations for one content type never share a version.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, ServingError};
use crate::model::{CapabilityRef, Predictor, PredictorId};
use crate::store::RecordStore;

#[derive(Default)]
struct RegistryInner {
    predictors: HashMap<PredictorId, Predictor>,
    /// Ids per content type, version ascending.
    by_content: HashMap<String, Vec<PredictorId>>,
    /// Capability -> the non-retired predictor it backs.
    bindings: HashMap<CapabilityRef, PredictorId>,
}

pub struct PredictorRegistry {
    inner: RwLock<RegistryInner>,
    known: Option<HashSet<CapabilityRef>>,
    store: Option<Arc<RecordStore>>,
}

impl Default for PredictorRegistry {
    fn default() -> Self { Self::new() }
}

impl PredictorRegistry {
    /// Registry accepting any capability reference.
    pub fn new() -> Self {
        Self { inner: RwLock::new(RegistryInner::default()), known: None, store: None }
    }

    /// Registry that rejects capability references outside `known`.
    pub fn with_known_capabilities(known: impl IntoIterator<Item = CapabilityRef>) -> Self {
        Self { known: Some(known.into_iter().collect()), ..Self::new() }
    }

    pub fn with_store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register(&self, content_type: &str, capability: CapabilityRef) -> Result<Predictor> {
        if let Some(known) = &self.known {
            if !known.contains(&capability) {
                return Err(ServingError::UnknownCapability(capability.0));
            }
        }
        let mut g = self.inner.write();
        if let Some(bound) = g.bindings.get(&capability) {
            return Err(ServingError::DuplicateCapability {
                capability: capability.0.clone(),
                predictor_id: bound.clone(),
            });
        }
        let version = g
            .by_content
            .get(content_type)
            .and_then(|ids| ids.last())
            .and_then(|id| g.predictors.get(id))
            .map(|p| p.version + 1)
            .unwrap_or(1);
        let predictor = Predictor {
            id: PredictorId::generate(),
            content_type: content_type.to_string(),
            version,
            capability: capability.clone(),
            created_at: Utc::now(),
        };
        if let Some(store) = &self.store {
            store.put_predictor(&predictor)?;
        }
        g.by_content.entry(content_type.to_string()).or_default().push(predictor.id.clone());
        g.bindings.insert(capability, predictor.id.clone());
        g.predictors.insert(predictor.id.clone(), predictor.clone());
        info!(
            predictor=%predictor.id,
            content_type,
            version,
            capability=%predictor.capability,
            "predictor registered"
        );
        Ok(predictor)
    }

    pub fn get(&self, id: &PredictorId) -> Result<Predictor> {
        self.inner
            .read()
            .predictors
            .get(id)
            .cloned()
            .ok_or_else(|| ServingError::not_found("predictor", id))
    }

    /// All predictors for a content type, version ascending.
    pub fn list(&self, content_type: &str) -> Vec<Predictor> {
        let g = self.inner.read();
        g.by_content
            .get(content_type)
            .map(|ids| ids.iter().filter_map(|id| g.predictors.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, content_type: &str) -> Option<Predictor> {
        let g = self.inner.read();
        g.by_content.get(content_type)?.last().and_then(|id| g.predictors.get(id).cloned())
    }

    pub fn content_types(&self) -> Vec<String> {
        let mut v: Vec<String> = self.inner.read().by_content.keys().cloned().collect();
        v.sort();
        v
    }

    /// Unbind the predictor's capability so a later version may reuse it. Called on retire.
    pub fn release_capability(&self, id: &PredictorId) {
        let mut g = self.inner.write();
        let Some(cap) = g.predictors.get(id).map(|p| p.capability.clone()) else { return };
        if g.bindings.get(&cap) == Some(id) {
            g.bindings.remove(&cap);
            debug!(predictor=%id, capability=%cap, "capability released");
        }
    }

    /// Rebuild from persisted records. Every restored predictor starts out bound; the
    /// ledger releases the retired ones during its own restore.
    pub fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else { return Ok(0) };
        let mut loaded = store.load_predictors()?;
        loaded.sort_by(|a, b| {
            (a.content_type.as_str(), a.version).cmp(&(b.content_type.as_str(), b.version))
        });
        let mut g = self.inner.write();
        let n = loaded.len();
        for p in loaded {
            g.by_content.entry(p.content_type.clone()).or_default().push(p.id.clone());
            g.bindings.insert(p.capability.clone(), p.id.clone());
            g.predictors.insert(p.id.clone(), p);
        }
        info!(predictors = n, "registry restored");
        Ok(n)
    }
}
