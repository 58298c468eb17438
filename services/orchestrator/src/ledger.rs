//! Deployment Ledger
//!
//! Single gateway for deployment state. Every mutation is computed on a scratch copy of
//! the content type's deployments, checked against the weight simplex, written through
//! to the record store and only then swapped in under the write lock. A failed check or
//! a failed write leaves the ledger untouched.
//!
//! Weight rules:
//! - the deployment being changed is pinned to its requested weight and the other ACTIVE
//!   deployments are scaled proportionally to fill the remainder (equal split when they
//!   carry no mass);
//! - a sole ACTIVE deployment always carries 1.0;
//! - non-ACTIVE deployments carry 0.0, their requested weight is kept in `target_weight`.

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use serving_core::SERVING_METRICS;

use crate::error::{Result, ServingError};
use crate::model::{Deployment, DeploymentState, PredictorId, TransitionRecord};
use crate::registry::PredictorRegistry;
use crate::store::RecordStore;

const WEIGHT_EPSILON: f64 = 1e-9;
const HISTORY_CAP: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveEntry {
    pub predictor_id: PredictorId,
    pub version: u32,
    pub weight: f64,
}

/// Immutable view of one content type's ACTIVE deployments, version ascending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSet {
    pub content_type: String,
    pub epoch: u64,
    pub entries: Vec<ActiveEntry>,
}

impl ActiveSet {
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn total_weight(&self) -> f64 { self.entries.iter().map(|e| e.weight).sum() }
}

#[derive(Default)]
struct LedgerInner {
    deployments: HashMap<PredictorId, Deployment>,
    active: HashMap<String, Arc<ActiveSet>>,
    epochs: HashMap<String, u64>,
    history: VecDeque<TransitionRecord>,
}

pub struct DeploymentLedger {
    inner: RwLock<LedgerInner>,
    registry: Arc<PredictorRegistry>,
    store: Option<Arc<RecordStore>>,
}

impl DeploymentLedger {
    pub fn new(registry: Arc<PredictorRegistry>) -> Self {
        Self { inner: RwLock::new(LedgerInner::default()), registry, store: None }
    }

    pub fn with_store(mut self, store: Arc<RecordStore>) -> Self { self.store = Some(store); self }

    pub fn registry(&self) -> &Arc<PredictorRegistry> { &self.registry }

    /// Create a STAGED deployment carrying `initial_weight` as its requested share.
    pub fn stage(&self, predictor_id: &PredictorId, initial_weight: f64) -> Result<Deployment> {
        check_weight(initial_weight)?;
        let predictor = self.registry.get(predictor_id)?;
        let mut g = self.inner.write();
        if let Some(existing) = g.deployments.get(predictor_id) {
            return Err(invalid(predictor_id, existing.state, "stage"));
        }
        let d = Deployment {
            predictor_id: predictor_id.clone(),
            content_type: predictor.content_type.clone(),
            version: predictor.version,
            traffic_weight: 0.0,
            target_weight: initial_weight,
            state: DeploymentState::Staged,
            staged_at: Utc::now(),
            activated_at: None,
            paused_at: None,
            retired_at: None,
        };
        let epoch = g.epochs.get(&d.content_type).copied().unwrap_or(0) + 1;
        let record = TransitionRecord {
            predictor_id: d.predictor_id.clone(),
            content_type: d.content_type.clone(),
            from: None,
            to: DeploymentState::Staged,
            weight_after: 0.0,
            epoch,
            at: d.staged_at,
        };
        if let Some(store) = &self.store {
            store.commit_deployments([&d], std::slice::from_ref(&record))?;
        }
        g.epochs.insert(d.content_type.clone(), epoch);
        push_history(&mut g.history, vec![record]);
        g.deployments.insert(d.predictor_id.clone(), d.clone());
        info!(
            predictor=%predictor_id,
            content_type=%d.content_type,
            version=d.version,
            target_weight=initial_weight,
            "deployment staged"
        );
        Ok(d)
    }

    /// STAGED or PAUSED -> ACTIVE at the deployment's requested weight.
    pub fn activate(&self, predictor_id: &PredictorId) -> Result<Deployment> {
        self.mutate(predictor_id, "activate", |set, idx| {
            match set[idx].state {
                DeploymentState::Staged | DeploymentState::Paused => {}
                other => return Err(invalid(predictor_id, other, "activate")),
            }
            let now = Utc::now();
            let d = &mut set[idx];
            d.state = DeploymentState::Active;
            d.activated_at = Some(now);
            d.paused_at = None;
            let target = d.target_weight;
            pin_weight(set, idx, target);
            Ok(())
        })
    }

    /// Pin an ACTIVE deployment's weight and rescale its siblings.
    pub fn set_weight(&self, predictor_id: &PredictorId, weight: f64) -> Result<Deployment> {
        check_weight(weight)?;
        self.mutate(predictor_id, "set_weight", |set, idx| {
            if set[idx].state != DeploymentState::Active {
                return Err(invalid(predictor_id, set[idx].state, "set_weight"));
            }
            set[idx].target_weight = weight;
            pin_weight(set, idx, weight);
            Ok(())
        })
    }

    /// ACTIVE -> PAUSED; the freed weight goes to the remaining ACTIVE siblings.
    pub fn pause(&self, predictor_id: &PredictorId) -> Result<Deployment> {
        self.mutate(predictor_id, "pause", |set, idx| {
            if set[idx].state != DeploymentState::Active {
                return Err(invalid(predictor_id, set[idx].state, "pause"));
            }
            let d = &mut set[idx];
            d.state = DeploymentState::Paused;
            d.paused_at = Some(Utc::now());
            d.traffic_weight = 0.0;
            normalize(set);
            Ok(())
        })
    }

    /// Any non-retired state -> RETIRED. Irreversible; releases the capability binding.
    pub fn retire(&self, predictor_id: &PredictorId) -> Result<Deployment> {
        let d = self.mutate(predictor_id, "retire", |set, idx| {
            if set[idx].state.is_terminal() {
                return Err(invalid(predictor_id, set[idx].state, "retire"));
            }
            let d = &mut set[idx];
            d.state = DeploymentState::Retired;
            d.retired_at = Some(Utc::now());
            d.traffic_weight = 0.0;
            normalize(set);
            Ok(())
        })?;
        self.registry.release_capability(predictor_id);
        Ok(d)
    }

    pub fn get(&self, predictor_id: &PredictorId) -> Result<Deployment> {
        self.inner
            .read()
            .deployments
            .get(predictor_id)
            .cloned()
            .ok_or_else(|| ServingError::not_found("deployment", predictor_id))
    }

    /// All deployments of a content type, version ascending.
    pub fn list(&self, content_type: &str) -> Vec<Deployment> {
        let g = self.inner.read();
        sorted_siblings(&g.deployments, content_type)
    }

    /// Current ACTIVE partition; cheap to call on every request.
    pub fn active_set(&self, content_type: &str) -> Arc<ActiveSet> {
        let g = self.inner.read();
        g.active.get(content_type).cloned().unwrap_or_else(|| {
            Arc::new(ActiveSet {
                content_type: content_type.to_string(),
                epoch: g.epochs.get(content_type).copied().unwrap_or(0),
                entries: Vec::new(),
            })
        })
    }

    pub fn epoch(&self, content_type: &str) -> u64 {
        self.inner.read().epochs.get(content_type).copied().unwrap_or(0)
    }

    pub fn content_types(&self) -> Vec<String> {
        let mut v: Vec<String> = self.inner.read().epochs.keys().cloned().collect();
        v.sort();
        v
    }

    /// Most recent transitions for a content type, oldest first.
    pub fn history(&self, content_type: &str, limit: usize) -> Vec<TransitionRecord> {
        let g = self.inner.read();
        let mut out: Vec<TransitionRecord> = g
            .history
            .iter()
            .rev()
            .filter(|r| r.content_type == content_type)
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Rebuild from persisted deployments and transitions.
    pub fn restore(&self) -> Result<usize> {
        let Some(store) = &self.store else { return Ok(0) };
        let deployments = store.load_deployments()?;
        let transitions = store.load_transitions()?;
        let mut g = self.inner.write();
        let n = deployments.len();
        for d in deployments {
            if d.state.is_terminal() {
                self.registry.release_capability(&d.predictor_id);
            }
            g.deployments.insert(d.predictor_id.clone(), d);
        }
        for r in &transitions {
            let e = g.epochs.entry(r.content_type.clone()).or_insert(0);
            *e = (*e).max(r.epoch);
        }
        push_history(&mut g.history, transitions);
        let content_types: Vec<String> =
            g.deployments.values().map(|d| d.content_type.clone()).collect();
        for ct in content_types {
            g.epochs.entry(ct.clone()).or_insert(1);
            let mut set = sorted_siblings(&g.deployments, &ct);
            if set.iter().any(|d| d.state == DeploymentState::Active) && !simplex_holds(&set) {
                warn!(content_type=%ct, "restored weights off the simplex - renormalizing");
                normalize(&mut set);
                for d in set { g.deployments.insert(d.predictor_id.clone(), d); }
            }
            let epoch = g.epochs.get(&ct).copied().unwrap_or(1);
            let active = build_active(&g.deployments, &ct, epoch);
            g.active.insert(ct, active);
        }
        info!(deployments = n, "ledger restored");
        Ok(n)
    }

    /// Apply `f` to a scratch copy of the target's sibling set and commit all-or-nothing.
    fn mutate<F>(
        &self,
        predictor_id: &PredictorId,
        action: &'static str,
        f: F,
    ) -> Result<Deployment>
    where
        F: FnOnce(&mut Vec<Deployment>, usize) -> Result<()>,
    {
        let mut g = self.inner.write();
        let content_type = match g.deployments.get(predictor_id) {
            Some(d) => d.content_type.clone(),
            None => return Err(ServingError::not_found("deployment", predictor_id)),
        };
        let before = sorted_siblings(&g.deployments, &content_type);
        let mut scratch = before.clone();
        let idx = scratch
            .iter()
            .position(|d| &d.predictor_id == predictor_id)
            .ok_or_else(|| ServingError::not_found("deployment", predictor_id))?;
        f(&mut scratch, idx)?;
        if !simplex_holds(&scratch) {
            warn!(
                predictor=%predictor_id,
                action,
                "rejecting mutation that breaks the weight simplex"
            );
            let total = scratch.iter().map(|d| d.traffic_weight).sum();
            return Err(ServingError::InvalidWeight(total));
        }

        let epoch = g.epochs.get(&content_type).copied().unwrap_or(0) + 1;
        let now = Utc::now();
        let records: Vec<TransitionRecord> = before
            .iter()
            .zip(scratch.iter())
            .filter(|(old, new)| {
                old.state != new.state
                    || (old.traffic_weight - new.traffic_weight).abs() > WEIGHT_EPSILON
                    || new.predictor_id == *predictor_id
            })
            .map(|(old, new)| TransitionRecord {
                predictor_id: new.predictor_id.clone(),
                content_type: content_type.clone(),
                from: Some(old.state),
                to: new.state,
                weight_after: new.traffic_weight,
                epoch,
                at: now,
            })
            .collect();
        if let Some(store) = &self.store {
            store.commit_deployments(scratch.iter(), &records)?;
        }

        let updated = scratch[idx].clone();
        for d in scratch { g.deployments.insert(d.predictor_id.clone(), d); }
        g.epochs.insert(content_type.clone(), epoch);
        let active = build_active(&g.deployments, &content_type, epoch);
        for e in &active.entries {
            let labels = [
                KeyValue::new("content_type", content_type.clone()),
                KeyValue::new("predictor", e.predictor_id.0.clone()),
            ];
            SERVING_METRICS.routing.active_weight.record(e.weight, &labels);
        }
        g.active.insert(content_type.clone(), active);
        push_history(&mut g.history, records);
        info!(
            predictor=%predictor_id,
            content_type=%content_type,
            action,
            state=?updated.state,
            weight=updated.traffic_weight,
            epoch,
            "deployment updated"
        );
        Ok(updated)
    }
}

fn check_weight(w: f64) -> Result<()> {
    if w.is_finite() && (0.0..=1.0).contains(&w) {
        Ok(())
    } else {
        Err(ServingError::InvalidWeight(w))
    }
}

fn invalid(
    predictor_id: &PredictorId,
    from: DeploymentState,
    action: &'static str,
) -> ServingError {
    ServingError::InvalidTransition { predictor_id: predictor_id.clone(), from: Some(from), action }
}

fn sorted_siblings(
    deployments: &HashMap<PredictorId, Deployment>,
    content_type: &str,
) -> Vec<Deployment> {
    let mut v: Vec<Deployment> =
        deployments.values().filter(|d| d.content_type == content_type).cloned().collect();
    v.sort_by(|a, b| {
        a.version.cmp(&b.version).then_with(|| a.predictor_id.cmp(&b.predictor_id))
    });
    v
}

fn build_active(
    deployments: &HashMap<PredictorId, Deployment>,
    content_type: &str,
    epoch: u64,
) -> Arc<ActiveSet> {
    let entries = sorted_siblings(deployments, content_type)
        .into_iter()
        .filter(|d| d.state == DeploymentState::Active)
        .map(|d| ActiveEntry {
            predictor_id: d.predictor_id,
            version: d.version,
            weight: d.traffic_weight,
        })
        .collect();
    Arc::new(ActiveSet { content_type: content_type.to_string(), epoch, entries })
}

fn active_indices(set: &[Deployment]) -> Vec<usize> {
    set.iter()
        .enumerate()
        .filter(|(_, d)| d.state == DeploymentState::Active)
        .map(|(i, _)| i)
        .collect()
}

/// Fix `set[pinned]` at `weight`; scale the other ACTIVE entries into `1 - weight`.
fn pin_weight(set: &mut [Deployment], pinned: usize, weight: f64) {
    let others: Vec<usize> = active_indices(set).into_iter().filter(|&i| i != pinned).collect();
    if others.is_empty() {
        set[pinned].traffic_weight = 1.0;
        return;
    }
    set[pinned].traffic_weight = weight;
    let remainder = 1.0 - weight;
    let mass: f64 = others.iter().map(|&i| set[i].traffic_weight).sum();
    for &i in &others {
        set[i].traffic_weight = if mass > WEIGHT_EPSILON {
            set[i].traffic_weight / mass * remainder
        } else {
            remainder / others.len() as f64
        };
    }
    debug!(pinned = weight, siblings = others.len(), "weights re-pinned");
}

/// Scale ACTIVE entries to sum to one; equal split when they carry no mass.
fn normalize(set: &mut [Deployment]) {
    let active = active_indices(set);
    if active.is_empty() { return; }
    let mass: f64 = active.iter().map(|&i| set[i].traffic_weight).sum();
    for &i in &active {
        set[i].traffic_weight = if mass > WEIGHT_EPSILON {
            set[i].traffic_weight / mass
        } else {
            1.0 / active.len() as f64
        };
    }
}

fn simplex_holds(set: &[Deployment]) -> bool {
    let mut total = 0.0;
    let mut any_active = false;
    for d in set {
        if !(0.0..=1.0 + WEIGHT_EPSILON).contains(&d.traffic_weight) { return false; }
        if d.state == DeploymentState::Active {
            any_active = true;
            total += d.traffic_weight;
        } else if d.traffic_weight != 0.0 {
            return false;
        }
    }
    !any_active || (total - 1.0).abs() < 1e-6
}

fn push_history(history: &mut VecDeque<TransitionRecord>, records: Vec<TransitionRecord>) {
    history.extend(records);
    while history.len() > HISTORY_CAP { history.pop_front(); }
}
