//! Embedded record store for predictors, deployments, articles, article predictions and
//! metric snapshots. Records are JSON encoded, one sled tree per collection.
//!
//! Without a data directory (or when it cannot be opened) the store runs on a temporary
//! database and nothing survives a restart.

use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::aggregator::MetricSnapshot;
use crate::error::{Result, ServingError};
use crate::model::{Article, ArticlePrediction, Deployment, Predictor, TransitionRecord};

const PREDICTORS: &str = "predictors";
const DEPLOYMENTS: &str = "deployments";
const TRANSITIONS: &str = "transitions";
const ARTICLES: &str = "articles";
const ARTICLE_PREDICTIONS: &str = "article_predictions";
const METRIC_SNAPSHOTS: &str = "metric_snapshots";

pub struct RecordStore {
    db: sled::Db,
    persistent: bool,
    abort_next_commit: AtomicBool,
}

impl RecordStore {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            match sled::open(p) {
                Ok(db) => {
                    info!(path=%p.display(), recovered=db.was_recovered(), "record store opened");
                    return Ok(Self::wrap(db, true));
                }
                Err(e) => warn!(
                    error=?e,
                    path=%p.display(),
                    "record store open failed - running ephemeral"
                ),
            }
        }
        Self::ephemeral()
    }

    pub fn ephemeral() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::wrap(db, false))
    }

    fn wrap(db: sled::Db, persistent: bool) -> Self {
        Self { db, persistent, abort_next_commit: AtomicBool::new(false) }
    }

    pub fn is_persistent(&self) -> bool { self.persistent }

    fn put<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        self.db.open_tree(tree)?.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        match self.db.open_tree(tree)?.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for kv in self.db.open_tree(tree)?.iter() {
            let (_, v) = kv?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    pub fn put_predictor(&self, p: &Predictor) -> Result<()> {
        self.put(PREDICTORS, p.id.as_str(), p)
    }

    pub fn load_predictors(&self) -> Result<Vec<Predictor>> { self.scan(PREDICTORS) }

    /// Write deployments and their transition records in one multi-tree transaction:
    /// either both trees see the change or neither does.
    pub fn commit_deployments<'a>(
        &self,
        deployments: impl IntoIterator<Item = &'a Deployment>,
        transitions: &[TransitionRecord],
    ) -> Result<()> {
        let mut rows = Vec::new();
        for d in deployments {
            rows.push((d.predictor_id.as_str().to_owned(), serde_json::to_vec(d)?));
        }
        let mut log = Vec::with_capacity(transitions.len());
        for r in transitions {
            log.push((self.db.generate_id()?.to_be_bytes(), serde_json::to_vec(r)?));
        }
        let abort = self.abort_next_commit.swap(false, Ordering::SeqCst);

        let deployments_tree = self.db.open_tree(DEPLOYMENTS)?;
        let transitions_tree = self.db.open_tree(TRANSITIONS)?;
        (&deployments_tree, &transitions_tree)
            .transaction(|(dep, trans)| {
                for (key, value) in &rows {
                    dep.insert(key.as_bytes(), value.as_slice())?;
                }
                if abort {
                    return Err(ConflictableTransactionError::Abort("commit aborted"));
                }
                for (key, value) in &log {
                    trans.insert(&key[..], value.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError<&'static str>| match e {
                TransactionError::Abort(reason) => ServingError::Storage(reason.to_string()),
                TransactionError::Storage(e) => ServingError::from(e),
            })
    }

    /// Make the next `commit_deployments` abort after its deployment writes.
    #[cfg(test)]
    pub(crate) fn abort_next_commit(&self) {
        self.abort_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn load_deployments(&self) -> Result<Vec<Deployment>> {
        self.scan(DEPLOYMENTS)
    }

    pub fn load_transitions(&self) -> Result<Vec<TransitionRecord>> {
        self.scan(TRANSITIONS)
    }

    pub fn put_article(&self, a: &Article) -> Result<()> {
        self.put(ARTICLES, &a.id, a)
    }

    pub fn get_article(&self, id: &str) -> Result<Option<Article>> {
        self.get(ARTICLES, id)
    }

    pub fn put_article_prediction(&self, p: &ArticlePrediction) -> Result<()> {
        self.put(ARTICLE_PREDICTIONS, &article_prediction_key(&p.article_id, &p.content_type), p)
    }

    pub fn get_article_prediction(
        &self,
        article_id: &str,
        content_type: &str,
    ) -> Result<Option<ArticlePrediction>> {
        self.get(ARTICLE_PREDICTIONS, &article_prediction_key(article_id, content_type))
    }

    pub fn put_metric_snapshots(&self, snapshots: &[MetricSnapshot]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for s in snapshots {
            let key = format!("{}:{}", s.predictor_id, s.metric);
            batch.insert(key.as_bytes(), serde_json::to_vec(s)?);
        }
        self.db.open_tree(METRIC_SNAPSHOTS)?.apply_batch(batch)?;
        Ok(())
    }

    pub fn load_metric_snapshots(&self) -> Result<Vec<MetricSnapshot>> {
        self.scan(METRIC_SNAPSHOTS)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await.map_err(ServingError::from)?;
        Ok(())
    }
}

fn article_prediction_key(article_id: &str, content_type: &str) -> String {
    format!("{article_id}:{content_type}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentState, PredictorId};
    use chrono::Utc;

    fn deployment(id: &str, w: f64) -> Deployment {
        Deployment {
            predictor_id: PredictorId::from(id),
            content_type: "article".into(),
            version: 1,
            traffic_weight: w,
            target_weight: w,
            state: DeploymentState::Active,
            staged_at: Utc::now(),
            activated_at: Some(Utc::now()),
            paused_at: None,
            retired_at: None,
        }
    }

    fn transition(id: &str, epoch: u64) -> TransitionRecord {
        TransitionRecord {
            predictor_id: PredictorId::from(id),
            content_type: "article".into(),
            from: Some(DeploymentState::Staged),
            to: DeploymentState::Active,
            weight_after: 1.0,
            epoch,
            at: Utc::now(),
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RecordStore::open(Some(dir.path())).unwrap();
            assert!(store.is_persistent());
            let deps = [deployment("a", 0.7), deployment("b", 0.3)];
            store.commit_deployments(&deps, &[transition("a", 1), transition("b", 2)]).unwrap();
            let article = Article {
                id: "art-1".into(),
                source: None,
                title: Some("t".into()),
                description: None,
                content: None,
                published_at: None,
            };
            store.put_article(&article).unwrap();
        }
        let store = RecordStore::open(Some(dir.path())).unwrap();
        let mut deps = store.load_deployments().unwrap();
        deps.sort_by(|a, b| a.predictor_id.cmp(&b.predictor_id));
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].traffic_weight, 0.7);
        assert_eq!(store.get_article("art-1").unwrap().unwrap().title.as_deref(), Some("t"));
        assert!(store.get_article("missing").unwrap().is_none());
        let epochs: Vec<u64> = store.load_transitions().unwrap().iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2]);
    }

    #[test]
    fn aborted_commit_writes_neither_tree() {
        let store = RecordStore::ephemeral().unwrap();
        store.commit_deployments(&[deployment("a", 1.0)], &[transition("a", 1)]).unwrap();
        store.abort_next_commit();
        let deps = [deployment("a", 0.5), deployment("b", 0.5)];
        let err = store.commit_deployments(&deps, &[transition("b", 2)]);
        assert!(matches!(err, Err(ServingError::Storage(_))));

        let deps = store.load_deployments().unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].traffic_weight, 1.0);
        assert_eq!(store.load_transitions().unwrap().len(), 1);

        store.commit_deployments(&[deployment("b", 0.5)], &[transition("b", 2)]).unwrap();
        assert_eq!(store.load_deployments().unwrap().len(), 2);
    }

    #[test]
    fn ephemeral_store_is_usable() {
        let store = RecordStore::ephemeral().unwrap();
        assert!(!store.is_persistent());
        assert!(store.load_predictors().unwrap().is_empty());
    }
}
