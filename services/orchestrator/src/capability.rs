//! Predictor capabilities: the fixed set of scoring implementations a predictor can bind
//! to. Model internals are opaque to the engine; it only needs load, predict, health and
//! unload.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use serving_core::resilience::ResilienceError;

use crate::error::ServingError;
use crate::model::{CapabilityRef, RequestId};

/// Price charged per input character.
pub const COST_PER_CHAR: f64 = 0.001;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("capability not loaded")]
    NotLoaded,
    #[error("load failed: {0}")]
    Load(String),
    #[error("prediction failed: {0}")]
    Predict(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Circuit(#[from] ResilienceError),
}

#[derive(Debug, Clone)]
pub struct PredictionInput {
    pub request_id: RequestId,
    pub content_type: String,
    pub article_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub score: f64,
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub cost: f64,
}

#[async_trait]
pub trait PredictorCapability: Send + Sync {
    fn name(&self) -> &str;
    fn is_loaded(&self) -> bool;
    async fn load(&self) -> Result<(), CapabilityError>;
    async fn predict(&self, input: &PredictionInput) -> Result<Prediction, CapabilityError>;
    async fn health_check(&self) -> bool;
    async fn unload(&self);
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn text_cost(text: &str) -> f64 {
    text.chars().count() as f64 * COST_PER_CHAR
}

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "positive", "gain", "gains", "growth", "win", "wins",
    "success", "strong", "rise", "rises", "record", "improve", "improved", "boost", "happy",
    "best", "up",
];
const NEGATIVE: &[&str] = &[
    "bad", "poor", "terrible", "negative", "loss", "losses", "decline", "fail", "fails",
    "failure", "weak", "fall", "falls", "crash", "crisis", "worst", "down", "drop", "risk",
    "fear",
];

struct Lexicon {
    positive: HashSet<String>,
    negative: HashSet<String>,
}

/// Word-list sentiment. Score in [0, 1]; 0.5 is neutral.
pub struct LexiconSentiment {
    name: String,
    lexicon: RwLock<Option<Lexicon>>,
}

impl LexiconSentiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), lexicon: RwLock::new(None) }
    }
}

#[async_trait]
impl PredictorCapability for LexiconSentiment {
    fn name(&self) -> &str { &self.name }

    fn is_loaded(&self) -> bool { self.lexicon.read().is_some() }

    async fn load(&self) -> Result<(), CapabilityError> {
        let lex = Lexicon {
            positive: POSITIVE.iter().map(|s| s.to_string()).collect(),
            negative: NEGATIVE.iter().map(|s| s.to_string()).collect(),
        };
        *self.lexicon.write() = Some(lex);
        debug!(capability=%self.name, "lexicon loaded");
        Ok(())
    }

    async fn predict(&self, input: &PredictionInput) -> Result<Prediction, CapabilityError> {
        let guard = self.lexicon.read();
        let lex = guard.as_ref().ok_or(CapabilityError::NotLoaded)?;
        let (mut pos, mut neg, mut total) = (0u32, 0u32, 0u32);
        for t in tokens(&input.text) {
            total += 1;
            if lex.positive.contains(&t) {
                pos += 1;
            } else if lex.negative.contains(&t) {
                neg += 1;
            }
        }
        let hits = pos + neg;
        let polarity = if hits == 0 { 0.0 } else { (pos as f64 - neg as f64) / hits as f64 };
        let score = (polarity + 1.0) / 2.0;
        let label = match polarity {
            p if p > 0.1 => "positive",
            p if p < -0.1 => "negative",
            _ => "neutral",
        };
        let confidence = if total == 0 { 0.0 } else { (hits as f64 / total as f64).min(1.0) };
        Ok(Prediction {
            score,
            label: Some(label.to_string()),
            confidence: Some(confidence),
            cost: text_cost(&input.text),
        })
    }

    async fn health_check(&self) -> bool { self.is_loaded() }

    async fn unload(&self) { *self.lexicon.write() = None; }
}

const NEWS_TOPICS: &[(&str, &[&str])] = &[
    (
        "business",
        &["market", "stock", "stocks", "economy", "bank", "trade", "profit", "revenue", "company"],
    ),
    (
        "technology",
        &["ai", "software", "chip", "chips", "startup", "app", "cloud", "data", "computer"],
    ),
    (
        "politics",
        &["election", "government", "minister", "president", "vote", "policy", "senate", "law"],
    ),
    ("sports", &["match", "league", "cup", "team", "coach", "season", "goal", "tournament"]),
];

/// Keyword topic tagger. Score is the share of tokens that hit the winning topic.
pub struct KeywordTopic {
    name: String,
    topics: Vec<(String, Vec<String>)>,
    index: RwLock<Option<HashMap<String, usize>>>,
}

impl KeywordTopic {
    pub fn new(name: impl Into<String>, topics: Vec<(String, Vec<String>)>) -> Self {
        Self { name: name.into(), topics, index: RwLock::new(None) }
    }

    pub fn news(name: impl Into<String>) -> Self {
        let topics = NEWS_TOPICS
            .iter()
            .map(|(label, words)| {
                (label.to_string(), words.iter().map(|w| w.to_string()).collect())
            })
            .collect();
        Self::new(name, topics)
    }
}

#[async_trait]
impl PredictorCapability for KeywordTopic {
    fn name(&self) -> &str { &self.name }

    fn is_loaded(&self) -> bool { self.index.read().is_some() }

    async fn load(&self) -> Result<(), CapabilityError> {
        if self.topics.is_empty() {
            return Err(CapabilityError::Load("no topics configured".into()));
        }
        let mut index = HashMap::new();
        for (i, (_, words)) in self.topics.iter().enumerate() {
            for w in words {
                index.insert(w.to_lowercase(), i);
            }
        }
        *self.index.write() = Some(index);
        Ok(())
    }

    async fn predict(&self, input: &PredictionInput) -> Result<Prediction, CapabilityError> {
        let guard = self.index.read();
        let index = guard.as_ref().ok_or(CapabilityError::NotLoaded)?;
        let mut hits = vec![0u32; self.topics.len()];
        let mut total = 0u32;
        for t in tokens(&input.text) {
            total += 1;
            if let Some(&i) = index.get(&t) {
                hits[i] += 1;
            }
        }
        let (best, best_hits) = hits
            .iter()
            .copied()
            .enumerate()
            .max_by_key(|&(i, h)| (h, std::cmp::Reverse(i)))
            .unwrap_or((0, 0));
        let matched: u32 = hits.iter().sum();
        let score = if total == 0 { 0.0 } else { best_hits as f64 / total as f64 };
        let (label, confidence) = if best_hits == 0 {
            (None, None)
        } else {
            let label = self.topics.get(best).map(|(l, _)| l.clone());
            (label, Some(best_hits as f64 / matched as f64))
        };
        Ok(Prediction { score, label, confidence, cost: text_cost(&input.text) })
    }

    async fn health_check(&self) -> bool { self.is_loaded() }

    async fn unload(&self) { *self.index.write() = None; }
}

/// Constant scorer with optional delay and failure injection; used for baselines and drills.
pub struct FixedScore {
    name: String,
    score: f64,
    delay: Duration,
    fail: AtomicBool,
    loaded: AtomicBool,
    calls: AtomicU64,
}

impl FixedScore {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every prediction and report unhealthy until cleared.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PredictorCapability for FixedScore {
    fn name(&self) -> &str { &self.name }

    fn is_loaded(&self) -> bool { self.loaded.load(Ordering::Relaxed) }

    async fn load(&self) -> Result<(), CapabilityError> {
        self.loaded.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn predict(&self, input: &PredictionInput) -> Result<Prediction, CapabilityError> {
        if !self.is_loaded() {
            return Err(CapabilityError::NotLoaded);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(CapabilityError::Predict("injected failure".into()));
        }
        Ok(Prediction {
            score: self.score,
            label: None,
            confidence: Some(1.0),
            cost: text_cost(&input.text),
        })
    }

    async fn health_check(&self) -> bool { !self.fail.load(Ordering::Relaxed) }

    async fn unload(&self) { self.loaded.store(false, Ordering::Relaxed); }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityStatus {
    pub capability: CapabilityRef,
    pub loaded: bool,
    /// Only checked while loaded.
    pub healthy: Option<bool>,
}

/// Capabilities registered at startup, keyed by the reference predictors bind to.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    entries: HashMap<CapabilityRef, Arc<dyn PredictorCapability>>,
}

impl CapabilitySet {
    pub fn new() -> Self { Self::default() }

    /// `lexicon-sentiment`, `keyword-topic` and a neutral `constant` baseline.
    pub fn builtin() -> Self {
        Self::new()
            .with(Arc::new(LexiconSentiment::new("lexicon-sentiment")))
            .with(Arc::new(KeywordTopic::news("keyword-topic")))
            .with(Arc::new(FixedScore::new("constant", 0.5)))
    }

    pub fn with(mut self, cap: Arc<dyn PredictorCapability>) -> Self {
        self.insert(cap);
        self
    }

    pub fn insert(&mut self, cap: Arc<dyn PredictorCapability>) {
        self.entries.insert(CapabilityRef(cap.name().to_string()), cap);
    }

    pub fn get(&self, r: &CapabilityRef) -> Result<Arc<dyn PredictorCapability>, ServingError> {
        self.entries.get(r).cloned().ok_or_else(|| ServingError::UnknownCapability(r.0.clone()))
    }

    pub fn refs(&self) -> Vec<CapabilityRef> {
        let mut v: Vec<CapabilityRef> = self.entries.keys().cloned().collect();
        v.sort();
        v
    }

    /// Load state of every capability, with a health check for the loaded ones.
    pub async fn status(&self) -> Vec<CapabilityStatus> {
        let mut out = Vec::with_capacity(self.entries.len());
        for r in self.refs() {
            let Some(cap) = self.entries.get(&r) else { continue };
            let loaded = cap.is_loaded();
            let healthy = if loaded { Some(cap.health_check().await) } else { None };
            out.push(CapabilityStatus { capability: r, loaded, healthy });
        }
        out
    }
}
