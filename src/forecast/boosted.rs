//! Gradient-boosted tree ensembles, one per forecast horizon.
//!
//! The model bundle is a JSON artifact produced offline:
//!
//! ```json
//! {
//!   "model_version": "gbt-2026-01",
//!   "feature_names": ["ci", "ci_lag_1", "tod_sin"],
//!   "horizons": [
//!     { "horizon_minutes": 2, "base_score": 0.1, "trees": [
//!       { "nodes": [
//!         { "feature": 0, "threshold": 0.5, "left": 1, "right": 2 },
//!         { "value": -0.05 },
//!         { "value": 0.2 }
//!       ] }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Prediction for a horizon is `base_score` plus one leaf value per tree.
//! A split sends the row left when `feature < threshold`.

use crate::clock::Clock;
use crate::forecast::{ForecastError, ForecastStrategy};
use crate::record::{CanonicalRow, FEATURE_NAMES, ForecastVector, HorizonSchedule};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelBundle {
    pub model_version: String,
    pub feature_names: Vec<String>,
    pub horizons: Vec<HorizonModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HorizonModel {
    pub horizon_minutes: u32,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("failed to read model bundle: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse model bundle: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model bundle: {0}")]
    Invalid(String),
}

impl ModelBundle {
    pub fn validate(&self) -> Result<(), ModelLoadError> {
        if self.model_version.trim().is_empty() {
            return Err(ModelLoadError::Invalid("model_version is empty".to_string()));
        }
        if self.feature_names.is_empty() {
            return Err(ModelLoadError::Invalid("feature_names is empty".to_string()));
        }
        if let Some(unknown) = self
            .feature_names
            .iter()
            .find(|name| !FEATURE_NAMES.contains(&name.as_str()))
        {
            return Err(ModelLoadError::Invalid(format!("unknown feature {unknown:?}")));
        }

        let mut seen = HashSet::new();
        for model in &self.horizons {
            let horizon = model.horizon_minutes;
            if horizon == 0 || !seen.insert(horizon) {
                return Err(ModelLoadError::Invalid(format!(
                    "horizon {horizon} is zero or duplicated"
                )));
            }
            if !model.base_score.is_finite() {
                return Err(ModelLoadError::Invalid(format!(
                    "horizon {horizon} has non-finite base_score"
                )));
            }
            for (index, tree) in model.trees.iter().enumerate() {
                tree.validate(self.feature_names.len())
                    .map_err(|msg| {
                        ModelLoadError::Invalid(format!("horizon {horizon} tree {index}: {msg}"))
                    })?;
            }
        }
        Ok(())
    }
}

impl Tree {
    /// Children must point forward so evaluation always terminates.
    fn validate(&self, feature_count: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (index, node) in self.nodes.iter().enumerate() {
            match *node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if feature >= feature_count {
                        return Err(format!("node {index} uses feature {feature}"));
                    }
                    if !threshold.is_finite() {
                        return Err(format!("node {index} has non-finite threshold"));
                    }
                    for child in [left, right] {
                        if child <= index || child >= self.nodes.len() {
                            return Err(format!("node {index} has invalid child {child}"));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    if !value.is_finite() {
                        return Err(format!("node {index} has non-finite leaf"));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, features: &[f64]) -> Option<f64> {
        let mut index = 0;
        loop {
            match *self.nodes.get(index)? {
                TreeNode::Leaf { value } => return Some(value),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if *features.get(feature)? < threshold {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }
}

impl HorizonModel {
    fn predict(&self, features: &[f64]) -> Option<f64> {
        let mut total = self.base_score;
        for tree in &self.trees {
            total += tree.evaluate(features)?;
        }
        Some(total.max(0.0))
    }
}

#[derive(Debug)]
pub struct BoostedTreeStrategy {
    bundle: ModelBundle,
    by_horizon: BTreeMap<u32, usize>,
    schedule: HorizonSchedule,
    clock: Arc<dyn Clock>,
}

impl BoostedTreeStrategy {
    pub fn load(
        path: impl AsRef<Path>,
        schedule: HorizonSchedule,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ModelLoadError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let bundle: ModelBundle = serde_json::from_str(&contents)?;
        let strategy = Self::from_bundle(bundle, schedule, clock)?;
        info!(
            model_version = %strategy.bundle.model_version,
            horizons = strategy.by_horizon.len(),
            path = %path.as_ref().display(),
            "Loaded forecast model"
        );
        Ok(strategy)
    }

    pub fn from_bundle(
        bundle: ModelBundle,
        schedule: HorizonSchedule,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ModelLoadError> {
        bundle.validate()?;
        let by_horizon: BTreeMap<u32, usize> = bundle
            .horizons
            .iter()
            .enumerate()
            .map(|(index, model)| (model.horizon_minutes, index))
            .collect();

        let scheduled = schedule.horizons();
        let covered = scheduled
            .iter()
            .filter(|horizon| by_horizon.contains_key(horizon))
            .count();
        if covered == 0 {
            return Err(ModelLoadError::Invalid(
                "model covers none of the configured horizons".to_string(),
            ));
        }
        if covered < scheduled.len() {
            warn!(
                covered,
                scheduled = scheduled.len(),
                "Model does not cover every horizon; gaps will be NaN"
            );
        }

        Ok(Self {
            bundle,
            by_horizon,
            schedule,
            clock,
        })
    }

    pub fn model_version(&self) -> &str {
        &self.bundle.model_version
    }

    fn feature_vector(&self, row: &CanonicalRow) -> Result<Vec<f64>, ForecastError> {
        let mut values = Vec::with_capacity(self.bundle.feature_names.len());
        let mut missing = Vec::new();
        for name in &self.bundle.feature_names {
            match row.feature(name) {
                Some(value) => values.push(value),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(values)
        } else {
            Err(ForecastError::MissingFeatures {
                strategy: self.strategy_name().to_string(),
                features: missing,
            })
        }
    }
}

impl ForecastStrategy for BoostedTreeStrategy {
    fn generate_forecast(&self, row: &CanonicalRow) -> Result<ForecastVector, ForecastError> {
        row.validate().map_err(ForecastError::InvalidInput)?;
        let features = self.feature_vector(row)?;

        Ok(ForecastVector::from_fn(
            row.camera_id.clone(),
            self.clock.now(),
            &self.schedule,
            self.bundle.model_version.clone(),
            |horizon| {
                let index = *self.by_horizon.get(&horizon)?;
                self.bundle.horizons.get(index)?.predict(&features)
            },
        ))
    }

    fn is_available(&self) -> bool {
        !self.by_horizon.is_empty()
    }

    fn strategy_name(&self) -> &str {
        "model"
    }
}
