use crate::error::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Number of model inputs: `[last_return, last_volatility]`.
pub const FEATURE_COUNT: usize = 2;

/// Next-period volatility estimator.
pub trait VolatilityModel: Send + Sync {
    fn predict(&self, last_return: f64, last_volatility: f64) -> f64;

    /// Short description for logging.
    fn describe(&self) -> String;
}

// ──────────────────────────────────────────────────────────────────────────────
// Artifact
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    GradientBoosting(GradientBoostedTrees),
    Linear(LinearModel),
}

/// Additive regression-tree ensemble: `init + learning_rate * Σ tree(x)`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GradientBoostedTrees {
    pub init: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RegressionTree {
    /// Node 0 is the root. Children always sit after their parent.
    pub nodes: Vec<TreeNode>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TreeNode {
    /// `x[feature] <= threshold` goes left.
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

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: [f64; FEATURE_COUNT],
}

impl RegressionTree {
    fn validate(&self, tree_idx: usize) -> std::result::Result<(), String> {
        if self.nodes.is_empty() {
            return Err(format!("tree {} has no nodes", tree_idx));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } = node
            {
                if *feature >= FEATURE_COUNT {
                    return Err(format!(
                        "tree {} node {} splits on feature {} (only {} inputs)",
                        tree_idx, i, feature, FEATURE_COUNT
                    ));
                }
                if !threshold.is_finite() {
                    return Err(format!("tree {} node {} has a non-finite threshold", tree_idx, i));
                }
                for child in [*left, *right] {
                    if child <= i || child >= self.nodes.len() {
                        return Err(format!(
                            "tree {} node {} points at invalid child {}",
                            tree_idx, i, child
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, x: &[f64; FEATURE_COUNT]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { value } => return *value,
            }
        }
    }
}

impl ModelArtifact {
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::GradientBoosting(gb) => {
                if gb.trees.is_empty() {
                    return Err("gradient boosting model has no trees".to_string());
                }
                if !gb.init.is_finite() || !gb.learning_rate.is_finite() {
                    return Err("init and learning_rate must be finite".to_string());
                }
                gb.trees
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, t)| t.validate(i))
            }
            Self::Linear(lin) => {
                if lin.intercept.is_finite() && lin.coefficients.iter().all(|c| c.is_finite()) {
                    Ok(())
                } else {
                    Err("linear model has non-finite parameters".to_string())
                }
            }
        }
    }
}

impl VolatilityModel for ModelArtifact {
    fn predict(&self, last_return: f64, last_volatility: f64) -> f64 {
        let x = [last_return, last_volatility];
        match self {
            Self::GradientBoosting(gb) => {
                let boost: f64 = gb.trees.iter().map(|t| t.evaluate(&x)).sum();
                gb.init + gb.learning_rate * boost
            }
            Self::Linear(lin) => {
                lin.intercept + lin.coefficients[0] * x[0] + lin.coefficients[1] * x[1]
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::GradientBoosting(gb) => format!(
                "gradient boosting ({} trees, learning_rate={})",
                gb.trees.len(),
                gb.learning_rate
            ),
            Self::Linear(_) => "linear".to_string(),
        }
    }
}

/// Reads and validates a model artifact.
pub fn load_model(path: &Path) -> Result<ModelArtifact> {
    let unavailable = |what: &str, e: String| {
        AnalyticsError::ModelUnavailable(format!("{} {}: {}", what, path.display(), e))
    };

    let raw = std::fs::read_to_string(path).map_err(|e| unavailable("cannot read", e.to_string()))?;
    let artifact: ModelArtifact =
        serde_json::from_str(&raw).map_err(|e| unavailable("cannot parse", e.to_string()))?;
    artifact
        .validate()
        .map_err(|e| unavailable("invalid model", e))?;
    Ok(artifact)
}

// ──────────────────────────────────────────────────────────────────────────────
// Load-Once Holder
// ──────────────────────────────────────────────────────────────────────────────

type LoadOutcome = Result<Arc<dyn VolatilityModel>>;
type Loader = Box<dyn Fn() -> LoadOutcome + Send + Sync>;

/// Write-once slot for the process-wide model. The first caller runs the
/// loader; concurrent first callers wait for that same run. The outcome,
/// success or failure, is kept for the life of the holder.
pub struct ModelCell {
    source: String,
    loader: Loader,
    slot: OnceLock<LoadOutcome>,
}

impl ModelCell {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        let source = path.display().to_string();
        Self::with_loader(source, move || {
            load_model(&path).map(|m| Arc::new(m) as Arc<dyn VolatilityModel>)
        })
    }

    pub fn with_loader(
        source: impl Into<String>,
        loader: impl Fn() -> LoadOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: source.into(),
            loader: Box::new(loader),
            slot: OnceLock::new(),
        }
    }

    /// Holder that is already loaded with `model`.
    #[cfg(test)]
    pub fn with_model(model: Arc<dyn VolatilityModel>) -> Self {
        let cell = Self::with_loader("injected", || {
            Err(AnalyticsError::ModelUnavailable("loader not used".to_string()))
        });
        let _ = cell.slot.set(Ok(model));
        cell
    }

    pub fn get(&self) -> Result<Arc<dyn VolatilityModel>> {
        let outcome = self.slot.get_or_init(|| {
            info!("Loading volatility model from {}", self.source);
            let outcome = (self.loader)();
            match &outcome {
                Ok(model) => info!("Volatility model ready: {}", model.describe()),
                Err(e) => warn!("Volatility model failed to load: {}", e),
            }
            outcome
        });
        outcome.clone()
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        matches!(self.slot.get(), Some(Ok(_)))
    }

    /// Raw, unrounded prediction.
    pub fn predict(&self, last_return: f64, last_volatility: f64) -> Result<f64> {
        Ok(self.get()?.predict(last_return, last_volatility))
    }
}
