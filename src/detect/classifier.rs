use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

use super::features::{round_to, BodyFeatures};
use crate::Role;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Classification {
    pub role: Role,
    /// Probability of `role`, 2 decimals.
    pub confidence: f32,
}

/// Maps body features to a role. Stateless per call.
pub trait RoleClassifier: Send {
    fn name(&self) -> &str;

    fn classify(&self, features: &BodyFeatures) -> Classification;
}

// ----------------------------------------------------------------------------
// Logistic regression
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogisticWeights {
    coefficients: Vec<f32>,
    intercept: f32,
}

/// Two-feature logistic regression: `p(adult) = sigmoid(w . x + b)`.
#[derive(Clone, Debug, PartialEq)]
pub struct LogisticRoleClassifier {
    weights: [f32; 2],
    intercept: f32,
}

impl LogisticRoleClassifier {
    pub fn new(weights: [f32; 2], intercept: f32) -> Result<Self> {
        if !weights.iter().chain(std::iter::once(&intercept)).all(|w| w.is_finite()) {
            return Err(anyhow!("classifier weights must be finite"));
        }
        Ok(Self { weights, intercept })
    }

    /// Load `{"coefficients": [w_height, w_ratio], "intercept": b}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: LogisticWeights =
            serde_json::from_str(json).context("parse classifier weights")?;
        let weights: [f32; 2] = parsed.coefficients.as_slice().try_into().map_err(|_| {
            anyhow!(
                "classifier expects 2 coefficients, got {}",
                parsed.coefficients.len()
            )
        })?;
        Self::new(weights, parsed.intercept)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read classifier weights {}", path.display()))?;
        let classifier = Self::from_json(&json)
            .with_context(|| format!("load classifier weights {}", path.display()))?;
        log::info!("LogisticRoleClassifier: loaded {}", path.display());
        Ok(classifier)
    }

    pub fn adult_probability(&self, features: &BodyFeatures) -> f32 {
        let x = features.as_array();
        let z = self.weights[0] * x[0] + self.weights[1] * x[1] + self.intercept;
        1.0 / (1.0 + (-z).exp())
    }
}

impl RoleClassifier for LogisticRoleClassifier {
    fn name(&self) -> &str {
        "logistic"
    }

    fn classify(&self, features: &BodyFeatures) -> Classification {
        let p_adult = self.adult_probability(features);
        if p_adult >= 0.5 {
            Classification {
                role: Role::Adult,
                confidence: round_to(p_adult, 2),
            }
        } else {
            Classification {
                role: Role::Child,
                confidence: round_to(1.0 - p_adult, 2),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Height threshold
// ----------------------------------------------------------------------------

/// Fallback when no trained weights are available: tall bodies are adults.
#[derive(Clone, Debug, PartialEq)]
pub struct HeightRatioClassifier {
    pub adult_min_height: f32,
}

impl Default for HeightRatioClassifier {
    fn default() -> Self {
        Self {
            adult_min_height: 140.0,
        }
    }
}

impl RoleClassifier for HeightRatioClassifier {
    fn name(&self) -> &str {
        "height"
    }

    fn classify(&self, features: &BodyFeatures) -> Classification {
        let threshold = self.adult_min_height.max(1.0);
        let margin = (features.body_height - threshold).abs() / threshold;
        let confidence = round_to((0.5 + margin).clamp(0.5, 0.99), 2);
        let role = if features.body_height >= threshold {
            Role::Adult
        } else {
            Role::Child
        };
        Classification { role, confidence }
    }
}
