use serde::{Deserialize, Serialize};
use serde_json::Value;

use casegen_core::CallError;

/// One requirement image to analyse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Location the model backend can read the image from
    pub path: String,
}

impl ImageRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// The language/vision model used to turn requirement images into test cases.
///
/// Implementations classify their failures with [`CallError`] kinds so callers
/// can tell transient outages from permanent input problems.
#[async_trait::async_trait]
pub trait RequirementModel: Send + Sync {
    /// Describe the requirements shown in one image. `hint` is extra context
    /// for the model (may be empty).
    async fn analyze_image(&self, image: &ImageRef, hint: &str) -> Result<String, CallError>;

    /// Merge several per-image analyses into one requirement summary.
    async fn summarize(&self, analyses: &[String]) -> Result<String, CallError>;

    /// Produce raw test cases (JSON objects) for a requirement summary.
    async fn generate_cases(&self, summary: &str) -> Result<Vec<Value>, CallError>;
}
