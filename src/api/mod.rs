pub mod machine;
pub mod nic;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Common record metadata carried by every stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,

    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: u64,
}

impl Metadata {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: id.as_ref().to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            finalizers: Vec::new(),
            created_at: Utc::now(),
            deleted_at: None,
            generation: 0,
            resource_version: 0,
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

/// Stored records expose their metadata through this trait so the store and
/// reconcilers can stay generic over the record kind.
pub trait Object: Clone + Send + Sync + 'static {
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;

    fn id(&self) -> &str {
        &self.metadata().id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizers() {
        let mut metadata = Metadata::new("m-1");
        assert!(!metadata.has_finalizer("machine"));

        metadata.add_finalizer("machine");
        metadata.add_finalizer("machine");
        assert_eq!(metadata.finalizers.len(), 1);

        metadata.add_finalizer("nic");
        metadata.remove_finalizer("machine");
        assert_eq!(metadata.finalizers, vec!["nic".to_string()]);
    }
}
