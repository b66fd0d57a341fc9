// The backend's node registry, as reported by /object_info. The pipeline only
// ever uses a fixed set of stock nodes, but we validate the whole flow against
// the registry so a missing custom node fails before anything is queued.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::client::ComfyClient;

/// Every node class the pipeline relies on. All of these ship with ComfyUI.
pub const REQUIRED_NODES: &[&str] = &[
    "CheckpointLoaderSimple",
    "EmptyLatentImage",
    "LoraLoader",
    "CLIPTextEncode",
    "ModelSamplingDiscrete",
    "KSampler",
    "VAEDecode",
    "SaveImage",
];

/// One entry of /object_info. Only the fields we consume; the backend sends a
/// lot more.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeClass {
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(default)]
    pub output_name: Vec<String>,
    #[serde(default)]
    pub category: String,
}

pub struct NodeRegistry {
    classes: HashMap<String, NodeClass>,
}

impl NodeRegistry {
    /// Acquires the registry from the backend. This is also the first request
    /// of a run, so it doubles as the connectivity check.
    pub async fn fetch(client: &ComfyClient) -> Result<Self> {
        let info = client.object_info().await?;
        Ok(Self::from_value(&info))
    }

    /// Builds the registry from raw /object_info JSON. Entries that don't
    /// deserialize are skipped; custom nodes get creative with their metadata.
    pub fn from_value(info: &Value) -> Self {
        let mut classes = HashMap::new();
        let entries = match info.as_object() {
            Some(entries) => entries,
            None => {
                warn!("object_info is not a mapping; registry will be empty");
                return Self { classes };
            }
        };
        for (name, entry) in entries {
            match serde_json::from_value::<NodeClass>(entry.clone()) {
                Ok(class) => {
                    classes.insert(name.clone(), class);
                }
                Err(e) => warn!("Skipping malformed node class {}: {}", name, e),
            }
        }
        debug!("Registry holds {} node classes", classes.len());
        Self { classes }
    }

    /// Looks up a node class by name. A missing key is fatal: there is no way
    /// to run the pipeline without every node it references.
    pub fn class(&self, name: &str) -> Result<&NodeClass> {
        self.classes
            .get(name)
            .ok_or_else(|| anyhow!("backend has no node class named {:?}", name))
    }

    /// Verifies that every node class the pipeline uses exists.
    pub fn require_all(&self) -> Result<()> {
        for name in REQUIRED_NODES {
            self.class(name)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
pub mod testdata {
    use super::*;
    use serde_json::json;

    /// A registry holding just the stock nodes, with their real output slots.
    pub fn stock_registry() -> NodeRegistry {
        NodeRegistry::from_value(&json!({
            "CheckpointLoaderSimple": {
                "output": ["MODEL", "CLIP", "VAE"],
                "output_name": ["MODEL", "CLIP", "VAE"],
                "category": "loaders",
            },
            "EmptyLatentImage": {
                "output": ["LATENT"],
                "output_name": ["LATENT"],
                "category": "latent",
            },
            "LoraLoader": {
                "output": ["MODEL", "CLIP"],
                "output_name": ["MODEL", "CLIP"],
                "category": "loaders",
            },
            "CLIPTextEncode": {
                "output": ["CONDITIONING"],
                "output_name": ["CONDITIONING"],
                "category": "conditioning",
            },
            "ModelSamplingDiscrete": {
                "output": ["MODEL"],
                "output_name": ["MODEL"],
                "category": "advanced/model",
            },
            "KSampler": {
                "output": ["LATENT"],
                "output_name": ["LATENT"],
                "category": "sampling",
            },
            "VAEDecode": {
                "output": ["IMAGE"],
                "output_name": ["IMAGE"],
                "category": "latent",
            },
            "SaveImage": {
                "output": [],
                "output_name": [],
                "category": "image",
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stock_registry_has_all_required_nodes() {
        let registry = testdata::stock_registry();
        assert_eq!(registry.len(), REQUIRED_NODES.len());
        registry.require_all().unwrap();
    }

    #[test]
    fn test_missing_class_is_fatal() {
        let registry = NodeRegistry::from_value(&json!({
            "KSampler": {"output": ["LATENT"], "output_name": ["LATENT"], "category": "sampling"},
        }));
        assert!(registry.class("KSampler").is_ok());
        let err = registry.class("CheckpointLoaderSimple").unwrap_err();
        assert!(err.to_string().contains("CheckpointLoaderSimple"));
        assert!(registry.require_all().is_err());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let registry = NodeRegistry::from_value(&json!({
            "Fine": {"output": ["IMAGE"], "output_name": ["IMAGE"], "category": "image"},
            "Weird": {"output": "not-a-list"},
        }));
        assert_eq!(registry.len(), 1);
        assert!(registry.class("Weird").is_err());
    }

    #[test]
    fn test_non_mapping_object_info() {
        let registry = NodeRegistry::from_value(&json!([1, 2, 3]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_output_slots_follow_framework_convention() {
        let registry = testdata::stock_registry();
        let ckpt = registry.class("CheckpointLoaderSimple").unwrap();
        assert_eq!(ckpt.output_name, ["MODEL", "CLIP", "VAE"]);
        let lora = registry.class("LoraLoader").unwrap();
        assert_eq!(lora.output_name, ["MODEL", "CLIP"]);
    }
}
