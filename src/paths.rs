// Filesystem discovery: locating a ComfyUI checkout relative to the working
// directory, and assembling the model search paths it would use (its own
// models/ tree plus anything listed in extra_model_paths.yaml).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

/// Walks ancestor directories starting at `start` until one contains an entry
/// named `name`, returning the entry's full path. Returns None once the
/// filesystem root has been searched without a match.
pub fn find_path(name: &str, start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(name);
        if candidate.exists() {
            info!("{} found: {}", name, candidate.display());
            return Some(candidate);
        }
        debug!("{} not in {}", name, current.display());
        dir = current.parent();
    }
    None
}

/// Locates a ComfyUI installation above `start`, if there is one.
pub fn find_comfyui_dir(start: &Path) -> Option<PathBuf> {
    find_path("ComfyUI", start).filter(|p| p.is_dir())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Checkpoint,
    Lora,
}

impl ModelKind {
    /// Directory name under ComfyUI's models/ tree, which doubles as the key
    /// used in extra_model_paths.yaml.
    fn key(self) -> &'static str {
        match self {
            ModelKind::Checkpoint => "checkpoints",
            ModelKind::Lora => "loras",
        }
    }
}

/// Search paths for model files, per kind.
#[derive(Debug, Default)]
pub struct ModelPaths {
    checkpoints: Vec<PathBuf>,
    loras: Vec<PathBuf>,
}

impl ModelPaths {
    /// Builds the search path set the way ComfyUI itself would: the models/
    /// tree of the nearest installation, extended by extra_model_paths.yaml
    /// if one is found. Both pieces are optional; an empty set just means
    /// every lookup misses.
    pub fn discover(start: &Path) -> Self {
        let mut paths = ModelPaths::default();
        match find_comfyui_dir(start) {
            Some(dir) => {
                paths.push(ModelKind::Checkpoint, dir.join("models").join("checkpoints"));
                paths.push(ModelKind::Lora, dir.join("models").join("loras"));
            }
            None => warn!("No ComfyUI directory found above {}", start.display()),
        }
        match find_path("extra_model_paths.yaml", start) {
            Some(config) => {
                if let Err(e) = paths.add_extra_model_paths(&config) {
                    warn!("Ignoring {}: {:#}", config.display(), e);
                }
            }
            None => info!("Could not find the extra_model_paths config file."),
        }
        paths
    }

    pub fn push(&mut self, kind: ModelKind, path: PathBuf) {
        match kind {
            ModelKind::Checkpoint => self.checkpoints.push(path),
            ModelKind::Lora => self.loras.push(path),
        }
    }

    /// Parses an extra_model_paths.yaml file and appends every directory it
    /// lists for the kinds we care about.
    pub fn add_extra_model_paths(&mut self, config: &Path) -> Result<()> {
        let text = std::fs::read_to_string(config)
            .with_context(|| format!("failed to read {}", config.display()))?;
        for (kind, path) in parse_extra_model_paths(&text)? {
            debug!("Extra {} path: {}", kind.key(), path.display());
            self.push(kind, path);
        }
        Ok(())
    }

    /// Returns the first directory containing `filename`, searching in
    /// registration order.
    pub fn locate(&self, kind: ModelKind, filename: &str) -> Option<PathBuf> {
        let dirs = match kind {
            ModelKind::Checkpoint => &self.checkpoints,
            ModelKind::Lora => &self.loras,
        };
        dirs.iter()
            .map(|dir| dir.join(filename))
            .find(|candidate| candidate.is_file())
    }
}

/// Parses the ComfyUI extra_model_paths.yaml format: top-level sections, each
/// with an optional base_path and per-kind values that may hold several
/// newline-separated relative paths.
pub fn parse_extra_model_paths(text: &str) -> Result<Vec<(ModelKind, PathBuf)>> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(text).context("failed to parse extra model paths yaml")?;
    let sections = match doc.as_mapping() {
        Some(sections) => sections,
        None => return Ok(Vec::new()),
    };

    let mut found = Vec::new();
    for (section_name, section) in sections {
        let section = match section.as_mapping() {
            Some(s) => s,
            None => {
                warn!("Skipping non-mapping section {:?}", section_name);
                continue;
            }
        };
        let base_path = section
            .get("base_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        for kind in [ModelKind::Checkpoint, ModelKind::Lora] {
            let value = match section.get(kind.key()).and_then(|v| v.as_str()) {
                Some(v) => v,
                None => continue,
            };
            // A single value may list several paths, one per line.
            for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let path = match &base_path {
                    Some(base) => base.join(line),
                    None => PathBuf::from(line),
                };
                found.push((kind, path));
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdirs(root: &Path, relative: &str) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test_log::test]
    fn test_find_path_at_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let target = mkdirs(tmp.path(), "ComfyUI");
        let start = mkdirs(tmp.path(), "projects/bot/scripts");
        assert_eq!(find_path("ComfyUI", &start), Some(target));
    }

    #[test]
    fn test_find_path_in_start_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let target = mkdirs(tmp.path(), "ComfyUI");
        assert_eq!(find_path("ComfyUI", tmp.path()), Some(target));
    }

    #[test]
    fn test_find_path_no_match() {
        let tmp = tempfile::tempdir().unwrap();
        let start = mkdirs(tmp.path(), "a/b/c");
        // Nothing by this name anywhere up to the root, one hopes.
        assert_eq!(find_path("comfygen-test-no-such-entry-4f1d", &start), None);
    }

    #[test]
    fn test_find_comfyui_dir_rejects_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ComfyUI"), "not a directory").unwrap();
        let start = mkdirs(tmp.path(), "nested");
        assert_eq!(find_comfyui_dir(&start), None);
    }

    #[test]
    fn test_parse_extra_model_paths() {
        let yaml = "\
a111:
    base_path: /opt/webui
    checkpoints: models/Stable-diffusion
    loras: |
        models/Lora
        models/LyCORIS
comfyui:
    checkpoints: /srv/models/checkpoints
";
        let parsed = parse_extra_model_paths(yaml).unwrap();
        assert_eq!(
            parsed,
            vec![
                (ModelKind::Checkpoint, PathBuf::from("/opt/webui/models/Stable-diffusion")),
                (ModelKind::Lora, PathBuf::from("/opt/webui/models/Lora")),
                (ModelKind::Lora, PathBuf::from("/opt/webui/models/LyCORIS")),
                (ModelKind::Checkpoint, PathBuf::from("/srv/models/checkpoints")),
            ]
        );
    }

    #[test]
    fn test_parse_extra_model_paths_ignores_junk() {
        let parsed = parse_extra_model_paths("just a string").unwrap();
        assert!(parsed.is_empty());
        let parsed = parse_extra_model_paths("section: 42").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_locate() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoints = mkdirs(tmp.path(), "models/checkpoints");
        std::fs::write(checkpoints.join("base.safetensors"), "").unwrap();

        let mut paths = ModelPaths::default();
        paths.push(ModelKind::Checkpoint, checkpoints.clone());
        assert_eq!(
            paths.locate(ModelKind::Checkpoint, "base.safetensors"),
            Some(checkpoints.join("base.safetensors"))
        );
        assert_eq!(paths.locate(ModelKind::Checkpoint, "missing.safetensors"), None);
        assert_eq!(paths.locate(ModelKind::Lora, "base.safetensors"), None);
    }

    #[test_log::test]
    fn test_discover_finds_models_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoints = mkdirs(tmp.path(), "ComfyUI/models/checkpoints");
        std::fs::write(checkpoints.join("base.safetensors"), "").unwrap();
        let start = mkdirs(tmp.path(), "work");

        let paths = ModelPaths::discover(&start);
        assert_eq!(
            paths.locate(ModelKind::Checkpoint, "base.safetensors"),
            Some(checkpoints.join("base.safetensors"))
        );
    }
}
