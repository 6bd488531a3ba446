//! Template store (spec.md §6): serves the site template gallery's
//! manifests and tar.gz bundles. The gallery UI itself is out of scope
//! (spec.md §1) — this only hands raw bytes to whoever asks.

use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;

pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Names of template directories directly under the root.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else { return Vec::new() };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        names.sort();
        names
    }

    fn dir_path(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return None;
        }
        let path = self.root.join(name);
        path.is_dir().then_some(path)
    }

    pub fn manifest(&self, name: &str) -> Option<String> {
        let dir = self.dir_path(name)?;
        std::fs::read_to_string(dir.join("manifest.json")).ok()
    }

    /// Builds a tar.gz whose top-level directory is `<name>/` (spec.md §6).
    pub fn bundle(&self, name: &str) -> Option<Vec<u8>> {
        let dir = self.dir_path(name)?;
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        builder.append_dir_all(name, &dir).ok()?;
        let gz = builder.into_inner().ok()?;
        gz.finish().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("classic")).unwrap();
        std::fs::write(dir.path().join("not-a-dir.txt"), b"x").unwrap();
        let store = TemplateStore::new(dir.path().to_path_buf());
        assert_eq!(store.list(), vec!["classic".to_string()]);
    }

    #[test]
    fn bundle_rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path().to_path_buf());
        assert!(store.bundle("../etc").is_none());
    }

    #[test]
    fn manifest_and_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tpl_dir = dir.path().join("classic");
        std::fs::create_dir(&tpl_dir).unwrap();
        std::fs::write(tpl_dir.join("manifest.json"), br#"{"name":"classic"}"#).unwrap();
        let store = TemplateStore::new(dir.path().to_path_buf());
        assert!(store.manifest("classic").unwrap().contains("classic"));
        assert!(store.bundle("classic").is_some());
    }
}
