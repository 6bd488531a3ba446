//! Sandboxed per-peer content root (spec.md §4.9): the filesystem backing
//! a peer's `site/` tree, with atomic writes and ETag-based optimistic
//! concurrency.
//!
//! Grounded on the teacher's config/key persistence idiom (write to a temp
//! file, then rename — never a partial write visible to readers) and
//! `db.rs`'s style of precise, typed error returns rather than panics.
//! Crates: `sha2` (ETags), `walkdir` (tree listing).

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{GoopError, GoopResult};

const MAX_SITE_FILE_LEN: u64 = 50 * 1024 * 1024;

pub struct ContentStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub rel_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub etag: Option<String>,
}

impl ContentStore {
    pub fn open(root: PathBuf) -> GoopResult<Self> {
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join("images"))?;
        Ok(Self { root })
    }

    /// Cleans and validates `rel` against the sandbox root: no `..`
    /// components, no absolute paths, no escape through an existing
    /// symlink anywhere along the path (spec.md §4.9).
    fn resolve(&self, rel: &str) -> GoopResult<PathBuf> {
        let rel_path = Path::new(rel);
        let mut cleaned = PathBuf::new();
        for component in rel_path.components() {
            match component {
                Component::Normal(part) => cleaned.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(GoopError::OutsideRoot(rel.to_string()));
                }
            }
        }
        let full = self.root.join(&cleaned);

        // Reject escape through a symlink anywhere along an *existing*
        // prefix of the path (a symlinked parent directory pointing
        // outside root).
        let mut check = self.root.clone();
        for component in cleaned.components() {
            check.push(component);
            if check.exists() {
                let canonical = check
                    .canonicalize()
                    .map_err(|e| GoopError::Io(e))?;
                let root_canonical = self.root.canonicalize().map_err(|e| GoopError::Io(e))?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(GoopError::OutsideRoot(rel.to_string()));
                }
            }
        }
        Ok(full)
    }

    fn mime_for(path: &Path) -> String {
        mime_guess::from_path(path).first_or_octet_stream().to_string()
    }

    fn is_image_path(rel: &str) -> bool {
        matches!(
            Path::new(rel).extension().and_then(|e| e.to_str()).map(|s| s.to_ascii_lowercase()).as_deref(),
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg")
        )
    }

    /// Serves a file for a remote `FetchSiteFile` request. Rejects the
    /// `lua/` subtree outright (spec.md §4.2) even though this repo carries
    /// no scripting engine — a peer's site directory may still contain
    /// leftover script sources that must never be wire-readable.
    pub fn read_for_site_fetch(&self, rel: &str) -> GoopResult<(String, Vec<u8>)> {
        let cleaned = rel.trim_start_matches('/');
        if cleaned == "lua" || cleaned.starts_with("lua/") {
            return Err(GoopError::Forbidden("lua/ is not servable".into()));
        }
        self.read(rel)
    }

    pub fn read(&self, rel: &str) -> GoopResult<(String, Vec<u8>)> {
        let full = self.resolve(rel)?;
        if !full.is_file() {
            return Err(GoopError::NotFound(rel.to_string()));
        }
        let meta = std::fs::metadata(&full)?;
        if meta.len() > MAX_SITE_FILE_LEN {
            return Err(GoopError::Validation(format!("{rel} exceeds 50 MiB")));
        }
        let bytes = std::fs::read(&full)?;
        Ok((Self::mime_for(&full), bytes))
    }

    pub fn etag_of(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        hex::encode(digest)
    }

    /// `if_match = Some("none")` means "must not exist"; any other
    /// mismatch against the current ETag returns `Conflict` (spec.md
    /// §4.9). Writes are atomic via a sibling temp file + rename.
    pub fn write(&self, rel: &str, data: &[u8], if_match: Option<&str>) -> GoopResult<String> {
        if Self::is_image_path(rel) && !rel.starts_with("images/") {
            return Err(GoopError::Forbidden("image files must live under images/".into()));
        }
        let full = self.resolve(rel)?;
        self.check_no_file_in_ancestry(&full)?;

        let current_etag = if full.is_file() {
            Some(Self::etag_of(&std::fs::read(&full)?))
        } else {
            None
        };
        match if_match {
            Some("none") if current_etag.is_some() => {
                return Err(GoopError::Conflict(format!("{rel} already exists")));
            }
            Some(expected) if expected != "none" => {
                if current_etag.as_deref() != Some(expected) {
                    return Err(GoopError::Conflict(format!("{rel} etag mismatch")));
                }
            }
            _ => {}
        }

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = full.with_extension(format!("tmp-{}", std::process::id()));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &full)?;
        Ok(Self::etag_of(data))
    }

    /// No parent path component of `full` may be a regular file (spec.md
    /// §4.9) — otherwise `create_dir_all` would either fail opaquely or,
    /// worse, silently shadow an existing file.
    fn check_no_file_in_ancestry(&self, full: &Path) -> GoopResult<()> {
        let mut current = full.parent();
        while let Some(dir) = current {
            if dir == self.root {
                break;
            }
            if dir.is_file() {
                return Err(GoopError::Conflict(format!("{} is a file, not a directory", dir.display())));
            }
            current = dir.parent();
        }
        Ok(())
    }

    pub fn delete(&self, rel: &str) -> GoopResult<()> {
        let full = self.resolve(rel)?;
        if full.is_dir() {
            std::fs::remove_dir_all(&full)?;
        } else if full.is_file() {
            std::fs::remove_file(&full)?;
        } else {
            return Err(GoopError::NotFound(rel.to_string()));
        }
        Ok(())
    }

    pub fn mkdir(&self, rel: &str) -> GoopResult<()> {
        let full = self.resolve(rel)?;
        self.check_no_file_in_ancestry(&full)?;
        std::fs::create_dir_all(&full)?;
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> GoopResult<()> {
        let full_from = self.resolve(from)?;
        let full_to = self.resolve(to)?;
        if !full_from.exists() {
            return Err(GoopError::NotFound(from.to_string()));
        }
        self.check_no_file_in_ancestry(&full_to)?;
        if let Some(parent) = full_to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&full_from, &full_to)?;
        Ok(())
    }

    pub fn list(&self, rel: &str) -> GoopResult<Vec<Entry>> {
        let full = self.resolve(rel)?;
        if !full.is_dir() {
            return Err(GoopError::NotFound(rel.to_string()));
        }
        let mut entries = Vec::new();
        for child in std::fs::read_dir(&full)? {
            let child = child?;
            let meta = child.metadata()?;
            let rel_child = format!("{rel}/{}", child.file_name().to_string_lossy()).trim_start_matches('/').to_string();
            let etag = if meta.is_file() { Some(Self::etag_of(&std::fs::read(child.path())?)) } else { None };
            entries.push(Entry { rel_path: rel_child, is_dir: meta.is_dir(), size: meta.len(), etag });
        }
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(entries)
    }

    pub fn list_tree(&self, rel: &str) -> GoopResult<Vec<Entry>> {
        let full = self.resolve(rel)?;
        if !full.is_dir() {
            return Err(GoopError::NotFound(rel.to_string()));
        }
        let mut entries = Vec::new();
        for dir_entry in WalkDir::new(&full).min_depth(1).follow_links(false) {
            let dir_entry = dir_entry.map_err(|e| GoopError::Io(std::io::Error::other(e)))?;
            let rel_path = dir_entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(dir_entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let meta = dir_entry.metadata().map_err(|e| GoopError::Io(std::io::Error::other(e)))?;
            let etag = if meta.is_file() { Some(Self::etag_of(&std::fs::read(dir_entry.path())?)) } else { None };
            entries.push(Entry { rel_path, is_dir: meta.is_dir(), size: meta.len(), etag });
        }
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ContentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().to_path_buf()).unwrap();
        (store, dir)
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (store, _dir) = store();
        store.write("hello.txt", b"hi there", None).unwrap();
        let (mime, bytes) = store.read("hello.txt").unwrap();
        assert_eq!(bytes, b"hi there");
        assert!(mime.contains("text"));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let (store, _dir) = store();
        assert!(matches!(store.read("../etc/passwd"), Err(GoopError::OutsideRoot(_))));
    }

    #[test]
    fn image_outside_images_dir_is_forbidden() {
        let (store, _dir) = store();
        assert!(matches!(store.write("avatar.png", b"\x89PNG", None), Err(GoopError::Forbidden(_))));
        assert!(store.write("images/avatar.png", b"\x89PNG", None).is_ok());
    }

    #[test]
    fn if_match_none_requires_absence() {
        let (store, _dir) = store();
        store.write("a.txt", b"one", None).unwrap();
        assert!(matches!(store.write("a.txt", b"two", Some("none")), Err(GoopError::Conflict(_))));
    }

    #[test]
    fn if_match_mismatch_is_conflict() {
        let (store, _dir) = store();
        let etag = store.write("a.txt", b"one", None).unwrap();
        assert!(store.write("a.txt", b"two", Some(&etag)).is_ok());
        assert!(matches!(store.write("a.txt", b"three", Some(&etag)), Err(GoopError::Conflict(_))));
    }

    #[test]
    fn list_tree_finds_nested_files() {
        let (store, _dir) = store();
        store.mkdir("docs").unwrap();
        store.write("docs/readme.md", b"# hi", None).unwrap();
        let entries = store.list_tree("").unwrap();
        assert!(entries.iter().any(|e| e.rel_path == "docs/readme.md"));
    }

    #[test]
    fn site_fetch_rejects_lua_subtree() {
        let (store, _dir) = store();
        store.mkdir("lua").unwrap();
        store.write("lua/script.lua", b"return 1", None).unwrap();
        assert!(matches!(store.read_for_site_fetch("lua/script.lua"), Err(GoopError::Forbidden(_))));
        assert!(store.read_for_site_fetch("lua/script.lua").is_err());
    }

    #[test]
    fn rejects_write_through_file_masquerading_as_directory() {
        let (store, _dir) = store();
        store.write("a", b"not a dir", None).unwrap();
        assert!(matches!(store.write("a/b.txt", b"nested", None), Err(GoopError::Conflict(_))));
    }
}
