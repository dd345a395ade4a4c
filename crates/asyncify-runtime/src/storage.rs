use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wasmtime::{Engine, Module};

use crate::error::RuntimeError;

const PRECOMPILED_EXT: &str = "cwasm";
const METADATA_EXT: &str = "metadata.json";
const PARTIAL_EXT: &str = "wasm.part";
const INSTALL_CHUNK: usize = 64 * 1024;

/// A guest module version as reported by the guest and stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    /// Stable version identifier, also the file stem in storage
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Where the module was fetched from, or the embedded module path
    #[serde(default)]
    pub url: String,
    /// SHA-256 hex of the .wasm bytes, when the publisher provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Newer version advertised by this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<EngineVersion>>,
}

impl EngineVersion {
    pub const EMBEDDED_ID: &'static str = "embedded";

    /// The module shipped with the host, at `path`.
    pub fn embedded(path: &Path) -> Self {
        Self {
            id: Self::EMBEDDED_ID.into(),
            name: Self::EMBEDDED_ID.into(),
            url: path.display().to_string(),
            sha256: None,
            next: None,
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.id == Self::EMBEDDED_ID
    }
}

/// Disk-backed module bundle store.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {version_id}.wasm           - module binary
///   {version_id}.cwasm          - precompiled (Wasmtime serialized)
///   {version_id}.metadata.json  - EngineVersion
/// ```
pub struct BundleStorage {
    base_dir: PathBuf,
}

impl BundleStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    pub fn wasm_path(&self, version_id: &str) -> PathBuf {
        self.base_dir.join(format!("{version_id}.wasm"))
    }

    pub fn cwasm_path(&self, version_id: &str) -> PathBuf {
        self.base_dir.join(format!("{version_id}.{PRECOMPILED_EXT}"))
    }

    pub fn meta_path(&self, version_id: &str) -> PathBuf {
        self.base_dir.join(format!("{version_id}.{METADATA_EXT}"))
    }

    pub fn exists(&self, version_id: &str) -> bool {
        self.wasm_path(version_id).exists()
    }

    /// Copy a module into storage in chunks, reporting progress in `[0, 1]`.
    ///
    /// The copy is hashed on the way; when `version.sha256` is set and does
    /// not match, nothing is installed. The bytes land under a temporary name
    /// and are renamed into place only once verified.
    pub async fn install(
        &self,
        version: &EngineVersion,
        source: &Path,
        mut progress: impl FnMut(f64),
    ) -> Result<PathBuf, RuntimeError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let mut input = tokio::fs::File::open(source)
            .await
            .map_err(|e| RuntimeError::StorageError(format!("Cannot read {}: {e}", source.display())))?;
        let total = input.metadata().await?.len();

        let partial = self.base_dir.join(format!("{}.{PARTIAL_EXT}", version.id));
        let mut output = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; INSTALL_CHUNK];
        let mut copied = 0u64;

        progress(0.0);
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            output.write_all(&buf[..n]).await?;
            copied += n as u64;
            if total > 0 {
                progress((copied as f64 / total as f64).min(1.0));
            }
        }
        output.flush().await?;
        drop(output);

        let digest = hex::encode(hasher.finalize());
        if let Some(expected) = &version.sha256 {
            if !expected.eq_ignore_ascii_case(&digest) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(RuntimeError::StorageError(format!(
                    "{}: sha256 mismatch (expected {expected}, got {digest})",
                    version.id
                )));
            }
        }

        let wasm_path = self.wasm_path(&version.id);
        tokio::fs::rename(&partial, &wasm_path).await?;
        // A cache compiled from a previous install of this id is stale now.
        let _ = tokio::fs::remove_file(self.cwasm_path(&version.id)).await;

        let mut meta = version.clone();
        meta.sha256 = Some(digest);
        tokio::fs::write(self.meta_path(&version.id), serde_json::to_string_pretty(&meta)?).await?;
        progress(1.0);

        tracing::info!(version = %version.id, bytes = copied, "Module version installed");
        Ok(wasm_path)
    }

    /// Load metadata for a version (by ID).
    pub fn load_meta(&self, version_id: &str) -> Result<EngineVersion, RuntimeError> {
        let path = self.meta_path(version_id);
        let content = std::fs::read_to_string(&path)
            .map_err(|_| RuntimeError::StorageError(format!("no installed version {version_id}")))?;
        let meta: EngineVersion = serde_json::from_str(&content)?;
        Ok(meta)
    }

    /// List all version IDs available on disk (those with .metadata.json).
    pub fn list_version_ids(&self) -> Result<Vec<String>, RuntimeError> {
        let mut ids = Vec::new();
        if !self.base_dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(&format!(".{METADATA_EXT}")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete every file stored for a version. Missing files are fine.
    pub fn remove(&self, version_id: &str) -> Result<(), RuntimeError> {
        for path in [
            self.wasm_path(version_id),
            self.cwasm_path(version_id),
            self.meta_path(version_id),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(version = version_id, "Module version removed");
        Ok(())
    }

    /// Load or compile an installed version, using the precompiled cache when valid.
    pub fn load_or_compile(&self, version_id: &str, engine: &Engine) -> Result<Module, RuntimeError> {
        let wasm_path = self.wasm_path(version_id);
        let cwasm_path = self.cwasm_path(version_id);

        if cwasm_path.exists() && wasm_path.exists() {
            if let Ok(cached) = load_precompiled(&cwasm_path, engine) {
                tracing::debug!(version = version_id, "Loaded from precompiled cache");
                return Ok(cached);
            }
            tracing::debug!(version = version_id, "Precompiled cache invalid, recompiling");
        }

        let module = compile_file(&wasm_path, engine)?;
        if let Ok(serialized) = module.serialize() {
            let _ = std::fs::write(&cwasm_path, serialized);
            tracing::debug!(version = version_id, "Saved precompiled cache");
        }
        Ok(module)
    }
}

/// Compile a module file in binary or text format.
pub fn compile_file(path: &Path, engine: &Engine) -> Result<Module, RuntimeError> {
    if !path.exists() {
        return Err(RuntimeError::StorageError(format!("Cannot read {}: not found", path.display())));
    }
    Module::from_file(engine, path)
        .map_err(|e| RuntimeError::CompilationFailed(format!("{}: {e:#}", path.display())))
}

fn load_precompiled(path: &Path, engine: &Engine) -> Result<Module> {
    // SAFETY: cwasm files in storage are only written by `load_or_compile`
    // from modules compiled by this wasmtime version.
    unsafe { Module::deserialize_file(engine, path) }
}

/// Hash the bytes of a module file.
pub fn hash_wasm(path: &Path) -> Result<String, RuntimeError> {
    let bytes = std::fs::read(path)?;
    let hash = Sha256::digest(&bytes);
    Ok(hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST: &str = r#"(module (memory (export "memory") 1))"#;

    fn version(id: &str) -> EngineVersion {
        EngineVersion {
            id: id.into(),
            name: format!("Guest {id}"),
            url: format!("https://example.invalid/{id}.wasm"),
            sha256: None,
            next: None,
        }
    }

    #[tokio::test]
    async fn install_reports_progress_and_records_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src.wat");
        std::fs::write(&source, GUEST).unwrap();
        let storage = BundleStorage::new(tmp.path().join("bundles"));

        let mut reports = Vec::new();
        let path = storage
            .install(&version("1.0.0"), &source, |p| reports.push(p))
            .await
            .unwrap();

        assert_eq!(path, storage.wasm_path("1.0.0"));
        assert_eq!(reports.first(), Some(&0.0));
        assert_eq!(reports.last(), Some(&1.0));
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));

        let meta = storage.load_meta("1.0.0").unwrap();
        assert_eq!(meta.sha256, Some(hash_wasm(&source).unwrap()));
        assert_eq!(storage.list_version_ids().unwrap(), vec!["1.0.0".to_string()]);
    }

    #[tokio::test]
    async fn install_rejects_hash_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src.wat");
        std::fs::write(&source, GUEST).unwrap();
        let storage = BundleStorage::new(tmp.path().to_path_buf());

        let mut bad = version("2.0.0");
        bad.sha256 = Some("00".repeat(32));
        let err = storage.install(&bad, &source, |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
        assert!(!storage.exists("2.0.0"));
        assert!(storage.list_version_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn compiled_versions_are_cached_and_removable() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src.wat");
        std::fs::write(&source, GUEST).unwrap();
        let storage = BundleStorage::new(tmp.path().join("bundles"));
        storage.install(&version("3.0.0"), &source, |_| {}).await.unwrap();

        let engine = Engine::default();
        storage.load_or_compile("3.0.0", &engine).unwrap();
        assert!(storage.cwasm_path("3.0.0").exists());
        storage.load_or_compile("3.0.0", &engine).unwrap();

        storage.remove("3.0.0").unwrap();
        storage.remove("3.0.0").unwrap();
        assert!(!storage.exists("3.0.0"));
        assert!(!storage.cwasm_path("3.0.0").exists());
    }

    #[test]
    fn version_metadata_omits_empty_links() {
        let mut v = version("4.0.0");
        let json = serde_json::to_value(&v).unwrap();
        assert!(json.get("next").is_none());

        v.next = Some(Box::new(version("4.1.0")));
        let json = serde_json::to_string(&v).unwrap();
        let back: EngineVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back.next.unwrap().id, "4.1.0");
        assert!(EngineVersion::embedded(Path::new("/opt/guest.wasm")).is_embedded());
    }
}
