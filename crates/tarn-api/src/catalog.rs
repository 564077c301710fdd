//! Model catalog: the model names available in the repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tarn_scheduler::launch::is_remote;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The repository lives somewhere this process cannot list.
    #[error("listing {0} is not supported")]
    Unsupported(String),

    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

pub trait ModelCatalog: Send + Sync {
    /// Model names, sorted.
    fn list_models(&self) -> CatalogResult<Vec<String>>;
}

/// One model per subdirectory of a local repository.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModelCatalog for DirectoryCatalog {
    fn list_models(&self) -> CatalogResult<Vec<String>> {
        let io_err = |source: std::io::Error| CatalogError::Io {
            path: self.root.clone(),
            source,
        };
        let mut models = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                models.push(name);
            }
        }
        models.sort();
        Ok(models)
    }
}

/// A repository on a remote filesystem.
#[derive(Debug, Clone)]
pub struct RemoteCatalog {
    location: String,
}

impl ModelCatalog for RemoteCatalog {
    fn list_models(&self) -> CatalogResult<Vec<String>> {
        Err(CatalogError::Unsupported(self.location.clone()))
    }
}

/// Catalog for a `model_repository` setting.
pub fn catalog_for(location: &str) -> Arc<dyn ModelCatalog> {
    if is_remote(location) {
        return Arc::new(RemoteCatalog {
            location: location.to_string(),
        });
    }
    let path = location.strip_prefix("file://").unwrap_or(location);
    Arc::new(DirectoryCatalog::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_model_directories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["mistral", "llama", ".cache"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "models").unwrap();

        let models = DirectoryCatalog::new(dir.path()).list_models().unwrap();
        assert_eq!(models, vec!["llama", "mistral"]);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let err = DirectoryCatalog::new("/nonexistent/tarn/models")
            .list_models()
            .unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }

    #[test]
    fn remote_repository_is_unsupported() {
        let err = catalog_for("hdfs:///models").list_models().unwrap_err();
        assert!(matches!(err, CatalogError::Unsupported(loc) if loc == "hdfs:///models"));
    }

    #[test]
    fn file_scheme_lists_locally() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bert")).unwrap();
        let location = format!("file://{}", dir.path().display());
        assert_eq!(catalog_for(&location).list_models().unwrap(), vec!["bert"]);
    }
}
