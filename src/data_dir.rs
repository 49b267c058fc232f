//! Location of bookbert's on-disk state: `config.redb` for settings and
//! document records, `chunks.redb` for the chunk store.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV_VAR: &str = "BOOKBERT_DATA_DIR";

const XDG_PREFIX: &str = "bookbert";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// `--data-dir`, else `BOOKBERT_DATA_DIR`, else `$XDG_DATA_HOME/bookbert`.
    /// The directory is created if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::resolve_with(explicit, std::env::var_os(DATA_DIR_ENV_VAR))
    }

    fn resolve_with(explicit: Option<&Path>, env: Option<OsString>) -> Result<Self> {
        let root = match (explicit, env) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(value)) if !value.is_empty() => PathBuf::from(value),
            _ => xdg::BaseDirectories::with_prefix(XDG_PREFIX)
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config("could not determine XDG data home directory".into())
                })?,
        };

        std::fs::create_dir_all(&root).map_err(|_| Error::DataDir(root.clone()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    pub fn chunks_db(&self) -> PathBuf {
        self.root.join("chunks.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_env() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tmp.path().join("from-env");
        let dir =
            DataDir::resolve_with(Some(tmp.path()), Some(other.clone().into())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.config_db(), tmp.path().join("config.redb"));
        assert_eq!(dir.chunks_db(), tmp.path().join("chunks.redb"));
        assert!(!other.exists());
    }

    #[test]
    fn env_path_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve_with(None, Some(nested.clone().into())).unwrap();

        assert_eq!(dir.root(), nested);
        assert!(dir.root().is_dir());
    }

    #[test]
    fn unusable_path_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();

        let result = DataDir::resolve_with(Some(&file.join("inner")), None);
        assert!(matches!(result, Err(Error::DataDir(_))));
    }
}
