use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "enclave";

pub const DATA_DIR_ENV: &str = "ENCLAVE_DATA_DIR";

/// `$ENCLAVE_DATA_DIR` if set, otherwise the platform data directory.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn identity_path(root: &Path) -> PathBuf {
    root.join("identity.key")
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join("settings.json")
}

pub fn audit_dir(root: &Path) -> PathBuf {
    root.join("audit")
}
