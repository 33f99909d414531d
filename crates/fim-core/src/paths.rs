use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "fim";
pub const APP_NAME: &str = "fimd";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_dir) = std::env::var("FIMD_DATA_DIR") {
        return Ok(PathBuf::from(override_dir));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

pub fn default_database_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("fim.db"))
}

pub fn default_health_check_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("healthcheck"))
}
