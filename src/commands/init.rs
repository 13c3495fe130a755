//! Init command implementation

use crate::config::Config;
use crate::db::Repository;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// What `init` created
#[derive(Debug, Clone, Serialize)]
pub struct InitInfo {
    pub config_path: String,
    pub db_path: String,
    pub audio_dir: String,
}

/// Write a default config, create the audio directory and the database schema
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<InitInfo> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    if config.paths.config_file.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config.paths.config_file.display()
        )));
    }

    std::fs::create_dir_all(&config.paths.base_dir)?;
    std::fs::create_dir_all(&config.paths.audio_dir)?;
    config.save()?;

    let db = Repository::connect(&config).await?;
    db.init_schema().await?;
    info!("Initialized leadline at {:?}", config.paths.base_dir);

    Ok(InitInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        audio_dir: config.paths.audio_dir.display().to_string(),
    })
}
