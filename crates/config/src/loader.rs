use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::Config};

const CONFIG_FILENAME: &str = "watchroom.json";
const CONFIG_ENV_VAR: &str = "WATCHROOM_CONFIG";

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, config discovery only looks in
/// this directory (project-local and user-global paths are skipped).
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE.lock().unwrap() = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE.lock().unwrap() = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.lock().unwrap().clone()
}

/// Load and parse a config file at an explicit path, substituting `${VAR}`
/// placeholders from the process environment before JSON parsing.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    Ok(serde_json::from_str(&raw)?)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `$WATCHROOM_CONFIG` (explicit override)
/// 2. `./watchroom.json` (project-local)
/// 3. `~/.config/watchroom/watchroom.json` (user-global)
///
/// When none exist, writes `Config::default()` to the user-global path and
/// returns it.
pub fn discover_and_load() -> Config {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, writing default config");
        let config = Config::default();
        if let Err(e) = write_default_config(&config) {
            warn!(error = %e, "failed to write default config file");
        }
        return config;
    }
    Config::default()
}

fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
        return None;
    }

    if let Some(dir) = config_dir_override() {
        let p = dir.join(CONFIG_FILENAME);
        return p.exists().then_some(p);
    }

    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }

    if let Some(dir) = config_dir() {
        let p = dir.join(CONFIG_FILENAME);
        if p.exists() {
            return Some(p);
        }
    }

    None
}

/// Returns the config directory: override, or `~/.config/watchroom/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("watchroom"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn write_default_config(config: &Config) -> anyhow::Result<()> {
    let path = config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILENAME);
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_explicit_file_in_overridden_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"port":9000,"secureCookies":true,"database":"mysql","databaseUrl":"mysql://x","emailSettings":{"identity":"a","username":"b","password":"c","host":"d"}}"#,
        )
        .unwrap();
        set_config_dir(dir.path().to_path_buf());
        let cfg = discover_and_load();
        clear_config_dir();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.database, crate::schema::Database::Mysql);
    }

    #[test]
    fn mariadb_alias_resolves_to_mysql() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"database":"mariadb","databaseUrl":"x","secureCookies":false,"emailSettings":{"identity":"","username":"","password":"","host":""}}"#,
        )
        .unwrap();
        let cfg = load_config(&dir.path().join(CONFIG_FILENAME)).unwrap();
        assert_eq!(cfg.database, crate::schema::Database::Mysql);
    }

    #[test]
    fn writes_default_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path().to_path_buf());
        let cfg = discover_and_load();
        clear_config_dir();
        assert_eq!(cfg.port, 8000);
        assert!(dir.path().join(CONFIG_FILENAME).exists());
    }

    #[test]
    fn env_placeholder_is_substituted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"database":"postgres","databaseUrl":"${WATCHROOM_LOADER_TEST_DB}","secureCookies":true,"emailSettings":{"identity":"","username":"","password":"","host":""}}"#,
        )
        .unwrap();
        unsafe { std::env::set_var("WATCHROOM_LOADER_TEST_DB", "postgres://x/y") };
        let cfg = load_config(&dir.path().join(CONFIG_FILENAME)).unwrap();
        unsafe { std::env::remove_var("WATCHROOM_LOADER_TEST_DB") };
        assert_eq!(cfg.database_url, "postgres://x/y");
    }
}
