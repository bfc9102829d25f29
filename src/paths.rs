//! Centralized path resolution for bsa
//!
//! # Environment Variables
//!
//! - `BSA_CONFIG_DIR` - Override config directory
//! - `BSA_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `BSA_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/bsa` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\bsa`
//!    - macOS/Linux: `~/.config/bsa`
//!
//! For state_dir():
//! 1. `BSA_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/bsa` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\bsa`
//!    - macOS/Linux: `~/.local/state/bsa`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "BSA_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "BSA_STATE_DIR";

const APP_DIR: &str = "bsa";

/// Get the bsa config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join(APP_DIR));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join(APP_DIR);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the bsa state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join(APP_DIR);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            return Ok(local_app_data.join(APP_DIR));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join(APP_DIR);
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Path of `config.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Path of `state.toml`
pub fn state_file() -> Result<PathBuf> {
    Ok(state_dir()?.join("state.toml"))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Run `f` with an env var temporarily set
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    /// Run `f` with an env var temporarily removed
    fn without_env_var<F, R>(key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::remove_var(key) };
        let result = f();
        if let Some(v) = original {
            // SAFETY: Tests run in isolation
            unsafe { env::set_var(key, v) };
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env_var(ENV_CONFIG_DIR, "/custom/bsa/config", || {
            assert_eq!(config_dir().unwrap(), PathBuf::from("/custom/bsa/config"));
            assert_eq!(
                config_file().unwrap(),
                PathBuf::from("/custom/bsa/config/config.toml")
            );
        });
    }

    #[test]
    fn test_state_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env_var(ENV_STATE_DIR, "~/bsa-state-tilde-test", || {
            assert_eq!(state_dir().unwrap(), home.join("bsa-state-tilde-test"));
        });
    }

    #[test]
    fn test_xdg_state_home() {
        without_env_var(ENV_STATE_DIR, || {
            with_env_var("XDG_STATE_HOME", "/tmp/xdg-state-bsa", || {
                assert_eq!(state_dir().unwrap(), PathBuf::from("/tmp/xdg-state-bsa/bsa"));
                assert_eq!(
                    state_file().unwrap(),
                    PathBuf::from("/tmp/xdg-state-bsa/bsa/state.toml")
                );
            });
        });
    }

    #[test]
    fn test_expand_with_env_var() {
        with_env_var("BSA_TEST_VAR", "bridge", || {
            assert_eq!(expand("/opt/$BSA_TEST_VAR/bin"), PathBuf::from("/opt/bridge/bin"));
        });
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand("/path/$NONEXISTENT_BSA_VAR_12345/file");
        assert_eq!(result, PathBuf::from("/path/$NONEXISTENT_BSA_VAR_12345/file"));
    }
}
