//! Platform-specific default paths.

use std::path::PathBuf;

fn home_dir() -> Option<PathBuf> {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";

    std::env::var_os(var).map(PathBuf::from)
}

/// Default directory for the config file and schema.
pub fn default_config_dir() -> PathBuf {
    let Some(home) = home_dir() else {
        return PathBuf::from(".").join("syn4pse").join("config");
    };

    if cfg!(target_os = "windows") {
        home.join("AppData").join("Roaming").join("syn4pse")
    } else if cfg!(target_os = "macos") {
        home.join("Library").join("Application Support").join("syn4pse")
    } else {
        match std::env::var_os("XDG_CONFIG_HOME") {
            Some(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join("syn4pse"),
            _ => home.join(".config").join("syn4pse"),
        }
    }
}

/// Default directory for downloaded model artifacts.
pub fn default_models_dir() -> PathBuf {
    let Some(home) = home_dir() else {
        return PathBuf::from(".").join("syn4pse").join("models");
    };

    if cfg!(target_os = "windows") {
        home.join("AppData").join("Local").join("syn4pse").join("models")
    } else if cfg!(target_os = "macos") {
        home.join("Library").join("Caches").join("syn4pse").join("models")
    } else {
        match std::env::var_os("XDG_CACHE_HOME") {
            Some(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join("syn4pse").join("models"),
            _ => home.join(".cache").join("syn4pse").join("models"),
        }
    }
}

/// Replace a leading tilde with the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expansion() {
        let home = home_dir().expect("test environment has a home directory");
        assert_eq!(expand_tilde("~/models"), home.join("models"));
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("relative"), PathBuf::from("relative"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_defaults_land_under_home() {
        let config = default_config_dir();
        let models = default_models_dir();
        assert!(config.ends_with("syn4pse") || config.to_string_lossy().contains("syn4pse"));
        assert!(models.ends_with("syn4pse/models") || models.to_string_lossy().contains("syn4pse"));
    }
}
