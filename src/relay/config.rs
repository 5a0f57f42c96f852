//! Relay configuration.

use std::time::Duration;

/// Identifier used when the executable name cannot be determined.
pub const FALLBACK_APP_IDENTIFIER: &str = "lifewatch";

/// Configuration for a [`super::GroupNotificationManager`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Stable identity of this application in subscriber records
    pub app_identifier: String,
    /// Accept posts while no subscriber record exists for the name
    pub permit_posts_without_subscribers: bool,
    /// Prune delivered entries of every name on every Nth post (0 disables)
    pub cleanup_frequency: u32,
    /// How long to wait for the store lock before giving up
    pub lock_timeout: Duration,
    /// Age after which a lock file is considered abandoned
    pub stale_lock_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            app_identifier: default_app_identifier(),
            permit_posts_without_subscribers: false,
            cleanup_frequency: 1,
            lock_timeout: Duration::from_secs(2),
            stale_lock_after: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Default configuration for a named application.
    pub fn for_app(app_identifier: impl Into<String>) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            ..Self::default()
        }
    }
}

/// Name of the running executable.
///
/// Subscriber records are keyed by this, so it must be the same on every
/// launch for retained reliable state to be found again.
pub fn default_app_identifier() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| FALLBACK_APP_IDENTIFIER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert!(!config.app_identifier.is_empty());
        assert!(!config.permit_posts_without_subscribers);
        assert_eq!(config.cleanup_frequency, 1);
        assert!(config.stale_lock_after > config.lock_timeout);
    }

    #[test]
    fn test_default_app_identifier_is_stable() {
        assert_eq!(
            RelayConfig::default().app_identifier,
            RelayConfig::default().app_identifier
        );
        let exe = std::env::current_exe().unwrap();
        let stem = exe.file_stem().unwrap().to_string_lossy();
        assert_eq!(default_app_identifier(), stem);
        assert_eq!(RelayConfig::for_app("widget").app_identifier, "widget");
    }
}
