use serde::Serialize;

use super::backend::{IsolationBackend, platform_backend};

/// Reported in place of a capability when the isolation tool is missing.
pub const NO_ISOLATION: &str = "none";

/// Host platform and the isolation mechanism detected on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub version: String,
    /// Detected isolation tool, or `"none"`.
    pub isolation: String,
}

/// Inspect the current platform. Never fails: a missing tool reports `"none"`.
pub fn get_platform_info() -> PlatformInfo {
    platform_info_for(platform_backend().as_ref())
}

pub fn platform_info_for(backend: &dyn IsolationBackend) -> PlatformInfo {
    PlatformInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        version: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        isolation: backend
            .capability()
            .unwrap_or_else(|| NO_ISOLATION.to_string()),
    }
}

impl PlatformInfo {
    /// Human-readable status lines for the `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let isolation = if self.isolation == NO_ISOLATION {
            "not available           --".to_string()
        } else {
            format!("{:<24}ok", self.isolation)
        };
        vec![
            format!("  Platform:  {}/{}", self.os, self.arch),
            format!("  Version:   {}", self.version),
            format!("  Isolation: {}", isolation),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backend::UnsupportedBackend;

    #[test]
    fn test_get_platform_info_runs() {
        let info = get_platform_info();
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert!(!info.isolation.is_empty());
    }

    #[test]
    fn test_missing_tool_reports_none() {
        let info = platform_info_for(&UnsupportedBackend);
        assert_eq!(info.isolation, "none");
    }

    #[test]
    fn test_status_lines() {
        let info = platform_info_for(&UnsupportedBackend);
        let lines = info.status_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("not available"));
    }
}
