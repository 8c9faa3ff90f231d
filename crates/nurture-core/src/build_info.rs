//! Build metadata embedded by the build script, shown by `nurture version`.

/// Short git commit hash, or `"unknown"` outside a checkout.
pub const GIT_HASH: &str = env!("NURTURE_GIT_HASH");

/// Build time as seconds since the Unix epoch.
pub const BUILD_TIMESTAMP: &str = env!("NURTURE_BUILD_TIMESTAMP");

/// Cargo profile the crate was built with.
pub const BUILD_PROFILE: &str = env!("NURTURE_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"<version> (<hash>, <profile>)"`, e.g. `"0.1.0 (abc1234, debug)"`.
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

/// Build timestamp parsed back into seconds, if the script produced one.
pub fn built_at_secs() -> Option<u64> {
    BUILD_TIMESTAMP.parse().ok().filter(|secs| *secs > 0)
}
