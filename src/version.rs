//! Build metadata printed by `version` and `fullVersion`.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commit the binary was built from, injected through `GIT_COMMIT` at build time.
pub const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

pub const BUILD_TIME: &str = match option_env!("BUILD_TIME") {
    Some(time) => time,
    None => "unknown",
};

/// Version, commit and build time, one per line.
pub fn full_version() -> String {
    format!("{}\n{}\n{}", VERSION, GIT_COMMIT, BUILD_TIME)
}
