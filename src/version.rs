//! Build information embedded by `build.rs`

use std::fmt;

/// Build information captured at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    pub rustc_version: &'static str,
    pub host: &'static str,
}

/// Get the current build info
pub const fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("CHATLINK_GIT_HASH"),
        git_branch: env!("CHATLINK_GIT_BRANCH"),
        git_dirty: env!("CHATLINK_GIT_DIRTY"),
        build_timestamp: env!("CHATLINK_BUILD_TIMESTAMP"),
        target: env!("CHATLINK_TARGET"),
        profile: env!("CHATLINK_PROFILE"),
        rustc_version: env!("CHATLINK_RUSTC_VERSION"),
        host: env!("CHATLINK_HOST"),
    }
}

impl BuildInfo {
    /// Whether the working tree had uncommitted changes at build time
    pub fn is_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version with commit suffix, e.g. "0.1.0-abc1234" or "0.1.0-abc1234-dirty"
    pub fn full_version(&self) -> String {
        let suffix = if self.is_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, suffix)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(f, "  Git Hash:   {}{}", self.git_hash, if self.is_dirty() { " (dirty)" } else { "" })?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {}", self.build_timestamp)?;
        writeln!(f, "  Profile:    {}", self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)
    }
}

/// Print version information to stdout
pub fn print_version() {
    print!("{}", build_info());
}
