use serde::Serialize;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build metadata, filled in by the release pipeline through environment variables
#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<&'static str>,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            name: APP_NAME,
            version: APP_VERSION,
            build_number: non_empty(option_env!("WHALEPOST_BUILD_NUMBER")),
            commit: non_empty(option_env!("WHALEPOST_GIT_COMMIT")),
            branch: non_empty(option_env!("WHALEPOST_GIT_BRANCH")),
            build_time: non_empty(option_env!("WHALEPOST_BUILD_TIME")),
        }
    }
}

fn non_empty(value: Option<&'static str>) -> Option<&'static str> {
    value.filter(|v| !v.is_empty())
}

/// e.g. `whalepost 1.0.0-17 (#3f2a9c1-master / 2024-03-01T10:00:00Z)`
impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)?;
        if let Some(build) = self.build_number {
            write!(f, "-{}", build)?;
        }
        if let Some(commit) = self.commit {
            write!(f, " (#{}", commit)?;
        }
        if let Some(branch) = self.branch {
            write!(f, "-{}", branch)?;
        }
        match (self.build_time, self.commit) {
            (Some(time), _) => write!(f, " / {})", time),
            (None, Some(_)) => write!(f, ")"),
            (None, None) => Ok(()),
        }
    }
}
