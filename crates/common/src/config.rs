use std::env;
use std::str::FromStr;

/// Read an environment variable and parse it, falling back to `default`
/// when the variable is unset or does not parse.
pub fn get_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Runtime profile, controlling log output format.
///
/// Resolved from the `CONDUIT_PROFILE` variable through the same parsing
/// path as every other tunable; anything unrecognized falls back to
/// development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Development,
    Production,
}

impl Profile {
    pub fn from_env() -> Self {
        get_env("CONDUIT_PROFILE", Profile::default())
    }

    pub fn is_production(self) -> bool {
        matches!(self, Profile::Production)
    }
}

impl FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Profile::Production),
            "development" | "dev" => Ok(Profile::Development),
            _ => Err(UnknownProfile),
        }
    }
}

/// Parse error for [`Profile`]; callers fall back to the default.
#[derive(Debug)]
pub struct UnknownProfile;
