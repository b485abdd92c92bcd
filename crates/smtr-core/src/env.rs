use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Deployment environment a pipeline run writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnv {
    Prod,
    Dev,
}

impl RunEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEnv::Prod => "prod",
            RunEnv::Dev => "dev",
        }
    }
}

impl fmt::Display for RunEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunEnv {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prod" => Ok(RunEnv::Prod),
            "dev" => Ok(RunEnv::Dev),
            other => Err(CoreError::InvalidEnv {
                value: other.to_string(),
            }),
        }
    }
}

/// Suffix that marks a production deployment name.
pub const PROD_DEPLOYMENT_SUFFIX: &str = "--prod";

/// Decide which environment a run targets.
///
/// A deployment name always wins: `*--prod` is prod, anything else dev.
/// Local runs without an explicit env default to dev. Otherwise `env`
/// must name a known environment.
pub fn resolve_run_env(
    env: Option<&str>,
    deployment_name: Option<&str>,
    local: bool,
) -> Result<RunEnv> {
    if let Some(name) = deployment_name {
        return Ok(if name.ends_with(PROD_DEPLOYMENT_SUFFIX) {
            RunEnv::Prod
        } else {
            RunEnv::Dev
        });
    }

    match env {
        None if local => Ok(RunEnv::Dev),
        None => Err(CoreError::InvalidEnv {
            value: "<unset>".to_string(),
        }),
        Some(value) => value.parse(),
    }
}
