//! Connection configuration and operation parameters.

use crate::{KBError, Result};

use std::env;
use std::path::PathBuf;

//-----------------------------------------------------------------------------

/// Where the backend lives and who talks to it.
///
/// The configuration is passed explicitly to [`crate::Gateway`] and [`crate::KnowledgeBase`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KBConfig {
    /// Backend database file.
    pub host: PathBuf,
    /// User name.
    pub user: String,
    /// Password for the user.
    pub password: String,
}

impl KBConfig {
    /// Environment variable for the backend host.
    pub const ENV_HOST: &'static str = "OME_HOST";

    /// Environment variable for the user name.
    pub const ENV_USER: &'static str = "OME_USER";

    /// Environment variable for the password.
    pub const ENV_PASS: &'static str = "OME_PASS";

    /// Creates a new configuration.
    pub fn new<P: Into<PathBuf>>(host: P, user: &str, password: &str) -> Self {
        KBConfig {
            host: host.into(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Reads the configuration from environment variables [`Self::ENV_HOST`], [`Self::ENV_USER`], and [`Self::ENV_PASS`].
    ///
    /// Returns an error naming the first variable that is not set.
    pub fn from_env() -> Result<Self> {
        let host = Self::get_env(Self::ENV_HOST)?;
        let user = Self::get_env(Self::ENV_USER)?;
        let password = Self::get_env(Self::ENV_PASS)?;
        Ok(Self::new(host, &user, &password))
    }

    fn get_env(name: &str) -> Result<String> {
        env::var(name).map_err(|_| KBError::Config(format!("environment variable {} is not set", name)))
    }
}

//-----------------------------------------------------------------------------

/// Parameters for batched operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KBParams {
    /// Number of records per ingest batch and rows per read window.
    pub batch_size: usize,
}

impl KBParams {
    /// Default batch size for ingests and table reads.
    pub const BATCH_SIZE: usize = 10000;

    /// Default window size for GDO streams.
    pub const STREAM_BATCH: usize = 100;
}

impl Default for KBParams {
    fn default() -> Self {
        Self {
            batch_size: Self::BATCH_SIZE,
        }
    }
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
