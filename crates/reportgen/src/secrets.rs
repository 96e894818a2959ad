//! Secret resolution for credentials referenced from the config.
//!
//! A secret can be given in three ways, tried in this order:
//!
//! 1. **Inline value** - for local testing (`token: "abc"`)
//! 2. **File** - Docker secrets style (`token_file: /run/secrets/hook_token`)
//! 3. **Environment variable** - (`token_env_var: REPORTGEN_HOOK_TOKEN`)
//!
//! Empty strings count as "not given".

use secrecy::SecretString;
use std::fs;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: inline value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where to find one secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretSource<'a> {
    pub value: Option<&'a str>,
    pub file: Option<&'a str>,
    pub env_var: Option<&'a str>,
}

fn given(part: Option<&str>) -> Option<&str> {
    part.filter(|s| !s.is_empty())
}

impl SecretSource<'_> {
    /// True if at least one source is set.
    pub fn is_configured(&self) -> bool {
        given(self.value).is_some() || given(self.file).is_some() || given(self.env_var).is_some()
    }

    /// Resolves the secret from the first source that is set. File contents
    /// and env var values are trimmed.
    pub fn resolve(&self) -> Result<SecretString> {
        if let Some(value) = given(self.value) {
            return Ok(SecretString::from(value.to_string()));
        }

        if let Some(path) = given(self.file) {
            let expanded = expand_home(path);
            return fs::read_to_string(&expanded)
                .map(|content| SecretString::from(content.trim().to_string()))
                .map_err(|source| SecretError::FileReadError {
                    path: expanded,
                    source,
                });
        }

        if let Some(name) = given(self.env_var) {
            return match std::env::var(name) {
                Ok(value) => Ok(SecretString::from(value.trim().to_string())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: name.to_string(),
                }),
            };
        }

        Err(SecretError::NoSourceProvided)
    }

    /// Like [`resolve`](Self::resolve), but `None` when no source is set.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>> {
        match self.resolve() {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NoSourceProvided) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Expands a leading `~` to the home directory. `~user/...` is not supported.
pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
