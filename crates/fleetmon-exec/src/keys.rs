//! SSH key resolution

use std::path::PathBuf;

use tracing::debug;

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to an identity file
    Path(PathBuf),
    /// Probe the user's default identity files
    Default,
}

impl KeySource {
    /// Resolve to a concrete identity file path.
    ///
    /// # Errors
    /// Returns `KeyError` if no usable identity file is found or its
    /// permissions are too open.
    pub fn resolve(&self) -> Result<PathBuf, KeyError> {
        match self {
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                Ok(path.clone())
            }
            KeySource::Default => {
                let home = std::env::var("HOME").map_err(|_| KeyError::NoHome)?;
                for name in ["id_ed25519", "id_rsa"] {
                    let candidate = PathBuf::from(&home).join(".ssh").join(name);
                    if candidate.exists() {
                        debug!(path = %candidate.display(), "using default identity file");
                        validate_key_permissions(&candidate)?;
                        return Ok(candidate);
                    }
                }
                Err(KeyError::NotFound(format!("{home}/.ssh/id_{{ed25519,rsa}}")))
            }
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("identity file not found: {0}")]
    NotFound(String),

    #[error("identity file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("HOME not set, cannot locate default identity file")]
    NoHome,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn validate_key_permissions(path: &PathBuf) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(KeyError::Io)?;
    let mode = metadata.permissions().mode();

    // mode & 0o77 checks group and other permissions
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
