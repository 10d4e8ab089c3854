use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, warn};

use crate::error::PortalResult;
use crate::models::AuthSession;

/// Keeps the last session on disk so a restart can pick it up again.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> PortalResult<Option<AuthSession>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                // unreadable file is treated as signed out
                warn!(error = %e, path = %self.path.display(), "Ignoring corrupt session file");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, session: &AuthSession) -> PortalResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let raw = serde_json::to_vec_pretty(session)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        fs::write(&self.path, raw).await?;
        debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    pub async fn clear(&self) -> PortalResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
