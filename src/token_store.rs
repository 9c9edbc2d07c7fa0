use anyhow::Context;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{error::Result, provider::Integration, types::OAuthToken};

/// Per-integration token persistence. Each integration owns one
/// `<integration>_tokens.json` file in the token directory; the in-memory
/// map is the source of truth while the process runs.
#[derive(Debug)]
pub struct TokenStore {
    dir: PathBuf,
    tokens: RwLock<HashMap<Integration, OAuthToken>>,
}

impl TokenStore {
    /// Load every integration's token file from `dir`. Environment overrides
    /// win over whatever is on disk.
    pub fn open(dir: impl Into<PathBuf>, overrides: &[(Integration, String)]) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create token directory {}", dir.display()))?;

        let mut tokens = HashMap::new();
        for integration in Integration::ALL {
            if let Some(token) = load_token_file(&token_path(&dir, integration)) {
                tokens.insert(integration, token);
            }
        }

        for (integration, access_token) in overrides {
            info!(
                "Using {} access token from environment",
                integration.display_name()
            );
            tokens.insert(*integration, OAuthToken::manual(access_token.clone()));
        }

        info!(
            "Loaded {} token(s) from {}",
            tokens.len(),
            dir.display()
        );

        Ok(Self {
            dir,
            tokens: RwLock::new(tokens),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, integration: Integration) -> PathBuf {
        token_path(&self.dir, integration)
    }

    pub fn get(&self, integration: Integration) -> Option<OAuthToken> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&integration)
            .cloned()
    }

    /// Persist then publish. If writing the file fails the previously stored
    /// token stays in place.
    pub fn save(&self, integration: Integration, token: OAuthToken) -> Result<()> {
        let path = self.path_for(integration);
        write_atomically(&path, &token)?;
        debug!("Saved {} token to {}", integration, path.display());

        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(integration, token);
        Ok(())
    }

    /// Remove the token from memory and disk. Clearing an empty slot is a
    /// no-op.
    pub fn clear(&self, integration: Integration) -> Result<()> {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&integration);

        let path = self.path_for(integration);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted {} token file", integration);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to delete {}", path.display()))
                .into()),
        }
    }
}

fn token_path(dir: &Path, integration: Integration) -> PathBuf {
    dir.join(format!("{}_tokens.json", integration.as_str()))
}

fn load_token_file(path: &Path) -> Option<OAuthToken> {
    match fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<OAuthToken>(&data) {
            Ok(token) if !token.access_token.is_empty() => Some(token),
            Ok(_) => {
                debug!("Token file {} holds no access token", path.display());
                None
            }
            Err(e) => {
                warn!("Failed to parse token file {}: {}", path.display(), e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            error!("Failed to read token file {}: {}", path.display(), e);
            None
        }
    }
}

// Write to a sibling temp file, then rename over the target.
fn write_atomically(path: &Path, token: &OAuthToken) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(token).context("Failed to serialize token")?;
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

    let result = fs::write(&tmp, data)
        .with_context(|| format!("Failed to write {}", tmp.display()))
        .and_then(|()| {
            fs::rename(&tmp, path)
                .with_context(|| format!("Failed to replace {}", path.display()))
        });

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
