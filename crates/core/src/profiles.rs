//! Mining profile CRUD over the atomic repository.

use crate::config::Profile;
use crate::error::{CoreError, Result};
use openminerd_store::{JsonRepository, StoreError};
use std::path::PathBuf;

pub struct ProfileStore {
    repo: JsonRepository<Vec<Profile>>,
}

impl ProfileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            repo: JsonRepository::new(path),
        }
    }

    pub fn list(&self) -> Result<Vec<Profile>> {
        Ok(self.repo.load()?)
    }

    pub fn get(&self, id: &str) -> Result<Profile> {
        self.repo
            .load()?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::ProfileNotFound(id.to_string()))
    }

    /// Add a new profile; a missing id gets a fresh UUID.
    pub fn add(&self, mut profile: Profile) -> Result<Profile> {
        if profile.id.is_empty() {
            profile.id = uuid::Uuid::new_v4().to_string();
        }
        let id = profile.id.clone();
        let stored = profile.clone();
        self.repo
            .update(move |profiles| {
                if profiles.iter().any(|p| p.id == profile.id) {
                    return Err(StoreError::Rejected("exists".into()));
                }
                profiles.push(profile.clone());
                Ok(())
            })
            .map_err(|e| match e {
                StoreError::Rejected(_) => CoreError::ProfileExists(id.clone()),
                other => other.into(),
            })?;
        Ok(stored)
    }

    pub fn update(&self, profile: Profile) -> Result<()> {
        let id = profile.id.clone();
        self.repo
            .update(move |profiles| match profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(existing) => {
                    *existing = profile.clone();
                    Ok(())
                }
                None => Err(StoreError::Rejected("missing".into())),
            })
            .map_err(|e| match e {
                StoreError::Rejected(_) => CoreError::ProfileNotFound(id.clone()),
                other => other.into(),
            })?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let target = id.to_string();
        self.repo
            .update(move |profiles| {
                let before = profiles.len();
                profiles.retain(|p| p.id != target);
                if profiles.len() == before {
                    return Err(StoreError::Rejected("missing".into()));
                }
                Ok(())
            })
            .map_err(|e| match e {
                StoreError::Rejected(_) => CoreError::ProfileNotFound(id.to_string()),
                other => other.into(),
            })?;
        Ok(())
    }
}
