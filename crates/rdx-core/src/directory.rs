//! Studies and participants known to the pipeline.

use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;

use crate::index::{now_secs, Index};
use crate::keys::create_client_key_pair;
use crate::store::{sealing, ObjectStore, StudyKeys};

const STUDY_ID_LEN: usize = 24;
const PATIENT_ID_LEN: usize = 8;
const PATIENT_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("[RD601] study '{0}' does not exist")]
    UnknownStudy(String),
    #[error("[RD602] participant '{0}' does not exist")]
    UnknownParticipant(String),
    #[error("[RD603] a study named '{0}' already exists")]
    DuplicateStudy(String),
    #[error("[RD604] could not allocate a unique identifier")]
    IdExhausted,
}

impl DirectoryError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownStudy(_) => "RD601",
            Self::UnknownParticipant(_) => "RD602",
            Self::DuplicateStudy(_) => "RD603",
            Self::IdExhausted => "RD604",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Study {
    pub object_id: String,
    pub name: String,
    pub created_at: i64,
}

impl Study {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            object_id: row.get("object_id")?,
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub patient_id: String,
    pub study_id: String,
    pub device_id: String,
    pub os_type: String,
    pub created_at: i64,
}

impl Participant {
    /// A device has completed registration for this participant.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        !self.device_id.is_empty()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            patient_id: row.get("patient_id")?,
            study_id: row.get("study_id")?,
            device_id: row.get("device_id")?,
            os_type: row.get("os_type")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Directory {
    index: Index,
}

impl Directory {
    #[must_use]
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    /// # Errors
    /// [`DirectoryError::DuplicateStudy`] when the name is taken.
    pub fn create_study(&self, name: &str) -> Result<Study> {
        let name = name.trim();
        let created_at = now_secs();
        let server_key = sealing::encode_server_key(&sealing::generate_server_key());
        let study = self.index.with_immediate_tx(|tx| {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM studies WHERE name = ?1)",
                params![name],
                |row| row.get(0),
            )?;
            if taken {
                return Err(DirectoryError::DuplicateStudy(name.to_string()).into());
            }
            let mut object_id = None;
            for _ in 0..ID_ATTEMPTS {
                let candidate: String = OsRng
                    .sample_iter(&Alphanumeric)
                    .take(STUDY_ID_LEN)
                    .map(char::from)
                    .collect();
                let used: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM studies WHERE object_id = ?1)",
                    params![candidate],
                    |row| row.get(0),
                )?;
                if !used {
                    object_id = Some(candidate);
                    break;
                }
            }
            let object_id = object_id.ok_or(DirectoryError::IdExhausted)?;
            tx.execute(
                "INSERT INTO studies(object_id, name, server_key, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![object_id, name, server_key, created_at],
            )?;
            Ok(Study {
                object_id,
                name: name.to_string(),
                created_at,
            })
        })?;
        info!(study_id = %study.object_id, name = %study.name, "study created");
        Ok(study)
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn study(&self, object_id: &str) -> Result<Option<Study>> {
        let conn = self.index.connection()?;
        conn.query_row(
            "SELECT object_id, name, created_at FROM studies WHERE object_id = ?1",
            params![object_id],
            Study::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Look a study up by object id, falling back to its name.
    ///
    /// # Errors
    /// [`DirectoryError::UnknownStudy`] when neither matches.
    pub fn resolve_study(&self, id_or_name: &str) -> Result<Study> {
        if let Some(study) = self.study(id_or_name)? {
            return Ok(study);
        }
        let conn = self.index.connection()?;
        conn.query_row(
            "SELECT object_id, name, created_at FROM studies WHERE name = ?1",
            params![id_or_name],
            Study::from_row,
        )
        .optional()?
        .ok_or_else(|| DirectoryError::UnknownStudy(id_or_name.to_string()).into())
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn studies(&self) -> Result<Vec<Study>> {
        let conn = self.index.connection()?;
        let mut stmt = conn.prepare("SELECT object_id, name, created_at FROM studies ORDER BY name")?;
        let studies = stmt
            .query_map([], Study::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(studies)
    }

    /// Enroll a participant, generating their key pair. Returns the
    /// participant and the device-form public key.
    ///
    /// # Errors
    /// Fails for unknown studies or when key storage fails.
    pub fn create_participant(
        &self,
        study_id: &str,
        store: &ObjectStore,
        key_bits: usize,
    ) -> Result<(Participant, String)> {
        if self.study(study_id)?.is_none() {
            return Err(DirectoryError::UnknownStudy(study_id.to_string()).into());
        }
        let mut patient_id = None;
        for _ in 0..ID_ATTEMPTS {
            let candidate: String = (0..PATIENT_ID_LEN)
                .map(|_| char::from(PATIENT_ID_CHARS[OsRng.gen_range(0..PATIENT_ID_CHARS.len())]))
                .collect();
            if self.participant(&candidate)?.is_none() {
                patient_id = Some(candidate);
                break;
            }
        }
        let patient_id = patient_id.ok_or(DirectoryError::IdExhausted)?;
        let public_key = create_client_key_pair(store, study_id, &patient_id, key_bits)?;
        let created_at = now_secs();
        self.index.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO participants(patient_id, study_id, created_at) VALUES (?1, ?2, ?3)",
                params![patient_id, study_id, created_at],
            )?;
            Ok(())
        })?;
        info!(study_id, patient_id = %patient_id, "participant created");
        Ok((
            Participant {
                patient_id,
                study_id: study_id.to_string(),
                device_id: String::new(),
                os_type: String::new(),
                created_at,
            },
            public_key,
        ))
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn participant(&self, patient_id: &str) -> Result<Option<Participant>> {
        let conn = self.index.connection()?;
        conn.query_row(
            "SELECT patient_id, study_id, device_id, os_type, created_at \
             FROM participants WHERE patient_id = ?1",
            params![patient_id],
            Participant::from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// # Errors
    /// [`DirectoryError::UnknownParticipant`] for unknown ids.
    pub fn require_participant(&self, patient_id: &str) -> Result<Participant> {
        self.participant(patient_id)?
            .ok_or_else(|| DirectoryError::UnknownParticipant(patient_id.to_string()).into())
    }

    /// # Errors
    /// Fails when the index cannot be read.
    pub fn participants(&self, study_id: &str) -> Result<Vec<Participant>> {
        let conn = self.index.connection()?;
        let mut stmt = conn.prepare(
            "SELECT patient_id, study_id, device_id, os_type, created_at \
             FROM participants WHERE study_id = ?1 ORDER BY patient_id",
        )?;
        let participants = stmt
            .query_map(params![study_id], Participant::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(participants)
    }

    /// Bind a device to a participant.
    ///
    /// # Errors
    /// [`DirectoryError::UnknownParticipant`] for unknown ids.
    pub fn set_device(&self, patient_id: &str, device_id: &str, os_type: &str) -> Result<()> {
        let updated = self.index.with_immediate_tx(|tx| {
            Ok(tx.execute(
                "UPDATE participants SET device_id = ?2, os_type = ?3 WHERE patient_id = ?1",
                params![patient_id, device_id, os_type],
            )?)
        })?;
        if updated == 0 {
            return Err(DirectoryError::UnknownParticipant(patient_id.to_string()).into());
        }
        Ok(())
    }
}

impl StudyKeys for Directory {
    fn server_key(&self, study_id: &str) -> Result<[u8; sealing::SERVER_KEY_LEN]> {
        let conn = self.index.connection()?;
        let encoded: String = conn
            .query_row(
                "SELECT server_key FROM studies WHERE object_id = ?1",
                params![study_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| DirectoryError::UnknownStudy(study_id.to_string()))?;
        sealing::decode_server_key(&encoded).with_context(|| format!("corrupt server key for study {study_id}"))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::config::StoreConfig;
    use crate::store::MemoryBackend;
    use tempfile::tempdir;

    #[test]
    fn studies_get_unique_ids_and_names() -> Result<()> {
        let temp = tempdir()?;
        let directory = Directory::new(Index::open(temp.path())?);
        let study = directory.create_study("Sleep Study")?;
        assert_eq!(study.object_id.len(), 24);
        assert!(study.object_id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(directory.resolve_study("Sleep Study")?, study);
        assert_eq!(directory.resolve_study(&study.object_id)?, study);
        assert_eq!(directory.server_key(&study.object_id)?.len(), 32);

        let err = directory.create_study("Sleep Study").unwrap_err();
        assert_eq!(
            err.downcast_ref::<DirectoryError>(),
            Some(&DirectoryError::DuplicateStudy("Sleep Study".into()))
        );
        assert!(directory.resolve_study("nope").is_err());
        Ok(())
    }

    #[test]
    fn participants_get_keys_and_devices() -> Result<()> {
        let temp = tempdir()?;
        let directory = Arc::new(Directory::new(Index::open(temp.path())?));
        let store = ObjectStore::new(
            Arc::new(MemoryBackend::new()),
            directory.clone(),
            &StoreConfig {
                retries: 0,
                retry_delay: Duration::ZERO,
                list_page_size: 10,
            },
        );
        let study = directory.create_study("s")?;
        let (participant, public_key) = directory.create_participant(&study.object_id, &store, 1024)?;
        assert_eq!(participant.patient_id.len(), 8);
        assert!(!public_key.is_empty());
        assert!(!participant.is_registered());

        directory.set_device(&participant.patient_id, "dev-1", "ANDROID")?;
        let stored = directory.require_participant(&participant.patient_id)?;
        assert!(stored.is_registered());
        assert_eq!(stored.os_type, "ANDROID");
        assert_eq!(directory.participants(&study.object_id)?.len(), 1);

        assert!(directory.set_device("missing", "d", "IOS").is_err());
        assert!(directory.create_participant("missing", &store, 1024).is_err());
        Ok(())
    }
}
