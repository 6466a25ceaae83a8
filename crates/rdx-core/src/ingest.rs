//! Device-facing upload and registration handling.
//!
//! The device deletes a file once it is acknowledged, so nothing here
//! acknowledges an upload before its raw payload is stored and queued.
//! Server-side failures before that point surface as `Err` (HTTP 500) and
//! the device retries.

use std::sync::Arc;

use anyhow::Result;
use rdx_domain::{identifiers_raw_path, is_allowed_extension, qualify_device_file_name, raw_path};
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::backlog::enqueue_tx;
use crate::crypto::{CryptoGate, FailureLedger};
use crate::directory::Directory;
use crate::index::{now_secs, Index};
use crate::keys::{client_private_key, client_public_key, public_key_string};
use crate::stats::record_upload_tx;
use crate::store::{ObjectKey, ObjectStore};

const IDENTIFIERS_HEADER: &str = "patient_id,MAC,phone_number,device_id,device_os,os_version,product,brand,\
hardware_id,manufacturer,model,beiwe_version\n";

/// One upload as received from a device.
#[derive(Clone, Copy, Debug)]
pub struct UploadRequest<'a> {
    pub patient_id: &'a str,
    pub file_name: Option<&'a str>,
    pub body: &'a [u8],
}

/// Terminal state of an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadDisposition {
    /// Stored and queued for chunking.
    Enqueued { raw_path: String, newly_queued: bool },
    RejectedUnauthenticated,
    RejectedUnregisteredDevice,
    RejectedNoName,
    RejectedEmpty,
    RejectedBadExtension { extension: String },
    /// Crash report forwarded to operators.
    CrashLogForwarded,
    /// Spurious device file, dropped.
    Ignored,
    /// Nothing decryptable; acknowledged without ingesting.
    DecryptFailedSoft,
    /// Undecryptable; acknowledged, recorded and alerted.
    DecryptFailedReport { code: &'static str },
}

impl UploadDisposition {
    /// Status returned to the device. 200 tells it to delete the file.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RejectedUnauthenticated => 403,
            Self::RejectedBadExtension { .. } => 400,
            Self::Enqueued { .. }
            | Self::RejectedUnregisteredDevice
            | Self::RejectedNoName
            | Self::RejectedEmpty
            | Self::CrashLogForwarded
            | Self::Ignored
            | Self::DecryptFailedSoft
            | Self::DecryptFailedReport { .. } => 200,
        }
    }

    #[must_use]
    pub fn state(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "ENQUEUED",
            Self::RejectedUnauthenticated => "REJECTED_UNAUTHENTICATED",
            Self::RejectedUnregisteredDevice => "REJECTED_UNREGISTERED_DEVICE",
            Self::RejectedNoName => "REJECTED_NO_NAME",
            Self::RejectedEmpty => "REJECTED_EMPTY",
            Self::RejectedBadExtension { .. } => "REJECTED_BAD_EXTENSION",
            Self::CrashLogForwarded => "CRASH_LOG_FORWARDED",
            Self::Ignored => "IGNORED",
            Self::DecryptFailedSoft => "DECRYPT_FAILED_SOFT",
            Self::DecryptFailedReport { .. } => "DECRYPT_FAILED_REPORT",
        }
    }

    /// Whether the device will delete its copy.
    #[must_use]
    pub fn acknowledged(&self) -> bool {
        self.http_status() == 200
    }
}

/// Attributes a device reports when it registers. Missing values are
/// recorded as `none`.
#[derive(Clone, Debug)]
pub struct DeviceRegistration {
    pub patient_id: String,
    pub device_id: String,
    pub os_type: String,
    pub phone_number: String,
    pub mac_address: String,
    pub device_os: String,
    pub os_version: String,
    pub product: String,
    pub brand: String,
    pub hardware_id: String,
    pub manufacturer: String,
    pub model: String,
    pub app_version: String,
}

impl DeviceRegistration {
    #[must_use]
    pub fn new(patient_id: &str, device_id: &str, os_type: &str) -> Self {
        let none = || "none".to_string();
        Self {
            patient_id: patient_id.to_string(),
            device_id: device_id.to_string(),
            os_type: os_type.to_string(),
            phone_number: none(),
            mac_address: none(),
            device_os: none(),
            os_version: none(),
            product: none(),
            brand: none(),
            hardware_id: none(),
            manufacturer: none(),
            model: none(),
            app_version: none(),
        }
    }

    fn identifiers_csv(&self) -> String {
        let values = [
            &self.patient_id,
            &self.mac_address,
            &self.phone_number,
            &self.device_id,
            &self.device_os,
            &self.os_version,
            &self.product,
            &self.brand,
            &self.hardware_id,
            &self.manufacturer,
            &self.model,
            &self.app_version,
        ];
        let values: Vec<&str> = values.iter().map(|value| value.as_str()).collect();
        format!("{IDENTIFIERS_HEADER}{}", values.join(","))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered {
        public_key: String,
        identifiers_path: String,
    },
    UnknownParticipant,
    /// Another device is already registered for this participant.
    DeviceMismatch,
    /// The participant registered before from a different OS.
    OsMismatch,
}

impl RegistrationOutcome {
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Registered { .. } => 200,
            Self::UnknownParticipant => 403,
            Self::DeviceMismatch => 405,
            Self::OsMismatch => 400,
        }
    }
}

pub struct Ingestor {
    directory: Arc<Directory>,
    store: ObjectStore,
    index: Index,
    ledger: Arc<dyn FailureLedger>,
    alerts: Arc<dyn AlertSink>,
}

impl Ingestor {
    #[must_use]
    pub fn new(
        directory: Arc<Directory>,
        store: ObjectStore,
        index: Index,
        ledger: Arc<dyn FailureLedger>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            directory,
            store,
            index,
            ledger,
            alerts,
        }
    }

    /// Run one upload through validation, decryption, storage and queueing.
    ///
    /// # Errors
    /// Server-side failures before the payload is durable; the device
    /// should retry.
    pub fn handle_upload(&self, request: &UploadRequest<'_>) -> Result<UploadDisposition> {
        let patient_id = request.patient_id;
        let Some(participant) = self.directory.participant(patient_id)? else {
            warn!(patient_id, "upload from unknown participant");
            return Ok(UploadDisposition::RejectedUnauthenticated);
        };
        if !participant.is_registered() {
            warn!(patient_id, "upload from participant without a registered device");
            return Ok(UploadDisposition::RejectedUnregisteredDevice);
        }
        let Some(file_name) = request.file_name.map(str::trim).filter(|name| !name.is_empty()) else {
            warn!(patient_id, "upload without a file name");
            return Ok(UploadDisposition::RejectedNoName);
        };
        let study_id = participant.study_id.as_str();

        if file_name.to_lowercase().contains("crashlog") {
            let key = ObjectKey::namespaced(
                study_id,
                &format!("crashlogs/{}", qualify_device_file_name(patient_id, file_name)),
            );
            self.store.put(&key, request.body)?;
            self.alerts.raise(Alert::new(
                AlertKind::CrashLog,
                patient_id,
                format!("crash log stored at {}", key.as_str()),
            ));
            return Ok(UploadDisposition::CrashLogForwarded);
        }
        if file_name.starts_with("rList-") {
            debug!(patient_id, file_name, "ignoring spurious device file");
            return Ok(UploadDisposition::Ignored);
        }
        if request.body.is_empty() {
            warn!(patient_id, file_name, "empty upload");
            return Ok(UploadDisposition::RejectedEmpty);
        }
        let extension = file_name.rsplit_once('.').map_or("", |(_, ext)| ext);
        if !is_allowed_extension(extension) {
            self.alerts.raise(Alert::new(
                AlertKind::RejectedUpload,
                patient_id,
                format!("{file_name} has an unsupported extension '{extension}'"),
            ));
            return Ok(UploadDisposition::RejectedBadExtension {
                extension: extension.to_string(),
            });
        }

        let private_key = client_private_key(&self.store, study_id, patient_id)?;
        let plaintext = match CryptoGate::new(self.ledger.as_ref()).decrypt(
            request.body,
            &private_key,
            patient_id,
            file_name,
        ) {
            Ok(plaintext) => plaintext,
            Err(failure) if failure.is_soft() => {
                warn!(patient_id, file_name, error = %failure, "upload had nothing to decrypt");
                return Ok(UploadDisposition::DecryptFailedSoft);
            }
            Err(failure) => {
                self.alerts.raise(Alert::new(
                    AlertKind::DecryptionFailure,
                    patient_id,
                    format!("{file_name}: {failure}"),
                ));
                return Ok(UploadDisposition::DecryptFailedReport { code: failure.code() });
            }
        };
        if plaintext.is_empty() {
            warn!(patient_id, file_name, "upload decrypted to nothing");
            return Ok(UploadDisposition::RejectedEmpty);
        }

        let raw = raw_path(study_id, &qualify_device_file_name(patient_id, file_name));
        self.store
            .put(&ObjectKey::path_complete(study_id, &raw), &plaintext)?;
        let size = plaintext.len() as u64;
        let newly_queued = self.index.with_immediate_tx(|tx| {
            let queued = enqueue_tx(tx, &raw, study_id, patient_id)?;
            record_upload_tx(tx, &raw, patient_id, size, now_secs())?;
            Ok(queued)
        })?;
        info!(patient_id, raw_path = %raw, size, "upload stored");
        Ok(UploadDisposition::Enqueued {
            raw_path: raw,
            newly_queued,
        })
    }

    /// Bind a device to a participant, record its identifiers and hand
    /// back the participant's public key.
    ///
    /// # Errors
    /// Server-side storage or index failures.
    pub fn register_device(&self, registration: &DeviceRegistration) -> Result<RegistrationOutcome> {
        let patient_id = registration.patient_id.as_str();
        let Some(participant) = self.directory.participant(patient_id)? else {
            return Ok(RegistrationOutcome::UnknownParticipant);
        };
        if participant.is_registered() && participant.device_id != registration.device_id {
            warn!(patient_id, "registration from a second device");
            return Ok(RegistrationOutcome::DeviceMismatch);
        }
        if !participant.os_type.is_empty() && participant.os_type != registration.os_type {
            warn!(patient_id, os_type = %registration.os_type, "registration from a different OS");
            return Ok(RegistrationOutcome::OsMismatch);
        }

        let study_id = participant.study_id.as_str();
        let identifiers_path = identifiers_raw_path(study_id, patient_id, now_secs());
        self.store.put(
            &ObjectKey::path_complete(study_id, &identifiers_path),
            registration.identifiers_csv().as_bytes(),
        )?;
        self.index
            .with_immediate_tx(|tx| enqueue_tx(tx, &identifiers_path, study_id, patient_id))?;
        self.directory
            .set_device(patient_id, &registration.device_id, &registration.os_type)?;
        let public_key = public_key_string(&client_public_key(&self.store, study_id, patient_id)?)?;
        info!(patient_id, device_id = %registration.device_id, "device registered");
        Ok(RegistrationOutcome::Registered {
            public_key,
            identifiers_path,
        })
    }
}
