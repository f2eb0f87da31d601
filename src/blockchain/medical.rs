use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::block::now_seconds;
use super::canonical::canonical_json;

/// Stands in for the ciphertext when a record is signed, so the signature does
/// not depend on the encryption nonce
pub const SIGNATURE_PLACEHOLDER: &str = "SIGNATURE_PLACEHOLDER";

/// Substituted for the payload of a readable record that fails to decrypt
pub const ENCRYPTED_SENTINEL: &str = "ENCRYPTED";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Invalid record type: {0}")]
    InvalidRecordType(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// The closed set of medical record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    DiagnosticReport,
    Prescription,
    LabResult,
    VitalSigns,
    ConsultationNotes,
    SurgeryRecord,
    ImagingReport,
    Vaccination,
    AllergyRecord,
    PatientConsent,
}

impl RecordType {
    pub const ALL: [RecordType; 10] = [
        RecordType::DiagnosticReport,
        RecordType::Prescription,
        RecordType::LabResult,
        RecordType::VitalSigns,
        RecordType::ConsultationNotes,
        RecordType::SurgeryRecord,
        RecordType::ImagingReport,
        RecordType::Vaccination,
        RecordType::AllergyRecord,
        RecordType::PatientConsent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::DiagnosticReport => "diagnostic_report",
            RecordType::Prescription => "prescription",
            RecordType::LabResult => "lab_result",
            RecordType::VitalSigns => "vital_signs",
            RecordType::ConsultationNotes => "consultation_notes",
            RecordType::SurgeryRecord => "surgery_record",
            RecordType::ImagingReport => "imaging_report",
            RecordType::Vaccination => "vaccination",
            RecordType::AllergyRecord => "allergy_record",
            RecordType::PatientConsent => "patient_consent",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordType::ALL
            .iter()
            .copied()
            .find(|record_type| record_type.as_str() == s)
            .ok_or_else(|| RecordError::InvalidRecordType(s.to_string()))
    }
}

/// Type tag carried by every medical record entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub enum RecordKind {
    #[default]
    #[serde(rename = "MEDICAL_RECORD")]
    MedicalRecord,
}

/// A medical record entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MedicalRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,

    pub patient_id: String,

    /// Author of the record; its hex public key verifies the signature
    pub doctor_id: String,

    pub record_type: RecordType,

    /// Base64 ciphertext of the payload, or null when there is none
    pub data: Option<String>,

    pub timestamp: f64,

    /// Principals allowed to read the plaintext
    pub access_list: Vec<String>,
}

impl MedicalRecord {
    /// Creates a new record stamped with the current time
    ///
    /// The access list defaults to the patient and the doctor.
    pub fn new(
        patient_id: &str,
        doctor_id: &str,
        record_type: RecordType,
        data: Option<String>,
        access_list: Option<Vec<String>>,
    ) -> Self {
        let access_list = access_list
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec![patient_id.to_string(), doctor_id.to_string()]);

        MedicalRecord {
            kind: RecordKind::MedicalRecord,
            patient_id: patient_id.to_string(),
            doctor_id: doctor_id.to_string(),
            record_type,
            data,
            timestamp: now_seconds(),
            access_list: dedup(access_list),
        }
    }

    /// Checks if a principal is on the record's access list
    pub fn is_listed(&self, principal: &str) -> bool {
        self.access_list.iter().any(|id| id == principal)
    }

    /// Gets the canonical message the author signs
    pub fn signing_payload(&self) -> Result<String, RecordError> {
        record_signing_payload(
            &self.patient_id,
            &self.doctor_id,
            self.record_type,
            &self.access_list,
        )
    }
}

/// Builds the canonical message a doctor signs for a record
///
/// The ciphertext is replaced by `SIGNATURE_PLACEHOLDER` and the timestamp is
/// left out, since the ledger assigns it at admission.
pub fn record_signing_payload(
    patient_id: &str,
    doctor_id: &str,
    record_type: RecordType,
    access_list: &[String],
) -> Result<String, RecordError> {
    let data = serde_json::json!({
        "type": RecordKind::MedicalRecord,
        "patient_id": patient_id,
        "doctor_id": doctor_id,
        "record_type": record_type,
        "data": SIGNATURE_PLACEHOLDER,
        "access_list": access_list,
    });

    canonical_json(&data).map_err(|e| RecordError::SerializationError(e.to_string()))
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

/// A medical record as returned to an authorized reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecordView {
    /// Index of the block holding the record
    pub block_index: u64,

    #[serde(rename = "type")]
    pub kind: RecordKind,

    pub patient_id: String,

    pub doctor_id: String,

    pub record_type: RecordType,

    /// Decrypted payload, `"ENCRYPTED"` if it could not be decrypted, or null
    #[schema(value_type = Object)]
    pub data: Value,

    pub timestamp: f64,

    pub access_list: Vec<String>,
}

impl RecordView {
    pub fn new(block_index: u64, record: MedicalRecord, data: Value) -> Self {
        RecordView {
            block_index,
            kind: record.kind,
            patient_id: record.patient_id,
            doctor_id: record.doctor_id,
            record_type: record.record_type,
            data,
            timestamp: record.timestamp,
            access_list: record.access_list,
        }
    }
}

/// Whether a consent record grants or revokes access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConsentAction {
    Grant,
    Revoke,
}

impl FromStr for ConsentAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(ConsentAction::Grant),
            "revoke" => Ok(ConsentAction::Revoke),
            other => Err(format!(
                "access_type must be either 'grant' or 'revoke', got '{}'",
                other
            )),
        }
    }
}

/// Encrypted payload of a `patient_consent` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentPayload {
    pub action: ConsentAction,
    pub provider_id: String,
    pub record_types: Vec<RecordType>,
    pub timestamp: f64,
    #[serde(default)]
    pub expiration: Option<f64>,
}

/// Consent decisions for one patient, folded in chain order
///
/// The latest decision per (provider, record type) wins.
#[derive(Debug, Default)]
pub struct ConsentGrants {
    decisions: HashMap<(String, RecordType), (ConsentAction, Option<f64>)>,
}

impl ConsentGrants {
    pub fn apply(&mut self, consent: &ConsentPayload) {
        for record_type in &consent.record_types {
            self.decisions.insert(
                (consent.provider_id.clone(), *record_type),
                (consent.action, consent.expiration),
            );
        }
    }

    /// Checks if a provider holds an unexpired grant for a record type at `now`
    pub fn allows(&self, provider_id: &str, record_type: RecordType, now: f64) -> bool {
        match self.decisions.get(&(provider_id.to_string(), record_type)) {
            Some((ConsentAction::Grant, expiration)) => expiration.map_or(true, |at| at > now),
            _ => false,
        }
    }
}
