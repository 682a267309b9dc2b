//! Syncable domain records
//!
//! Every record carries the metadata offline-first sync needs: a stable id,
//! a version counter advanced by remote writes, a synced flag and
//! created/updated timestamps.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Contract shared by all records that participate in synchronization
pub trait Syncable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Remote collection / local document list name
    const COLLECTION: &'static str;

    /// JSON field names encrypted before leaving memory
    const SENSITIVE_FIELDS: &'static [&'static str] = &[];

    fn id(&self) -> Uuid;

    fn version(&self) -> u64;

    fn is_synced(&self) -> bool;

    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> DateTime<Utc>;

    /// Copy with the given version and synced flag
    fn with_sync_state(&self, version: u64, synced: bool) -> Self;

    /// Copy with `updated_at` set to `now`
    fn touched(&self, now: DateTime<Utc>) -> Self;

    /// Copy representing a local edit made at `now`.
    ///
    /// Editing a synced record opens the next version; further edits before
    /// the next remote write stay on that version.
    fn edited(&self, now: DateTime<Utc>) -> Self {
        let version = if self.is_synced() {
            self.version().saturating_add(1)
        } else {
            self.version()
        };
        self.with_sync_state(version, false).touched(now)
    }

    /// Version the remote copy must currently hold for this record to be pushed
    fn base_version(&self) -> u64 {
        self.version().saturating_sub(1)
    }

    fn to_json(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_json(value: Value) -> SyncResult<Self> {
        serde_json::from_value(value).map_err(|e| SyncError::Deserialization(e.to_string()))
    }
}

/// A prescription written for a patient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prescription {
    pub id: Uuid,
    pub patient_name: String,
    /// Author of the prescription
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_synced: bool,
    pub version: u64,
}

/// Field changes for [`Prescription::copy_with`]
#[derive(Debug, Clone, Default)]
pub struct PrescriptionChanges {
    pub patient_name: Option<String>,
    pub created_by: Option<String>,
}

impl Prescription {
    pub fn new(
        patient_name: impl Into<String>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_name: patient_name.into(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            is_synced: false,
            version: 1,
        }
    }

    pub fn copy_with(&self, changes: PrescriptionChanges) -> Self {
        Self {
            patient_name: changes.patient_name.unwrap_or_else(|| self.patient_name.clone()),
            created_by: changes.created_by.unwrap_or_else(|| self.created_by.clone()),
            ..self.clone()
        }
    }
}

impl Syncable for Prescription {
    const COLLECTION: &'static str = "prescriptions";
    const SENSITIVE_FIELDS: &'static [&'static str] = &["patientName"];

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_synced(&self) -> bool {
        self.is_synced
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn with_sync_state(&self, version: u64, synced: bool) -> Self {
        Self {
            version,
            is_synced: synced,
            ..self.clone()
        }
    }

    fn touched(&self, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: now,
            ..self.clone()
        }
    }
}

/// A medication line belonging to a prescription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medication {
    pub id: Uuid,
    pub prescription_id: Uuid,
    pub name: String,
    pub dosage: String,
    pub instructions: String,
    pub expiration_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_synced: bool,
    pub version: u64,
}

/// Field changes for [`Medication::copy_with`]
#[derive(Debug, Clone, Default)]
pub struct MedicationChanges {
    pub name: Option<String>,
    pub dosage: Option<String>,
    pub instructions: Option<String>,
    pub expiration_date: Option<NaiveDate>,
}

impl Medication {
    pub fn new(
        prescription_id: Uuid,
        name: impl Into<String>,
        dosage: impl Into<String>,
        instructions: impl Into<String>,
        expiration_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            prescription_id,
            name: name.into(),
            dosage: dosage.into(),
            instructions: instructions.into(),
            expiration_date,
            created_at: now,
            updated_at: now,
            is_synced: false,
            version: 1,
        }
    }

    pub fn copy_with(&self, changes: MedicationChanges) -> Self {
        Self {
            name: changes.name.unwrap_or_else(|| self.name.clone()),
            dosage: changes.dosage.unwrap_or_else(|| self.dosage.clone()),
            instructions: changes.instructions.unwrap_or_else(|| self.instructions.clone()),
            expiration_date: changes.expiration_date.unwrap_or(self.expiration_date),
            ..self.clone()
        }
    }

    /// Expired once `today` is past the expiration date
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        today > self.expiration_date
    }
}

impl Syncable for Medication {
    const COLLECTION: &'static str = "medications";

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_synced(&self) -> bool {
        self.is_synced
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn with_sync_state(&self, version: u64, synced: bool) -> Self {
        Self {
            version,
            is_synced: synced,
            ..self.clone()
        }
    }

    fn touched(&self, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: now,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_prescription_is_unsynced_first_version() {
        let rx = Prescription::new("Jane Roe", "dr.smith", Utc::now());
        assert_eq!(rx.version, 1);
        assert!(!rx.is_synced);
        assert_eq!(rx.base_version(), 0);
    }

    #[test]
    fn test_edit_of_synced_record_opens_next_version() {
        let now = Utc::now();
        let synced = Prescription::new("Jane Roe", "dr.smith", now).with_sync_state(3, true);

        let edited = synced.edited(now + Duration::seconds(5));
        assert_eq!(edited.version, 4);
        assert!(!edited.is_synced);
        assert_eq!(edited.updated_at, now + Duration::seconds(5));

        // Second edit before the push stays on the same version
        let edited_again = edited.edited(now + Duration::seconds(9));
        assert_eq!(edited_again.version, 4);
    }

    #[test]
    fn test_copy_with_keeps_unchanged_fields() {
        let rx = Prescription::new("Jane Roe", "dr.smith", Utc::now());
        let renamed = rx.copy_with(PrescriptionChanges {
            patient_name: Some("Jane Q. Roe".to_string()),
            ..Default::default()
        });

        assert_eq!(renamed.patient_name, "Jane Q. Roe");
        assert_eq!(renamed.created_by, "dr.smith");
        assert_eq!(renamed.id, rx.id);
        assert_eq!(renamed.version, rx.version);
    }

    #[test]
    fn test_json_uses_camel_case() {
        let rx = Prescription::new("Jane Roe", "dr.smith", Utc::now());
        let json = rx.to_json().unwrap();

        assert_eq!(json["patientName"], "Jane Roe");
        assert_eq!(json["isSynced"], false);
        assert_eq!(Prescription::from_json(json).unwrap(), rx);
    }

    #[test]
    fn test_medication_expiry() {
        let expires = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let rx = Uuid::new_v4();
        let med = Medication::new(rx, "Amoxicillin", "500mg", "Twice daily", expires, Utc::now());

        assert!(!med.is_expired(expires));
        assert!(med.is_expired(expires.succ_opt().unwrap()));

        let extended = med.copy_with(MedicationChanges {
            expiration_date: NaiveDate::from_ymd_opt(2026, 9, 1),
            ..Default::default()
        });
        assert!(!extended.is_expired(expires.succ_opt().unwrap()));
        assert_eq!(extended.dosage, "500mg");
    }
}
