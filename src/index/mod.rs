//! The index: a transactional catalog of the Patient/Study/Series/Instance
//! tree, its attachments, metadata and change log.
//!
//! The index never touches blob content. Attachments are written to the
//! storage area *before* the transaction that references them begins, and
//! removed *after* the transaction that forgets them commits; both orderings
//! are the responsibility of the caller (the server context), which receives
//! the list of blobs to remove from every mutating operation.

pub mod backend;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::compression::CompressionScheme;
use crate::errors::{VaultError, VaultResult};
use crate::storage::FileContentKind;

use backend::{GlobalProperty, IndexDatabase, SqliteIndexDatabase};

/// The four levels of the resource hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceType {
    pub fn to_db(self) -> i64 {
        match self {
            ResourceType::Patient => 0,
            ResourceType::Study => 1,
            ResourceType::Series => 2,
            ResourceType::Instance => 3,
        }
    }

    pub fn from_db(value: i64) -> VaultResult<Self> {
        match value {
            0 => Ok(ResourceType::Patient),
            1 => Ok(ResourceType::Study),
            2 => Ok(ResourceType::Series),
            3 => Ok(ResourceType::Instance),
            _ => Err(VaultError::ParameterOutOfRange {
                message: format!("unknown resource type {}", value),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Study => "Study",
            ResourceType::Series => "Series",
            ResourceType::Instance => "Instance",
        }
    }
}

/// Kinds of entries in the change log. Plugins may register their own kinds
/// at or above 4096.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    NewInstance,
    NewSeries,
    NewStudy,
    NewPatient,
    Deleted,
    NewChildInstance,
    CompletedSeries,
    StablePatient,
    StableStudy,
    StableSeries,
    User(i64),
}

impl ChangeKind {
    pub fn to_db(self) -> i64 {
        match self {
            ChangeKind::NewInstance => 1,
            ChangeKind::NewSeries => 2,
            ChangeKind::NewStudy => 3,
            ChangeKind::NewPatient => 4,
            ChangeKind::Deleted => 5,
            ChangeKind::NewChildInstance => 6,
            ChangeKind::CompletedSeries => 7,
            ChangeKind::StablePatient => 8,
            ChangeKind::StableStudy => 9,
            ChangeKind::StableSeries => 10,
            ChangeKind::User(value) => value,
        }
    }

    pub fn from_db(value: i64) -> VaultResult<Self> {
        match value {
            1 => Ok(ChangeKind::NewInstance),
            2 => Ok(ChangeKind::NewSeries),
            3 => Ok(ChangeKind::NewStudy),
            4 => Ok(ChangeKind::NewPatient),
            5 => Ok(ChangeKind::Deleted),
            6 => Ok(ChangeKind::NewChildInstance),
            7 => Ok(ChangeKind::CompletedSeries),
            8 => Ok(ChangeKind::StablePatient),
            9 => Ok(ChangeKind::StableStudy),
            10 => Ok(ChangeKind::StableSeries),
            v if v >= 4096 => Ok(ChangeKind::User(v)),
            v => Err(VaultError::ParameterOutOfRange {
                message: format!("unknown change kind {}", v),
            }),
        }
    }

    pub fn name(self) -> String {
        match self {
            ChangeKind::NewInstance => "NewInstance".to_string(),
            ChangeKind::NewSeries => "NewSeries".to_string(),
            ChangeKind::NewStudy => "NewStudy".to_string(),
            ChangeKind::NewPatient => "NewPatient".to_string(),
            ChangeKind::Deleted => "Deleted".to_string(),
            ChangeKind::NewChildInstance => "NewChildInstance".to_string(),
            ChangeKind::CompletedSeries => "CompletedSeries".to_string(),
            ChangeKind::StablePatient => "StablePatient".to_string(),
            ChangeKind::StableStudy => "StableStudy".to_string(),
            ChangeKind::StableSeries => "StableSeries".to_string(),
            ChangeKind::User(value) => format!("UserChange{}", value),
        }
    }
}

/// Metadata keys. Keys at or above 1024 come from the `UserMetadata`
/// configuration option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    IndexInSeries,
    ReceptionDate,
    RemoteAet,
    ExpectedNumberOfInstances,
    ModifiedFrom,
    AnonymizedFrom,
    LastUpdate,
    Origin,
    CalledAet,
    User(i64),
}

impl MetadataKind {
    pub fn to_db(self) -> i64 {
        match self {
            MetadataKind::IndexInSeries => 1,
            MetadataKind::ReceptionDate => 2,
            MetadataKind::RemoteAet => 3,
            MetadataKind::ExpectedNumberOfInstances => 4,
            MetadataKind::ModifiedFrom => 5,
            MetadataKind::AnonymizedFrom => 6,
            MetadataKind::LastUpdate => 7,
            MetadataKind::Origin => 8,
            MetadataKind::CalledAet => 9,
            MetadataKind::User(value) => value,
        }
    }
}

/// A blob reference stored against a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: FileContentKind,
    pub uuid: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: CompressionScheme,
    pub compressed_md5: String,
    pub uncompressed_md5: String,
}

/// One record of the totally ordered change log.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    #[serde(rename = "Seq")]
    pub seq: i64,
    #[serde(rename = "ChangeType", serialize_with = "serialize_change_kind")]
    pub kind: ChangeKind,
    #[serde(rename = "ResourceType", serialize_with = "serialize_resource_type")]
    pub resource_type: ResourceType,
    #[serde(rename = "ID")]
    pub public_id: String,
    #[serde(rename = "Date")]
    pub date: String,
}

fn serialize_change_kind<S: serde::Serializer>(
    kind: &ChangeKind,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&kind.name())
}

fn serialize_resource_type<S: serde::Serializer>(
    kind: &ResourceType,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.name())
}

/// Per-level description of the resource rows an instance belongs to.
#[derive(Debug, Clone, Default)]
pub struct ResourceData {
    pub public_id: String,
    pub main_tags: Vec<(u16, u16, String)>,
    pub identifiers: Vec<(u16, u16, String)>,
}

/// Everything the index needs to record a freshly parsed instance. The
/// attachments have already been written to the storage area.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub patient: ResourceData,
    pub study: ResourceData,
    pub series: ResourceData,
    pub instance: ResourceData,
    pub attachments: Vec<Attachment>,
    pub metadata: Vec<(MetadataKind, String)>,
}

/// Storage caps enforced at ingestion time. Zero disables a cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCaps {
    pub maximum_storage_size: u64,
    pub maximum_patient_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Success,
    AlreadyStored,
}

impl StoreStatus {
    pub fn name(self) -> &'static str {
        match self {
            StoreStatus::Success => "Success",
            StoreStatus::AlreadyStored => "AlreadyStored",
        }
    }
}

/// Result of recording an instance: the change events that became visible
/// when the transaction committed, and the blobs orphaned by recycling,
/// which the caller must remove from the storage area.
#[derive(Debug)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    pub instance_public_id: String,
    pub events: Vec<ChangeEvent>,
    pub deleted_files: Vec<Attachment>,
}

/// Aggregate counters reported by `GET /statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    #[serde(rename = "CountPatients")]
    pub patients: u64,
    #[serde(rename = "CountStudies")]
    pub studies: u64,
    #[serde(rename = "CountSeries")]
    pub series: u64,
    #[serde(rename = "CountInstances")]
    pub instances: u64,
    #[serde(rename = "TotalDiskSize")]
    pub total_disk_size: u64,
    #[serde(rename = "TotalUncompressedSize")]
    pub total_uncompressed_size: u64,
}

/// How an identifier tag is matched during a find.
#[derive(Debug, Clone)]
pub enum IdentifierQuery {
    Exact { value: String, case_sensitive: bool },
    Wildcard { pattern: String },
    Range { lower: String, upper: String },
}

pub struct Index {
    db: Mutex<Box<dyn IndexDatabase>>,
}

fn now_dicom_datetime() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string()
}

impl Index {
    pub fn new(db: Box<dyn IndexDatabase>) -> Self {
        Index { db: Mutex::new(db) }
    }

    pub fn open(path: &std::path::Path, allow_upgrade: bool) -> VaultResult<Self> {
        Ok(Index::new(Box::new(SqliteIndexDatabase::open(path, allow_upgrade)?)))
    }

    pub fn open_in_memory() -> VaultResult<Self> {
        Ok(Index::new(Box::new(SqliteIndexDatabase::open_in_memory()?)))
    }

    /// Run `f` inside one database transaction. Any error rolls back every
    /// row and change-log entry written by `f`.
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn IndexDatabase) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let mut db = self.db.lock().map_err(|_| VaultError::Internal {
            message: "index lock poisoned".to_string(),
        })?;
        db.begin()?;
        match f(&mut **db) {
            Ok(value) => {
                db.commit()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback) = db.rollback() {
                    warn!("Cannot rollback index transaction: {}", rollback);
                }
                Err(error)
            }
        }
    }

    /// Record one instance, creating the missing levels of its hierarchy.
    pub fn store_instance(
        &self,
        request: NewInstance,
        caps: StoreCaps,
    ) -> VaultResult<StoreOutcome> {
        self.transaction(|db| {
            let date = now_dicom_datetime();

            // deduplication by SOP Instance UID: the public id is derived
            // from it, so an existing row means the same instance
            if db.lookup_resource(&request.instance.public_id)?.is_some() {
                if let Some((patient, _)) = db.lookup_resource(&request.patient.public_id)? {
                    db.touch_patient_recycling(patient)?;
                }
                return Ok(StoreOutcome {
                    status: StoreStatus::AlreadyStored,
                    instance_public_id: request.instance.public_id.clone(),
                    events: Vec::new(),
                    deleted_files: Vec::new(),
                });
            }

            let mut events = Vec::new();
            let mut deleted_files = Vec::new();

            let levels: [(&ResourceData, ResourceType, ChangeKind); 4] = [
                (&request.patient, ResourceType::Patient, ChangeKind::NewPatient),
                (&request.study, ResourceType::Study, ChangeKind::NewStudy),
                (&request.series, ResourceType::Series, ChangeKind::NewSeries),
                (&request.instance, ResourceType::Instance, ChangeKind::NewInstance),
            ];

            let mut parent: Option<i64> = None;
            let mut series_row: Option<i64> = None;
            let mut series_existed = false;
            let mut patient_row: Option<i64> = None;

            for (data, kind, change) in levels {
                let id = match db.lookup_resource(&data.public_id)? {
                    Some((id, existing)) => {
                        if existing != kind {
                            return Err(VaultError::Internal {
                                message: format!(
                                    "public id collision between {} and {}",
                                    existing.name(),
                                    kind.name()
                                ),
                            });
                        }
                        if kind == ResourceType::Series {
                            series_existed = true;
                        }
                        id
                    }
                    None => {
                        let id = db.create_resource(&data.public_id, kind, parent)?;
                        for (group, element, value) in &data.main_tags {
                            db.set_main_dicom_tag(id, *group, *element, value)?;
                        }
                        for (group, element, value) in &data.identifiers {
                            db.set_identifier_tag(id, *group, *element, value)?;
                        }
                        let seq = db.log_change(change, kind, &data.public_id, &date)?;
                        events.push(ChangeEvent {
                            seq,
                            kind: change,
                            resource_type: kind,
                            public_id: data.public_id.clone(),
                            date: date.clone(),
                        });
                        id
                    }
                };
                if kind == ResourceType::Patient {
                    patient_row = Some(id);
                }
                if kind == ResourceType::Series {
                    series_row = Some(id);
                }
                parent = Some(id);
            }

            let instance_row = parent.expect("instance level always present");
            let patient_row = patient_row.expect("patient level always present");
            let series_row = series_row.expect("series level always present");

            // an instance arriving in an already known series is also
            // reported against its parent
            if series_existed {
                let seq = db.log_change(
                    ChangeKind::NewChildInstance,
                    ResourceType::Series,
                    &request.series.public_id,
                    &date,
                )?;
                events.push(ChangeEvent {
                    seq,
                    kind: ChangeKind::NewChildInstance,
                    resource_type: ResourceType::Series,
                    public_id: request.series.public_id.clone(),
                    date: date.clone(),
                });
            }

            for attachment in &request.attachments {
                db.add_attachment(instance_row, attachment)?;
            }
            add_to_totals(db, &request.attachments, 1)?;

            for (kind, value) in &request.metadata {
                db.set_metadata(instance_row, kind.to_db(), value)?;
            }

            if let Some(expected) =
                db.get_metadata(series_row, MetadataKind::ExpectedNumberOfInstances.to_db())?
            {
                let count = db.get_children(series_row)?.len() as u64;
                if expected.parse::<u64>().ok() == Some(count) {
                    let seq = db.log_change(
                        ChangeKind::CompletedSeries,
                        ResourceType::Series,
                        &request.series.public_id,
                        &date,
                    )?;
                    events.push(ChangeEvent {
                        seq,
                        kind: ChangeKind::CompletedSeries,
                        resource_type: ResourceType::Series,
                        public_id: request.series.public_id.clone(),
                        date: date.clone(),
                    });
                }
            }

            db.touch_patient_recycling(patient_row)?;

            enforce_caps(db, caps, patient_row, &date, &mut events, &mut deleted_files)?;

            Ok(StoreOutcome {
                status: StoreStatus::Success,
                instance_public_id: request.instance.public_id.clone(),
                events,
                deleted_files,
            })
        })
    }

    /// Delete a resource and its descendants. An emptied parent is deleted
    /// as well, except a protected patient. Returns the change events and
    /// the blobs the caller must remove from the storage area.
    pub fn delete_resource(
        &self,
        public_id: &str,
    ) -> VaultResult<(Vec<ChangeEvent>, Vec<Attachment>)> {
        self.transaction(|db| {
            let (id, kind) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            let date = now_dicom_datetime();
            let mut events = Vec::new();
            let mut files = Vec::new();

            collect_subtree_attachments(db, id, &mut files)?;

            let mut parent = db.get_parent(id)?;
            db.delete_resource(id)?;
            let seq = db.log_change(ChangeKind::Deleted, kind, public_id, &date)?;
            events.push(ChangeEvent {
                seq,
                kind: ChangeKind::Deleted,
                resource_type: kind,
                public_id: public_id.to_string(),
                date: date.clone(),
            });

            // remove emptied ancestors, bottom-up
            while let Some(ancestor) = parent {
                if !db.get_children(ancestor)?.is_empty() {
                    break;
                }
                let kind = db.get_resource_type(ancestor)?;
                if kind == ResourceType::Patient && db.is_patient_protected(ancestor)? {
                    break;
                }
                let ancestor_public = db.get_public_id(ancestor)?;
                parent = db.get_parent(ancestor)?;

                collect_subtree_attachments(db, ancestor, &mut files)?;
                db.delete_resource(ancestor)?;
                let seq = db.log_change(ChangeKind::Deleted, kind, &ancestor_public, &date)?;
                events.push(ChangeEvent {
                    seq,
                    kind: ChangeKind::Deleted,
                    resource_type: kind,
                    public_id: ancestor_public,
                    date: date.clone(),
                });
            }

            add_to_totals(db, &files, -1)?;
            Ok((events, files))
        })
    }

    pub fn lookup(&self, public_id: &str) -> VaultResult<Option<ResourceType>> {
        self.transaction(|db| Ok(db.lookup_resource(public_id)?.map(|(_, kind)| kind)))
    }

    pub fn list_resources(&self, kind: ResourceType) -> VaultResult<Vec<String>> {
        self.transaction(|db| db.list_resources(kind))
    }

    /// JSON view of a resource, as exposed by the REST front-end.
    pub fn resource_json(&self, public_id: &str) -> VaultResult<serde_json::Value> {
        self.transaction(|db| {
            let (id, kind) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;

            let mut object = serde_json::Map::new();
            object.insert("ID".to_string(), public_id.into());
            object.insert("Type".to_string(), kind.name().into());

            let mut tags = serde_json::Map::new();
            for (group, element, value) in db.get_main_dicom_tags(id)? {
                tags.insert(tag_name(group, element), value.into());
            }
            object.insert("MainDicomTags".to_string(), tags.into());

            if let Some(parent) = db.get_parent(id)? {
                let parent_kind = db.get_resource_type(parent)?;
                let key = match parent_kind {
                    ResourceType::Patient => "ParentPatient",
                    ResourceType::Study => "ParentStudy",
                    ResourceType::Series => "ParentSeries",
                    ResourceType::Instance => unreachable!("instances have no children"),
                };
                object.insert(key.to_string(), db.get_public_id(parent)?.into());
            }

            if kind != ResourceType::Instance {
                let key = match kind {
                    ResourceType::Patient => "Studies",
                    ResourceType::Study => "Series",
                    ResourceType::Series => "Instances",
                    ResourceType::Instance => unreachable!(),
                };
                let mut children = Vec::new();
                for child in db.get_children(id)? {
                    children.push(serde_json::Value::from(db.get_public_id(child)?));
                }
                object.insert(key.to_string(), children.into());
            }

            if kind == ResourceType::Patient {
                object.insert(
                    "IsProtected".to_string(),
                    db.is_patient_protected(id)?.into(),
                );
            }

            if kind == ResourceType::Instance {
                if let Some(index) =
                    db.get_metadata(id, MetadataKind::IndexInSeries.to_db())?
                {
                    if let Ok(index) = index.parse::<u64>() {
                        object.insert("IndexInSeries".to_string(), index.into());
                    }
                }
                if let Some(attachment) = db.get_attachment(id, FileContentKind::Dicom)? {
                    object.insert(
                        "FileSize".to_string(),
                        attachment.uncompressed_size.into(),
                    );
                    object.insert("FileUuid".to_string(), attachment.uuid.into());
                }
            }

            Ok(serde_json::Value::Object(object))
        })
    }

    pub fn get_attachment(
        &self,
        public_id: &str,
        kind: FileContentKind,
    ) -> VaultResult<Attachment> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            db.get_attachment(id, kind)?
                .ok_or_else(|| VaultError::InexistentItem {
                    what: format!("attachment {} of {}", kind.to_db(), public_id),
                })
        })
    }

    pub fn get_metadata(
        &self,
        public_id: &str,
        kind: MetadataKind,
    ) -> VaultResult<Option<String>> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            db.get_metadata(id, kind.to_db())
        })
    }

    pub fn set_metadata(
        &self,
        public_id: &str,
        kind: MetadataKind,
        value: &str,
    ) -> VaultResult<()> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            db.set_metadata(id, kind.to_db(), value)
        })
    }

    pub fn remove_metadata(&self, public_id: &str, kind: MetadataKind) -> VaultResult<()> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            db.remove_metadata(id, kind.to_db())
        })
    }

    /// Detach a blob from a resource, adjusting the size accounting. The
    /// caller removes the returned blob from the storage area after the
    /// commit.
    pub fn remove_attachment(
        &self,
        public_id: &str,
        kind: FileContentKind,
    ) -> VaultResult<Attachment> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            let attachment =
                db.get_attachment(id, kind)?
                    .ok_or_else(|| VaultError::InexistentItem {
                        what: format!("attachment {} of {}", kind.to_db(), public_id),
                    })?;
            db.remove_attachment(id, kind)?;
            add_to_totals(db, std::slice::from_ref(&attachment), -1)?;
            Ok(attachment)
        })
    }

    pub fn list_metadata(&self, public_id: &str) -> VaultResult<Vec<(i64, String)>> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            db.list_metadata(id)
        })
    }

    pub fn main_tags(&self, public_id: &str) -> VaultResult<HashMap<String, String>> {
        self.transaction(|db| {
            let (id, _) =
                db.lookup_resource(public_id)?
                    .ok_or_else(|| VaultError::UnknownResource {
                        what: public_id.to_string(),
                    })?;
            let mut result = HashMap::new();
            for (group, element, value) in db.get_main_dicom_tags(id)? {
                result.insert(tag_name(group, element), value);
            }
            Ok(result)
        })
    }

    /// Append a change that is not tied to an ingestion transaction, such as
    /// the stable-resource events.
    pub fn log_change(
        &self,
        kind: ChangeKind,
        resource_type: ResourceType,
        public_id: &str,
    ) -> VaultResult<ChangeEvent> {
        self.transaction(|db| {
            let date = now_dicom_datetime();
            let seq = db.log_change(kind, resource_type, public_id, &date)?;
            Ok(ChangeEvent {
                seq,
                kind,
                resource_type,
                public_id: public_id.to_string(),
                date,
            })
        })
    }

    pub fn get_changes(&self, since: i64, limit: u64) -> VaultResult<(Vec<ChangeEvent>, bool)> {
        self.transaction(|db| db.get_changes(since, limit))
    }

    pub fn last_change_seq(&self) -> VaultResult<i64> {
        self.transaction(|db| db.last_change_seq())
    }

    pub fn set_protected(&self, public_id: &str, protected: bool) -> VaultResult<()> {
        self.transaction(|db| {
            let id = expect_patient(db, public_id)?;
            db.set_patient_protected(id, protected)
        })
    }

    pub fn is_protected(&self, public_id: &str) -> VaultResult<bool> {
        self.transaction(|db| {
            let id = expect_patient(db, public_id)?;
            db.is_patient_protected(id)
        })
    }

    /// Record an explicit access to a resource, refreshing the recycling
    /// position of the owning patient.
    pub fn touch_access(&self, public_id: &str) -> VaultResult<()> {
        self.transaction(|db| {
            let mut current = match db.lookup_resource(public_id)? {
                Some((id, _)) => Some(id),
                None => return Ok(()),
            };
            while let Some(id) = current {
                if db.get_resource_type(id)? == ResourceType::Patient {
                    db.touch_patient_recycling(id)?;
                    break;
                }
                current = db.get_parent(id)?;
            }
            Ok(())
        })
    }

    pub fn statistics(&self) -> VaultResult<Statistics> {
        self.transaction(|db| {
            Ok(Statistics {
                patients: db.count_resources(ResourceType::Patient)?,
                studies: db.count_resources(ResourceType::Study)?,
                series: db.count_resources(ResourceType::Series)?,
                instances: db.count_resources(ResourceType::Instance)?,
                total_disk_size: read_total(db, GlobalProperty::TotalCompressedSize)?,
                total_uncompressed_size: read_total(db, GlobalProperty::TotalUncompressedSize)?,
            })
        })
    }

    /// Look up resources of `kind` by one identifier tag.
    pub fn find_by_identifier(
        &self,
        kind: ResourceType,
        group: u16,
        element: u16,
        query: &IdentifierQuery,
    ) -> VaultResult<Vec<String>> {
        self.transaction(|db| {
            let ids = match query {
                IdentifierQuery::Exact { value, case_sensitive } => db
                    .lookup_identifier_exact(kind, group, element, value, *case_sensitive)?,
                IdentifierQuery::Wildcard { pattern } => {
                    db.lookup_identifier_wildcard(kind, group, element, pattern)?
                }
                IdentifierQuery::Range { lower, upper } => {
                    db.lookup_identifier_range(kind, group, element, lower, upper)?
                }
            };
            let mut result = Vec::new();
            for id in ids {
                result.push(db.get_public_id(id)?);
            }
            Ok(result)
        })
    }

    /// Every blob UUID referenced by an attachment, for the startup sweep.
    pub fn all_attachment_uuids(&self) -> VaultResult<Vec<String>> {
        self.transaction(|db| {
            Ok(db
                .list_all_attachments()?
                .into_iter()
                .map(|a| a.uuid)
                .collect())
        })
    }

    pub fn get_global_property(&self, property: GlobalProperty) -> VaultResult<Option<String>> {
        self.transaction(|db| db.get_global_property(property))
    }

    pub fn set_global_property(&self, property: GlobalProperty, value: &str) -> VaultResult<()> {
        self.transaction(|db| db.set_global_property(property, value))
    }
}

fn expect_patient(db: &mut dyn IndexDatabase, public_id: &str) -> VaultResult<i64> {
    match db.lookup_resource(public_id)? {
        Some((id, ResourceType::Patient)) => Ok(id),
        Some((_, kind)) => Err(VaultError::BadRequest {
            message: format!("{} is a {}, not a patient", public_id, kind.name()),
        }),
        None => Err(VaultError::UnknownResource {
            what: public_id.to_string(),
        }),
    }
}

fn read_total(db: &mut dyn IndexDatabase, property: GlobalProperty) -> VaultResult<u64> {
    Ok(db
        .get_global_property(property)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

fn add_to_totals(
    db: &mut dyn IndexDatabase,
    attachments: &[Attachment],
    sign: i64,
) -> VaultResult<()> {
    let compressed: i64 = attachments.iter().map(|a| a.compressed_size as i64).sum();
    let uncompressed: i64 = attachments.iter().map(|a| a.uncompressed_size as i64).sum();

    let total = read_total(db, GlobalProperty::TotalCompressedSize)? as i64 + sign * compressed;
    db.set_global_property(
        GlobalProperty::TotalCompressedSize,
        &total.max(0).to_string(),
    )?;
    let total =
        read_total(db, GlobalProperty::TotalUncompressedSize)? as i64 + sign * uncompressed;
    db.set_global_property(
        GlobalProperty::TotalUncompressedSize,
        &total.max(0).to_string(),
    )?;
    Ok(())
}

fn collect_subtree_attachments(
    db: &mut dyn IndexDatabase,
    id: i64,
    files: &mut Vec<Attachment>,
) -> VaultResult<()> {
    files.extend(db.list_attachments(id)?);
    for child in db.get_children(id)? {
        collect_subtree_attachments(db, child, files)?;
    }
    Ok(())
}

/// Evict the least recently used unprotected patients until both caps hold.
/// The patient being ingested into is never a candidate.
fn enforce_caps(
    db: &mut dyn IndexDatabase,
    caps: StoreCaps,
    current_patient: i64,
    date: &str,
    events: &mut Vec<ChangeEvent>,
    deleted_files: &mut Vec<Attachment>,
) -> VaultResult<()> {
    loop {
        let over_count = caps.maximum_patient_count > 0
            && db.count_resources(ResourceType::Patient)? > caps.maximum_patient_count;
        let over_size = caps.maximum_storage_size > 0
            && read_total(db, GlobalProperty::TotalCompressedSize)? > caps.maximum_storage_size;

        if !over_count && !over_size {
            return Ok(());
        }

        let victim = db
            .oldest_recyclable_patient(Some(current_patient))?
            .ok_or(VaultError::FullStorage)?;

        let public_id = db.get_public_id(victim)?;
        info!("Recycling the oldest patient: {}", public_id);

        let mut files = Vec::new();
        collect_subtree_attachments(db, victim, &mut files)?;
        add_to_totals(db, &files, -1)?;
        deleted_files.extend(files);

        db.delete_resource(victim)?;
        let seq = db.log_change(ChangeKind::Deleted, ResourceType::Patient, &public_id, date)?;
        events.push(ChangeEvent {
            seq,
            kind: ChangeKind::Deleted,
            resource_type: ResourceType::Patient,
            public_id,
            date: date.to_string(),
        });
    }
}

/// Human-readable tag name. User-registered tags take precedence over the
/// standard dictionary; unknown tags fall back to the numeric form.
pub fn tag_name(group: u16, element: u16) -> String {
    use dicom_core::dictionary::DataDictionary;
    use dicom_core::Tag;
    use dicom_dictionary_std::StandardDataDictionary;

    let tag = Tag(group, element);
    if let Some(name) = crate::dictionary::name_of(tag) {
        return name;
    }
    match StandardDataDictionary.by_tag(tag) {
        Some(entry) => entry.alias.to_string(),
        None => format!("{:04x},{:04x}", group, element),
    }
}
