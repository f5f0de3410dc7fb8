//! Preparation of incoming instances for the index.
//!
//! This module turns a raw DICOM buffer into the level-by-level description
//! the index records: deterministic public identifiers, the main tags
//! projected at each level, the identifier tags, and the simplified JSON
//! view handed to scripts and plugins.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use sha1::{Digest, Sha1};

use crate::errors::{VaultError, VaultResult};
use crate::index::{tag_name, NewInstance, ResourceData};

/// Where an instance entered the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    Unknown,
    DicomProtocol,
    RestApi,
    Plugins,
    Lua,
}

impl OriginKind {
    pub fn name(self) -> &'static str {
        match self {
            OriginKind::Unknown => "Unknown",
            OriginKind::DicomProtocol => "DicomProtocol",
            OriginKind::RestApi => "RestApi",
            OriginKind::Plugins => "Plugins",
            OriginKind::Lua => "Lua",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Origin {
    pub kind: OriginKind,
    pub remote_ip: String,
    pub remote_aet: String,
    pub called_aet: String,
}

impl Origin {
    pub fn rest_api(remote_ip: &str) -> Self {
        Origin {
            kind: OriginKind::RestApi,
            remote_ip: remote_ip.to_string(),
            remote_aet: String::new(),
            called_aet: String::new(),
        }
    }

    pub fn dicom_protocol(remote_ip: &str, remote_aet: &str, called_aet: &str) -> Self {
        Origin {
            kind: OriginKind::DicomProtocol,
            remote_ip: remote_ip.to_string(),
            remote_aet: remote_aet.to_string(),
            called_aet: called_aet.to_string(),
        }
    }

    pub fn plugins() -> Self {
        Origin {
            kind: OriginKind::Plugins,
            remote_ip: String::new(),
            remote_aet: String::new(),
            called_aet: String::new(),
        }
    }

    pub fn lua() -> Self {
        Origin {
            kind: OriginKind::Lua,
            remote_ip: String::new(),
            remote_aet: String::new(),
            called_aet: String::new(),
        }
    }
}

/// An instance ready for ingestion: the exact bytes to persist plus the
/// parsed object they came from.
pub struct InstanceToStore {
    pub buffer: Vec<u8>,
    pub object: DefaultDicomObject,
    pub origin: Origin,
}

impl InstanceToStore {
    /// Parse a raw buffer, as received from `POST /instances`.
    pub fn parse(buffer: Vec<u8>, origin: Origin) -> VaultResult<Self> {
        if buffer.is_empty() {
            return Err(VaultError::EmptyRequest);
        }
        let object =
            dicom_object::from_reader(&buffer[..]).map_err(|e| VaultError::DicomFormat {
                message: e.to_string(),
            })?;
        Ok(InstanceToStore {
            buffer,
            object,
            origin,
        })
    }

    /// Wrap an already parsed object, as produced by the DICOM front-end.
    pub fn from_object(object: DefaultDicomObject, origin: Origin) -> VaultResult<Self> {
        let mut buffer = Vec::with_capacity(64 * 1024);
        object.write_all(&mut buffer).map_err(|e| VaultError::Internal {
            message: format!("cannot serialize DICOM object: {}", e),
        })?;
        Ok(InstanceToStore {
            buffer,
            object,
            origin,
        })
    }
}

/// Derive the stable public identifier of a resource from its DICOM
/// identifier: the SHA-1 of the identifier, in five dash-separated groups.
pub fn make_public_id(dicom_identifier: &str) -> String {
    let digest = Sha1::digest(dicom_identifier.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..16],
        &hex[16..24],
        &hex[24..32],
        &hex[32..40]
    )
}

const PATIENT_MAIN_TAGS: &[Tag] = &[
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::OTHER_PATIENT_I_DS,
];

const STUDY_MAIN_TAGS: &[Tag] = &[
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_ID,
    tags::STUDY_DESCRIPTION,
    tags::ACCESSION_NUMBER,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::INSTITUTION_NAME,
    tags::REQUESTED_PROCEDURE_DESCRIPTION,
];

const SERIES_MAIN_TAGS: &[Tag] = &[
    tags::SERIES_INSTANCE_UID,
    tags::SERIES_NUMBER,
    tags::SERIES_DATE,
    tags::SERIES_TIME,
    tags::SERIES_DESCRIPTION,
    tags::MODALITY,
    tags::BODY_PART_EXAMINED,
    tags::PROTOCOL_NAME,
    tags::STATION_NAME,
    tags::MANUFACTURER,
    tags::OPERATORS_NAME,
];

const INSTANCE_MAIN_TAGS: &[Tag] = &[
    tags::SOP_INSTANCE_UID,
    tags::SOP_CLASS_UID,
    tags::INSTANCE_NUMBER,
    tags::INSTANCE_CREATION_DATE,
    tags::INSTANCE_CREATION_TIME,
    tags::NUMBER_OF_FRAMES,
    tags::IMAGE_POSITION_PATIENT,
];

fn get_trimmed_tag(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_tag(object: &InMemDicomObject, tag: Tag) -> VaultResult<String> {
    get_trimmed_tag(object, tag).ok_or_else(|| VaultError::InexistentTag {
        tag: tag_name(tag.0, tag.1),
    })
}

fn collect_tags(object: &InMemDicomObject, tags: &[Tag]) -> Vec<(u16, u16, String)> {
    tags.iter()
        .filter_map(|tag| get_trimmed_tag(object, *tag).map(|v| (tag.0, tag.1, v)))
        .collect()
}

/// Build the per-level index description of a parsed instance. The returned
/// request has no attachments yet; the caller fills them in after writing
/// the blobs.
pub fn build_new_instance(object: &InMemDicomObject) -> VaultResult<NewInstance> {
    let patient_id = get_trimmed_tag(object, tags::PATIENT_ID).unwrap_or_default();
    let study_uid = require_tag(object, tags::STUDY_INSTANCE_UID)?;
    let series_uid = require_tag(object, tags::SERIES_INSTANCE_UID)?;
    let sop_uid = require_tag(object, tags::SOP_INSTANCE_UID)?;

    let mut study_identifiers = vec![(
        tags::STUDY_INSTANCE_UID.0,
        tags::STUDY_INSTANCE_UID.1,
        study_uid.clone(),
    )];
    if let Some(accession) = get_trimmed_tag(object, tags::ACCESSION_NUMBER) {
        study_identifiers.push((
            tags::ACCESSION_NUMBER.0,
            tags::ACCESSION_NUMBER.1,
            accession,
        ));
    }

    Ok(NewInstance {
        patient: ResourceData {
            public_id: make_public_id(&patient_id),
            main_tags: collect_tags(object, PATIENT_MAIN_TAGS),
            identifiers: vec![(tags::PATIENT_ID.0, tags::PATIENT_ID.1, patient_id)],
        },
        study: ResourceData {
            public_id: make_public_id(&study_uid),
            main_tags: collect_tags(object, STUDY_MAIN_TAGS),
            identifiers: study_identifiers,
        },
        series: ResourceData {
            public_id: make_public_id(&series_uid),
            main_tags: collect_tags(object, SERIES_MAIN_TAGS),
            identifiers: vec![(
                tags::SERIES_INSTANCE_UID.0,
                tags::SERIES_INSTANCE_UID.1,
                series_uid,
            )],
        },
        instance: ResourceData {
            public_id: make_public_id(&sop_uid),
            main_tags: collect_tags(object, INSTANCE_MAIN_TAGS),
            identifiers: vec![(
                tags::SOP_INSTANCE_UID.0,
                tags::SOP_INSTANCE_UID.1,
                sop_uid,
            )],
        },
        attachments: Vec::new(),
        metadata: Vec::new(),
    })
}

/// Flat `tag name -> string value` projection of a dataset, handed to Lua
/// hooks and plugin observers. Sequences and pixel data are skipped.
pub fn simplified_json(object: &InMemDicomObject) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for element in object {
        let tag = element.header().tag;
        if tag == tags::PIXEL_DATA {
            continue;
        }
        if let Ok(value) = element.to_str() {
            map.insert(
                tag_name(tag.0, tag.1),
                serde_json::Value::from(value.trim_end_matches('\0').trim()),
            );
        }
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn sample_dataset() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "DOE^JOHN")),
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4"),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4.5"),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4.5.6"),
            ),
            DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
        ])
    }

    #[test]
    fn public_ids_are_deterministic() {
        let a = make_public_id("1.2.3.4");
        let b = make_public_id("1.2.3.4");
        let c = make_public_id("1.2.3.5");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 44);
        assert_eq!(a.matches('-').count(), 4);
    }

    #[test]
    fn builds_all_four_levels() {
        let request = build_new_instance(&sample_dataset()).unwrap();
        assert_eq!(request.patient.public_id, make_public_id("P1"));
        assert_eq!(request.study.public_id, make_public_id("1.2.3.4"));
        assert_eq!(request.series.public_id, make_public_id("1.2.3.4.5"));
        assert_eq!(request.instance.public_id, make_public_id("1.2.3.4.5.6"));

        assert!(request
            .patient
            .main_tags
            .iter()
            .any(|(g, e, v)| (*g, *e) == (0x0010, 0x0010) && v == "DOE^JOHN"));
        assert_eq!(request.series.identifiers[0].2, "1.2.3.4.5");
    }

    #[test]
    fn missing_sop_instance_uid_is_rejected() {
        let mut dataset = sample_dataset();
        dataset.remove_element(tags::SOP_INSTANCE_UID);
        assert!(matches!(
            build_new_instance(&dataset),
            Err(VaultError::InexistentTag { .. })
        ));
    }

    #[test]
    fn simplified_json_is_flat() {
        let json = simplified_json(&sample_dataset());
        assert_eq!(json["PatientID"], "P1");
        assert_eq!(json["Modality"], "CT");
        assert_eq!(json["PatientName"], "DOE^JOHN");
    }
}
