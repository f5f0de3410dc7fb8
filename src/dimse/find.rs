//! C-FIND query execution against the index.
//!
//! The query identifier is reduced to a hierarchy level and a set of tag
//! filters. Candidates are selected through the identifier index whenever
//! the query constrains the level's own identifier, then every filter is
//! matched against the merged tags of the resource and its ancestors.

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use regex::RegexBuilder;

use crate::errors::{VaultError, VaultResult};
use crate::index::{tag_name, IdentifierQuery, Index, ResourceType};

/// A parsed C-FIND identifier.
#[derive(Debug, Clone)]
pub struct FindQuery {
    pub level: ResourceType,
    /// Non-empty matching keys of the query.
    pub filters: Vec<(Tag, String)>,
    /// Every key present in the query, including the empty return keys.
    pub return_keys: Vec<Tag>,
}

/// The identifier tag owning each hierarchy level.
pub fn level_identifier_tag(level: ResourceType) -> Tag {
    match level {
        ResourceType::Patient => tags::PATIENT_ID,
        ResourceType::Study => tags::STUDY_INSTANCE_UID,
        ResourceType::Series => tags::SERIES_INSTANCE_UID,
        ResourceType::Instance => tags::SOP_INSTANCE_UID,
    }
}

pub fn parse_query(identifier: &InMemDicomObject) -> VaultResult<FindQuery> {
    let level = identifier
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_uppercase())
        .ok_or_else(|| VaultError::BadRequest {
            message: "C-FIND query without QueryRetrieveLevel".to_string(),
        })?;

    let level = match level.as_str() {
        "PATIENT" => ResourceType::Patient,
        "STUDY" => ResourceType::Study,
        "SERIES" => ResourceType::Series,
        "IMAGE" | "INSTANCE" => ResourceType::Instance,
        other => {
            return Err(VaultError::BadRequest {
                message: format!("unsupported QueryRetrieveLevel \"{}\"", other),
            })
        }
    };

    let mut filters = Vec::new();
    let mut return_keys = Vec::new();
    for element in identifier {
        let tag = element.header().tag;
        if tag == tags::QUERY_RETRIEVE_LEVEL || tag == tags::SPECIFIC_CHARACTER_SET {
            continue;
        }
        return_keys.push(tag);
        if let Ok(value) = element.to_str() {
            let value = value.trim_end_matches('\0').trim().to_string();
            if !value.is_empty() {
                filters.push((tag, value));
            }
        }
    }

    Ok(FindQuery {
        level,
        filters,
        return_keys,
    })
}

fn has_wildcard(value: &str) -> bool {
    value.contains('*') || value.contains('?')
}

/// DICOM attribute matching: wildcards for text, `lower-upper` ranges for
/// dates and times.
pub fn matches_filter(value: &str, filter: &str, case_sensitive: bool) -> bool {
    if let Some((lower, upper)) = parse_range(filter) {
        let after_lower = lower.map(|l| value >= l).unwrap_or(true);
        let before_upper = upper.map(|u| value <= u).unwrap_or(true);
        return after_lower && before_upper;
    }

    if has_wildcard(filter) {
        let mut pattern = String::from("^");
        for c in filter.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        pattern.push('$');
        return RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map(|re| re.is_match(value))
            .unwrap_or(false);
    }

    if case_sensitive {
        value == filter
    } else {
        value.eq_ignore_ascii_case(filter)
    }
}

/// A date/time range filter, `lower-upper` with either bound optional.
/// Values containing non-range characters are not ranges.
fn parse_range(filter: &str) -> Option<(Option<&str>, Option<&str>)> {
    if !filter.contains('-') || filter.chars().any(|c| !c.is_ascii_digit() && c != '-' && c != '.')
    {
        return None;
    }
    let (lower, upper) = filter.split_once('-')?;
    Some((
        (!lower.is_empty()).then_some(lower),
        (!upper.is_empty()).then_some(upper),
    ))
}

/// Merged `tag name -> value` view of a resource and its ancestors.
fn merged_tags(
    index: &Index,
    public_id: &str,
) -> VaultResult<std::collections::HashMap<String, String>> {
    let mut merged = index.main_tags(public_id)?;
    let mut current = public_id.to_string();
    loop {
        let json = index.resource_json(&current)?;
        let parent = ["ParentPatient", "ParentStudy", "ParentSeries"]
            .iter()
            .find_map(|key| json[*key].as_str().map(String::from));
        match parent {
            Some(parent) => {
                for (name, value) in index.main_tags(&parent)? {
                    merged.entry(name).or_insert(value);
                }
                current = parent;
            }
            None => break,
        }
    }
    Ok(merged)
}

/// Run a query, returning the public ids of up to `limit` matching
/// resources at the query's level (0 means unbounded).
pub fn find_resource_ids(
    index: &Index,
    query: &FindQuery,
    case_sensitive: bool,
    limit: u64,
) -> VaultResult<Vec<String>> {
    let identifier_tag = level_identifier_tag(query.level);

    // candidate selection through the identifier index when possible
    let candidates = match query
        .filters
        .iter()
        .find(|(tag, _)| *tag == identifier_tag)
    {
        Some((tag, value)) if has_wildcard(value) => index.find_by_identifier(
            query.level,
            tag.0,
            tag.1,
            &IdentifierQuery::Wildcard {
                pattern: value.clone(),
            },
        )?,
        Some((tag, value)) => index.find_by_identifier(
            query.level,
            tag.0,
            tag.1,
            &IdentifierQuery::Exact {
                value: value.clone(),
                case_sensitive: true,
            },
        )?,
        None => index.list_resources(query.level)?,
    };

    let mut matches = Vec::new();
    for public_id in candidates {
        let merged = merged_tags(index, &public_id)?;

        let accepted = query.filters.iter().all(|(tag, filter)| {
            match merged.get(&tag_name(tag.0, tag.1)) {
                Some(value) => matches_filter(value, filter, case_sensitive),
                None => false,
            }
        });
        if !accepted {
            continue;
        }

        matches.push(public_id);
        if limit != 0 && matches.len() as u64 >= limit {
            break;
        }
    }
    Ok(matches)
}

/// Run a query, returning up to `limit` matching identifiers (0 means
/// unbounded).
pub fn execute_find(
    index: &Index,
    query: &FindQuery,
    case_sensitive: bool,
    limit: u64,
) -> VaultResult<Vec<InMemDicomObject>> {
    let mut answers = Vec::new();
    for public_id in find_resource_ids(index, query, case_sensitive, limit)? {
        let merged = merged_tags(index, &public_id)?;
        answers.push(build_answer(query, &merged));
    }
    Ok(answers)
}

fn build_answer(
    query: &FindQuery,
    merged: &std::collections::HashMap<String, String>,
) -> InMemDicomObject {
    let mut answer = InMemDicomObject::new_empty();

    let level = match query.level {
        ResourceType::Patient => "PATIENT",
        ResourceType::Study => "STUDY",
        ResourceType::Series => "SERIES",
        ResourceType::Instance => "IMAGE",
    };
    answer.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level),
    ));

    // answer the return keys of the query, plus the identifier chain
    let mut keys = query.return_keys.clone();
    for tag in [
        tags::PATIENT_ID,
        tags::STUDY_INSTANCE_UID,
        tags::SERIES_INSTANCE_UID,
        tags::SOP_INSTANCE_UID,
    ] {
        if !keys.contains(&tag) {
            keys.push(tag);
        }
    }

    for tag in keys {
        if let Some(value) = merged.get(&tag_name(tag.0, tag.1)) {
            answer.put(DataElement::new(
                tag,
                vr_of(tag),
                PrimitiveValue::from(value.as_str()),
            ));
        }
    }
    answer
}

/// Value representations of the tags this server projects into the index.
/// User-registered tags carry the VR they were declared with.
fn vr_of(tag: Tag) -> VR {
    if let Some(vr) = crate::dictionary::vr_of(tag) {
        return vr;
    }
    match tag {
        tags::PATIENT_NAME | tags::REFERRING_PHYSICIAN_NAME | tags::OPERATORS_NAME => VR::PN,
        tags::PATIENT_BIRTH_DATE
        | tags::STUDY_DATE
        | tags::SERIES_DATE
        | tags::INSTANCE_CREATION_DATE => VR::DA,
        tags::STUDY_TIME | tags::SERIES_TIME | tags::INSTANCE_CREATION_TIME => VR::TM,
        tags::STUDY_INSTANCE_UID
        | tags::SERIES_INSTANCE_UID
        | tags::SOP_INSTANCE_UID
        | tags::SOP_CLASS_UID => VR::UI,
        tags::PATIENT_SEX | tags::MODALITY | tags::BODY_PART_EXAMINED => VR::CS,
        tags::SERIES_NUMBER | tags::INSTANCE_NUMBER | tags::NUMBER_OF_FRAMES => VR::IS,
        tags::ACCESSION_NUMBER | tags::STUDY_ID => VR::SH,
        tags::IMAGE_POSITION_PATIENT => VR::DS,
        _ => VR::LO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{
        Attachment, MetadataKind, NewInstance, ResourceData, StoreCaps,
    };
    use crate::compression::CompressionScheme;
    use crate::storage::FileContentKind;
    use dicom_core::dicom_value;

    fn seed(index: &Index, patient: &str, name: &str, study: &str, series: &str, sop: &str) {
        let request = NewInstance {
            patient: ResourceData {
                public_id: crate::server::ingest::make_public_id(patient),
                main_tags: vec![
                    (0x0010, 0x0020, patient.to_string()),
                    (0x0010, 0x0010, name.to_string()),
                ],
                identifiers: vec![(0x0010, 0x0020, patient.to_string())],
            },
            study: ResourceData {
                public_id: crate::server::ingest::make_public_id(study),
                main_tags: vec![
                    (0x0020, 0x000d, study.to_string()),
                    (0x0008, 0x0020, "20240115".to_string()),
                ],
                identifiers: vec![(0x0020, 0x000d, study.to_string())],
            },
            series: ResourceData {
                public_id: crate::server::ingest::make_public_id(series),
                main_tags: vec![
                    (0x0020, 0x000e, series.to_string()),
                    (0x0008, 0x0060, "CT".to_string()),
                ],
                identifiers: vec![(0x0020, 0x000e, series.to_string())],
            },
            instance: ResourceData {
                public_id: crate::server::ingest::make_public_id(sop),
                main_tags: vec![(0x0008, 0x0018, sop.to_string())],
                identifiers: vec![(0x0008, 0x0018, sop.to_string())],
            },
            attachments: vec![Attachment {
                kind: FileContentKind::Dicom,
                uuid: uuid::Uuid::new_v4().to_string(),
                compressed_size: 10,
                uncompressed_size: 10,
                compression: CompressionScheme::None,
                compressed_md5: String::new(),
                uncompressed_md5: String::new(),
            }],
            metadata: vec![(MetadataKind::ReceptionDate, "20240115T101010".to_string())],
        };
        index.store_instance(request, StoreCaps::default()).unwrap();
    }

    fn query(level: &str, elements: &[(Tag, VR, &str)]) -> InMemDicomObject {
        let mut object = InMemDicomObject::new_empty();
        object.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, level),
        ));
        for (tag, vr, value) in elements {
            object.put(DataElement::new(*tag, *vr, dicom_value!(Str, *value)));
        }
        object
    }

    #[test]
    fn wildcard_matching_rules() {
        assert!(matches_filter("DOE^JOHN", "DOE*", false));
        assert!(matches_filter("doe^john", "DOE*", false));
        assert!(!matches_filter("doe^john", "DOE*", true));
        assert!(matches_filter("CT", "CT", false));
        assert!(matches_filter("ABC", "A?C", true));
        assert!(!matches_filter("ABBC", "A?C", true));
    }

    #[test]
    fn date_range_matching() {
        assert!(matches_filter("20240115", "20240101-20240201", false));
        assert!(!matches_filter("20231215", "20240101-20240201", false));
        assert!(matches_filter("20240115", "20240101-", false));
        assert!(matches_filter("20240115", "-20240201", false));
        // a PN with a hyphen is not a range
        assert!(matches_filter("SMITH-JONES", "SMITH-JONES", false));
    }

    #[test]
    fn patient_level_find_by_name() {
        let index = Index::open_in_memory().unwrap();
        seed(&index, "P1", "DOE^JOHN", "1.2.1", "1.2.1.1", "1.2.1.1.1");
        seed(&index, "P2", "ROE^JANE", "1.2.2", "1.2.2.1", "1.2.2.1.1");

        let parsed = parse_query(&query(
            "PATIENT",
            &[(tags::PATIENT_NAME, VR::PN, "DOE*")],
        ))
        .unwrap();
        let answers = execute_find(&index, &parsed, false, 0).unwrap();

        assert_eq!(answers.len(), 1);
        let name = answers[0]
            .element(tags::PATIENT_NAME)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(name, "DOE^JOHN");
    }

    #[test]
    fn study_level_find_carries_patient_tags() {
        let index = Index::open_in_memory().unwrap();
        seed(&index, "P1", "DOE^JOHN", "1.2.1", "1.2.1.1", "1.2.1.1.1");

        let parsed = parse_query(&query(
            "STUDY",
            &[
                (tags::PATIENT_ID, VR::LO, "P1"),
                (tags::STUDY_DATE, VR::DA, "20240101-20240201"),
            ],
        ))
        .unwrap();
        let answers = execute_find(&index, &parsed, false, 0).unwrap();

        assert_eq!(answers.len(), 1);
        let uid = answers[0]
            .element(tags::STUDY_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(uid, "1.2.1");
        // the patient identifier is merged into the study answer
        assert_eq!(
            answers[0].element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P1"
        );
    }

    #[test]
    fn find_honors_the_result_limit() {
        let index = Index::open_in_memory().unwrap();
        for i in 0..5 {
            seed(
                &index,
                &format!("P{}", i),
                "DOE^JOHN",
                &format!("1.2.{}", i),
                &format!("1.2.{}.1", i),
                &format!("1.2.{}.1.1", i),
            );
        }

        let parsed = parse_query(&query("PATIENT", &[])).unwrap();
        let answers = execute_find(&index, &parsed, false, 3).unwrap();
        assert_eq!(answers.len(), 3);
    }

    #[test]
    fn missing_level_is_rejected() {
        let object = InMemDicomObject::new_empty();
        assert!(matches!(
            parse_query(&object),
            Err(VaultError::BadRequest { .. })
        ));
    }
}
