//! User-registered DICOM tags.
//!
//! The `Dictionary` configuration section declares tags the standard
//! dictionary does not know, typically private tags:
//!
//! ```json
//! "Dictionary": {
//!   "0014,1020": ["DA", "ValidationExpiryDate", 1, 1],
//!   "0009,0010": ["LO", "PrivateCreator", 1, 1, "ACME"]
//! }
//! ```
//!
//! Each entry maps `"group,element"` to `[vr, name, minMultiplicity,
//! maxMultiplicity, privateCreator?]`. The registry is process-wide, like
//! the dictionary of the underlying DICOM toolkit: the name and VR lookups
//! of the ingestion pipeline and of C-FIND answers consult it before the
//! standard dictionary.

use std::collections::HashMap;
use std::sync::RwLock;

use dicom_core::{Tag, VR};
use serde_json::Value;
use tracing::info;

use crate::config::Configuration;
use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTag {
    pub tag: Tag,
    pub vr: VR,
    pub name: String,
    pub min_multiplicity: u32,
    /// Zero means unbounded.
    pub max_multiplicity: u32,
    pub private_creator: Option<String>,
}

lazy_static::lazy_static! {
    static ref CUSTOM_TAGS: RwLock<HashMap<Tag, CustomTag>> = RwLock::new(HashMap::new());
}

/// Register one tag. Re-registering replaces the previous entry, so a
/// server reset reloads the configuration cleanly.
pub fn register(entry: CustomTag) {
    info!(
        "Registering custom DICOM tag: {} {} {}",
        entry.tag, entry.vr, entry.name
    );
    CUSTOM_TAGS
        .write()
        .unwrap_or_else(|p| p.into_inner())
        .insert(entry.tag, entry);
}

/// The registered name of a tag, if any.
pub fn name_of(tag: Tag) -> Option<String> {
    CUSTOM_TAGS
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .get(&tag)
        .map(|entry| entry.name.clone())
}

/// The registered value representation of a tag, if any.
pub fn vr_of(tag: Tag) -> Option<VR> {
    CUSTOM_TAGS
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .get(&tag)
        .map(|entry| entry.vr)
}

/// Load every tag declared by the `Dictionary` configuration section.
pub fn register_from_configuration(config: &Configuration) -> VaultResult<()> {
    let section = match config.dictionary() {
        Some(section) => section,
        None => return Ok(()),
    };
    for (key, value) in section {
        register(parse_entry(key, value)?);
    }
    Ok(())
}

fn parse_entry(key: &str, value: &Value) -> VaultResult<CustomTag> {
    let tag = parse_tag(key)?;
    let items = value.as_array().ok_or_else(|| invalid(key))?;
    if items.len() != 4 && items.len() != 5 {
        return Err(invalid(key));
    }

    let vr = items[0]
        .as_str()
        .and_then(parse_vr)
        .ok_or_else(|| invalid(key))?;
    let name = items[1].as_str().ok_or_else(|| invalid(key))?;
    let min_multiplicity = items[2].as_u64().ok_or_else(|| invalid(key))? as u32;
    let max_multiplicity = items[3].as_u64().ok_or_else(|| invalid(key))? as u32;
    let private_creator = items
        .get(4)
        .map(|v| v.as_str().map(String::from).ok_or_else(|| invalid(key)))
        .transpose()?;

    Ok(CustomTag {
        tag,
        vr,
        name: name.to_string(),
        min_multiplicity,
        max_multiplicity,
        private_creator,
    })
}

fn invalid(key: &str) -> VaultError {
    VaultError::BadFileFormat {
        message: format!("invalid Dictionary entry for tag \"{}\"", key),
    }
}

/// Parse a `"group,element"` pair of hexadecimal numbers.
fn parse_tag(key: &str) -> VaultResult<Tag> {
    let parsed = key.split_once(',').and_then(|(group, element)| {
        let group = u16::from_str_radix(group.trim(), 16).ok()?;
        let element = u16::from_str_radix(element.trim(), 16).ok()?;
        Some(Tag(group, element))
    });
    parsed.ok_or_else(|| VaultError::BadFileFormat {
        message: format!("invalid DICOM tag \"{}\" in the Dictionary section", key),
    })
}

fn parse_vr(value: &str) -> Option<VR> {
    match value {
        "AE" => Some(VR::AE),
        "AS" => Some(VR::AS),
        "AT" => Some(VR::AT),
        "CS" => Some(VR::CS),
        "DA" => Some(VR::DA),
        "DS" => Some(VR::DS),
        "DT" => Some(VR::DT),
        "FL" => Some(VR::FL),
        "FD" => Some(VR::FD),
        "IS" => Some(VR::IS),
        "LO" => Some(VR::LO),
        "LT" => Some(VR::LT),
        "OB" => Some(VR::OB),
        "OD" => Some(VR::OD),
        "OF" => Some(VR::OF),
        "OL" => Some(VR::OL),
        "OW" => Some(VR::OW),
        "PN" => Some(VR::PN),
        "SH" => Some(VR::SH),
        "SL" => Some(VR::SL),
        "SQ" => Some(VR::SQ),
        "SS" => Some(VR::SS),
        "ST" => Some(VR::ST),
        "TM" => Some(VR::TM),
        "UC" => Some(VR::UC),
        "UI" => Some(VR::UI),
        "UL" => Some(VR::UL),
        "UN" => Some(VR::UN),
        "UR" => Some(VR::UR),
        "US" => Some(VR::US),
        "UT" => Some(VR::UT),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_tags_from_the_configuration() {
        let config = Configuration::from_json(serde_json::json!({
            "Dictionary": {
                "0009,1001": ["DA", "SampleExpiryDate", 1, 1],
                "0009,1002": ["LO", "SampleOwner", 1, 1, "ACME"]
            }
        }))
        .unwrap();
        register_from_configuration(&config).unwrap();

        assert_eq!(
            name_of(Tag(0x0009, 0x1001)).as_deref(),
            Some("SampleExpiryDate")
        );
        assert_eq!(vr_of(Tag(0x0009, 0x1001)), Some(VR::DA));
        assert_eq!(vr_of(Tag(0x0009, 0x1002)), Some(VR::LO));
        assert_eq!(name_of(Tag(0x0009, 0x1003)), None);
    }

    #[test]
    fn malformed_entries_are_fatal() {
        let bad_tag = Configuration::from_json(serde_json::json!({
            "Dictionary": {"not-a-tag": ["DA", "Name", 1, 1]}
        }))
        .unwrap();
        assert!(matches!(
            register_from_configuration(&bad_tag),
            Err(VaultError::BadFileFormat { .. })
        ));

        let bad_vr = Configuration::from_json(serde_json::json!({
            "Dictionary": {"0009,1010": ["XX", "Name", 1, 1]}
        }))
        .unwrap();
        assert!(matches!(
            register_from_configuration(&bad_vr),
            Err(VaultError::BadFileFormat { .. })
        ));

        let bad_arity = Configuration::from_json(serde_json::json!({
            "Dictionary": {"0009,1011": ["DA", "Name"]}
        }))
        .unwrap();
        assert!(matches!(
            register_from_configuration(&bad_arity),
            Err(VaultError::BadFileFormat { .. })
        ));
    }

    #[test]
    fn tag_key_parsing() {
        assert_eq!(parse_tag("0014,1020").unwrap(), Tag(0x0014, 0x1020));
        assert_eq!(parse_tag("7fe0,0010").unwrap(), Tag(0x7fe0, 0x0010));
        assert!(parse_tag("0014").is_err());
        assert!(parse_tag("ghij,0010").is_err());
    }
}
