//! Server configuration.
//!
//! The configuration is a single JSON object, read either from one file or
//! from a directory whose `*.json` files are merged non-destructively. Two
//! files defining the same top-level key is a configuration error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::errors::{VaultError, VaultResult};

/// A DICOM modality declared under the `DicomModalities` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModality {
    pub aet: String,
    pub host: String,
    pub port: u16,
}

/// A remote HTTP peer declared under the `OrthancPeers` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default)]
pub struct Configuration {
    root: Map<String, Value>,
    /// Path the configuration was loaded from, if any.
    source: Option<PathBuf>,
}

impl Configuration {
    /// Load the configuration from a file or a directory of JSON files.
    /// With no path, the built-in defaults apply.
    pub fn load(path: Option<&Path>) -> VaultResult<Self> {
        let mut config = Configuration::default();

        let path = match path {
            Some(p) => p,
            None => {
                warn!("Using the default configuration");
                return Ok(config);
            }
        };

        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .collect();
            files.sort();

            if files.is_empty() {
                return bad_format(format!(
                    "no JSON configuration file in directory {}",
                    path.display()
                ));
            }

            for file in files {
                config.merge_file(&file)?;
            }
        } else {
            config.merge_file(path)?;
        }

        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> VaultResult<()> {
        info!("Reading the configuration from: {}", path.display());
        let content =
            std::fs::read_to_string(path).map_err(|_| VaultError::InexistentFile {
                path: path.display().to_string(),
            })?;
        let value: Value =
            serde_json::from_str(&content).map_err(|e| VaultError::BadFileFormat {
                message: format!("{}: {}", path.display(), e),
            })?;

        let object = match value {
            Value::Object(o) => o,
            _ => {
                return bad_format(format!(
                    "{}: the configuration must be a JSON object",
                    path.display()
                ))
            }
        };

        for (key, value) in object {
            if self.root.contains_key(&key) {
                return bad_format(format!(
                    "the configuration option \"{}\" is defined by several files",
                    key
                ));
            }
            self.root.insert(key, value);
        }
        Ok(())
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn get_string(&self, option: &str, default: &str) -> String {
        match self.root.get(option) {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                warn!("Option \"{}\" is not a string, using default", option);
                default.to_string()
            }
            None => default.to_string(),
        }
    }

    pub fn get_bool(&self, option: &str, default: bool) -> bool {
        match self.root.get(option) {
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                warn!("Option \"{}\" is not a boolean, using default", option);
                default
            }
            None => default,
        }
    }

    pub fn get_unsigned(&self, option: &str, default: u64) -> u64 {
        match self.root.get(option) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(_) => {
                warn!("Option \"{}\" is not an integer, using default", option);
                default
            }
            None => default,
        }
    }

    pub fn get_list_of_strings(&self, option: &str) -> Vec<String> {
        match self.root.get(option) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn get_object(&self, option: &str) -> Option<&Map<String, Value>> {
        self.root.get(option).and_then(|v| v.as_object())
    }

    /// Users allowed by HTTP basic authentication, `user -> password`.
    pub fn registered_users(&self) -> HashMap<String, String> {
        self.get_object("RegisteredUsers")
            .map(|users| {
                users
                    .iter()
                    .filter_map(|(user, password)| {
                        password.as_str().map(|p| (user.clone(), p.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The DICOM modalities this server knows, by symbolic name.
    pub fn modalities(&self) -> VaultResult<HashMap<String, RemoteModality>> {
        let mut result = HashMap::new();
        if let Some(modalities) = self.get_object("DicomModalities") {
            for (name, entry) in modalities {
                result.insert(name.clone(), parse_modality(name, entry)?);
            }
        }
        Ok(result)
    }

    pub fn get_modality(&self, name: &str) -> VaultResult<RemoteModality> {
        self.modalities()?
            .remove(name)
            .ok_or_else(|| VaultError::InexistentItem {
                what: format!("modality \"{}\"", name),
            })
    }

    /// Remote HTTP peers, by symbolic name.
    pub fn peers(&self) -> VaultResult<HashMap<String, RemotePeer>> {
        let mut result = HashMap::new();
        if let Some(peers) = self.get_object("OrthancPeers") {
            for (name, entry) in peers {
                result.insert(name.clone(), parse_peer(name, entry)?);
            }
        }
        Ok(result)
    }

    /// Raw `Dictionary` section declaring user-registered DICOM tags; the
    /// entries are parsed and registered by the dictionary module.
    pub fn dictionary(&self) -> Option<&Map<String, Value>> {
        self.get_object("Dictionary")
    }

    /// Whether `aet` matches one of the configured modalities.
    pub fn is_known_aet(&self, aet: &str) -> bool {
        let strict = self.get_bool("StrictAetComparison", false);
        let modalities = match self.modalities() {
            Ok(m) => m,
            Err(_) => return false,
        };
        modalities
            .values()
            .any(|m| aet_equal(&m.aet, aet, strict))
    }

    /// User-registered metadata kinds, `name -> key`. Keys below 1024 are
    /// reserved for the server itself.
    pub fn user_metadata(&self) -> VaultResult<HashMap<String, i64>> {
        self.user_registrations("UserMetadata")
    }

    /// User-registered attachment kinds, `name -> key`.
    pub fn user_content_types(&self) -> VaultResult<HashMap<String, i64>> {
        self.user_registrations("UserContentType")
    }

    fn user_registrations(&self, option: &str) -> VaultResult<HashMap<String, i64>> {
        let mut result = HashMap::new();
        if let Some(entries) = self.get_object(option) {
            for (name, value) in entries {
                // "UserContentType" also accepts [key, mime] pairs
                let key = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::Array(items) => items.first().and_then(|v| v.as_i64()),
                    _ => None,
                };
                let key = key.ok_or_else(|| VaultError::BadParameterType {
                    message: format!("{}.{} must be an integer", option, name),
                })?;
                if key < 1024 {
                    return Err(VaultError::ParameterOutOfRange {
                        message: format!(
                            "{}.{}: keys below 1024 are reserved ({})",
                            option, name, key
                        ),
                    });
                }
                result.insert(name.clone(), key);
            }
        }
        Ok(result)
    }

    /// Serialize a sample configuration, for the `--config` flag.
    pub fn default_configuration() -> String {
        let sample = serde_json::json!({
            "Name": "dicom-vault",
            "StorageDirectory": "VaultStorage",
            "IndexDirectory": "VaultStorage",
            "StorageCompression": false,
            "MaximumStorageSize": 0,
            "MaximumPatientCount": 0,
            "HttpServerEnabled": true,
            "HttpPort": 8042,
            "HttpDescribeErrors": true,
            "HttpCompressionEnabled": true,
            "DicomServerEnabled": true,
            "DicomAet": "VAULT",
            "DicomPort": 4242,
            "DicomCheckCalledAet": false,
            "DefaultEncoding": "Latin1",
            "DeflatedTransferSyntaxAccepted": true,
            "JpegTransferSyntaxAccepted": true,
            "Jpeg2000TransferSyntaxAccepted": true,
            "JpegLosslessTransferSyntaxAccepted": true,
            "JpipTransferSyntaxAccepted": true,
            "Mpeg2TransferSyntaxAccepted": true,
            "RleTransferSyntaxAccepted": true,
            "UnknownSopClassAccepted": false,
            "RemoteAccessAllowed": false,
            "SslEnabled": false,
            "SslCertificate": "certificate.pem",
            "HttpsVerifyPeers": true,
            "HttpsCACertificates": "",
            "AuthenticationEnabled": false,
            "RegisteredUsers": {},
            "DicomModalities": {},
            "OrthancPeers": {},
            "LuaScripts": [],
            "Plugins": [],
            "UserMetadata": {},
            "UserContentType": {},
            "Dictionary": {},
            "StoreDicom": true,
            "StoreMD5ForAttachments": true,
            "StableAge": 60,
            "LimitFindResults": 0,
            "LimitFindInstances": 0,
            "CaseSensitivePN": false,
            "StrictAetComparison": false,
            "KeepAlive": false,
            "HttpTimeout": 0
        });
        serde_json::to_string_pretty(&sample).expect("static JSON")
    }

    /// Build a configuration directly from a JSON object (used by tests and
    /// by the embedded scripting environment).
    pub fn from_json(value: Value) -> VaultResult<Self> {
        match value {
            Value::Object(root) => Ok(Configuration { root, source: None }),
            _ => bad_format("the configuration must be a JSON object".into()),
        }
    }
}

fn bad_format<T>(message: String) -> VaultResult<T> {
    Err(VaultError::BadFileFormat { message })
}

fn aet_equal(a: &str, b: &str, strict: bool) -> bool {
    if strict {
        a == b
    } else {
        a.trim().eq_ignore_ascii_case(b.trim())
    }
}

fn parse_modality(name: &str, entry: &Value) -> VaultResult<RemoteModality> {
    let items = entry
        .as_array()
        .ok_or_else(|| VaultError::BadFileFormat {
            message: format!("DicomModalities.{} must be an array", name),
        })?;
    let aet = items.first().and_then(|v| v.as_str());
    let host = items.get(1).and_then(|v| v.as_str());
    let port = items.get(2).and_then(|v| v.as_u64());
    match (aet, host, port) {
        (Some(aet), Some(host), Some(port)) if port <= u16::MAX as u64 => {
            Ok(RemoteModality {
                aet: aet.to_string(),
                host: host.to_string(),
                port: port as u16,
            })
        }
        _ => Err(VaultError::BadFileFormat {
            message: format!(
                "DicomModalities.{} must be [AET, host, port]",
                name
            ),
        }),
    }
}

fn parse_peer(name: &str, entry: &Value) -> VaultResult<RemotePeer> {
    let items = entry
        .as_array()
        .ok_or_else(|| VaultError::BadFileFormat {
            message: format!("OrthancPeers.{} must be an array", name),
        })?;
    let url = items.first().and_then(|v| v.as_str());
    match url {
        Some(url) => Ok(RemotePeer {
            url: url.to_string(),
            username: items.get(1).and_then(|v| v.as_str()).map(String::from),
            password: items.get(2).and_then(|v| v.as_str()).map(String::from),
        }),
        None => Err(VaultError::BadFileFormat {
            message: format!("OrthancPeers.{} must be [url, (username, password)]", name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VaultError;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn defaults_without_configuration() {
        let config = Configuration::load(None).unwrap();
        assert_eq!(config.get_string("DicomAet", "VAULT"), "VAULT");
        assert_eq!(config.get_unsigned("HttpPort", 8042), 8042);
        assert!(!config.get_bool("AuthenticationEnabled", false));
    }

    #[test]
    fn merges_directory_of_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"DicomModalities": {"sample": ["SCP", "localhost", 104]}}"#);
        write(dir.path(), "b.json", r#"{"OrthancPeers": {"other": ["http://localhost:8043/"]}}"#);

        let config = Configuration::load(Some(dir.path())).unwrap();
        let modalities = config.modalities().unwrap();
        assert_eq!(modalities["sample"].aet, "SCP");
        assert_eq!(modalities["sample"].port, 104);
        assert_eq!(config.peers().unwrap()["other"].url, "http://localhost:8043/");
    }

    #[test]
    fn duplicate_option_across_files_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"DicomModalities": {}}"#);
        write(dir.path(), "b.json", r#"{"DicomModalities": {}}"#);

        match Configuration::load(Some(dir.path())) {
            Err(VaultError::BadFileFormat { .. }) => {}
            other => panic!("expected BadFileFormat, got {:?}", other),
        }
    }

    #[test]
    fn aet_comparison_modes() {
        let config = Configuration::from_json(serde_json::json!({
            "DicomModalities": {"sample": ["STORESCU", "localhost", 2000]}
        }))
        .unwrap();
        assert!(config.is_known_aet("storescu"));
        assert!(config.is_known_aet(" STORESCU "));

        let strict = Configuration::from_json(serde_json::json!({
            "StrictAetComparison": true,
            "DicomModalities": {"sample": ["STORESCU", "localhost", 2000]}
        }))
        .unwrap();
        assert!(strict.is_known_aet("STORESCU"));
        assert!(!strict.is_known_aet("storescu"));
    }

    #[test]
    fn user_registrations_reject_reserved_keys() {
        let config = Configuration::from_json(serde_json::json!({
            "UserMetadata": {"sample": 1024}
        }))
        .unwrap();
        assert_eq!(config.user_metadata().unwrap()["sample"], 1024);

        let reserved = Configuration::from_json(serde_json::json!({
            "UserMetadata": {"sample": 16}
        }))
        .unwrap();
        assert!(matches!(
            reserved.user_metadata(),
            Err(VaultError::ParameterOutOfRange { .. })
        ));
    }

    #[test]
    fn sample_configuration_is_valid_json() {
        let sample = Configuration::default_configuration();
        let value: Value = serde_json::from_str(&sample).unwrap();
        assert!(value.is_object());
    }
}
