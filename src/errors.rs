//! The single error taxonomy of the server.
//!
//! Every failure surfaced to a protocol front-end is one of these kinds. Each
//! kind has a stable numeric code and an HTTP status projection, so the REST
//! layer can format a response without knowing where the error came from.
//! Codes at or above [`PLUGIN_ERROR_BASE`] are reserved for plugin-registered
//! errors and resolved through the plugin error dictionary.

use snafu::prelude::*;

/// First numeric code available to plugin-registered errors.
pub const PLUGIN_ERROR_BASE: i64 = 1_000_000;

/// Offset added to raw SQLite extended codes when surfaced in `--errors`.
pub const SQLITE_ERROR_BASE: i64 = 1000;

/// Offset added to DICOM association error codes.
pub const DICOM_ERROR_BASE: i64 = 2000;

pub type VaultResult<T, E = VaultError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VaultError {
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },

    #[snafu(display("Not implemented: {what}"))]
    NotImplemented { what: String },

    #[snafu(display("Parameter out of range: {message}"))]
    ParameterOutOfRange { message: String },

    #[snafu(display("Bad type for a parameter: {message}"))]
    BadParameterType { message: String },

    #[snafu(display("Bad sequence of calls: {message}"))]
    BadSequenceOfCalls { message: String },

    #[snafu(display("Accessing an inexistent item: {what}"))]
    InexistentItem { what: String },

    #[snafu(display("Bad request: {message}"))]
    BadRequest { message: String },

    #[snafu(display("Error in the network protocol: {message}"))]
    NetworkProtocol { message: String },

    #[snafu(display("Error with the database engine: {source}"))]
    #[snafu(context(false))]
    Database { source: rusqlite::Error },

    #[snafu(display("Badly formatted URI: {uri}"))]
    UriSyntax { uri: String },

    #[snafu(display("Inexistent file: {path}"))]
    InexistentFile { path: String },

    #[snafu(display("Cannot write to file: {path}"))]
    CannotWriteFile { path: String },

    #[snafu(display("Bad file format: {message}"))]
    BadFileFormat { message: String },

    #[snafu(display("Timeout: {message}"))]
    Timeout { message: String },

    #[snafu(display("Unknown resource: {what}"))]
    UnknownResource { what: String },

    #[snafu(display(
        "Incompatible database version: found {found}, expected {expected}"
    ))]
    IncompatibleDatabaseVersion { found: u32, expected: u32 },

    #[snafu(display("The file storage is full"))]
    FullStorage,

    #[snafu(display("Corrupted file (e.g. inconsistent MD5 hash): {what}"))]
    CorruptedFile { what: String },

    #[snafu(display("Inexistent tag: {tag}"))]
    InexistentTag { tag: String },

    #[snafu(display("Cannot modify a read-only data structure"))]
    ReadOnly,

    #[snafu(display("Incompatible format of the images: {message}"))]
    IncompatibleImageFormat { message: String },

    #[snafu(display("Incompatible size of the images: {message}"))]
    IncompatibleImageSize { message: String },

    #[snafu(display("Error while using a shared library: {message}"))]
    SharedLibrary { message: String },

    #[snafu(display("Plugin invoking an unknown service: {service}"))]
    UnknownPluginService { service: u32 },

    #[snafu(display("Unknown DICOM tag: {tag}"))]
    UnknownDicomTag { tag: String },

    #[snafu(display("Cannot parse a JSON document: {message}"))]
    BadJson { message: String },

    #[snafu(display("Bad credentials were provided to an HTTP service"))]
    Unauthorized,

    #[snafu(display("Error within the database plugin: {message}"))]
    DatabasePlugin { message: String },

    #[snafu(display("Error within the storage area plugin: {message}"))]
    StorageAreaPlugin { message: String },

    #[snafu(display("The request is empty"))]
    EmptyRequest,

    #[snafu(display("Cannot send a response which is acceptable by the client"))]
    NotAcceptable,

    #[snafu(display("Error encountered within a plugin: {message}"))]
    Plugin { message: String },

    /// A plugin raised one of its registered error codes.
    #[snafu(display("Plugin error {code}"))]
    PluginDefined { code: i64 },

    #[snafu(display("Error in the DICOM network layer: {message}"))]
    DicomNetwork { message: String },

    #[snafu(display("Cannot parse a DICOM object: {message}"))]
    DicomFormat { message: String },

    #[snafu(display("Error in the Lua engine: {source}"))]
    #[snafu(context(false))]
    Lua { source: mlua::Error },
}

impl VaultError {
    /// Stable numeric code, as listed by `--errors`.
    pub fn code(&self) -> i64 {
        match self {
            VaultError::Internal { .. } => -1,
            VaultError::Plugin { .. } => 1,
            VaultError::NotImplemented { .. } => 2,
            VaultError::ParameterOutOfRange { .. } => 3,
            VaultError::BadParameterType { .. } => 5,
            VaultError::BadSequenceOfCalls { .. } => 6,
            VaultError::InexistentItem { .. } => 7,
            VaultError::BadRequest { .. } => 8,
            VaultError::NetworkProtocol { .. } => 9,
            VaultError::Database { .. } => 11,
            VaultError::UriSyntax { .. } => 12,
            VaultError::InexistentFile { .. } => 13,
            VaultError::CannotWriteFile { .. } => 14,
            VaultError::BadFileFormat { .. } => 15,
            VaultError::Timeout { .. } => 16,
            VaultError::UnknownResource { .. } => 17,
            VaultError::IncompatibleDatabaseVersion { .. } => 18,
            VaultError::FullStorage => 19,
            VaultError::CorruptedFile { .. } => 20,
            VaultError::InexistentTag { .. } => 21,
            VaultError::ReadOnly => 22,
            VaultError::IncompatibleImageFormat { .. } => 23,
            VaultError::IncompatibleImageSize { .. } => 24,
            VaultError::SharedLibrary { .. } => 25,
            VaultError::UnknownPluginService { .. } => 26,
            VaultError::UnknownDicomTag { .. } => 27,
            VaultError::BadJson { .. } => 28,
            VaultError::Unauthorized => 29,
            VaultError::DatabasePlugin { .. } => 31,
            VaultError::StorageAreaPlugin { .. } => 32,
            VaultError::EmptyRequest => 33,
            VaultError::NotAcceptable => 34,
            VaultError::Lua { .. } => 35,
            VaultError::DicomNetwork { .. } => DICOM_ERROR_BASE + 1,
            VaultError::DicomFormat { .. } => DICOM_ERROR_BASE + 2,
            VaultError::PluginDefined { code } => *code,
        }
    }

    /// Short identifier used in error listings and REST error bodies.
    pub fn kind_name(&self) -> &'static str {
        match self {
            VaultError::Internal { .. } => "InternalError",
            VaultError::Plugin { .. } => "Plugin",
            VaultError::NotImplemented { .. } => "NotImplemented",
            VaultError::ParameterOutOfRange { .. } => "ParameterOutOfRange",
            VaultError::BadParameterType { .. } => "BadParameterType",
            VaultError::BadSequenceOfCalls { .. } => "BadSequenceOfCalls",
            VaultError::InexistentItem { .. } => "InexistentItem",
            VaultError::BadRequest { .. } => "BadRequest",
            VaultError::NetworkProtocol { .. } => "NetworkProtocol",
            VaultError::Database { .. } => "Database",
            VaultError::UriSyntax { .. } => "UriSyntax",
            VaultError::InexistentFile { .. } => "InexistentFile",
            VaultError::CannotWriteFile { .. } => "CannotWriteFile",
            VaultError::BadFileFormat { .. } => "BadFileFormat",
            VaultError::Timeout { .. } => "Timeout",
            VaultError::UnknownResource { .. } => "UnknownResource",
            VaultError::IncompatibleDatabaseVersion { .. } => "IncompatibleDatabaseVersion",
            VaultError::FullStorage => "FullStorage",
            VaultError::CorruptedFile { .. } => "CorruptedFile",
            VaultError::InexistentTag { .. } => "InexistentTag",
            VaultError::ReadOnly => "ReadOnly",
            VaultError::IncompatibleImageFormat { .. } => "IncompatibleImageFormat",
            VaultError::IncompatibleImageSize { .. } => "IncompatibleImageSize",
            VaultError::SharedLibrary { .. } => "SharedLibrary",
            VaultError::UnknownPluginService { .. } => "UnknownPluginService",
            VaultError::UnknownDicomTag { .. } => "UnknownDicomTag",
            VaultError::BadJson { .. } => "BadJson",
            VaultError::Unauthorized => "Unauthorized",
            VaultError::DatabasePlugin { .. } => "DatabasePlugin",
            VaultError::StorageAreaPlugin { .. } => "StorageAreaPlugin",
            VaultError::EmptyRequest => "EmptyRequest",
            VaultError::NotAcceptable => "NotAcceptable",
            VaultError::Lua { .. } => "LuaEngine",
            VaultError::DicomNetwork { .. } => "DicomNetwork",
            VaultError::DicomFormat { .. } => "DicomFormat",
            VaultError::PluginDefined { .. } => "Plugin",
        }
    }

    /// HTTP status used when this error is surfaced through REST.
    pub fn http_status(&self) -> u16 {
        match self {
            VaultError::BadRequest { .. }
            | VaultError::BadParameterType { .. }
            | VaultError::ParameterOutOfRange { .. }
            | VaultError::BadFileFormat { .. }
            | VaultError::BadJson { .. }
            | VaultError::UriSyntax { .. }
            | VaultError::EmptyRequest
            | VaultError::UnknownDicomTag { .. }
            | VaultError::DicomFormat { .. } => 400,
            VaultError::Unauthorized => 401,
            VaultError::InexistentItem { .. }
            | VaultError::InexistentFile { .. }
            | VaultError::InexistentTag { .. }
            | VaultError::UnknownResource { .. } => 404,
            VaultError::NotAcceptable => 406,
            VaultError::Timeout { .. } => 408,
            VaultError::FullStorage => 507,
            _ => 500,
        }
    }

    /// All error kinds with a representative instance, for `--errors`.
    pub fn enumerate() -> Vec<(i64, &'static str, String)> {
        let samples: Vec<VaultError> = vec![
            VaultError::Internal { message: String::new() },
            VaultError::Plugin { message: String::new() },
            VaultError::NotImplemented { what: String::new() },
            VaultError::ParameterOutOfRange { message: String::new() },
            VaultError::BadParameterType { message: String::new() },
            VaultError::BadSequenceOfCalls { message: String::new() },
            VaultError::InexistentItem { what: String::new() },
            VaultError::BadRequest { message: String::new() },
            VaultError::NetworkProtocol { message: String::new() },
            VaultError::UriSyntax { uri: String::new() },
            VaultError::InexistentFile { path: String::new() },
            VaultError::CannotWriteFile { path: String::new() },
            VaultError::BadFileFormat { message: String::new() },
            VaultError::Timeout { message: String::new() },
            VaultError::UnknownResource { what: String::new() },
            VaultError::IncompatibleDatabaseVersion { found: 0, expected: 0 },
            VaultError::FullStorage,
            VaultError::CorruptedFile { what: String::new() },
            VaultError::InexistentTag { tag: String::new() },
            VaultError::ReadOnly,
            VaultError::IncompatibleImageFormat { message: String::new() },
            VaultError::IncompatibleImageSize { message: String::new() },
            VaultError::SharedLibrary { message: String::new() },
            VaultError::UnknownPluginService { service: 0 },
            VaultError::UnknownDicomTag { tag: String::new() },
            VaultError::BadJson { message: String::new() },
            VaultError::Unauthorized,
            VaultError::DatabasePlugin { message: String::new() },
            VaultError::StorageAreaPlugin { message: String::new() },
            VaultError::EmptyRequest,
            VaultError::NotAcceptable,
            VaultError::DicomNetwork { message: String::new() },
            VaultError::DicomFormat { message: String::new() },
        ];
        let mut listed: Vec<(i64, &'static str, String)> = samples
            .into_iter()
            .map(|e| (e.code(), e.kind_name(), e.to_string()))
            .collect();
        listed.push((11, "Database", "Error with the database engine".to_string()));
        listed.push((35, "LuaEngine", "Error in the Lua engine".to_string()));
        listed.sort_by_key(|(code, _, _)| *code);
        listed
    }
}

impl From<std::io::Error> for VaultError {
    fn from(source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => VaultError::InexistentFile {
                path: source.to_string(),
            },
            _ => VaultError::Internal {
                message: source.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(source: serde_json::Error) -> Self {
        VaultError::BadJson {
            message: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_unique() {
        let listed = VaultError::enumerate();
        let mut codes: Vec<i64> = listed.iter().map(|(c, _, _)| *c).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), listed.len());
    }

    #[test]
    fn http_projection() {
        assert_eq!(VaultError::Unauthorized.http_status(), 401);
        assert_eq!(VaultError::FullStorage.http_status(), 507);
        assert_eq!(
            VaultError::UnknownResource { what: "x".into() }.http_status(),
            404
        );
        assert_eq!(
            VaultError::BadFileFormat { message: "x".into() }.http_status(),
            400
        );
    }

    #[test]
    fn plugin_codes_start_at_one_million() {
        let e = VaultError::PluginDefined { code: PLUGIN_ERROR_BASE + 1 };
        assert_eq!(e.code(), 1_000_001);
        assert_eq!(e.kind_name(), "Plugin");
    }
}
