//! Request filtering.
//!
//! Two layers mediate every inbound request: the static configuration
//! (known AETs, transfer-syntax gates) and the scripted predicates. When a
//! script defines the predicate matching a gate, its verdict wins over the
//! configuration.

use tracing::{error, info};

use crate::scripting::{LuaArg, HTTP_FILTER};

use super::ServerContext;

/// The DICOM request verbs subject to filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DicomRequestType {
    Echo,
    Store,
    Find,
    Move,
    Worklist,
}

/// Families of transfer syntaxes gated by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSyntaxGroup {
    Deflated,
    Jpeg,
    Jpeg2000,
    JpegLossless,
    Jpip,
    Mpeg2,
    Rle,
}

impl TransferSyntaxGroup {
    /// The configuration option (and, prefixed with `Is`, the Lua
    /// predicate) gating this family.
    pub fn config_option(self) -> &'static str {
        match self {
            TransferSyntaxGroup::Deflated => "DeflatedTransferSyntaxAccepted",
            TransferSyntaxGroup::Jpeg => "JpegTransferSyntaxAccepted",
            TransferSyntaxGroup::Jpeg2000 => "Jpeg2000TransferSyntaxAccepted",
            TransferSyntaxGroup::JpegLossless => "JpegLosslessTransferSyntaxAccepted",
            TransferSyntaxGroup::Jpip => "JpipTransferSyntaxAccepted",
            TransferSyntaxGroup::Mpeg2 => "Mpeg2TransferSyntaxAccepted",
            TransferSyntaxGroup::Rle => "RleTransferSyntaxAccepted",
        }
    }

    /// Classify a transfer syntax UID. Uncompressed syntaxes are not gated
    /// and return `None`.
    pub fn of_uid(uid: &str) -> Option<Self> {
        match uid.trim_end_matches('\0') {
            "1.2.840.10008.1.2.1.99" => Some(TransferSyntaxGroup::Deflated),
            "1.2.840.10008.1.2.4.50" | "1.2.840.10008.1.2.4.51" => {
                Some(TransferSyntaxGroup::Jpeg)
            }
            "1.2.840.10008.1.2.4.57"
            | "1.2.840.10008.1.2.4.70"
            | "1.2.840.10008.1.2.4.80"
            | "1.2.840.10008.1.2.4.81" => Some(TransferSyntaxGroup::JpegLossless),
            "1.2.840.10008.1.2.4.90"
            | "1.2.840.10008.1.2.4.91"
            | "1.2.840.10008.1.2.4.92"
            | "1.2.840.10008.1.2.4.93" => Some(TransferSyntaxGroup::Jpeg2000),
            "1.2.840.10008.1.2.4.94" | "1.2.840.10008.1.2.4.95" => {
                Some(TransferSyntaxGroup::Jpip)
            }
            "1.2.840.10008.1.2.4.100" | "1.2.840.10008.1.2.4.101" => {
                Some(TransferSyntaxGroup::Mpeg2)
            }
            "1.2.840.10008.1.2.5" => Some(TransferSyntaxGroup::Rle),
            _ => None,
        }
    }
}

/// Filter applied to every DICOM association and request.
pub struct ApplicationEntityFilter<'a> {
    context: &'a ServerContext,
}

impl<'a> ApplicationEntityFilter<'a> {
    pub fn new(context: &'a ServerContext) -> Self {
        ApplicationEntityFilter { context }
    }

    pub fn is_allowed_connection(
        &self,
        _remote_ip: &str,
        _remote_aet: &str,
        _called_aet: &str,
    ) -> bool {
        true
    }

    /// C-STORE is accepted from any AET; query/retrieve only from the
    /// modalities declared in the configuration.
    pub fn is_allowed_request(
        &self,
        _remote_ip: &str,
        remote_aet: &str,
        _called_aet: &str,
        request: DicomRequestType,
    ) -> bool {
        match request {
            DicomRequestType::Echo | DicomRequestType::Store => true,
            DicomRequestType::Find | DicomRequestType::Move | DicomRequestType::Worklist => {
                if self.context.config.is_known_aet(remote_aet) {
                    true
                } else {
                    error!("Unknown remote DICOM modality AET: \"{}\"", remote_aet);
                    false
                }
            }
        }
    }

    pub fn is_allowed_transfer_syntax(
        &self,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
        group: TransferSyntaxGroup,
    ) -> bool {
        self.scripted_gate(remote_ip, remote_aet, called_aet, group.config_option(), true)
    }

    pub fn is_unknown_sop_class_accepted(
        &self,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
    ) -> bool {
        self.scripted_gate(
            remote_ip,
            remote_aet,
            called_aet,
            "UnknownSopClassAccepted",
            false,
        )
    }

    fn scripted_gate(
        &self,
        remote_ip: &str,
        remote_aet: &str,
        called_aet: &str,
        option: &str,
        default: bool,
    ) -> bool {
        let predicate = format!("Is{}", option);

        {
            let lua = self.context.lua.lock();
            if lua.has_function(&predicate) {
                match lua.call_predicate(
                    &predicate,
                    &[
                        LuaArg::Str(remote_aet.to_string()),
                        LuaArg::Str(remote_ip.to_string()),
                        LuaArg::Str(called_aet.to_string()),
                    ],
                ) {
                    Ok(verdict) => return verdict,
                    Err(e) => {
                        error!("Lua predicate {} failed: {}", predicate, e);
                        return false;
                    }
                }
            }
        }

        self.context.config.get_bool(option, default)
    }
}

/// Verdict of the HTTP request filter: the scripted predicate if defined,
/// otherwise allow.
pub fn is_http_request_allowed(
    context: &ServerContext,
    method: &str,
    uri: &str,
    remote_ip: &str,
    username: &str,
) -> bool {
    let lua = context.lua.lock();
    if !lua.has_function(HTTP_FILTER) {
        return true;
    }

    match lua.call_predicate(
        HTTP_FILTER,
        &[
            LuaArg::Str(method.to_string()),
            LuaArg::Str(uri.to_string()),
            LuaArg::Str(remote_ip.to_string()),
            LuaArg::Str(username.to_string()),
        ],
    ) {
        Ok(true) => true,
        Ok(false) => {
            info!("An incoming HTTP request has been discarded by the filter");
            false
        }
        Err(e) => {
            error!("Lua HTTP filter failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::plugins::PluginRegistry;
    use std::sync::Arc;

    fn context_with(config: serde_json::Value) -> (tempfile::TempDir, ServerContext) {
        let dir = tempfile::tempdir().unwrap();
        let mut root = serde_json::json!({
            "StorageDirectory": dir.path().join("storage").display().to_string(),
            "IndexDirectory": dir.path().join("index").display().to_string(),
        });
        if let (Some(root), Some(extra)) = (root.as_object_mut(), config.as_object()) {
            for (key, value) in extra {
                root.insert(key.clone(), value.clone());
            }
        }
        let config = Arc::new(Configuration::from_json(root).unwrap());
        let context =
            ServerContext::create(config, Arc::new(PluginRegistry::new()), false).unwrap();
        (dir, context)
    }

    #[test]
    fn store_is_accepted_from_unknown_aet() {
        let (_dir, context) = context_with(serde_json::json!({}));
        let filter = ApplicationEntityFilter::new(&context);
        assert!(filter.is_allowed_request("1.2.3.4", "ANYONE", "VAULT", DicomRequestType::Store));
        assert!(!filter.is_allowed_request("1.2.3.4", "ANYONE", "VAULT", DicomRequestType::Find));
    }

    #[test]
    fn find_requires_a_known_aet() {
        let (_dir, context) = context_with(serde_json::json!({
            "DicomModalities": {"sample": ["FINDSCU", "localhost", 1104]}
        }));
        let filter = ApplicationEntityFilter::new(&context);
        assert!(filter.is_allowed_request("1.2.3.4", "FINDSCU", "VAULT", DicomRequestType::Find));
        assert!(!filter.is_allowed_request("1.2.3.4", "OTHER", "VAULT", DicomRequestType::Move));
    }

    #[test]
    fn transfer_syntax_gate_follows_configuration() {
        let (_dir, context) = context_with(serde_json::json!({
            "JpegTransferSyntaxAccepted": false
        }));
        let filter = ApplicationEntityFilter::new(&context);
        assert!(!filter.is_allowed_transfer_syntax(
            "1.2.3.4",
            "SCU",
            "VAULT",
            TransferSyntaxGroup::Jpeg
        ));
        // unconfigured gates default to accepted
        assert!(filter.is_allowed_transfer_syntax(
            "1.2.3.4",
            "SCU",
            "VAULT",
            TransferSyntaxGroup::Rle
        ));
    }

    #[test]
    fn lua_predicate_overrides_configuration() {
        let (_dir, context) = context_with(serde_json::json!({
            "JpegTransferSyntaxAccepted": false
        }));
        context
            .lua
            .lock()
            .execute(
                "function IsJpegTransferSyntaxAccepted(aet, ip, called) return aet == 'TRUSTED' end",
            )
            .unwrap();

        let filter = ApplicationEntityFilter::new(&context);
        assert!(filter.is_allowed_transfer_syntax(
            "1.2.3.4",
            "TRUSTED",
            "VAULT",
            TransferSyntaxGroup::Jpeg
        ));
        assert!(!filter.is_allowed_transfer_syntax(
            "1.2.3.4",
            "OTHER",
            "VAULT",
            TransferSyntaxGroup::Jpeg
        ));
    }

    #[test]
    fn unknown_sop_class_defaults_to_rejected() {
        let (_dir, context) = context_with(serde_json::json!({}));
        let filter = ApplicationEntityFilter::new(&context);
        assert!(!filter.is_unknown_sop_class_accepted("1.2.3.4", "SCU", "VAULT"));
    }

    #[test]
    fn http_filter_defaults_to_allow() {
        let (_dir, context) = context_with(serde_json::json!({}));
        assert!(is_http_request_allowed(&context, "GET", "/system", "127.0.0.1", ""));
    }

    #[test]
    fn http_filter_verdict_is_authoritative() {
        let (_dir, context) = context_with(serde_json::json!({}));
        context
            .lua
            .lock()
            .execute(
                "function IncomingHttpRequestFilter(method, uri, ip, user)
                   return uri ~= '/secret'
                 end",
            )
            .unwrap();

        assert!(is_http_request_allowed(&context, "GET", "/system", "127.0.0.1", ""));
        assert!(!is_http_request_allowed(&context, "GET", "/secret", "127.0.0.1", ""));
    }

    #[test]
    fn transfer_syntax_classification() {
        assert_eq!(
            TransferSyntaxGroup::of_uid("1.2.840.10008.1.2.4.50"),
            Some(TransferSyntaxGroup::Jpeg)
        );
        assert_eq!(
            TransferSyntaxGroup::of_uid("1.2.840.10008.1.2.5"),
            Some(TransferSyntaxGroup::Rle)
        );
        // uncompressed little endian is never gated
        assert_eq!(TransferSyntaxGroup::of_uid("1.2.840.10008.1.2.1"), None);
    }
}
