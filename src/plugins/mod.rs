//! The plugin surface.
//!
//! Extensions register themselves against this registry: REST routes, ingest
//! and change observers, the worklist handler, an image decoder, an
//! alternate storage area, an alternate index back-end, and their own error
//! codes. The numeric service identifiers are stable so that out-of-tree
//! code compiled against an older server keeps dispatching correctly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use dicom_object::InMemDicomObject;
use regex::Regex;
use tracing::{error, info, warn};

use crate::errors::{VaultError, VaultResult, PLUGIN_ERROR_BASE};
use crate::index::backend::IndexDatabase;
use crate::index::ChangeEvent;
use crate::storage::StorageArea;

/// Stable numeric identifiers of the dispatchable services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceId {
    LogInfo = 1,
    LogWarning = 2,
    LogError = 3,
    RegisterRestCallback = 1000,
    RegisterOnStoredInstanceCallback = 1001,
    RegisterOnChangeCallback = 1002,
    RegisterStorageArea = 1009,
    RegisterWorklistCallback = 1025,
    RegisterDecodeImageCallback = 1027,
    DatabaseAnswer = 4000,
    RegisterDatabaseBackend = 4017,
    RegisterErrorCode = 4018,
}

impl ServiceId {
    pub fn from_u32(value: u32) -> VaultResult<Self> {
        match value {
            1 => Ok(ServiceId::LogInfo),
            2 => Ok(ServiceId::LogWarning),
            3 => Ok(ServiceId::LogError),
            1000 => Ok(ServiceId::RegisterRestCallback),
            1001 => Ok(ServiceId::RegisterOnStoredInstanceCallback),
            1002 => Ok(ServiceId::RegisterOnChangeCallback),
            1009 => Ok(ServiceId::RegisterStorageArea),
            1025 => Ok(ServiceId::RegisterWorklistCallback),
            1027 => Ok(ServiceId::RegisterDecodeImageCallback),
            4000 => Ok(ServiceId::DatabaseAnswer),
            4017 => Ok(ServiceId::RegisterDatabaseBackend),
            4018 => Ok(ServiceId::RegisterErrorCode),
            other => Err(VaultError::UnknownPluginService { service: other }),
        }
    }
}

/// An HTTP request routed to a plugin callback.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: String,
    pub uri: String,
    pub body: Vec<u8>,
    /// Capture groups of the route pattern.
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A freshly committed instance, as seen by on-stored observers.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub public_id: String,
    pub simplified_tags: serde_json::Value,
}

pub type RestCallback = Box<dyn Fn(&RestRequest) -> VaultResult<RestResponse> + Send + Sync>;
pub type OnStoredCallback = Box<dyn Fn(&StoredInstance) -> VaultResult<()> + Send + Sync>;
pub type OnChangeCallback = Box<dyn Fn(&ChangeEvent) -> VaultResult<()> + Send + Sync>;

/// Serves DICOM modality worklist queries. At most one handler exists.
pub trait WorklistHandler: Send + Sync {
    /// Return the worklist items matching `query`.
    fn find(&self, query: &InMemDicomObject) -> VaultResult<Vec<InMemDicomObject>>;
}

/// A decoded frame produced by an image-decoder plugin.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// 8-bit grayscale pixels, row-major.
    pub pixels: Vec<u8>,
}

/// Overrides the built-in frame decoder. Returning `Ok(None)` declines the
/// frame, falling back to the built-in decoder.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, dicom: &[u8], frame: u32) -> VaultResult<Option<DecodedFrame>>;
}

#[derive(Debug, Clone)]
pub struct PluginErrorEntry {
    pub plugin: String,
    pub http_status: u16,
    pub message: String,
}

struct RestRoute {
    pattern: Regex,
    callback: RestCallback,
    mutual_exclusion: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    // the service dispatcher serializes on this lock; observers called
    // through it may re-enter the index, which has its own lock
    dispatch_lock: Mutex<()>,
    rest_routes: RwLock<Vec<RestRoute>>,
    // serializes REST callbacks registered with mutual exclusion
    rest_exclusion: Mutex<()>,
    on_stored: RwLock<Vec<OnStoredCallback>>,
    on_change: RwLock<Vec<OnChangeCallback>>,
    worklist: Mutex<Option<Arc<dyn WorklistHandler>>>,
    decoder: Mutex<Option<Arc<dyn ImageDecoder>>>,
    storage_area: Mutex<Option<Arc<dyn StorageArea>>>,
    database: Mutex<Option<Box<dyn IndexDatabase>>>,
    errors: RwLock<HashMap<i64, PluginErrorEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Route an HTTP request to a plugin callback. `None` when no registered
    /// pattern matches the URI.
    pub fn handle_rest(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Option<VaultResult<RestResponse>> {
        let routes = self.rest_routes.read().unwrap_or_else(|p| p.into_inner());
        for route in routes.iter() {
            if let Some(captures) = route.pattern.captures(uri) {
                let groups = captures
                    .iter()
                    .skip(1)
                    .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                let request = RestRequest {
                    method: method.to_string(),
                    uri: uri.to_string(),
                    body: body.to_vec(),
                    groups,
                };
                let result = if route.mutual_exclusion {
                    let _guard = self
                        .rest_exclusion
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    (route.callback)(&request)
                } else {
                    (route.callback)(&request)
                };
                return Some(result);
            }
        }
        None
    }

    pub fn register_rest_callback(
        &self,
        pattern: &str,
        mutual_exclusion: bool,
        callback: RestCallback,
    ) -> VaultResult<()> {
        let pattern = Regex::new(&format!("^{}$", pattern)).map_err(|e| VaultError::Plugin {
            message: format!("invalid REST route pattern \"{}\": {}", pattern, e),
        })?;
        info!("Plugin REST route registered: {}", pattern.as_str());
        self.rest_routes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(RestRoute {
                pattern,
                callback,
                mutual_exclusion,
            });
        Ok(())
    }

    pub fn register_on_stored(&self, callback: OnStoredCallback) {
        self.on_stored
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    pub fn register_on_change(&self, callback: OnChangeCallback) {
        self.on_change
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    /// Register the worklist handler. A second registration fails.
    pub fn register_worklist(&self, handler: Arc<dyn WorklistHandler>) -> VaultResult<()> {
        let mut slot = self.worklist.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(VaultError::Plugin {
                message: "a worklist handler is already registered".to_string(),
            });
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn worklist_handler(&self) -> Option<Arc<dyn WorklistHandler>> {
        self.worklist
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Register the image decoder override. A second registration fails.
    pub fn register_decoder(&self, decoder: Arc<dyn ImageDecoder>) -> VaultResult<()> {
        let mut slot = self.decoder.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(VaultError::Plugin {
                message: "an image decoder is already registered".to_string(),
            });
        }
        *slot = Some(decoder);
        Ok(())
    }

    pub fn image_decoder(&self) -> Option<Arc<dyn ImageDecoder>> {
        self.decoder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Substitute the process storage area. A second registration fails.
    pub fn register_storage_area(&self, area: Arc<dyn StorageArea>) -> VaultResult<()> {
        let mut slot = self.storage_area.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(VaultError::Plugin {
                message: "a storage area is already registered".to_string(),
            });
        }
        *slot = Some(area);
        Ok(())
    }

    pub fn take_storage_area(&self) -> Option<Arc<dyn StorageArea>> {
        self.storage_area
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Substitute the index back-end. A second registration fails.
    pub fn register_database(&self, database: Box<dyn IndexDatabase>) -> VaultResult<()> {
        let mut slot = self.database.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(VaultError::Plugin {
                message: "a database back-end is already registered".to_string(),
            });
        }
        *slot = Some(database);
        Ok(())
    }

    pub fn take_database(&self) -> Option<Box<dyn IndexDatabase>> {
        self.database
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Register a plugin error code. Codes start at [`PLUGIN_ERROR_BASE`].
    pub fn register_error_code(
        &self,
        code: i64,
        plugin: &str,
        http_status: u16,
        message: &str,
    ) -> VaultResult<()> {
        if code < PLUGIN_ERROR_BASE {
            return Err(VaultError::ParameterOutOfRange {
                message: format!(
                    "plugin error codes start at {} (got {})",
                    PLUGIN_ERROR_BASE, code
                ),
            });
        }
        let mut errors = self.errors.write().unwrap_or_else(|p| p.into_inner());
        if errors.contains_key(&code) {
            return Err(VaultError::Plugin {
                message: format!("plugin error code {} is already registered", code),
            });
        }
        errors.insert(
            code,
            PluginErrorEntry {
                plugin: plugin.to_string(),
                http_status,
                message: message.to_string(),
            },
        );
        Ok(())
    }

    pub fn lookup_error(&self, code: i64) -> Option<PluginErrorEntry> {
        self.errors
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&code)
            .cloned()
    }

    /// Notify every on-stored observer, in registration order. Observer
    /// failures are logged and swallowed: the ingestion has already
    /// committed.
    pub fn notify_stored(&self, instance: &StoredInstance) {
        let callbacks = self.on_stored.read().unwrap_or_else(|p| p.into_inner());
        for callback in callbacks.iter() {
            if let Err(e) = callback(instance) {
                self.log_callback_error("on-stored", &e);
            }
        }
    }

    /// Notify every on-change observer, in registration order.
    pub fn notify_change(&self, event: &ChangeEvent) {
        let callbacks = self.on_change.read().unwrap_or_else(|p| p.into_inner());
        for callback in callbacks.iter() {
            if let Err(e) = callback(event) {
                self.log_callback_error("on-change", &e);
            }
        }
    }

    fn log_callback_error(&self, what: &str, error: &VaultError) {
        if let VaultError::PluginDefined { code } = error {
            if let Some(entry) = self.lookup_error(*code) {
                error!(
                    "Error in {} callback of plugin \"{}\": {} (code {})",
                    what, entry.plugin, entry.message, code
                );
                return;
            }
        }
        error!("Error in {} callback: {}", what, error);
    }

    /// The service dispatcher. Every service serializes on the dispatch
    /// lock, except `DatabaseAnswer`: it is invoked from inside a database
    /// callback whose caller already holds the index transaction, and
    /// serializing it here would deadlock.
    pub fn dispatch(&self, service: u32, request: ServiceRequest) -> VaultResult<()> {
        let service = ServiceId::from_u32(service)?;

        if service == ServiceId::DatabaseAnswer {
            return self.dispatch_unlocked(service, request);
        }

        let _guard = self.dispatch_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.dispatch_unlocked(service, request)
    }

    fn dispatch_unlocked(
        &self,
        service: ServiceId,
        request: ServiceRequest,
    ) -> VaultResult<()> {
        match (service, request) {
            (ServiceId::LogInfo, ServiceRequest::Log { message }) => {
                info!("{}", message);
                Ok(())
            }
            (ServiceId::LogWarning, ServiceRequest::Log { message }) => {
                warn!("{}", message);
                Ok(())
            }
            (ServiceId::LogError, ServiceRequest::Log { message }) => {
                error!("{}", message);
                Ok(())
            }
            (
                ServiceId::RegisterRestCallback,
                ServiceRequest::RestCallback {
                    pattern,
                    mutual_exclusion,
                    callback,
                },
            ) => self.register_rest_callback(&pattern, mutual_exclusion, callback),
            (ServiceId::RegisterOnStoredInstanceCallback, ServiceRequest::OnStored { callback }) => {
                self.register_on_stored(callback);
                Ok(())
            }
            (ServiceId::RegisterOnChangeCallback, ServiceRequest::OnChange { callback }) => {
                self.register_on_change(callback);
                Ok(())
            }
            (ServiceId::RegisterStorageArea, ServiceRequest::StorageArea { area }) => {
                self.register_storage_area(area)
            }
            (ServiceId::RegisterWorklistCallback, ServiceRequest::Worklist { handler }) => {
                self.register_worklist(handler)
            }
            (ServiceId::RegisterDecodeImageCallback, ServiceRequest::Decoder { decoder }) => {
                self.register_decoder(decoder)
            }
            (ServiceId::RegisterDatabaseBackend, ServiceRequest::Database { database }) => {
                self.register_database(database)
            }
            (
                ServiceId::RegisterErrorCode,
                ServiceRequest::ErrorCode {
                    code,
                    plugin,
                    http_status,
                    message,
                },
            ) => self.register_error_code(code, &plugin, http_status, &message),
            (ServiceId::DatabaseAnswer, ServiceRequest::DatabaseAnswer { .. }) => {
                // consumed by the database back-end driving the current
                // transaction; nothing to record at the registry level
                Ok(())
            }
            (service, _) => Err(VaultError::BadParameterType {
                message: format!("mismatched payload for service {:?}", service),
            }),
        }
    }
}

/// Typed payloads of [`PluginRegistry::dispatch`].
pub enum ServiceRequest {
    Log { message: String },
    RestCallback {
        pattern: String,
        mutual_exclusion: bool,
        callback: RestCallback,
    },
    OnStored { callback: OnStoredCallback },
    OnChange { callback: OnChangeCallback },
    StorageArea { area: Arc<dyn StorageArea> },
    Worklist { handler: Arc<dyn WorklistHandler> },
    Decoder { decoder: Arc<dyn ImageDecoder> },
    Database { database: Box<dyn IndexDatabase> },
    ErrorCode {
        code: i64,
        plugin: String,
        http_status: u16,
        message: String,
    },
    DatabaseAnswer { payload: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DummyWorklist;
    impl WorklistHandler for DummyWorklist {
        fn find(&self, _query: &InMemDicomObject) -> VaultResult<Vec<InMemDicomObject>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn worklist_slot_is_a_singleton() {
        let registry = PluginRegistry::new();
        registry.register_worklist(Arc::new(DummyWorklist)).unwrap();
        assert!(matches!(
            registry.register_worklist(Arc::new(DummyWorklist)),
            Err(VaultError::Plugin { .. })
        ));
        assert!(registry.worklist_handler().is_some());
    }

    #[test]
    fn rest_routes_match_and_capture() {
        let registry = PluginRegistry::new();
        registry
            .register_rest_callback(
                "/sample/(.*)",
                false,
                Box::new(|request| {
                    Ok(RestResponse {
                        status: 200,
                        content_type: "text/plain".to_string(),
                        body: request.groups[0].as_bytes().to_vec(),
                    })
                }),
            )
            .unwrap();

        let response = registry
            .handle_rest("GET", "/sample/hello", b"")
            .unwrap()
            .unwrap();
        assert_eq!(response.body, b"hello".to_vec());

        assert!(registry.handle_rest("GET", "/other", b"").is_none());
        // the pattern is anchored
        assert!(registry.handle_rest("GET", "/x/sample/hello", b"").is_none());
    }

    #[test]
    fn stored_observers_fire_in_registration_order() {
        let registry = PluginRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            registry.register_on_stored(Box::new(move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        registry.notify_stored(&StoredInstance {
            public_id: "id".to_string(),
            simplified_tags: serde_json::json!({}),
        });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn observer_errors_are_swallowed() {
        let registry = PluginRegistry::new();
        registry
            .register_error_code(PLUGIN_ERROR_BASE + 1, "sample-plugin", 500, "boom")
            .unwrap();

        let reached = Arc::new(AtomicUsize::new(0));
        registry.register_on_stored(Box::new(|_| {
            Err(VaultError::PluginDefined {
                code: PLUGIN_ERROR_BASE + 1,
            })
        }));
        {
            let reached = reached.clone();
            registry.register_on_stored(Box::new(move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        registry.notify_stored(&StoredInstance {
            public_id: "id".to_string(),
            simplified_tags: serde_json::json!({}),
        });
        // the second observer still ran
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_dictionary_validates_codes() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.register_error_code(10, "p", 400, "too low"),
            Err(VaultError::ParameterOutOfRange { .. })
        ));
        registry
            .register_error_code(PLUGIN_ERROR_BASE, "p", 418, "teapot")
            .unwrap();
        assert!(matches!(
            registry.register_error_code(PLUGIN_ERROR_BASE, "p", 418, "again"),
            Err(VaultError::Plugin { .. })
        ));
        let entry = registry.lookup_error(PLUGIN_ERROR_BASE).unwrap();
        assert_eq!(entry.http_status, 418);
    }

    #[test]
    fn dispatch_checks_service_ids() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.dispatch(
                999,
                ServiceRequest::Log {
                    message: "x".to_string()
                }
            ),
            Err(VaultError::UnknownPluginService { service: 999 })
        ));
        registry
            .dispatch(
                1,
                ServiceRequest::Log {
                    message: "hello".to_string(),
                },
            )
            .unwrap();
    }
}
