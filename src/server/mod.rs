//! The server context: the process-wide coordinator owning the index, the
//! storage area, the script engine and the plugin registry.
//!
//! The context enforces the two-phase coupling between index and blob store:
//! blobs are written before the index transaction that references them, and
//! removed only after the transaction that forgets them has committed.

pub mod filters;
pub mod ingest;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compression::{compute_md5, zlib_compress, zlib_uncompress, CompressionScheme};
use crate::config::Configuration;
use crate::errors::{VaultError, VaultResult};
use crate::index::{
    Attachment, ChangeEvent, ChangeKind, Index, MetadataKind, ResourceType, Statistics,
    StoreCaps, StoreStatus,
};
use crate::plugins::{PluginRegistry, StoredInstance};
use crate::scripting::{LuaEngine, ON_STORED_INSTANCE};
use crate::storage::{DicomlessStorage, FileContentKind, FilesystemStorage, StorageArea};

use ingest::{build_new_instance, simplified_json, InstanceToStore};

/// What the main loop should do once `wait_for_exit` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopping,
    Restarting,
}

/// Result of one ingestion, as reported to the protocol front-ends.
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub status: StoreStatus,
    pub instance_id: String,
    pub patient_id: String,
    pub study_id: String,
    pub series_id: String,
}

pub struct ServerContext {
    pub index: Index,
    storage: Arc<dyn StorageArea>,
    pub lua: LuaEngine,
    pub plugins: Arc<PluginRegistry>,
    pub config: Arc<Configuration>,
    compression: CompressionScheme,
    store_md5: bool,
    caps: StoreCaps,
    stable_age: Duration,
    // resources awaiting their stable event, with the time of last activity
    stable_candidates: Mutex<HashMap<(ResourceType, String), Instant>>,
    signal: watch::Sender<RunState>,
}

impl ServerContext {
    /// Assemble the context from the configuration. Plugin-registered
    /// substitutes for the storage area and the database take precedence
    /// over the built-in ones.
    pub fn create(
        config: Arc<Configuration>,
        plugins: Arc<PluginRegistry>,
        allow_upgrade: bool,
    ) -> VaultResult<Self> {
        crate::dictionary::register_from_configuration(&config)?;

        let storage_root = PathBuf::from(config.get_string("StorageDirectory", "VaultStorage"));
        let index_root =
            PathBuf::from(config.get_string("IndexDirectory",
                &storage_root.display().to_string()));

        let index = match plugins.take_database() {
            Some(database) => Index::new(database),
            None => Index::open(&index_root.join("index.db"), allow_upgrade)?,
        };

        let mut storage: Arc<dyn StorageArea> = match plugins.take_storage_area() {
            Some(area) => area,
            None => Arc::new(FilesystemStorage::new(&storage_root)?),
        };
        if !config.get_bool("StoreDicom", true) {
            warn!("The DICOM files will not be stored (StoreDicom is disabled)");
            storage = Arc::new(DicomlessStorage::new(storage));
        }

        let compression = if config.get_bool("StorageCompression", false) {
            CompressionScheme::ZlibWithSize
        } else {
            CompressionScheme::None
        };

        let caps = StoreCaps {
            maximum_storage_size: config.get_unsigned("MaximumStorageSize", 0) * 1024 * 1024,
            maximum_patient_count: config.get_unsigned("MaximumPatientCount", 0),
        };
        if caps.maximum_storage_size != 0 {
            info!(
                "At most {} MB will be used for the storage area",
                caps.maximum_storage_size / (1024 * 1024)
            );
        }
        if caps.maximum_patient_count != 0 {
            info!(
                "At most {} patients will be kept in the storage area",
                caps.maximum_patient_count
            );
        }

        let lua = LuaEngine::new()?;
        lua.load_scripts(&config.get_list_of_strings("LuaScripts"))?;

        let (signal, _) = watch::channel(RunState::Running);

        let context = ServerContext {
            index,
            storage,
            lua,
            plugins,
            store_md5: config.get_bool("StoreMD5ForAttachments", true),
            stable_age: Duration::from_secs(config.get_unsigned("StableAge", 60)),
            stable_candidates: Mutex::new(HashMap::new()),
            compression,
            caps,
            config,
            signal,
        };

        context.sweep_orphan_blobs()?;
        Ok(context)
    }

    /// Remove blobs present in the storage area but referenced by no
    /// attachment, left behind by a crash between an index commit and the
    /// corresponding blob removal.
    fn sweep_orphan_blobs(&self) -> VaultResult<()> {
        let stored = self.storage.list_all_uuids()?;
        if stored.is_empty() {
            return Ok(());
        }
        let referenced: std::collections::HashSet<String> =
            self.index.all_attachment_uuids()?.into_iter().collect();
        let mut swept = 0usize;
        for uuid in stored {
            if !referenced.contains(&uuid) {
                self.storage.remove(&uuid, FileContentKind::Dicom)?;
                swept += 1;
            }
        }
        if swept > 0 {
            warn!("Removed {} orphaned files from the storage area", swept);
        }
        Ok(())
    }

    /// Ingest one instance: write the blobs, record the resource tree, then
    /// notify the observers of everything that became visible.
    pub fn store(&self, instance: InstanceToStore) -> VaultResult<StoreResult> {
        let mut request = build_new_instance(&instance.object)?;
        let simplified = simplified_json(&instance.object);

        let result = StoreResult {
            status: StoreStatus::Success,
            instance_id: request.instance.public_id.clone(),
            patient_id: request.patient.public_id.clone(),
            study_id: request.study.public_id.clone(),
            series_id: request.series.public_id.clone(),
        };

        let json = serde_json::to_vec(&dicom_json::to_value(&instance.object).map_err(
            |e| VaultError::Internal {
                message: format!("cannot build the DICOM JSON summary: {}", e),
            },
        )?)?;

        // blobs are written before the transaction that references them;
        // the failure path removes them
        let mut written = Vec::new();
        let dicom = self.write_blob(&instance.buffer, FileContentKind::Dicom, &mut written)?;
        let json = self.write_blob(&json, FileContentKind::DicomAsJson, &mut written)?;
        request.attachments = vec![dicom, json];

        request.metadata = self.instance_metadata(&instance);

        let outcome = match self.index.store_instance(request, self.caps) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.remove_blobs(&written);
                return Err(error);
            }
        };

        if outcome.status == StoreStatus::AlreadyStored {
            // another front-end won the race; our blobs are unreferenced
            self.remove_blobs(&written);
            return Ok(StoreResult {
                status: StoreStatus::AlreadyStored,
                ..result
            });
        }

        info!("New instance stored: {}", result.instance_id);

        // post-commit: recycled blobs go away, observers are told
        for attachment in &outcome.deleted_files {
            if let Err(e) = self.storage.remove(&attachment.uuid, attachment.kind) {
                warn!("Cannot remove recycled attachment {}: {}", attachment.uuid, e);
            }
        }

        self.mark_activity(&result);
        self.notify_events(&outcome.events);

        let stored = StoredInstance {
            public_id: result.instance_id.clone(),
            simplified_tags: simplified,
        };
        self.plugins.notify_stored(&stored);

        {
            let lua = self.lua.lock();
            if lua.has_function(ON_STORED_INSTANCE) {
                if let Err(e) =
                    lua.call_on_stored(&stored.public_id, &stored.simplified_tags)
                {
                    error!("Error in the Lua OnStoredInstance hook: {}", e);
                }
            }
        }

        Ok(result)
    }

    fn instance_metadata(&self, instance: &InstanceToStore) -> Vec<(MetadataKind, String)> {
        let mut metadata = vec![
            (
                MetadataKind::ReceptionDate,
                chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string(),
            ),
            (MetadataKind::Origin, instance.origin.kind.name().to_string()),
        ];
        if !instance.origin.remote_aet.is_empty() {
            metadata.push((MetadataKind::RemoteAet, instance.origin.remote_aet.clone()));
        }
        if !instance.origin.called_aet.is_empty() {
            metadata.push((MetadataKind::CalledAet, instance.origin.called_aet.clone()));
        }
        if let Ok(element) = instance.object.element(dicom_dictionary_std::tags::INSTANCE_NUMBER)
        {
            if let Ok(value) = element.to_str() {
                let value = value.trim().to_string();
                if !value.is_empty() {
                    metadata.push((MetadataKind::IndexInSeries, value));
                }
            }
        }
        metadata
    }

    fn write_blob(
        &self,
        content: &[u8],
        kind: FileContentKind,
        written: &mut Vec<Attachment>,
    ) -> VaultResult<Attachment> {
        let uuid = Uuid::new_v4().to_string();
        let uncompressed_md5 = if self.store_md5 {
            compute_md5(content)
        } else {
            String::new()
        };

        let (stored, compression) = match self.compression {
            CompressionScheme::None => (content.to_vec(), CompressionScheme::None),
            CompressionScheme::ZlibWithSize => {
                let compressed = zlib_compress(content)?;
                // do not pay the zlib overhead on incompressible content
                if compressed.len() < content.len() {
                    (compressed, CompressionScheme::ZlibWithSize)
                } else {
                    (content.to_vec(), CompressionScheme::None)
                }
            }
        };

        let compressed_md5 = if self.store_md5 {
            compute_md5(&stored)
        } else {
            String::new()
        };

        self.storage.create(&uuid, &stored, kind)?;

        let attachment = Attachment {
            kind,
            uuid,
            compressed_size: stored.len() as u64,
            uncompressed_size: content.len() as u64,
            compression,
            compressed_md5,
            uncompressed_md5,
        };
        written.push(attachment.clone());
        Ok(attachment)
    }

    fn remove_blobs(&self, attachments: &[Attachment]) {
        for attachment in attachments {
            if let Err(e) = self.storage.remove(&attachment.uuid, attachment.kind) {
                warn!("Cannot remove unreferenced blob {}: {}", attachment.uuid, e);
            }
        }
    }

    /// Read an attachment back, undoing compression and verifying its
    /// integrity when MD5 recording is enabled.
    pub fn read_attachment(
        &self,
        public_id: &str,
        kind: FileContentKind,
    ) -> VaultResult<Vec<u8>> {
        let attachment = self.index.get_attachment(public_id, kind)?;
        let stored = self.storage.read(&attachment.uuid, kind)?;

        if !attachment.compressed_md5.is_empty()
            && compute_md5(&stored) != attachment.compressed_md5
        {
            return Err(VaultError::CorruptedFile {
                what: format!("attachment {} of {}", attachment.uuid, public_id),
            });
        }

        let content = match attachment.compression {
            CompressionScheme::None => stored,
            CompressionScheme::ZlibWithSize => zlib_uncompress(&stored)?,
        };

        if content.len() as u64 != attachment.uncompressed_size {
            return Err(VaultError::CorruptedFile {
                what: format!("attachment {} of {}", attachment.uuid, public_id),
            });
        }

        self.index.touch_access(public_id)?;
        Ok(content)
    }

    /// Convenience for the front-ends: the raw DICOM file of an instance.
    pub fn read_dicom_file(&self, public_id: &str) -> VaultResult<Vec<u8>> {
        self.read_attachment(public_id, FileContentKind::Dicom)
    }

    /// Detach a blob from a resource; its content is removed from the
    /// storage area once the index has forgotten it.
    pub fn delete_attachment(
        &self,
        public_id: &str,
        kind: FileContentKind,
    ) -> VaultResult<()> {
        let attachment = self.index.remove_attachment(public_id, kind)?;
        if let Err(e) = self.storage.remove(&attachment.uuid, attachment.kind) {
            warn!("Cannot remove attachment {}: {}", attachment.uuid, e);
        }
        Ok(())
    }

    /// Delete a resource and everything below it.
    pub fn delete_resource(&self, public_id: &str) -> VaultResult<()> {
        let (events, files) = self.index.delete_resource(public_id)?;
        for attachment in &files {
            if let Err(e) = self.storage.remove(&attachment.uuid, attachment.kind) {
                warn!("Cannot remove attachment {}: {}", attachment.uuid, e);
            }
        }
        {
            let mut candidates = self
                .stable_candidates
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            for event in &events {
                candidates.remove(&(event.resource_type, event.public_id.clone()));
            }
        }
        self.notify_events(&events);
        Ok(())
    }

    pub fn get_statistics(&self) -> VaultResult<Statistics> {
        self.index.statistics()
    }

    /// Append an out-of-transaction change (stable events, plugin-signalled
    /// changes) and fan it out to the observers.
    pub fn signal_change(
        &self,
        kind: ChangeKind,
        resource_type: ResourceType,
        public_id: &str,
    ) -> VaultResult<()> {
        let event = self.index.log_change(kind, resource_type, public_id)?;
        self.notify_events(std::slice::from_ref(&event));
        Ok(())
    }

    fn notify_events(&self, events: &[ChangeEvent]) {
        for event in events {
            self.plugins.notify_change(event);
        }
    }

    fn mark_activity(&self, result: &StoreResult) {
        let now = Instant::now();
        let mut candidates = self
            .stable_candidates
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        candidates.insert((ResourceType::Patient, result.patient_id.clone()), now);
        candidates.insert((ResourceType::Study, result.study_id.clone()), now);
        candidates.insert((ResourceType::Series, result.series_id.clone()), now);
    }

    /// Emit the stable events of every resource idle for longer than the
    /// configured age. Invoked periodically by the monitor task.
    pub fn flush_stable_resources(&self) {
        let expired: Vec<(ResourceType, String)> = {
            let mut candidates = self
                .stable_candidates
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let expired: Vec<(ResourceType, String)> = candidates
                .iter()
                .filter(|(_, last)| now.duration_since(**last) >= self.stable_age)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                candidates.remove(key);
            }
            expired
        };

        for (resource_type, public_id) in expired {
            let kind = match resource_type {
                ResourceType::Patient => ChangeKind::StablePatient,
                ResourceType::Study => ChangeKind::StableStudy,
                ResourceType::Series => ChangeKind::StableSeries,
                ResourceType::Instance => continue,
            };
            debug!("Resource is now stable: {}", public_id);
            if let Err(e) = self.signal_change(kind, resource_type, &public_id) {
                warn!("Cannot signal a stable resource: {}", e);
            }
        }
    }

    /// Background task emitting the stable-resource events. Polls the
    /// shutdown flag between iterations.
    pub async fn run_stable_monitor(self: Arc<Self>) {
        let mut rx = self.signal.subscribe();
        loop {
            tokio::select! {
                _ = rx.changed() => {
                    if *rx.borrow() != RunState::Running {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    self.flush_stable_resources();
                }
            }
        }
    }

    /// Render one frame of an instance as a PNG image. A plugin-registered
    /// decoder is tried first; if it declines, the built-in decoder runs.
    pub fn decode_frame_png(&self, public_id: &str, frame: u32) -> VaultResult<Vec<u8>> {
        let dicom = self.read_dicom_file(public_id)?;

        if let Some(decoder) = self.plugins.image_decoder() {
            if let Some(decoded) = decoder.decode(&dicom, frame)? {
                let image = image::GrayImage::from_raw(
                    decoded.width,
                    decoded.height,
                    decoded.pixels,
                )
                .ok_or_else(|| VaultError::IncompatibleImageSize {
                    message: "plugin decoder returned a truncated frame".to_string(),
                })?;
                return encode_png(image::DynamicImage::ImageLuma8(image));
            }
        }

        let object =
            dicom_object::from_reader(&dicom[..]).map_err(|e| VaultError::DicomFormat {
                message: e.to_string(),
            })?;
        use dicom_pixeldata::PixelDecoder;
        let decoded = object
            .decode_pixel_data()
            .map_err(|e| VaultError::IncompatibleImageFormat {
                message: e.to_string(),
            })?;
        let image = decoded
            .to_dynamic_image(frame)
            .map_err(|e| VaultError::IncompatibleImageFormat {
                message: e.to_string(),
            })?;
        encode_png(image)
    }

    pub fn stop(&self) {
        info!("Stopping the server");
        self.signal.send_replace(RunState::Stopping);
    }

    /// Tear everything down and reconstruct from a fresh configuration.
    pub fn reset(&self) {
        warn!("Reset request received, restarting the server");
        self.signal.send_replace(RunState::Restarting);
    }

    pub fn is_running(&self) -> bool {
        *self.signal.borrow() == RunState::Running
    }

    /// Block until a stop or reset is signalled. Returns `true` when the
    /// caller should rebuild the whole pipeline instead of exiting.
    pub async fn wait_for_exit(&self) -> bool {
        let mut rx = self.signal.subscribe();
        loop {
            match *rx.borrow_and_update() {
                RunState::Running => {}
                RunState::Stopping => return false,
                RunState::Restarting => return true,
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Run the Lua `Finalize` hook; called right before tear-down.
    pub fn finalize(&self) {
        self.lua.finalize();
    }
}

fn encode_png(image: image::DynamicImage) -> VaultResult<Vec<u8>> {
    let mut png = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| VaultError::Internal {
            message: format!("cannot encode PNG: {}", e),
        })?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::{tags, uids};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use super::ingest::Origin;

    fn synthesize_dicom(patient: &str, study: &str, series: &str, sop: &str) -> Vec<u8> {
        let object = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study)),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series)),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "DOE^JOHN")),
            DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "CT")),
        ]);
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop)
            .transfer_syntax("1.2.840.10008.1.2.1")
            .build()
            .unwrap();
        let file = object.with_exact_meta(meta);
        let mut buffer = Vec::new();
        file.write_all(&mut buffer).unwrap();
        buffer
    }

    fn test_context(extra: serde_json::Value) -> (tempfile::TempDir, ServerContext) {
        let dir = tempfile::tempdir().unwrap();
        let mut root = serde_json::json!({
            "StorageDirectory": dir.path().join("storage").display().to_string(),
            "IndexDirectory": dir.path().join("index").display().to_string(),
        });
        if let (Some(root), Some(extra)) = (root.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                root.insert(key.clone(), value.clone());
            }
        }
        let config = Arc::new(Configuration::from_json(root).unwrap());
        let context =
            ServerContext::create(config, Arc::new(PluginRegistry::new()), false).unwrap();
        (dir, context)
    }

    fn store(context: &ServerContext, buffer: Vec<u8>) -> VaultResult<StoreResult> {
        let instance = InstanceToStore::parse(buffer, Origin::rest_api("127.0.0.1"))?;
        context.store(instance)
    }

    #[test]
    fn store_and_read_back() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let buffer = synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");

        let result = store(&context, buffer.clone()).unwrap();
        assert_eq!(result.status, StoreStatus::Success);

        let read = context.read_dicom_file(&result.instance_id).unwrap();
        assert_eq!(read, buffer);

        let json = context
            .read_attachment(&result.instance_id, FileContentKind::DicomAsJson)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert!(value.is_object());
    }

    #[test]
    fn second_store_is_already_stored() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let buffer = synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");

        let first = store(&context, buffer.clone()).unwrap();
        let second = store(&context, buffer).unwrap();

        assert_eq!(second.status, StoreStatus::AlreadyStored);
        assert_eq!(second.instance_id, first.instance_id);
        assert_eq!(second.patient_id, first.patient_id);
        assert_eq!(context.get_statistics().unwrap().instances, 1);
    }

    #[test]
    fn storage_compression_round_trips() {
        let (_dir, context) = test_context(serde_json::json!({
            "StorageCompression": true
        }));
        let buffer = synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5");

        let result = store(&context, buffer.clone()).unwrap();
        assert_eq!(context.read_dicom_file(&result.instance_id).unwrap(), buffer);
    }

    #[test]
    fn deleting_a_patient_removes_blobs() {
        let (_dir, context) = test_context(serde_json::json!({}));
        let result = store(
            &context,
            synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5"),
        )
        .unwrap();

        context.delete_resource(&result.patient_id).unwrap();
        assert!(matches!(
            context.read_dicom_file(&result.instance_id),
            Err(VaultError::UnknownResource { .. })
        ));
        assert_eq!(context.get_statistics().unwrap().total_disk_size, 0);
    }

    #[test]
    fn patient_cap_keeps_the_most_recent() {
        let (_dir, context) = test_context(serde_json::json!({
            "MaximumPatientCount": 1
        }));
        store(&context, synthesize_dicom("P1", "1.2.1", "1.2.1.1", "1.2.1.1.1")).unwrap();
        let second =
            store(&context, synthesize_dicom("P2", "1.2.2", "1.2.2.1", "1.2.2.1.1")).unwrap();

        let patients = context.index.list_resources(ResourceType::Patient).unwrap();
        assert_eq!(patients, vec![second.patient_id]);
    }

    #[test]
    fn protected_patient_blocks_ingestion_under_cap() {
        let (_dir, context) = test_context(serde_json::json!({
            "MaximumPatientCount": 1
        }));
        let first =
            store(&context, synthesize_dicom("P1", "1.2.1", "1.2.1.1", "1.2.1.1.1")).unwrap();
        context.index.set_protected(&first.patient_id, true).unwrap();

        let result = store(&context, synthesize_dicom("P2", "1.2.2", "1.2.2.1", "1.2.2.1.1"));
        assert!(matches!(result, Err(VaultError::FullStorage)));

        // the rejected instance left nothing behind, including blobs
        let stats = context.get_statistics().unwrap();
        assert_eq!(stats.patients, 1);
        assert_eq!(stats.instances, 1);
    }

    #[test]
    fn lua_hook_observes_committed_instances() {
        let (_dir, context) = test_context(serde_json::json!({}));
        context
            .lua
            .lock()
            .execute(
                "stored = nil
                 function OnStoredInstance(id, tags) stored = tags.PatientID end",
            )
            .unwrap();

        store(&context, synthesize_dicom("P42", "1.2.3", "1.2.3.4", "1.2.3.4.5")).unwrap();
        context
            .lua
            .lock()
            .execute("assert(stored == 'P42', tostring(stored))")
            .unwrap();
    }

    #[test]
    fn failing_observer_does_not_prevent_storage() {
        let (_dir, context) = test_context(serde_json::json!({}));
        context.plugins.register_on_stored(Box::new(|_| {
            Err(VaultError::PluginDefined { code: 1_000_001 })
        }));

        let result = store(
            &context,
            synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5"),
        )
        .unwrap();
        assert_eq!(result.status, StoreStatus::Success);
        assert!(context.index.lookup(&result.instance_id).unwrap().is_some());
    }

    #[test]
    fn stable_events_fire_after_quiescence() {
        let (_dir, context) = test_context(serde_json::json!({
            "StableAge": 0
        }));
        store(&context, synthesize_dicom("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5")).unwrap();

        context.flush_stable_resources();

        let (events, _) = context.index.get_changes(0, 100).unwrap();
        let kinds: Vec<ChangeKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ChangeKind::StablePatient));
        assert!(kinds.contains(&ChangeKind::StableStudy));
        assert!(kinds.contains(&ChangeKind::StableSeries));
    }

    #[test]
    fn restart_barrier_signals() {
        let (_dir, context) = test_context(serde_json::json!({}));
        assert!(context.is_running());
        context.reset();
        assert!(!context.is_running());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        assert!(runtime.block_on(context.wait_for_exit()));
    }
}
