//! The DICOM upper-layer front-end.
//!
//! One tokio task per association. C-STORE feeds the ingestion pipeline,
//! C-FIND queries the index, C-MOVE pushes matched instances to a known
//! modality over a client association, and worklist queries are delegated
//! to the plugin-registered handler. Transfer-syntax negotiation honors the
//! configured gates and their scripted overrides.

pub mod find;
mod move_scu;

use std::sync::Arc;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{pdu::PDataValueType, Pdu};
use tracing::{debug, error, info, warn};

use crate::errors::{VaultError, VaultResult};
use crate::index::StoreStatus;
use crate::server::filters::{ApplicationEntityFilter, DicomRequestType, TransferSyntaxGroup};
use crate::server::ingest::{InstanceToStore, Origin};
use crate::server::ServerContext;

/// The storage SOP classes this server accepts.
#[allow(deprecated)]
pub static STORAGE_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::MR_SPECTROSCOPY_STORAGE,
    uids::ENHANCED_MR_COLOR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE_RETIRED,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE_RETIRED,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_SINGLE_BIT_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
    uids::BREAST_PROJECTION_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::BREAST_PROJECTION_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::ENHANCED_PET_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE_RETIRED,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
    uids::ENCAPSULATED_CDA_STORAGE,
    uids::ENCAPSULATED_STL_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
];

type Association = dicom_ul::association::server::AsyncServerAssociation<tokio::net::TcpStream>;

/// A DIMSE command whose dataset has not arrived yet.
enum PendingCommand {
    None,
    Store {
        message_id: u16,
        sop_class_uid: String,
        sop_instance_uid: String,
    },
    Find {
        message_id: u16,
        sop_class_uid: String,
        allowed: bool,
    },
    Move {
        message_id: u16,
        sop_class_uid: String,
        destination: String,
        allowed: bool,
    },
}

/// Run the DICOM server until the context signals a stop or a reset.
pub async fn run_dicom_server(context: Arc<ServerContext>) -> VaultResult<()> {
    let port = context.config.get_unsigned("DicomPort", 4242) as u16;
    let aet = context.config.get_string("DicomAet", "VAULT");

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| VaultError::NetworkProtocol {
            message: format!("cannot bind DICOM port {}: {}", port, e),
        })?;
    info!("DICOM server {} listening on port {}", aet, port);

    let exit_context = context.clone();
    loop {
        tokio::select! {
            _ = exit_context.wait_for_exit() => {
                break;
            }
            result = listener.accept() => {
                let (socket, peer) = result.map_err(|e| VaultError::NetworkProtocol {
                    message: format!("cannot accept DICOM association: {}", e),
                })?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_association(context, socket, peer).await {
                        warn!("DICOM association from {} failed: {}", peer, e);
                    }
                });
            }
        }
    }

    info!("DICOM server has stopped");
    Ok(())
}

async fn handle_association(
    context: Arc<ServerContext>,
    socket: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) -> VaultResult<()> {
    let remote_ip = peer.ip().to_string();
    let aet = context.config.get_string("DicomAet", "VAULT");
    let filter = ApplicationEntityFilter::new(&context);

    if !filter.is_allowed_connection(&remote_ip, "", &aet) {
        return Err(VaultError::Unauthorized);
    }

    let mut options = dicom_ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(aet.clone())
        .max_pdu_length(context.config.get_unsigned("MaximumPduLength", 16384) as u32);

    if filter.is_unknown_sop_class_accepted(&remote_ip, "", &aet) {
        options = options.promiscuous(true);
    }

    // the remote AET is only known after negotiation; the transfer-syntax
    // gates are evaluated against the peer address
    for ts in TransferSyntaxRegistry.iter() {
        if ts.is_unsupported() {
            continue;
        }
        let accepted = match TransferSyntaxGroup::of_uid(ts.uid()) {
            None => true,
            Some(group) => {
                filter.is_allowed_transfer_syntax(&remote_ip, "", &aet, group)
            }
        };
        if accepted {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    for uid in STORAGE_ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }
    options = options
        .with_abstract_syntax(uids::VERIFICATION)
        .with_abstract_syntax(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .with_abstract_syntax(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE);
    if context.plugins.worklist_handler().is_some() {
        options = options.with_abstract_syntax(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND);
    }

    let mut association = options
        .establish_async(socket)
        .await
        .map_err(|e| VaultError::DicomNetwork {
            message: format!("could not establish association: {}", e),
        })?;

    let remote_aet = association.client_ae_title().to_string();
    info!("New association from {} ({})", remote_aet, remote_ip);

    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut pending = PendingCommand::None;

    loop {
        match association.receive().await {
            Ok(mut pdu) => match pdu {
                Pdu::PData { ref mut data } => {
                    if data.is_empty() {
                        debug!("Ignoring empty PData PDU");
                        continue;
                    }

                    for data_value in data {
                        if data_value.value_type == PDataValueType::Data && !data_value.is_last
                        {
                            instance_buffer.append(&mut data_value.data);
                        } else if data_value.value_type == PDataValueType::Command
                            && data_value.is_last
                        {
                            // commands are always in implicit VR LE
                            let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                .erased();
                            let command = InMemDicomObject::read_dataset_with_ts(
                                data_value.data.as_slice(),
                                &ts,
                            )
                            .map_err(|e| VaultError::DicomFormat {
                                message: format!("cannot read DIMSE command: {}", e),
                            })?;

                            instance_buffer.clear();
                            pending = dispatch_command(
                                &filter,
                                &mut association,
                                data_value.presentation_context_id,
                                &command,
                                &remote_ip,
                                &remote_aet,
                                &aet,
                            )
                            .await?;
                        } else if data_value.value_type == PDataValueType::Data
                            && data_value.is_last
                        {
                            instance_buffer.append(&mut data_value.data);

                            let command = std::mem::replace(&mut pending, PendingCommand::None);
                            handle_dataset(
                                &context,
                                &mut association,
                                data_value.presentation_context_id,
                                command,
                                &instance_buffer,
                                &remote_ip,
                                &remote_aet,
                                &aet,
                            )
                            .await?;
                            instance_buffer.clear();
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    if let Err(e) = association.send(&Pdu::ReleaseRP).await {
                        warn!("Failed to send association release: {}", e);
                    }
                    info!("Released association with {}", remote_aet);
                    break;
                }
                Pdu::AbortRQ { source } => {
                    warn!("Aborted connection from: {:?}", source);
                    break;
                }
                _ => {}
            },
            Err(err) => {
                debug!("Association finished: {}", err);
                break;
            }
        }
    }

    Ok(())
}

/// React to a complete DIMSE command; returns the state awaiting a dataset.
#[allow(clippy::too_many_arguments)]
async fn dispatch_command(
    filter: &ApplicationEntityFilter<'_>,
    association: &mut Association,
    presentation_context_id: u8,
    command: &InMemDicomObject,
    remote_ip: &str,
    remote_aet: &str,
    called_aet: &str,
) -> VaultResult<PendingCommand> {
    let command_field = command
        .element(tags::COMMAND_FIELD)
        .ok()
        .and_then(|e| e.uint16().ok())
        .ok_or_else(|| VaultError::DicomFormat {
            message: "DIMSE command without a command field".to_string(),
        })?;
    let message_id = command
        .element(tags::MESSAGE_ID)
        .ok()
        .and_then(|e| e.uint16().ok())
        .unwrap_or(1);

    match command_field {
        // C-ECHO-RQ
        0x0030 => {
            let response = echo_response(message_id);
            send_command(association, presentation_context_id, &response).await?;
            Ok(PendingCommand::None)
        }
        // C-STORE-RQ
        0x0001 => Ok(PendingCommand::Store {
            message_id,
            sop_class_uid: string_element(command, tags::AFFECTED_SOP_CLASS_UID),
            sop_instance_uid: string_element(command, tags::AFFECTED_SOP_INSTANCE_UID),
        }),
        // C-FIND-RQ
        0x0020 => {
            let sop_class_uid = string_element(command, tags::AFFECTED_SOP_CLASS_UID);
            let request = if sop_class_uid == uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND {
                DicomRequestType::Worklist
            } else {
                DicomRequestType::Find
            };
            let allowed =
                filter.is_allowed_request(remote_ip, remote_aet, called_aet, request);
            Ok(PendingCommand::Find {
                message_id,
                sop_class_uid,
                allowed,
            })
        }
        // C-MOVE-RQ
        0x0021 => {
            let allowed = filter.is_allowed_request(
                remote_ip,
                remote_aet,
                called_aet,
                DicomRequestType::Move,
            );
            Ok(PendingCommand::Move {
                message_id,
                sop_class_uid: string_element(command, tags::AFFECTED_SOP_CLASS_UID),
                destination: string_element(command, tags::MOVE_DESTINATION),
                allowed,
            })
        }
        other => {
            warn!("Unsupported DIMSE command 0x{:04x}", other);
            Ok(PendingCommand::None)
        }
    }
}

/// React to the dataset completing a pending command.
#[allow(clippy::too_many_arguments)]
async fn handle_dataset(
    context: &Arc<ServerContext>,
    association: &mut Association,
    presentation_context_id: u8,
    pending: PendingCommand,
    buffer: &[u8],
    remote_ip: &str,
    remote_aet: &str,
    called_aet: &str,
) -> VaultResult<()> {
    let ts_uid = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .map(|pc| pc.transfer_syntax.clone())
        .ok_or_else(|| VaultError::DicomNetwork {
            message: "missing presentation context".to_string(),
        })?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| VaultError::DicomNetwork {
            message: format!("unsupported transfer syntax {}", ts_uid),
        })?;

    match pending {
        PendingCommand::None => {
            warn!("Received a dataset without a pending DIMSE command");
            Ok(())
        }

        PendingCommand::Store {
            message_id,
            sop_class_uid,
            sop_instance_uid,
        } => {
            let status = match InMemDicomObject::read_dataset_with_ts(buffer, ts) {
                Ok(object) => {
                    let meta = FileMetaTableBuilder::new()
                        .media_storage_sop_class_uid(sop_class_uid.trim_end_matches('\0'))
                        .media_storage_sop_instance_uid(
                            sop_instance_uid.trim_end_matches('\0'),
                        )
                        .transfer_syntax(ts.uid())
                        .build()
                        .map_err(|e| VaultError::DicomFormat {
                            message: format!("cannot build file meta: {}", e),
                        })?;
                    let file_object = object.with_exact_meta(meta);

                    let origin = Origin::dicom_protocol(remote_ip, remote_aet, called_aet);
                    match InstanceToStore::from_object(file_object, origin)
                        .and_then(|instance| context.store(instance))
                    {
                        Ok(stored) => {
                            if stored.status == StoreStatus::AlreadyStored {
                                debug!("Instance already stored: {}", stored.instance_id);
                            }
                            0x0000
                        }
                        Err(error) => store_error_status(&error),
                    }
                }
                Err(e) => {
                    error!("Cannot read the incoming instance: {}", e);
                    // cannot understand
                    0xC000
                }
            };

            let response =
                store_response(message_id, &sop_class_uid, &sop_instance_uid, status);
            send_command(association, presentation_context_id, &response).await
        }

        PendingCommand::Find {
            message_id,
            sop_class_uid,
            allowed,
        } => {
            if !allowed {
                // refused: not authorized
                let response = find_response(message_id, &sop_class_uid, 0xA700, false);
                return send_command(association, presentation_context_id, &response).await;
            }

            let identifier = InMemDicomObject::read_dataset_with_ts(buffer, ts)
                .map_err(|e| VaultError::DicomFormat {
                    message: format!("cannot read C-FIND identifier: {}", e),
                })?;

            let answers = if sop_class_uid == uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND {
                match context.plugins.worklist_handler() {
                    Some(handler) => handler.find(&identifier)?,
                    None => Vec::new(),
                }
            } else {
                let query = find::parse_query(&identifier)?;
                let limit = if query.level == crate::index::ResourceType::Instance {
                    context.config.get_unsigned("LimitFindInstances", 0)
                } else {
                    context.config.get_unsigned("LimitFindResults", 0)
                };
                let case_sensitive = context.config.get_bool("CaseSensitivePN", false);
                find::execute_find(&context.index, &query, case_sensitive, limit)?
            };

            debug!("C-FIND: {} answer(s)", answers.len());
            for answer in &answers {
                let response = find_response(message_id, &sop_class_uid, 0xFF00, true);
                send_command(association, presentation_context_id, &response).await?;
                send_dataset(association, presentation_context_id, answer, ts).await?;
            }

            let done = find_response(message_id, &sop_class_uid, 0x0000, false);
            send_command(association, presentation_context_id, &done).await
        }

        PendingCommand::Move {
            message_id,
            sop_class_uid,
            destination,
            allowed,
        } => {
            if !allowed {
                let response = move_response(message_id, &sop_class_uid, 0xA700, 0, 0);
                return send_command(association, presentation_context_id, &response).await;
            }

            let destination = destination.trim_end_matches('\0').trim().to_string();
            let modality = context
                .config
                .modalities()?
                .into_values()
                .find(|m| m.aet == destination);

            let modality = match modality {
                Some(modality) => modality,
                None => {
                    error!("C-MOVE to an unknown destination: \"{}\"", destination);
                    // refused: move destination unknown
                    let response = move_response(message_id, &sop_class_uid, 0xA801, 0, 0);
                    return send_command(association, presentation_context_id, &response)
                        .await;
                }
            };

            let identifier = InMemDicomObject::read_dataset_with_ts(buffer, ts)
                .map_err(|e| VaultError::DicomFormat {
                    message: format!("cannot read C-MOVE identifier: {}", e),
                })?;
            let query = find::parse_query(&identifier)?;
            let case_sensitive = context.config.get_bool("CaseSensitivePN", false);
            let resources =
                find::find_resource_ids(&context.index, &query, case_sensitive, 0)?;

            let mut instances = Vec::new();
            for public_id in &resources {
                collect_instances(&context.index, public_id, &mut instances)?;
            }

            info!(
                "C-MOVE of {} instance(s) to {} ({}:{})",
                instances.len(),
                modality.aet,
                modality.host,
                modality.port
            );
            let (completed, failed) =
                move_scu::send_instances(context, &modality, &instances).await;

            let status = if failed == 0 { 0x0000 } else { 0xB000 };
            let response = move_response(message_id, &sop_class_uid, status, completed, failed);
            send_command(association, presentation_context_id, &response).await
        }
    }
}

/// Map an ingestion failure to a C-STORE response status.
fn store_error_status(error: &VaultError) -> u16 {
    match error {
        // refused: out of resources
        VaultError::FullStorage => 0xA700,
        // error: cannot understand
        VaultError::DicomFormat { .. } | VaultError::InexistentTag { .. } => 0xC000,
        _ => 0x0110,
    }
}

/// Every instance below `public_id`, for C-MOVE sub-operations.
fn collect_instances(
    index: &crate::index::Index,
    public_id: &str,
    instances: &mut Vec<String>,
) -> VaultResult<()> {
    let json = index.resource_json(public_id)?;
    if json["Type"] == "Instance" {
        instances.push(public_id.to_string());
        return Ok(());
    }
    for key in ["Studies", "Series", "Instances"] {
        if let Some(children) = json[key].as_array() {
            for child in children {
                if let Some(child) = child.as_str() {
                    collect_instances(index, child, instances)?;
                }
            }
        }
    }
    Ok(())
}

fn string_element(object: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .unwrap_or_default()
}

async fn send_command(
    association: &mut Association,
    presentation_context_id: u8,
    command: &InMemDicomObject,
) -> VaultResult<()> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::new();
    command
        .write_dataset_with_ts(&mut data, &ts)
        .map_err(|e| VaultError::Internal {
            message: format!("cannot write DIMSE response: {}", e),
        })?;

    association
        .send(&Pdu::PData {
            data: vec![dicom_ul::pdu::PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data,
            }],
        })
        .await
        .map_err(|e| VaultError::DicomNetwork {
            message: format!("failed to send response: {}", e),
        })
}

async fn send_dataset(
    association: &mut Association,
    presentation_context_id: u8,
    dataset: &InMemDicomObject,
    ts: &dicom_encoding::transfer_syntax::TransferSyntax,
) -> VaultResult<()> {
    let mut data = Vec::new();
    dataset
        .write_dataset_with_ts(&mut data, ts)
        .map_err(|e| VaultError::Internal {
            message: format!("cannot write C-FIND answer: {}", e),
        })?;

    association
        .send(&Pdu::PData {
            data: vec![dicom_ul::pdu::PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data,
            }],
        })
        .await
        .map_err(|e| VaultError::DicomNetwork {
            message: format!("failed to send answer: {}", e),
        })
}

fn echo_response(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}

fn store_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn find_response(
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
    has_dataset: bool,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8020])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [if has_dataset { 0x0000 } else { 0x0101 }]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

fn move_response(
    message_id: u16,
    sop_class_uid: &str,
    status: u16,
    completed: u16,
    failed: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8021])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [failed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [0]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_statuses() {
        assert_eq!(store_error_status(&VaultError::FullStorage), 0xA700);
        assert_eq!(
            store_error_status(&VaultError::DicomFormat {
                message: "x".to_string()
            }),
            0xC000
        );
        assert_eq!(
            store_error_status(&VaultError::Internal {
                message: "x".to_string()
            }),
            0x0110
        );
    }

    #[test]
    fn echo_response_is_a_valid_command() {
        let response = echo_response(7);
        assert_eq!(
            response
                .element(tags::COMMAND_FIELD)
                .unwrap()
                .uint16()
                .unwrap(),
            0x8030
        );
        assert_eq!(
            response
                .element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
                .unwrap()
                .uint16()
                .unwrap(),
            7
        );
    }

    #[test]
    fn find_final_response_has_no_dataset() {
        let response = find_response(1, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND, 0x0000, false);
        assert_eq!(
            response
                .element(tags::COMMAND_DATA_SET_TYPE)
                .unwrap()
                .uint16()
                .unwrap(),
            0x0101
        );
        let pending = find_response(1, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND, 0xFF00, true);
        assert_eq!(
            pending
                .element(tags::COMMAND_DATA_SET_TYPE)
                .unwrap()
                .uint16()
                .unwrap(),
            0x0000
        );
    }

    #[test]
    fn collect_instances_walks_the_tree() {
        use crate::index::{Index, StoreCaps};
        let index = Index::open_in_memory().unwrap();

        let request = crate::index::NewInstance {
            patient: sample("p"),
            study: sample("st"),
            series: sample("se"),
            instance: sample("i"),
            attachments: Vec::new(),
            metadata: Vec::new(),
        };
        index.store_instance(request, StoreCaps::default()).unwrap();

        let mut instances = Vec::new();
        collect_instances(&index, "p", &mut instances).unwrap();
        assert_eq!(instances, vec!["i".to_string()]);
    }

    fn sample(public_id: &str) -> crate::index::ResourceData {
        crate::index::ResourceData {
            public_id: public_id.to_string(),
            main_tags: Vec::new(),
            identifiers: Vec::new(),
        }
    }
}
