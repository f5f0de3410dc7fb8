//! C-MOVE sub-operations: pushing stored instances to a remote modality
//! over a client association.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::Pdu;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::RemoteModality;
use crate::errors::{VaultError, VaultResult};
use crate::server::ServerContext;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;

/// Push every listed instance to `modality`, one association per instance.
/// Returns `(completed, failed)` sub-operation counts.
pub async fn send_instances(
    context: &ServerContext,
    modality: &RemoteModality,
    instance_ids: &[String],
) -> (u16, u16) {
    let calling_aet = context.config.get_string("DicomAet", "VAULT");
    let mut completed: u16 = 0;
    let mut failed: u16 = 0;

    for public_id in instance_ids {
        match send_one(context, modality, &calling_aet, public_id).await {
            Ok(()) => completed = completed.saturating_add(1),
            Err(e) => {
                warn!("C-MOVE sub-operation for {} failed: {}", public_id, e);
                failed = failed.saturating_add(1);
            }
        }
    }

    (completed, failed)
}

async fn send_one(
    context: &ServerContext,
    modality: &RemoteModality,
    calling_aet: &str,
    public_id: &str,
) -> VaultResult<()> {
    let buffer = context.read_dicom_file(public_id)?;
    let object = dicom_object::from_reader(&buffer[..]).map_err(|e| VaultError::DicomFormat {
        message: e.to_string(),
    })?;

    let meta = object.meta();
    let sop_class_uid = meta
        .media_storage_sop_class_uid
        .trim_end_matches('\0')
        .to_string();
    let sop_instance_uid = meta
        .media_storage_sop_instance_uid
        .trim_end_matches('\0')
        .to_string();
    let ts_uid = meta.transfer_syntax.trim_end_matches('\0').to_string();

    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .ok_or_else(|| VaultError::DicomNetwork {
            message: format!("unsupported transfer syntax {}", ts_uid),
        })?;

    let address = format!("{}@{}:{}", modality.aet, modality.host, modality.port);
    debug!("Establishing association with '{}'", address);

    let mut scu = dicom_ul::association::ClientAssociationOptions::new()
        .calling_ae_title(calling_aet)
        .with_presentation_context(sop_class_uid.clone(), vec![ts_uid.clone()])
        .establish_with_async(&address)
        .await
        .map_err(|e| VaultError::DicomNetwork {
            message: format!("could not establish association with {}: {}", address, e),
        })?;

    let presentation_context = scu
        .presentation_contexts()
        .iter()
        .find(|pc| pc.transfer_syntax == ts_uid)
        .or_else(|| scu.presentation_contexts().first())
        .cloned()
        .ok_or_else(|| VaultError::DicomNetwork {
            message: "no presentation context accepted".to_string(),
        })?;

    let command = store_request(&sop_class_uid, &sop_instance_uid, 1);
    let mut command_data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(
            &mut command_data,
            &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| VaultError::Internal {
            message: format!("cannot write C-STORE command: {}", e),
        })?;

    let mut object_data = Vec::with_capacity(buffer.len());
    object
        .write_dataset_with_ts(&mut object_data, ts)
        .map_err(|e| VaultError::Internal {
            message: format!("cannot serialize instance: {}", e),
        })?;

    let total = command_data.len() + object_data.len();
    if total < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
        scu.send(&Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: presentation_context.id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: command_data,
                },
                PDataValue {
                    presentation_context_id: presentation_context.id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: object_data,
                },
            ],
        })
        .await
        .map_err(|e| VaultError::DicomNetwork {
            message: format!("failed to send C-STORE request: {}", e),
        })?;
    } else {
        scu.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: presentation_context.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_data,
            }],
        })
        .await
        .map_err(|e| VaultError::DicomNetwork {
            message: format!("failed to send C-STORE command: {}", e),
        })?;

        let mut pdata = scu.send_pdata(presentation_context.id);
        pdata
            .write_all(&object_data)
            .await
            .map_err(|e| VaultError::DicomNetwork {
                message: format!("failed to stream instance data: {}", e),
            })?;
    }

    let response = scu.receive().await.map_err(|e| VaultError::DicomNetwork {
        message: format!("no C-STORE response: {}", e),
    })?;

    let status = match response {
        Pdu::PData { data } => {
            let command = InMemDicomObject::read_dataset_with_ts(
                data[0].data.as_slice(),
                &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| VaultError::DicomFormat {
                message: format!("cannot read C-STORE response: {}", e),
            })?;
            command
                .element(tags::STATUS)
                .ok()
                .and_then(|e| e.uint16().ok())
                .unwrap_or(0xC000)
        }
        other => {
            let _ = scu.abort().await;
            return Err(VaultError::DicomNetwork {
                message: format!("unexpected response: {:?}", other),
            });
        }
    };

    let _ = scu.release().await;

    match status {
        0x0000 => Ok(()),
        status => Err(VaultError::DicomNetwork {
            message: format!("C-STORE failed with status 0x{:04x}", status),
        }),
    }
}

fn store_request(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_request_shape() {
        let command = store_request("1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", 9);
        assert_eq!(
            command
                .element(tags::COMMAND_FIELD)
                .unwrap()
                .uint16()
                .unwrap(),
            0x0001
        );
        assert_eq!(
            command.element(tags::MESSAGE_ID).unwrap().uint16().unwrap(),
            9
        );
        assert_eq!(
            command
                .element(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3.4"
        );
    }
}
