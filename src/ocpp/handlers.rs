//! Inbound OCPP 1.6 action handlers.
//!
//! Actions are dispatched by name from the session's receive loop. Payloads
//! are deserialized into `rust_ocpp::v1_6` types, applied to the store, and
//! answered with an OCPP-conformant reply frame.

use chrono::Utc;
use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::messages::boot_notification::{
    BootNotificationRequest, BootNotificationResponse,
};
use rust_ocpp::v1_6::messages::data_transfer::DataTransferResponse;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::messages::start_transaction::{
    StartTransactionRequest, StartTransactionResponse,
};
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v1_6::messages::stop_transaction::{
    StopTransactionRequest, StopTransactionResponse,
};
use rust_ocpp::v1_6::types::{
    AuthorizationStatus, ChargePointStatus, DataTransferStatus, IdTagInfo, Measurand, Phase,
    RegistrationStatus, SampledValue,
};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::model::{AuthOutcome, BootInfo, ConnectorStatus, Store};
use crate::support::frame::Frame;

/// Route one inbound call to its handler and produce the reply frame.
pub fn handle_call(
    store: &Store,
    charger_id: &str,
    unique_id: &str,
    action: &str,
    payload: &Value,
) -> Frame {
    match action {
        "BootNotification" => boot_notification(store, charger_id, unique_id, payload),
        "Heartbeat" => heartbeat(charger_id, unique_id),
        "Authorize" => authorize(store, charger_id, unique_id, payload),
        "MeterValues" => meter_values(store, charger_id, unique_id, payload),
        "StatusNotification" => status_notification(store, charger_id, unique_id, payload),
        "StartTransaction" => start_transaction(store, charger_id, unique_id, payload),
        "StopTransaction" => stop_transaction(store, charger_id, unique_id, payload),
        // Notifications we acknowledge without acting on.
        "DiagnosticsStatusNotification"
        | "FirmwareStatusNotification"
        | "SignedFirmwareStatusNotification"
        | "LogStatusNotification"
        | "SecurityEventNotification" => Frame::result(unique_id, serde_json::json!({})),
        "DataTransfer" => {
            let response = DataTransferResponse {
                status: DataTransferStatus::Rejected,
                data: Some("Not supported".to_string()),
            };
            reply(unique_id, &response)
        }
        other => {
            warn!(charger_id, action = other, "unhandled action");
            Frame::error(unique_id, "NotImplemented", format!("action {other} not implemented"))
        }
    }
}

fn reply<T: serde::Serialize>(unique_id: &str, response: &T) -> Frame {
    match serde_json::to_value(response) {
        Ok(payload) => Frame::result(unique_id, payload),
        Err(e) => {
            error!(error = %e, "failed to serialize reply");
            Frame::error(unique_id, "InternalError", "reply serialization failed")
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    charger_id: &str,
    action: &str,
    payload: &Value,
) -> Result<T, Frame> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        error!(charger_id, action, error = %e, "malformed payload");
        Frame::error("", "ProtocolError", format!("malformed {action} payload"))
    })
}

fn boot_notification(store: &Store, charger_id: &str, unique_id: &str, payload: &Value) -> Frame {
    let req: BootNotificationRequest = match parse(charger_id, "BootNotification", payload) {
        Ok(r) => r,
        Err(mut f) => return with_id(&mut f, unique_id),
    };
    info!(
        charger_id,
        vendor = req.charge_point_vendor.as_str(),
        model = req.charge_point_model.as_str(),
        "BootNotification"
    );
    let info = BootInfo {
        charge_point_vendor: req.charge_point_vendor,
        charge_point_model: req.charge_point_model,
        charge_box_serial_number: req.charge_box_serial_number,
        charge_point_serial_number: req.charge_point_serial_number,
        firmware_version: req.firmware_version,
        meter_type: req.meter_type,
    };
    if let Err(e) = store.boot_notification(charger_id, info) {
        error!(charger_id, error = %e, "BootNotification not applied");
    }
    let response = BootNotificationResponse {
        current_time: Utc::now(),
        interval: store.config().csms.heartbeat_interval as _,
        status: RegistrationStatus::Accepted,
    };
    reply(unique_id, &response)
}

fn heartbeat(charger_id: &str, unique_id: &str) -> Frame {
    // last_update is refreshed for every message by the session loop.
    tracing::debug!(charger_id, "Heartbeat");
    reply(
        unique_id,
        &HeartbeatResponse {
            current_time: Utc::now(),
        },
    )
}

fn authorize(store: &Store, charger_id: &str, unique_id: &str, payload: &Value) -> Frame {
    let req: AuthorizeRequest = match parse(charger_id, "Authorize", payload) {
        Ok(r) => r,
        Err(mut f) => return with_id(&mut f, unique_id),
    };
    let id_tag_info = match store.authorize(charger_id, &req.id_tag) {
        AuthOutcome::Accepted { parent_id_tag } => IdTagInfo {
            status: AuthorizationStatus::Accepted,
            expiry_date: None,
            parent_id_tag,
        },
        AuthOutcome::Blocked => IdTagInfo {
            status: AuthorizationStatus::Blocked,
            expiry_date: None,
            parent_id_tag: None,
        },
        AuthOutcome::ConcurrentTx => IdTagInfo {
            status: AuthorizationStatus::ConcurrentTx,
            expiry_date: None,
            parent_id_tag: None,
        },
        AuthOutcome::Invalid => IdTagInfo {
            status: AuthorizationStatus::Invalid,
            expiry_date: None,
            parent_id_tag: None,
        },
    };
    reply(unique_id, &AuthorizeResponse { id_tag_info })
}

fn start_transaction(store: &Store, charger_id: &str, unique_id: &str, payload: &Value) -> Frame {
    let req: StartTransactionRequest = match parse(charger_id, "StartTransaction", payload) {
        Ok(r) => r,
        Err(mut f) => return with_id(&mut f, unique_id),
    };
    info!(
        charger_id,
        connector_id = req.connector_id,
        id_tag = req.id_tag.as_str(),
        meter_start = req.meter_start,
        "StartTransaction"
    );
    match store.start_transaction(
        charger_id,
        req.connector_id,
        &req.id_tag,
        req.meter_start as i64,
        req.timestamp,
    ) {
        Ok(transaction_id) => {
            // Authorization was already validated on the preceding Authorize
            // call; accept here.
            let response = StartTransactionResponse {
                transaction_id,
                id_tag_info: IdTagInfo {
                    status: AuthorizationStatus::Accepted,
                    expiry_date: None,
                    parent_id_tag: None,
                },
            };
            reply(unique_id, &response)
        }
        Err(e) => {
            error!(charger_id, error = %e, "StartTransaction failed");
            Frame::error(unique_id, "InternalError", e.to_string())
        }
    }
}

fn stop_transaction(store: &Store, charger_id: &str, unique_id: &str, payload: &Value) -> Frame {
    let req: StopTransactionRequest = match parse(charger_id, "StopTransaction", payload) {
        Ok(r) => r,
        Err(mut f) => return with_id(&mut f, unique_id),
    };
    info!(
        charger_id,
        transaction_id = req.transaction_id,
        meter_stop = req.meter_stop,
        reason = ?req.reason,
        "StopTransaction"
    );
    let reason = req.reason.map(|r| format!("{r:?}"));
    if let Err(e) = store.stop_transaction(
        charger_id,
        req.transaction_id,
        req.meter_stop as i64,
        req.timestamp,
        reason,
        req.id_tag,
    ) {
        // The charger considers the transaction over either way.
        warn!(charger_id, error = %e, "StopTransaction not applied");
    }
    reply(unique_id, &StopTransactionResponse { id_tag_info: None })
}

fn status_notification(store: &Store, charger_id: &str, unique_id: &str, payload: &Value) -> Frame {
    let req: StatusNotificationRequest = match parse(charger_id, "StatusNotification", payload) {
        Ok(r) => r,
        Err(mut f) => return with_id(&mut f, unique_id),
    };
    let status = map_status(&req.status);
    if let Err(e) = store.status_notification(charger_id, req.connector_id, status, Utc::now()) {
        error!(charger_id, connector_id = req.connector_id, error = %e, "StatusNotification not applied");
    }
    Frame::result(unique_id, serde_json::json!({}))
}

fn meter_values(store: &Store, charger_id: &str, unique_id: &str, payload: &Value) -> Frame {
    let req: MeterValuesRequest = match parse(charger_id, "MeterValues", payload) {
        Ok(r) => r,
        Err(mut f) => return with_id(&mut f, unique_id),
    };
    if let Some(meter_value) = req.meter_value.first() {
        let samples = &meter_value.sampled_value;
        let usage_meter = [Phase::L1, Phase::L2, Phase::L3]
            .into_iter()
            .map(|phase| {
                extract_sample(samples, &Measurand::CurrentImport, Some(phase)).unwrap_or(0.0)
            })
            .fold(0.0, f64::max);
        let energy_meter =
            extract_sample(samples, &Measurand::EnergyActiveImportRegister, None).map(|v| v as i64);
        let offered = extract_sample(samples, &Measurand::CurrentOffered, None);

        if let Err(e) = store.meter_values(
            charger_id,
            req.connector_id,
            usage_meter,
            energy_meter,
            offered,
            req.transaction_id,
            meter_value.timestamp,
            Utc::now(),
        ) {
            error!(charger_id, connector_id = req.connector_id, error = %e, "MeterValues not applied");
        }
    }
    Frame::result(unique_id, serde_json::json!({}))
}

/// Pull one sampled value by measurand and phase. A sample without a
/// measurand is the energy register, per OCPP defaulting.
fn extract_sample(
    samples: &[SampledValue],
    measurand: &Measurand,
    phase: Option<Phase>,
) -> Option<f64> {
    samples
        .iter()
        .find(|sv| {
            let sv_measurand = sv
                .measurand
                .clone()
                .unwrap_or(Measurand::EnergyActiveImportRegister);
            sv_measurand == *measurand && sv.phase == phase
        })
        .and_then(|sv| sv.value.parse().ok())
}

fn map_status(status: &ChargePointStatus) -> ConnectorStatus {
    match status {
        ChargePointStatus::Available => ConnectorStatus::Available,
        ChargePointStatus::Preparing => ConnectorStatus::Preparing,
        ChargePointStatus::Charging => ConnectorStatus::Charging,
        ChargePointStatus::SuspendedEV => ConnectorStatus::SuspendedEV,
        ChargePointStatus::SuspendedEVSE => ConnectorStatus::SuspendedEVSE,
        ChargePointStatus::Finishing => ConnectorStatus::Finishing,
        ChargePointStatus::Reserved => ConnectorStatus::Reserved,
        ChargePointStatus::Unavailable => ConnectorStatus::Unavailable,
        ChargePointStatus::Faulted => ConnectorStatus::Faulted,
    }
}

/// Parse-error frames are built before the unique id is known; patch it in.
fn with_id(frame: &mut Frame, unique_id: &str) -> Frame {
    if let Frame::CallError { unique_id: id, .. } = frame {
        *id = unique_id.to_string();
    }
    frame.clone()
}
