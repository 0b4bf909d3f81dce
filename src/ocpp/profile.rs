//! Charging-profile driver.
//!
//! Translates engine intent into OCPP `SetChargingProfile` /
//! `ClearChargingProfile` calls with fixed id and stack-level conventions:
//!
//! | id | stack | purpose | role |
//! |----|-------|---------|------|
//! | 1  | 0     | TxDefaultProfile on connector 0 | base default, allows `min_allocation` |
//! | 2  | 1     | TxDefaultProfile per connector  | blocking default, limit 0, shadows the base |
//! | 3  | 3     | TxProfile per transaction       | the live allocation |
//!
//! Clearing profile 2 is the only way to *initiate* charging: a connector in
//! `SuspendedEVSE` has no transaction id, so a TxProfile is not addressable
//! until the charger starts one.
//!
//! Also carries the TriggerMessage / configuration / remote-control wrappers
//! the loop and the admin API send through the same serialized call path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::change_configuration::{
    ChangeConfigurationRequest, ChangeConfigurationResponse,
};
use rust_ocpp::v1_6::messages::clear_charging_profile::{
    ClearChargingProfileRequest, ClearChargingProfileResponse,
};
use rust_ocpp::v1_6::messages::get_configuration::{
    GetConfigurationRequest, GetConfigurationResponse,
};
use rust_ocpp::v1_6::messages::remote_start_transaction::{
    RemoteStartTransactionRequest, RemoteStartTransactionResponse,
};
use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};
use rust_ocpp::v1_6::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v1_6::messages::set_charging_profile::{
    SetChargingProfileRequest, SetChargingProfileResponse,
};
use rust_ocpp::v1_6::messages::trigger_message::{TriggerMessageRequest, TriggerMessageResponse};
use rust_ocpp::v1_6::messages::update_firmware::UpdateFirmwareRequest;
use rust_ocpp::v1_6::types::{
    ChargingProfile, ChargingProfileKindType, ChargingProfilePurposeType, ChargingProfileStatus,
    ChargingRateUnitType, ChargingSchedule, ChargingSchedulePeriod, ClearChargingProfileStatus,
    MessageTrigger, ResetRequestStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::calls::{CallError, CallSender};

const BASE_PROFILE_ID: i32 = 1;
const BLOCKING_PROFILE_ID: i32 = 2;
const TX_PROFILE_ID: i32 = 3;

/// Typed wrapper over [`CallSender`] for everything the engine and the API
/// send towards chargers.
pub struct ProfileDriver {
    calls: Arc<CallSender>,
    /// Limit of the base default profile (amps).
    min_allocation: f64,
}

impl ProfileDriver {
    pub fn new(calls: Arc<CallSender>, min_allocation: f64) -> Self {
        Self {
            calls,
            min_allocation,
        }
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        charger_id: &str,
        action: &str,
        request: &Req,
    ) -> Result<Resp, CallError> {
        let payload = serde_json::to_value(request)
            .map_err(|e| CallError::SendFailed(format!("serialization failed: {e}")))?;
        let result = self.calls.send_call(charger_id, action, payload).await?;
        serde_json::from_value(result)
            .map_err(|e| CallError::InvalidResponse(format!("failed to parse reply: {e}")))
    }

    fn single_period_profile(
        profile_id: i32,
        stack_level: u32,
        purpose: ChargingProfilePurposeType,
        limit: f64,
        transaction_id: Option<i32>,
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: profile_id,
            transaction_id,
            stack_level,
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKindType::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: None,
                start_schedule: None,
                charging_rate_unit: ChargingRateUnitType::A,
                charging_schedule_period: vec![ChargingSchedulePeriod {
                    start_period: 0,
                    limit: rust_decimal::Decimal::from_f64_retain(limit).unwrap_or_default(),
                    number_phases: None,
                }],
                min_charging_rate: None,
            },
        }
    }

    async fn set_profile(
        &self,
        charger_id: &str,
        connector_id: u32,
        profile: ChargingProfile,
    ) -> Result<(), CallError> {
        let request = SetChargingProfileRequest {
            connector_id: connector_id as i32,
            cs_charging_profiles: profile,
        };
        let response: SetChargingProfileResponse =
            self.call(charger_id, "SetChargingProfile", &request).await?;
        match response.status {
            ChargingProfileStatus::Accepted => Ok(()),
            other => Err(CallError::Rejected(format!("{other:?}"))),
        }
    }

    // ── The engine's five primitives ───────────────────────────

    /// Clear every TxDefaultProfile on the charger.
    pub async fn clear_all_default_profiles(&self, charger_id: &str) -> Result<(), CallError> {
        let request = ClearChargingProfileRequest {
            id: None,
            connector_id: None,
            charging_profile_purpose: Some(ChargingProfilePurposeType::TxDefaultProfile),
            stack_level: None,
        };
        let response: ClearChargingProfileResponse =
            self.call(charger_id, "ClearChargingProfile", &request).await?;
        match response.status {
            ClearChargingProfileStatus::Accepted => Ok(()),
            other => Err(CallError::Rejected(format!("{other:?}"))),
        }
    }

    /// Install the base default on connector 0: minimum charging allowed on
    /// all connectors unless shadowed by a blocking default.
    pub async fn set_base_default_profile(&self, charger_id: &str) -> Result<(), CallError> {
        debug!(charger_id, "set base default profile");
        self.set_profile(
            charger_id,
            0,
            Self::single_period_profile(
                BASE_PROFILE_ID,
                0,
                ChargingProfilePurposeType::TxDefaultProfile,
                self.min_allocation,
                None,
            ),
        )
        .await
    }

    /// Install the blocking default (limit 0) on one connector.
    pub async fn set_blocking_default_profile(
        &self,
        charger_id: &str,
        connector_id: u32,
    ) -> Result<(), CallError> {
        debug!(charger_id, connector_id, "set blocking default profile");
        self.set_profile(
            charger_id,
            connector_id,
            Self::single_period_profile(
                BLOCKING_PROFILE_ID,
                1,
                ChargingProfilePurposeType::TxDefaultProfile,
                0.0,
                None,
            ),
        )
        .await
    }

    /// Remove the blocking default from one connector, permitting charging
    /// to start at the base profile's minimum rate.
    pub async fn clear_blocking_default_profile(
        &self,
        charger_id: &str,
        connector_id: u32,
    ) -> Result<(), CallError> {
        debug!(charger_id, connector_id, "clear blocking default profile");
        let request = ClearChargingProfileRequest {
            id: Some(BLOCKING_PROFILE_ID),
            connector_id: Some(connector_id as i32),
            charging_profile_purpose: None,
            stack_level: None,
        };
        let response: ClearChargingProfileResponse =
            self.call(charger_id, "ClearChargingProfile", &request).await?;
        match response.status {
            ClearChargingProfileStatus::Accepted => Ok(()),
            other => Err(CallError::Rejected(format!("{other:?}"))),
        }
    }

    /// Set the per-transaction limit.
    pub async fn set_tx_profile(
        &self,
        charger_id: &str,
        connector_id: u32,
        transaction_id: i32,
        limit: f64,
    ) -> Result<(), CallError> {
        debug!(charger_id, connector_id, transaction_id, limit, "set tx profile");
        self.set_profile(
            charger_id,
            connector_id,
            Self::single_period_profile(
                TX_PROFILE_ID,
                3,
                ChargingProfilePurposeType::TxProfile,
                limit,
                Some(transaction_id),
            ),
        )
        .await
    }

    // ── State triggers after (re)connect ───────────────────────

    pub async fn trigger_boot_notification(&self, charger_id: &str) -> Result<(), CallError> {
        self.trigger(charger_id, MessageTrigger::BootNotification, None).await
    }

    pub async fn trigger_status_notification(
        &self,
        charger_id: &str,
        connector_id: u32,
    ) -> Result<(), CallError> {
        self.trigger(charger_id, MessageTrigger::StatusNotification, Some(connector_id))
            .await
    }

    pub async fn trigger_meter_values(&self, charger_id: &str) -> Result<(), CallError> {
        self.trigger(charger_id, MessageTrigger::MeterValues, None).await
    }

    async fn trigger(
        &self,
        charger_id: &str,
        requested_message: MessageTrigger,
        connector_id: Option<u32>,
    ) -> Result<(), CallError> {
        let request = TriggerMessageRequest {
            requested_message,
            connector_id,
        };
        let _response: TriggerMessageResponse =
            self.call(charger_id, "TriggerMessage", &request).await?;
        Ok(())
    }

    /// Name-addressed TriggerMessage used by the admin API.
    pub async fn trigger_message(
        &self,
        charger_id: &str,
        requested_message: &str,
        connector_id: Option<u32>,
    ) -> Result<(), CallError> {
        let trigger = match requested_message {
            "BootNotification" => MessageTrigger::BootNotification,
            "DiagnosticsStatusNotification" => MessageTrigger::DiagnosticsStatusNotification,
            "FirmwareStatusNotification" => MessageTrigger::FirmwareStatusNotification,
            "Heartbeat" => MessageTrigger::Heartbeat,
            "MeterValues" => MessageTrigger::MeterValues,
            "StatusNotification" => MessageTrigger::StatusNotification,
            other => {
                return Err(CallError::SendFailed(format!("unknown trigger {other}")));
            }
        };
        self.trigger(charger_id, trigger, connector_id).await
    }

    // ── Configuration and remote control (API pass-through) ────

    pub async fn change_configuration(
        &self,
        charger_id: &str,
        key: &str,
        value: &str,
    ) -> Result<String, CallError> {
        let request = ChangeConfigurationRequest {
            key: key.to_string(),
            value: value.to_string(),
        };
        let response: ChangeConfigurationResponse =
            self.call(charger_id, "ChangeConfiguration", &request).await?;
        Ok(format!("{:?}", response.status))
    }

    pub async fn get_configuration(
        &self,
        charger_id: &str,
        keys: Option<Vec<String>>,
    ) -> Result<Value, CallError> {
        let request = GetConfigurationRequest { key: keys };
        let response: GetConfigurationResponse =
            self.call(charger_id, "GetConfiguration", &request).await?;
        serde_json::to_value(&response)
            .map_err(|e| CallError::InvalidResponse(format!("re-encoding reply: {e}")))
    }

    pub async fn reset(&self, charger_id: &str, hard: bool) -> Result<String, CallError> {
        let request = ResetRequest {
            kind: if hard {
                ResetRequestStatus::Hard
            } else {
                ResetRequestStatus::Soft
            },
        };
        let response: ResetResponse = self.call(charger_id, "Reset", &request).await?;
        Ok(format!("{:?}", response.status))
    }

    pub async fn remote_start_transaction(
        &self,
        charger_id: &str,
        id_tag: &str,
        connector_id: Option<u32>,
    ) -> Result<String, CallError> {
        let request = RemoteStartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            charging_profile: None,
        };
        let response: RemoteStartTransactionResponse = self
            .call(charger_id, "RemoteStartTransaction", &request)
            .await?;
        Ok(format!("{:?}", response.status))
    }

    pub async fn remote_stop_transaction(
        &self,
        charger_id: &str,
        transaction_id: i32,
    ) -> Result<String, CallError> {
        let request = RemoteStopTransactionRequest { transaction_id };
        let response: RemoteStopTransactionResponse = self
            .call(charger_id, "RemoteStopTransaction", &request)
            .await?;
        Ok(format!("{:?}", response.status))
    }

    pub async fn update_firmware(
        &self,
        charger_id: &str,
        location: &str,
        retrieve_date: DateTime<Utc>,
    ) -> Result<(), CallError> {
        let request = UpdateFirmwareRequest {
            location: location.to_string(),
            retries: None,
            retrieve_date,
            retry_interval: None,
        };
        // The v1.6 UpdateFirmware reply carries no status.
        let _reply: Value = self
            .calls
            .send_call(
                charger_id,
                "UpdateFirmware",
                serde_json::to_value(&request)
                    .map_err(|e| CallError::SendFailed(format!("serialization failed: {e}")))?,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::registry::SessionRegistry;
    use crate::support::frame::Frame;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        driver: ProfileDriver,
        calls: Arc<CallSender>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("CP-1", tx);
        let calls = Arc::new(CallSender::new(registry, Duration::from_secs(5)));
        Fixture {
            driver: ProfileDriver::new(calls.clone(), 6.0),
            calls,
            rx,
        }
    }

    async fn next_call(rx: &mut mpsc::UnboundedReceiver<String>) -> (String, String, Value) {
        let text = rx.recv().await.unwrap();
        match Frame::parse(&text).unwrap() {
            Frame::Call {
                unique_id,
                action,
                payload,
            } => (unique_id, action, payload),
            other => panic!("expected a call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocking_profile_shadows_the_base() {
        let mut fx = fixture();

        let driver_call = async {
            fx.driver.set_blocking_default_profile("CP-1", 2).await
        };
        let wire = async {
            let (id, action, payload) = next_call(&mut fx.rx).await;
            assert_eq!(action, "SetChargingProfile");
            assert_eq!(payload["connectorId"], 2);
            let profile = &payload["csChargingProfiles"];
            assert_eq!(profile["chargingProfileId"], 2);
            assert_eq!(profile["stackLevel"], 1);
            assert_eq!(profile["chargingProfilePurpose"], "TxDefaultProfile");
            assert_eq!(
                profile["chargingSchedule"]["chargingSchedulePeriod"][0]["limit"],
                0.0
            );
            fx.calls
                .handle_result("CP-1", &id, serde_json::json!({"status": "Accepted"}));
        };
        let (result, ()) = tokio::join!(driver_call, wire);
        result.unwrap();
    }

    #[tokio::test]
    async fn base_profile_targets_connector_zero_at_minimum() {
        let mut fx = fixture();

        let driver_call = async { fx.driver.set_base_default_profile("CP-1").await };
        let wire = async {
            let (id, action, payload) = next_call(&mut fx.rx).await;
            assert_eq!(action, "SetChargingProfile");
            assert_eq!(payload["connectorId"], 0);
            let profile = &payload["csChargingProfiles"];
            assert_eq!(profile["chargingProfileId"], 1);
            assert_eq!(profile["stackLevel"], 0);
            assert_eq!(
                profile["chargingSchedule"]["chargingSchedulePeriod"][0]["limit"],
                6.0
            );
            fx.calls
                .handle_result("CP-1", &id, serde_json::json!({"status": "Accepted"}));
        };
        let (result, ()) = tokio::join!(driver_call, wire);
        result.unwrap();
    }

    #[tokio::test]
    async fn tx_profile_carries_the_transaction_id() {
        let mut fx = fixture();

        let driver_call = async { fx.driver.set_tx_profile("CP-1", 1, 1, 16.0).await };
        let wire = async {
            let (id, action, payload) = next_call(&mut fx.rx).await;
            assert_eq!(action, "SetChargingProfile");
            let profile = &payload["csChargingProfiles"];
            assert_eq!(profile["chargingProfileId"], 3);
            assert_eq!(profile["stackLevel"], 3);
            assert_eq!(profile["chargingProfilePurpose"], "TxProfile");
            assert_eq!(profile["transactionId"], 1);
            assert_eq!(
                profile["chargingSchedule"]["chargingSchedulePeriod"][0]["limit"],
                16.0
            );
            fx.calls
                .handle_result("CP-1", &id, serde_json::json!({"status": "Accepted"}));
        };
        let (result, ()) = tokio::join!(driver_call, wire);
        result.unwrap();
    }

    #[tokio::test]
    async fn clear_blocking_addresses_profile_two() {
        let mut fx = fixture();

        let driver_call = async { fx.driver.clear_blocking_default_profile("CP-1", 1).await };
        let wire = async {
            let (id, action, payload) = next_call(&mut fx.rx).await;
            assert_eq!(action, "ClearChargingProfile");
            assert_eq!(payload["id"], 2);
            assert_eq!(payload["connectorId"], 1);
            fx.calls
                .handle_result("CP-1", &id, serde_json::json!({"status": "Accepted"}));
        };
        let (result, ()) = tokio::join!(driver_call, wire);
        result.unwrap();
    }

    #[tokio::test]
    async fn non_accepted_status_is_a_rejection() {
        let mut fx = fixture();

        let driver_call = async { fx.driver.set_tx_profile("CP-1", 1, 1, 16.0).await };
        let wire = async {
            let (id, _, _) = next_call(&mut fx.rx).await;
            fx.calls
                .handle_result("CP-1", &id, serde_json::json!({"status": "Rejected"}));
        };
        let (result, ()) = tokio::join!(driver_call, wire);
        assert!(matches!(result, Err(CallError::Rejected(_))));
    }
}
