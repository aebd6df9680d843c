// services/mpesa_service.rs
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::Utc;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::models::mpesa::SettlementInfo;

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Serialize)]
pub struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    pub result_code: String,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "Amount", default)]
    pub amount: Option<f64>,
    #[serde(rename = "MpesaReceiptNumber", default)]
    pub mpesa_receipt_number: Option<String>,
    #[serde(rename = "TransactionDate", default)]
    pub transaction_date: Option<serde_json::Value>,
    #[serde(rename = "PhoneNumber", default)]
    pub phone_number: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

/// Safaricom's "the transaction is being processed" error code on the
/// query endpoint. Not a failure; ask again later.
const QUERY_IN_PROGRESS_CODE: &str = "500.001.1001";

/// Outcome of a charge request. `TransportError` means the request may or
/// may not have reached the gateway; the charge could still be live.
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Accepted {
        merchant_request_id: String,
        checkout_request_id: String,
        customer_message: String,
    },
    Rejected {
        reason: String,
    },
    TransportError,
}

#[derive(Debug, Clone)]
pub enum StkQueryOutcome {
    Success { settlement: SettlementInfo },
    StillPending,
    Failed { code: String, desc: String },
}

/// Accepts the local formats subscribers actually type and canonicalizes to
/// `254XXXXXXXXX`. Safaricom and Airtel prefixes both start with 07/01.
pub fn normalize_phone(phone: &str) -> Result<String> {
    let phone = phone.trim();
    let phone = phone.strip_prefix('+').unwrap_or(phone);

    if !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::InvalidPhone(phone.to_string()));
    }

    let canonical = if phone.starts_with("254") && phone.len() == 12 {
        phone.to_string()
    } else if (phone.starts_with("07") || phone.starts_with("01")) && phone.len() == 10 {
        format!("254{}", &phone[1..])
    } else if (phone.starts_with('7') || phone.starts_with('1')) && phone.len() == 9 {
        format!("254{}", phone)
    } else {
        return Err(AppError::InvalidPhone(phone.to_string()));
    };

    Ok(canonical)
}

#[derive(Debug, Clone)]
pub struct MpesaService {
    config: AppConfig,
    client: Client,
    cached_token: Arc<RwLock<Option<(String, chrono::DateTime<Utc>)>>>,
}

impl MpesaService {
    pub fn new(config: AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        MpesaService {
            config,
            client,
            cached_token: Arc::new(RwLock::new(None)),
        }
    }

    fn generate_password(&self, timestamp: &str) -> String {
        let password_string = format!(
            "{}{}{}",
            self.config.mpesa_short_code, self.config.mpesa_passkey, timestamp
        );
        base64.encode(password_string)
    }

    fn invalidate_token(&self) {
        let mut cached = self.cached_token.write().unwrap();
        *cached = None;
    }

    pub async fn get_access_token(&self) -> Result<String> {
        {
            let cached = self.cached_token.read().unwrap();
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Utc::now() + chrono::Duration::minutes(5) {
                    return Ok(token.clone());
                }
            }
        }

        info!("Requesting new access token");
        let auth_string = format!(
            "{}:{}",
            self.config.mpesa_consumer_key, self.config.mpesa_consumer_secret
        );
        let encoded_auth = base64.encode(auth_string);

        let (auth_url, _, _) = self.config.get_mpesa_urls();

        let response = self
            .client
            .get(&auth_url)
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await
            .map_err(|e| AppError::GatewayAuth(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Failed to get access token: {} - {}", status, body);
            return Err(AppError::GatewayAuth(format!("auth failed: {}", status)));
        }

        let auth_response: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::GatewayAuth(e.to_string()))?;

        let ttl_secs: i64 = auth_response.expires_in.parse().unwrap_or(3600);
        {
            let expiry_time = Utc::now() + chrono::Duration::seconds(ttl_secs);
            let mut cached = self.cached_token.write().unwrap();
            *cached = Some((auth_response.access_token.clone(), expiry_time));
        }

        info!("Access token obtained");
        Ok(auth_response.access_token)
    }

    /// Fires the STK prompt at the subscriber's handset. Amount must already
    /// be validated; the phone must already be canonical.
    pub async fn stk_push(
        &self,
        phone_number: &str,
        amount: i64,
        account_reference: &str,
        transaction_desc: &str,
    ) -> Result<ChargeOutcome> {
        info!("STK push for {} - KSh {}", phone_number, amount);

        let access_token = self.get_access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let (_, stk_push_url, _) = self.config.get_mpesa_urls();

        let stk_request = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: amount.to_string(),
            party_a: phone_number.to_string(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: phone_number.to_string(),
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: transaction_desc.to_string(),
        };

        let response = match self
            .client
            .post(&stk_push_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&stk_request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // The request may still have landed; never report this as rejected
                warn!("STK push transport error: {}", e);
                return Ok(ChargeOutcome::TransportError);
            }
        };

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token();
            return Err(AppError::GatewayAuth("token rejected by gateway".to_string()));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("STK push rejected: {} - {}", status, body);
            let reason = serde_json::from_str::<GatewayErrorBody>(&body)
                .ok()
                .and_then(|e| e.error_message)
                .unwrap_or_else(|| format!("gateway returned {}", status));
            return Ok(ChargeOutcome::Rejected { reason });
        }

        let stk_response: StkPushResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("STK push response unreadable: {}", e);
                return Ok(ChargeOutcome::TransportError);
            }
        };

        if stk_response.response_code != "0" {
            return Ok(ChargeOutcome::Rejected {
                reason: stk_response.response_description,
            });
        }

        info!("STK push accepted: {}", stk_response.merchant_request_id);
        Ok(ChargeOutcome::Accepted {
            merchant_request_id: stk_response.merchant_request_id,
            checkout_request_id: stk_response.checkout_request_id,
            customer_message: stk_response.customer_message,
        })
    }

    /// Queries the gateway for the outcome of an in-flight charge. Transport
    /// errors bubble up as `Err`; the next poll retries them.
    pub async fn query_status(&self, checkout_request_id: &str) -> Result<StkQueryOutcome> {
        let access_token = self.get_access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let (_, _, stk_query_url) = self.config.get_mpesa_urls();

        let query_request = StkQueryRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let response = self
            .client
            .post(&stk_query_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&query_request)
            .send()
            .await
            .map_err(|e| AppError::gateway(format!("status query failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        map_query_response(status, &body)
    }
}

/// Maps the gateway's status-query response onto a closed outcome. The
/// "in progress" case arrives as an HTTP 500 with a specific error code.
fn map_query_response(status: u16, body: &str) -> Result<StkQueryOutcome> {
    if !(200..300).contains(&status) {
        if let Ok(err) = serde_json::from_str::<GatewayErrorBody>(body) {
            if err.error_code.as_deref() == Some(QUERY_IN_PROGRESS_CODE) {
                return Ok(StkQueryOutcome::StillPending);
            }
            return Err(AppError::gateway(
                err.error_message
                    .unwrap_or_else(|| format!("status query returned {}", status)),
            ));
        }
        return Err(AppError::gateway(format!("status query returned {}", status)));
    }

    let parsed: StkQueryResponse = serde_json::from_str(body)
        .map_err(|e| AppError::gateway(format!("unreadable query response: {}", e)))?;

    if parsed.result_code == "0" {
        let settlement = SettlementInfo {
            amount: parsed.amount.map(|v| v as i64),
            receipt_number: parsed.mpesa_receipt_number,
            transaction_date: parsed.transaction_date.map(|v| stringify(&v)),
            phone_number: parsed.phone_number.map(|v| stringify(&v)),
        };
        return Ok(StkQueryOutcome::Success { settlement });
    }

    Ok(StkQueryOutcome::Failed {
        code: parsed.result_code,
        desc: parsed.result_desc,
    })
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_all_accepted_formats() {
        for input in ["0712345678", "+254712345678", "254712345678", "712345678"] {
            assert_eq!(normalize_phone(input).unwrap(), "254712345678", "{}", input);
        }
        assert_eq!(normalize_phone("0110123456").unwrap(), "254110123456");
        assert_eq!(normalize_phone(" 0712345678 ").unwrap(), "254712345678");
    }

    #[test]
    fn rejects_malformed_phones() {
        for input in ["", "12345", "07123456789", "255712345678", "07one23456", "0812345678"] {
            assert!(normalize_phone(input).is_err(), "{}", input);
        }
    }

    #[test]
    fn query_success_maps_settlement() {
        let body = r#"{
            "ResponseCode": "0",
            "ResponseDescription": "The service request has been accepted successsfully",
            "MerchantRequestID": "22205-34066-1",
            "CheckoutRequestID": "ws_CO_13012021093521236557",
            "ResultCode": "0",
            "ResultDesc": "The service request is processed successfully.",
            "Amount": 5000,
            "MpesaReceiptNumber": "NLJ7RT61SV",
            "TransactionDate": 20210113093547,
            "PhoneNumber": 254712345678
        }"#;
        match map_query_response(200, body).unwrap() {
            StkQueryOutcome::Success { settlement } => {
                assert_eq!(settlement.amount, Some(5000));
                assert_eq!(settlement.receipt_number.as_deref(), Some("NLJ7RT61SV"));
                assert_eq!(settlement.phone_number.as_deref(), Some("254712345678"));
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn query_failure_maps_code_and_desc() {
        let body = r#"{
            "ResponseCode": "0",
            "ResponseDescription": "ok",
            "ResultCode": "1032",
            "ResultDesc": "Request cancelled by user."
        }"#;
        match map_query_response(200, body).unwrap() {
            StkQueryOutcome::Failed { code, desc } => {
                assert_eq!(code, "1032");
                assert_eq!(desc, "Request cancelled by user.");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn query_in_progress_is_still_pending() {
        let body = r#"{
            "requestId": "ws-req-123",
            "errorCode": "500.001.1001",
            "errorMessage": "The transaction is being processed"
        }"#;
        assert!(matches!(
            map_query_response(500, body).unwrap(),
            StkQueryOutcome::StillPending
        ));
    }

    #[test]
    fn query_transport_level_failure_is_err() {
        let body = r#"{"errorCode": "404.001.03", "errorMessage": "Invalid Access Token"}"#;
        assert!(map_query_response(404, body).is_err());
        assert!(map_query_response(503, "upstream unavailable").is_err());
    }
}
