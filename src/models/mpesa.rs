// models/mpesa.rs
//
// Wire shapes for the Safaricom STK callback, exactly as the gateway
// sends them. Field names are PascalCase on the wire.
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode")]
    pub result_code: i64,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
}

/// Settlement fields pulled out of the metadata items on a successful charge.
#[derive(Debug, Clone, Default)]
pub struct SettlementInfo {
    pub amount: Option<i64>,
    pub receipt_number: Option<String>,
    pub transaction_date: Option<String>,
    pub phone_number: Option<String>,
}

impl StkCallback {
    pub fn settlement_info(&self) -> SettlementInfo {
        let mut info = SettlementInfo::default();
        let Some(metadata) = &self.callback_metadata else {
            return info;
        };

        for item in &metadata.items {
            let Some(value) = &item.value else { continue };
            match item.name.as_str() {
                "Amount" => info.amount = value.as_f64().map(|v| v as i64),
                "MpesaReceiptNumber" => {
                    info.receipt_number = value.as_str().map(|s| s.to_string())
                }
                // The gateway sends these as bare numbers
                "TransactionDate" => info.transaction_date = Some(stringify_value(value)),
                "PhoneNumber" => info.phone_number = Some(stringify_value(value)),
                _ => {}
            }
        }
        info
    }
}

fn stringify_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The acknowledgment Safaricom expects back from the callback URL.
/// Anything else makes the gateway keep retrying.
#[derive(Debug, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn success() -> Self {
        CallbackAck {
            result_code: 0,
            result_desc: "Success".to_string(),
        }
    }

    pub fn failure(desc: &str) -> Self {
        CallbackAck {
            result_code: 1,
            result_desc: desc.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESS_CALLBACK: &str = r#"{
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 5000.00},
                        {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                        {"Name": "TransactionDate", "Value": 20191219102115},
                        {"Name": "PhoneNumber", "Value": 254708374149}
                    ]
                }
            }
        }
    }"#;

    const FAILED_CALLBACK: &str = r#"{
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user."
            }
        }
    }"#;

    #[test]
    fn parses_success_callback() {
        let envelope: CallbackEnvelope = serde_json::from_str(SUCCESS_CALLBACK).unwrap();
        let callback = &envelope.body.stk_callback;
        assert_eq!(callback.result_code, 0);
        assert_eq!(callback.checkout_request_id, "ws_CO_191220191020363925");

        let info = callback.settlement_info();
        assert_eq!(info.amount, Some(5000));
        assert_eq!(info.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(info.transaction_date.as_deref(), Some("20191219102115"));
        assert_eq!(info.phone_number.as_deref(), Some("254708374149"));
    }

    #[test]
    fn parses_failed_callback_without_metadata() {
        let envelope: CallbackEnvelope = serde_json::from_str(FAILED_CALLBACK).unwrap();
        let callback = &envelope.body.stk_callback;
        assert_eq!(callback.result_code, 1032);
        assert!(callback.callback_metadata.is_none());

        let info = callback.settlement_info();
        assert!(info.receipt_number.is_none());
        assert!(info.amount.is_none());
    }

    #[test]
    fn ack_envelope_uses_gateway_field_names() {
        let ack = serde_json::to_value(CallbackAck::success()).unwrap();
        assert_eq!(ack["ResultCode"], 0);
        assert_eq!(ack["ResultDesc"], "Success");

        let nack = serde_json::to_value(CallbackAck::failure("Transaction not found")).unwrap();
        assert_eq!(nack["ResultCode"], 1);
    }
}
