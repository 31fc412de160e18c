//! Synchronous acknowledgement returned for every protocol POST.
//!
//! Receipt is acknowledged immediately with `ACK`; the real answer arrives later as a
//! callback. `NACK` carries an error describing why the message was refused.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ack,
    Nack,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub ack: Ack,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// `{"message": {"ack": {"status": "ACK"}}, "error": {...}}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub message: AckMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl AckResponse {
    pub fn ack() -> Self {
        Self {
            message: AckMessage {
                ack: Ack {
                    status: AckStatus::Ack,
                },
            },
            error: None,
        }
    }

    pub fn nack(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: AckMessage {
                ack: Ack {
                    status: AckStatus::Nack,
                },
            },
            error: Some(AckError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.message.ack.status == AckStatus::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        assert_eq!(
            serde_json::to_value(AckResponse::ack()).unwrap(),
            json!({"message": {"ack": {"status": "ACK"}}})
        );
        let nack: AckResponse = serde_json::from_value(json!({
            "message": {"ack": {"status": "NACK"}},
            "error": {"code": "signature_invalid", "message": "bad signature"}
        }))
        .unwrap();
        assert!(!nack.is_ack());
        assert_eq!(nack.error.unwrap().code, "signature_invalid");
    }
}
