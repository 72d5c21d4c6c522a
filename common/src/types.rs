use serde::{Deserialize, Serialize};

use crate::{
    error::{RequestError, ValidationError},
    schedule::{timer_index, ScheduleSlot, SLOT_COUNT},
};

const STATUS_OK: &str = "OK";
const STATUS_ERROR: &str = "ERROR";

/// Full state snapshot. Reply to `get_status` and the WebSocket push body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
    pub current_day: u8,
    pub current_time: u16,
    pub heating_state: bool,
    pub is_heating: bool,
    pub boost_timer_countdown: u16,
    pub timers: [[u16; 3]; SLOT_COUNT],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeatingStateReply {
    pub status: &'static str,
    pub heating_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoostReply {
    pub status: &'static str,
    pub boost_timer_countdown: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetTimerReply {
    pub status: &'static str,
    pub timer_number: u8,
    pub new_days: u8,
    pub new_on_time: u16,
    pub new_off_time: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ApiReply {
    Status(StatusPayload),
    HeatingState(HeatingStateReply),
    Boost(BoostReply),
    SetTimer(SetTimerReply),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            message: message.into(),
        }
    }
}

impl StatusPayload {
    pub(crate) fn ok(
        current_day: u8,
        current_time: u16,
        heating_state: bool,
        is_heating: bool,
        boost_timer_countdown: u16,
        timers: [[u16; 3]; SLOT_COUNT],
    ) -> Self {
        Self {
            status: STATUS_OK,
            current_day,
            current_time,
            heating_state,
            is_heating,
            boost_timer_countdown,
            timers,
        }
    }
}

impl ApiReply {
    pub(crate) fn heating_state(heating_state: bool) -> Self {
        Self::HeatingState(HeatingStateReply {
            status: STATUS_OK,
            heating_state,
        })
    }

    pub(crate) fn boost(boost_timer_countdown: u16) -> Self {
        Self::Boost(BoostReply {
            status: STATUS_OK,
            boost_timer_countdown,
        })
    }

    pub(crate) fn set_timer(timer_number: u8, slot: &ScheduleSlot) -> Self {
        Self::SetTimer(SetTimerReply {
            status: STATUS_OK,
            timer_number,
            new_days: slot.days.bits(),
            new_on_time: slot.on_minute,
            new_off_time: slot.off_minute,
        })
    }
}

/// Raw `set_timer` parameters as sent by the web UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SetTimerRequest {
    pub timer_number: Option<i64>,
    pub new_days: Option<i64>,
    pub new_on_time: Option<i64>,
    pub new_off_time: Option<i64>,
}

impl SetTimerRequest {
    /// Checks fields in wire order and reports the first bad one.
    pub fn validate(&self) -> Result<(u8, ScheduleSlot), ValidationError> {
        let timer_number = self
            .timer_number
            .and_then(|value| u8::try_from(value).ok())
            .ok_or(ValidationError::TimerNumber)?;
        timer_index(timer_number)?;

        let days = self
            .new_days
            .and_then(|value| u8::try_from(value).ok())
            .ok_or(ValidationError::Days)?;
        let on_minute = self
            .new_on_time
            .and_then(|value| u16::try_from(value).ok())
            .ok_or(ValidationError::OnTime)?;
        let off_minute = self
            .new_off_time
            .and_then(|value| u16::try_from(value).ok())
            .ok_or(ValidationError::OffTime)?;

        let slot = ScheduleSlot::new(days, on_minute, off_minute)?;
        Ok((timer_number, slot))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    GetStatus,
    TriggerHeating,
    Boost,
    SetTimer(SetTimerRequest),
}

#[derive(Debug, Deserialize)]
struct ActionEnvelope {
    action: Option<String>,
}

impl ApiRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, RequestError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| RequestError::Malformed)?;
        let envelope = ActionEnvelope::deserialize(&value).map_err(|_| RequestError::Malformed)?;

        match envelope.action.as_deref() {
            Some("get_status") => Ok(Self::GetStatus),
            Some("trigger_heating") => Ok(Self::TriggerHeating),
            Some("boost") => Ok(Self::Boost),
            Some("set_timer") => SetTimerRequest::deserialize(&value)
                .map(Self::SetTimer)
                .map_err(|_| RequestError::InvalidParameters {
                    action: "set_timer".to_string(),
                }),
            _ => Err(RequestError::UnknownAction),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::GetStatus => "get_status",
            Self::TriggerHeating => "trigger_heating",
            Self::Boost => "boost",
            Self::SetTimer(_) => "set_timer",
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_every_action() {
        assert_eq!(
            ApiRequest::from_json(br#"{"action":"get_status"}"#),
            Ok(ApiRequest::GetStatus)
        );
        assert_eq!(
            ApiRequest::from_json(br#"{"action":"trigger_heating"}"#),
            Ok(ApiRequest::TriggerHeating)
        );
        assert_eq!(
            ApiRequest::from_json(br#"{"action":"boost"}"#),
            Ok(ApiRequest::Boost)
        );
        assert_eq!(
            ApiRequest::from_json(
                br#"{"action":"set_timer","timer_number":2,"new_days":31,"new_on_time":390,"new_off_time":450}"#
            ),
            Ok(ApiRequest::SetTimer(SetTimerRequest {
                timer_number: Some(2),
                new_days: Some(31),
                new_on_time: Some(390),
                new_off_time: Some(450),
            }))
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_bodies() {
        assert_eq!(
            ApiRequest::from_json(br#"{"action":"reboot"}"#),
            Err(RequestError::UnknownAction)
        );
        assert_eq!(ApiRequest::from_json(br#"{}"#), Err(RequestError::UnknownAction));
        assert_eq!(ApiRequest::from_json(b"not json"), Err(RequestError::Malformed));
        assert_eq!(
            ApiRequest::from_json(br#"{"action":"set_timer","timer_number":"two"}"#),
            Err(RequestError::InvalidParameters {
                action: "set_timer".to_string()
            })
        );
    }

    #[test]
    fn set_timer_validation_names_the_field() {
        let valid = SetTimerRequest {
            timer_number: Some(1),
            new_days: Some(127),
            new_on_time: Some(0),
            new_off_time: Some(1410),
        };
        assert!(valid.validate().is_ok());

        let cases = [
            (SetTimerRequest { timer_number: Some(0), ..valid.clone() }, ValidationError::TimerNumber),
            (SetTimerRequest { timer_number: Some(7), ..valid.clone() }, ValidationError::TimerNumber),
            (SetTimerRequest { timer_number: None, ..valid.clone() }, ValidationError::TimerNumber),
            (SetTimerRequest { new_days: Some(128), ..valid.clone() }, ValidationError::Days),
            (SetTimerRequest { new_days: Some(-1), ..valid.clone() }, ValidationError::Days),
            (SetTimerRequest { new_on_time: Some(1411), ..valid.clone() }, ValidationError::OnTime),
            (SetTimerRequest { new_off_time: Some(1411), ..valid.clone() }, ValidationError::OffTime),
            (SetTimerRequest { new_off_time: None, ..valid.clone() }, ValidationError::OffTime),
        ];

        for (request, expected) in cases {
            assert_eq!(request.validate(), Err(expected), "{request:?}");
        }
    }

    #[test]
    fn status_serializes_with_wire_names() {
        let payload = StatusPayload::ok(3, 615, true, false, 1200, [[127, 390, 450]; SLOT_COUNT]);
        let value = serde_json::to_value(ApiReply::Status(payload)).unwrap();

        assert_eq!(value["status"], json!("OK"));
        assert_eq!(value["current_day"], json!(3));
        assert_eq!(value["current_time"], json!(615));
        assert_eq!(value["heating_state"], json!(true));
        assert_eq!(value["is_heating"], json!(false));
        assert_eq!(value["boost_timer_countdown"], json!(1200));
        assert_eq!(value["timers"][5], json!([127, 390, 450]));
    }

    #[test]
    fn error_body_shape() {
        let value = serde_json::to_value(ErrorBody::new("Unknown action")).unwrap();
        assert_eq!(value, json!({"status": "ERROR", "message": "Unknown action"}));
    }
}
