//! Turns an inbound request body into a canonical [`Event`].
//!
//! The body is an open JSON object. Missing `orderId`, `amount` and
//! `timestamp` keys are filled from [`IngressDefaults`] and the current
//! instant. Supplied values are kept whatever their JSON type, and every
//! other key is carried through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::contract::{format_timestamp, Detail, Event};
use crate::error::RelayError;

pub const ORDER_ID_KEY: &str = "orderId";
pub const AMOUNT_KEY: &str = "amount";
pub const TIMESTAMP_KEY: &str = "timestamp";

pub const DEFAULT_EVENT_SOURCE: &str = "myapp";
pub const DEFAULT_EVENT_TYPE: &str = "order";
pub const DEFAULT_ORDER_ID: &str = "12345";
pub const DEFAULT_AMOUNT: u64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct IngressDefaults {
    pub order_id: String,
    pub amount: Number,
}

impl Default for IngressDefaults {
    fn default() -> Self {
        Self {
            order_id: DEFAULT_ORDER_ID.to_string(),
            amount: Number::from(DEFAULT_AMOUNT),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressSettings {
    pub source: String,
    pub detail_type: String,
    pub defaults: IngressDefaults,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_EVENT_SOURCE.to_string(),
            detail_type: DEFAULT_EVENT_TYPE.to_string(),
            defaults: IngressDefaults::default(),
        }
    }
}

/// Typed view over an order event's detail, for consumers that expect the
/// conventional field types. Ingress does not require it to parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderDetail {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub amount: Number,
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: Detail,
}

impl OrderDetail {
    pub fn from_detail(detail: &Detail) -> Result<Self, RelayError> {
        serde_json::from_value(Value::Object(detail.clone()))
            .map_err(|error| RelayError::MalformedInput(format!("invalid order detail: {error}")))
    }
}

/// Decodes a request body. Absent, `null` and blank bodies are an empty
/// object; anything else must be a JSON object, given either as text or
/// already decoded.
pub fn parse_body(body: Option<&Value>) -> Result<Detail, RelayError> {
    match body {
        None | Some(Value::Null) => Ok(Detail::new()),
        Some(Value::Object(object)) => Ok(object.clone()),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(Detail::new()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => Ok(object),
            Ok(Value::Null) => Ok(Detail::new()),
            Ok(_) => Err(RelayError::MalformedInput(
                "request body must be a JSON object".to_string(),
            )),
            Err(error) => Err(RelayError::MalformedInput(format!(
                "malformed JSON body: {error}"
            ))),
        },
        Some(_) => Err(RelayError::MalformedInput(
            "request body must be a JSON object".to_string(),
        )),
    }
}

/// Merges the supplied fields over the defaults. A supplied key always wins,
/// except that `null` on a core key counts as absent.
pub fn build_detail(mut supplied: Detail, defaults: &IngressDefaults, now: DateTime<Utc>) -> Detail {
    for key in [ORDER_ID_KEY, AMOUNT_KEY, TIMESTAMP_KEY] {
        if matches!(supplied.get(key), Some(Value::Null)) {
            supplied.remove(key);
        }
    }

    supplied
        .entry(ORDER_ID_KEY)
        .or_insert_with(|| Value::String(defaults.order_id.clone()));
    supplied
        .entry(AMOUNT_KEY)
        .or_insert_with(|| Value::Number(defaults.amount.clone()));
    supplied
        .entry(TIMESTAMP_KEY)
        .or_insert_with(|| Value::String(format_timestamp(now)));
    supplied
}

pub fn build_event(
    body: Option<&Value>,
    settings: &IngressSettings,
    now: DateTime<Utc>,
) -> Result<Event, RelayError> {
    let supplied = parse_body(body)?;
    let detail = build_detail(supplied, &settings.defaults, now);
    Ok(Event::new(
        settings.source.clone(),
        settings.detail_type.clone(),
        detail,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-17T12:00:00Z")
            .expect("timestamp should parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn absent_body_yields_defaults_and_fresh_timestamp() {
        let event = build_event(None, &IngressSettings::default(), fixed_now())
            .expect("event should build");

        assert_eq!(event.source, "myapp");
        assert_eq!(event.detail_type, "order");
        assert_eq!(event.timestamp, fixed_now());
        assert_eq!(event.detail[ORDER_ID_KEY], json!("12345"));
        assert_eq!(event.detail[AMOUNT_KEY], json!(100));
        assert_eq!(event.detail[TIMESTAMP_KEY], json!("2026-10-17T12:00:00.000Z"));
    }

    #[test]
    fn supplied_fields_win_and_extra_fields_survive() {
        let body = json!("{\"orderId\":\"A1\",\"amount\":50,\"note\":{\"gift\":true}}");
        let event = build_event(Some(&body), &IngressSettings::default(), fixed_now())
            .expect("event should build");

        assert_eq!(event.detail[ORDER_ID_KEY], json!("A1"));
        assert_eq!(event.detail[AMOUNT_KEY], json!(50));
        assert_eq!(event.detail["note"], json!({"gift": true}));
        assert!(event.detail.contains_key(TIMESTAMP_KEY));
    }

    #[test]
    fn detail_is_superset_of_every_supplied_field() {
        let bodies = [
            json!({}),
            json!({"orderId": "B2"}),
            json!({"amount": 12.5, "customer": "c-9"}),
            json!({"timestamp": "2020-01-01T00:00:00Z", "tags": [1, 2]}),
            json!({"orderId": "C3", "amount": 0, "nested": {"a": null}}),
        ];

        for body in bodies {
            let event = build_event(Some(&body), &IngressSettings::default(), fixed_now())
                .expect("event should build");
            for (key, value) in body.as_object().expect("fixture is an object") {
                assert_eq!(event.detail.get(key), Some(value), "key {key} lost");
            }
            for key in [ORDER_ID_KEY, AMOUNT_KEY, TIMESTAMP_KEY] {
                assert!(event.detail.contains_key(key), "core key {key} missing");
            }
        }
    }

    #[test]
    fn null_core_fields_fall_back_to_defaults() {
        let body = json!({"orderId": null, "amount": null});
        let detail = build_detail(
            parse_body(Some(&body)).expect("body should parse"),
            &IngressDefaults::default(),
            fixed_now(),
        );

        assert_eq!(detail[ORDER_ID_KEY], json!("12345"));
        assert_eq!(detail[AMOUNT_KEY], json!(100));
    }

    #[test]
    fn configured_defaults_replace_builtin_literals() {
        let settings = IngressSettings {
            source: "shop".to_string(),
            detail_type: "checkout".to_string(),
            defaults: IngressDefaults {
                order_id: "unassigned".to_string(),
                amount: Number::from(0),
            },
        };
        let event = build_event(None, &settings, fixed_now()).expect("event should build");

        assert_eq!(event.source, "shop");
        assert_eq!(event.detail_type, "checkout");
        assert_eq!(event.detail[ORDER_ID_KEY], json!("unassigned"));
        assert_eq!(event.detail[AMOUNT_KEY], json!(0));
    }

    #[test]
    fn blank_and_null_bodies_are_empty_objects() {
        assert!(parse_body(Some(&json!("   "))).expect("blank").is_empty());
        assert!(parse_body(Some(&Value::Null)).expect("null").is_empty());
        assert!(parse_body(Some(&json!("null"))).expect("null text").is_empty());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let error = parse_body(Some(&json!("{\"orderId\":"))).expect_err("should fail");
        assert!(matches!(error, RelayError::MalformedInput(message) if message.starts_with("malformed JSON body")));
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        for body in [json!("[1,2]"), json!("42"), json!(17), json!([1])] {
            let error = parse_body(Some(&body)).expect_err("non-object should fail");
            assert!(matches!(error, RelayError::MalformedInput(_)));
        }
    }

    #[test]
    fn supplied_core_fields_of_any_type_are_kept() {
        let body = json!({"orderId": 7, "amount": "50", "timestamp": 3});
        let event = build_event(Some(&body), &IngressSettings::default(), fixed_now())
            .expect("any JSON object body should build");

        assert_eq!(event.detail[ORDER_ID_KEY], json!(7));
        assert_eq!(event.detail[AMOUNT_KEY], json!("50"));
        assert_eq!(event.detail[TIMESTAMP_KEY], json!(3));
        assert!(OrderDetail::from_detail(&event.detail).is_err());
    }

    #[test]
    fn order_detail_exposes_typed_core() {
        let event = build_event(
            Some(&json!({"orderId": "A1", "amount": 50, "channel": "web"})),
            &IngressSettings::default(),
            fixed_now(),
        )
        .expect("event should build");
        let order = OrderDetail::from_detail(&event.detail).expect("detail should be typed");

        assert_eq!(order.order_id, "A1");
        assert_eq!(order.amount, Number::from(50));
        assert_eq!(order.extra["channel"], json!("web"));
    }
}
