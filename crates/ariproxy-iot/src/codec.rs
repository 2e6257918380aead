//! # Parameter Codec
//!
//! Wire types and conversions for the appliance's protobuf payloads.
//!
//! Parameter messages follow the Everyware (Kura) payload layout the appliance
//! firmware speaks: a timestamp, a repeated metric list at field 5000 where
//! every metric carries a name, a value-type classifier and exactly one typed
//! value. The appliance adds its parameter limits next to the metrics.
//! Consumption reports use a separate, smaller message.
//!
//! Field numbers, the value-type classifier and the positional `P<n>` keys of
//! read requests are part of the device compatibility surface.

use std::collections::HashMap;

use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use prost::Message;
use serde::Serialize;

use crate::{IoTError, INLINE_CLIENT_ID};

/// Metric key naming the requesting client in a request message.
pub const REQUESTER_KEY: &str = "requester.client.id";

/// Metric key tagging the kind of a request message.
pub const REQUEST_ID_KEY: &str = "request.id";

/// `request.id` of a parameter read.
pub const REQUEST_PARAMS: &str = "params";

/// `request.id` of a consumption read.
pub const REQUEST_CONSUMPTIONS: &str = "consumptions";

/// `request.id` of a parameter write.
pub const REQUEST_RESULT: &str = "result";

/// Metric key carrying the category of a consumption read.
pub const CONSUMPTION_TYPE_KEY: &str = "Typ";

// =============================================================================
// Wire types
// =============================================================================

/// Value-type classifier carried by every metric.
///
/// The firmware only ever exchanges `Int32` (writable settings) and `String`
/// (identification, request trailers); anything else is rejected on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValueType {
    Double = 0,
    Float = 1,
    Int64 = 2,
    Int32 = 3,
    Bool = 4,
    String = 5,
    Bytes = 6,
}

/// A parameter message: settings, telemetry, birth records and requests.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParametersMsg {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(message, repeated, tag = "5000")]
    pub params: Vec<Parameter>,
    #[prost(message, optional, tag = "5002")]
    pub param_limits: Option<ParameterLimitsMsg>,
}

/// One typed key/value entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Parameter {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(enumeration = "ValueType", tag = "2")]
    pub value_type: i32,
    #[prost(oneof = "ParameterValue", tags = "6, 8")]
    pub value: Option<ParameterValue>,
}

/// The value of a [`Parameter`]; exactly one variant is ever set.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum ParameterValue {
    #[prost(int32, tag = "6")]
    Int(i32),
    #[prost(string, tag = "8")]
    Str(String),
}

/// Limits advertised alongside a parameter reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterLimitsMsg {
    #[prost(message, repeated, tag = "1")]
    pub limits: Vec<ParameterLimit>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterLimit {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(int32, tag = "2")]
    pub min: i32,
    #[prost(int32, tag = "3")]
    pub max: i32,
}

/// A consumption report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsumptionsMsg {
    #[prost(message, repeated, tag = "1")]
    pub consumptions: Vec<Consumption>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Consumption {
    #[prost(int32, tag = "1")]
    pub category: i32,
    #[prost(int32, tag = "2")]
    pub interval: i32,
    #[prost(int64, repeated, tag = "3")]
    pub values: Vec<i64>,
}

impl Parameter {
    /// An int-valued parameter (value type `Int32`).
    pub fn int(key: impl Into<String>, value: i32) -> Self {
        Parameter {
            key: key.into(),
            value_type: ValueType::Int32 as i32,
            value: Some(ParameterValue::Int(value)),
        }
    }

    /// A string-valued parameter (value type `String`).
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Parameter {
            key: key.into(),
            value_type: ValueType::String as i32,
            value: Some(ParameterValue::Str(value.into())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Some(ParameterValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.value {
            Some(ParameterValue::Int(i)) => Some(i),
            _ => None,
        }
    }
}

// =============================================================================
// Application-facing types
// =============================================================================

/// Allowed bounds of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterLimits {
    pub min: i32,
    pub max: i32,
}

/// One consumption series: category, interval and watt-hour samples in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumptionSeries {
    pub category: i32,
    pub interval: i32,
    pub samples: Vec<i64>,
}

/// The most recent consumption report of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumptionSnapshot {
    pub series: Vec<ConsumptionSeries>,
}

impl From<ConsumptionsMsg> for ConsumptionSnapshot {
    fn from(msg: ConsumptionsMsg) -> Self {
        ConsumptionSnapshot {
            series: msg
                .consumptions
                .into_iter()
                .map(|c| ConsumptionSeries {
                    category: c.category,
                    interval: c.interval,
                    samples: c.values,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a parameter message. Nothing is returned for malformed input.
pub fn decode_parameters(payload: &[u8]) -> Result<ParametersMsg, IoTError> {
    ParametersMsg::decode(payload).map_err(|source| IoTError::Decode {
        what: "parameter",
        source,
    })
}

/// Decode a consumption report.
pub fn decode_consumption(payload: &[u8]) -> Result<ConsumptionsMsg, IoTError> {
    ConsumptionsMsg::decode(payload).map_err(|source| IoTError::Decode {
        what: "consumption",
        source,
    })
}

/// String-valued projection used for birth records; non-string entries are dropped.
pub fn project_birth(msg: &ParametersMsg) -> HashMap<String, String> {
    msg.params
        .iter()
        .filter_map(|p| p.as_str().map(|s| (p.key.clone(), s.to_string())))
        .collect()
}

/// Int-valued projection of the parameters plus the embedded limits.
pub fn project_params(
    msg: &ParametersMsg,
) -> (HashMap<String, i32>, HashMap<String, ParameterLimits>) {
    let values = msg
        .params
        .iter()
        .filter_map(|p| p.as_int().map(|v| (p.key.clone(), v)))
        .collect();

    let limits = msg
        .param_limits
        .iter()
        .flat_map(|l| l.limits.iter())
        .map(|l| {
            (
                l.key.clone(),
                ParameterLimits {
                    min: l.min,
                    max: l.max,
                },
            )
        })
        .collect();

    (values, limits)
}

/// Render a payload for logs: the decoded entries when it parses, base64 otherwise.
pub fn describe_payload(payload: &[u8]) -> String {
    match ParametersMsg::decode(payload) {
        Ok(msg) if !msg.params.is_empty() => msg
            .params
            .iter()
            .map(|p| match &p.value {
                Some(ParameterValue::Int(i)) => format!("{}={}", p.key, i),
                Some(ParameterValue::Str(s)) => format!("{}={:?}", p.key, s),
                None => format!("{}=<unset>", p.key),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => base64::engine::general_purpose::STANDARD.encode(payload),
    }
}

// =============================================================================
// Encoding
// =============================================================================

fn request(mut params: Vec<Parameter>, request_id: &str) -> Bytes {
    params.push(Parameter::string(REQUESTER_KEY, INLINE_CLIENT_ID));
    params.push(Parameter::string(REQUEST_ID_KEY, request_id));

    let msg = ParametersMsg {
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        params,
        param_limits: None,
    };
    Bytes::from(msg.encode_to_vec())
}

/// Build a parameter read request for `keys`, keyed `P1`..`Pn` in order.
pub fn encode_read_request<S: AsRef<str>>(keys: &[S]) -> Bytes {
    let params = keys
        .iter()
        .enumerate()
        .map(|(i, key)| Parameter::string(format!("P{}", i + 1), key.as_ref()))
        .collect();
    request(params, REQUEST_PARAMS)
}

/// Build a consumption read request for one category.
pub fn encode_consumption_request(category: &str) -> Bytes {
    request(
        vec![Parameter::string(CONSUMPTION_TYPE_KEY, category)],
        REQUEST_CONSUMPTIONS,
    )
}

/// Build a write request setting `key` to `value`.
pub fn encode_write_request(key: &str, value: i32) -> Bytes {
    request(vec![Parameter::int(key, value)], REQUEST_RESULT)
}
