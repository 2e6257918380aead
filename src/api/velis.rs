//! Velis routes: plant listing, plant data, writes, limits and reports.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use ariproxy_iot::device::{SYS_WATER_HEATER, WHE_TYPE_REM4};
use serde_json::{json, Map, Value};
use tracing::{instrument, warn};

use super::{json_body, ApiState};

/// Parameter holding the operating mode
pub const MODE_KEY: &str = "T_22.0.3";
/// Parameter holding the requested temperature (tenths of a degree)
pub const REQ_TEMP_KEY: &str = "T_22.1.3";

const TEMP_KEY: &str = "T_22.3.6";
const BOOST_REQ_TEMP_KEY: &str = "T_22.1.0";
const PROC_REQ_TEMP_KEY: &str = "T_22.3.1";

/// One entry per device that has announced itself with a BIRTH.
#[instrument(level = "debug", skip(state))]
pub async fn plants(State(state): State<ApiState>) -> Json<Value> {
    let plants: Vec<Value> = state
        .broker
        .sessions()
        .snapshots()
        .into_iter()
        .filter_map(|session| {
            let birth = session.birth?;
            let mut plant: Map<String, Value> = birth
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            plant.insert("gw".to_string(), json!(session.id));
            plant.insert("sn".to_string(), json!(birth.get("serial_number")));

            match state.registry.get(&session.id) {
                Some(descriptor) => {
                    plant.insert("sys".to_string(), json!(descriptor.sys));
                    plant.insert("wheType".to_string(), json!(descriptor.whe_type));
                    if !descriptor.name.is_empty() {
                        plant.insert("name".to_string(), json!(descriptor.name));
                    }
                }
                None => {
                    if birth.get("model_name").map(String::as_str) == Some("Velis") {
                        plant.insert("sys".to_string(), json!(SYS_WATER_HEATER));
                    }
                    if birth.get("display_name").map(String::as_str) == Some("REM4_EWH") {
                        plant.insert("wheType".to_string(), json!(WHE_TYPE_REM4));
                    }
                }
            }
            Some(Value::Object(plant))
        })
        .collect();

    Json(Value::Array(plants))
}

/// Current settings of a device, temperatures in whole degrees.
#[instrument(level = "debug", skip(state))]
pub async fn plant_data(State(state): State<ApiState>, Path(gw): Path<String>) -> Json<Value> {
    let Some(params) = state.broker.sessions().get(&gw).and_then(|s| s.params) else {
        return Json(json!({}));
    };

    let mut data = Map::new();
    data.insert("gw".to_string(), json!(gw));
    if let Some(mode) = params.get(MODE_KEY) {
        data.insert("mode".to_string(), json!(mode));
    }
    for (field, key) in [
        ("temp", TEMP_KEY),
        ("boostReqTemp", BOOST_REQ_TEMP_KEY),
        ("procReqTemp", PROC_REQ_TEMP_KEY),
        ("reqTemp", REQ_TEMP_KEY),
    ] {
        if let Some(value) = params.get(key) {
            data.insert(field.to_string(), json!(value / 10));
        }
    }
    Json(Value::Object(data))
}

fn new_value(body: &Bytes) -> Option<i32> {
    json_body(body).get("new")?.as_f64().map(|v| v as i32)
}

async fn write(state: &ApiState, gw: &str, key: &str, value: Option<i32>) -> Json<Value> {
    let Some(value) = value else {
        warn!("⚠️ Missing \"new\" value for {} {}", gw, key);
        return Json(Value::Null);
    };
    match state.broker.write_parameter(gw, key, value).await {
        Ok(()) => Json(json!({ "success": true })),
        Err(e) => {
            warn!("⚠️ Error for {} {} {}: {}", gw, key, value, e);
            Json(Value::Null)
        }
    }
}

#[instrument(level = "debug", skip(state, body))]
pub async fn set_temperature(
    State(state): State<ApiState>,
    Path(gw): Path<String>,
    body: Bytes,
) -> Json<Value> {
    let value = new_value(&body).map(|degrees| degrees.saturating_mul(10));
    write(&state, &gw, REQ_TEMP_KEY, value).await
}

#[instrument(level = "debug", skip(state, body))]
pub async fn set_mode(State(state): State<ApiState>, Path(gw): Path<String>, body: Bytes) -> Json<Value> {
    write(&state, &gw, MODE_KEY, new_value(&body)).await
}

/// Parameter limits advertised with the device's last reply.
pub async fn limits(State(state): State<ApiState>, Path(gw): Path<String>) -> Json<Value> {
    let limits = state
        .broker
        .sessions()
        .get(&gw)
        .and_then(|s| s.param_limits)
        .unwrap_or_default();
    Json(json!(limits))
}

/// Sum of a series plus the offset, clamped at the `i64` range.
fn total(samples: &[i64], offset: i64) -> i64 {
    samples
        .iter()
        .fold(offset, |sum, sample| sum.saturating_add(*sample))
}

/// Consumption series of the last report, with totals including the configured offset.
#[instrument(level = "debug", skip(state))]
pub async fn reports(State(state): State<ApiState>, Path(gw): Path<String>) -> Json<Value> {
    let Some(consumption) = state.broker.sessions().get(&gw).and_then(|s| s.consumption) else {
        return Json(json!([]));
    };
    let offset = state
        .registry
        .get(&gw)
        .map(|d| d.consumption_offset)
        .unwrap_or_default();

    let series: Vec<Value> = consumption
        .series
        .iter()
        .map(|s| {
            json!({
                "cat": s.category,
                "interval": s.interval,
                "values": s.samples,
                "total": total(&s.samples, offset),
            })
        })
        .collect();
    Json(Value::Array(series))
}
