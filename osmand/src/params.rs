use std::collections::HashMap;

use chrono::{DateTime, LocalResult, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

/// Epoch values below this are treated as seconds, everything else as milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 10_000_000_000;

/// Query keys that can carry the device identifier, in lookup order.
pub const DEVICE_ID_KEYS: [&str; 4] = ["id", "deviceid", "deviceId", "device_id"];

pub const LATITUDE_KEYS: [&str; 2] = ["lat", "latitude"];
pub const LONGITUDE_KEYS: [&str; 2] = ["lon", "longitude"];

/// Collects request parameters from the query string and the body.
///
/// Clients are inconsistent: the reference OsmAnd client sends everything in
/// the query string, Traccar-style clients POST a urlencoded form, and mobile
/// clients POST a nested JSON document. All three are merged into one flat
/// key/value map, with body values overriding query values on conflict.
pub fn collect(query: Option<&str>, content_type: &str, body: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        merge_pairs(&mut params, query);
    }
    if body.is_empty() {
        return params;
    }
    if content_type.contains("application/json") || looks_like_json(body) {
        match serde_json::from_slice::<Value>(body) {
            Ok(document) => flatten_json(&document, &mut params),
            Err(error) => debug!("discarding unparseable json body: {}", error),
        }
    } else if let Ok(text) = std::str::from_utf8(body) {
        merge_pairs(&mut params, text);
    }
    params
}

fn merge_pairs(params: &mut HashMap<String, String>, raw: &str) {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw).unwrap_or_default();
    for (key, value) in pairs {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        params.insert(key.to_string(), value.trim().to_string());
    }
}

fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .map_or(false, |byte| *byte == b'{')
}

/// Flattens a nested JSON body into the same flat keys the query string uses.
///
/// The nested shape is the one produced by Traccar-compatible mobile clients:
/// `location.timestamp`, `location.coords.{latitude,longitude,speed,...}`,
/// `location.is_moving`, `location.battery.{level,is_charging}` and
/// `location.activity.type`. Top level scalars are kept under their own key so
/// `{"device_id": "x"}` still resolves the identifier.
fn flatten_json(document: &Value, params: &mut HashMap<String, String>) {
    let Some(object) = document.as_object() else {
        return;
    };
    for (key, value) in object {
        if key == "location" {
            if let Some(location) = value.as_object() {
                flatten_location(location, params);
            }
            continue;
        }
        insert_scalar(params, key, value);
    }
}

fn flatten_location(location: &Map<String, Value>, params: &mut HashMap<String, String>) {
    for (key, value) in location {
        match key.as_str() {
            "coords" => {
                if let Some(coords) = value.as_object() {
                    for (field, target) in [
                        ("latitude", "lat"),
                        ("longitude", "lon"),
                        ("speed", "speed"),
                        ("accuracy", "accuracy"),
                        ("altitude", "altitude"),
                        ("heading", "heading"),
                    ] {
                        if let Some(value) = coords.get(field) {
                            insert_scalar(params, target, value);
                        }
                    }
                }
            }
            "battery" => {
                if let Some(battery) = value.as_object() {
                    if let Some(level) = battery.get("level") {
                        insert_scalar(params, "batt", level);
                    }
                    if let Some(charging) = battery.get("is_charging") {
                        insert_scalar(params, "charge", charging);
                    }
                }
            }
            "activity" => {
                if let Some(kind) = value.get("type") {
                    insert_scalar(params, "activity", kind);
                }
            }
            "is_moving" => insert_scalar(params, "motion", value),
            _ => insert_scalar(params, key, value),
        }
    }
}

fn insert_scalar(params: &mut HashMap<String, String>, key: &str, value: &Value) {
    let rendered = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return,
    };
    params.insert(key.to_string(), rendered);
}

/// Returns the first non empty value among the given keys.
pub fn first<'p>(params: &'p HashMap<String, String>, keys: &[&str]) -> Option<&'p str> {
    keys.iter()
        .filter_map(|key| params.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

pub fn device_id(params: &HashMap<String, String>) -> Option<String> {
    first(params, &DEVICE_ID_KEYS).map(str::to_string)
}

/// Parses a device supplied timestamp, preferring ISO 8601 over epoch values.
///
/// Bare integers are disambiguated with a magnitude heuristic since clients
/// send both second and millisecond precision. Anything unparseable falls back
/// to the server clock so a bad clock never rejects an otherwise valid fix.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Utc::now();
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        let parsed = if epoch.abs() < EPOCH_MILLIS_CUTOFF {
            Utc.timestamp_opt(epoch, 0)
        } else {
            Utc.timestamp_millis_opt(epoch)
        };
        if let LocalResult::Single(timestamp) = parsed {
            return timestamp;
        }
    }
    debug!("unparseable timestamp {:?}, using server clock", raw);
    Utc::now()
}

/// Parses the reported speed, dropping negative and non numeric values.
pub fn parse_speed(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|speed| speed.is_finite() && *speed >= 0.0)
}

/// Extracts the optional telemetry fields into a position attribute map.
pub fn attributes(params: &HashMap<String, String>) -> Option<Map<String, Value>> {
    let mut attributes = Map::new();
    if let Some(motion) = first(params, &["motion"]).and_then(parse_flag) {
        attributes.insert("motion".to_string(), Value::Bool(motion));
    }
    for key in ["odometer", "accuracy", "altitude"] {
        if let Some(value) = numeric(params, &[key]) {
            attributes.insert(key.to_string(), value);
        }
    }
    if let Some(heading) = numeric(params, &["heading", "bearing"]) {
        attributes.insert("heading".to_string(), heading);
    }
    if let Some(battery) = numeric(params, &["batt", "battery"]) {
        attributes.insert("battery".to_string(), battery);
    }
    if let Some(charging) = first(params, &["charge"]).and_then(parse_flag) {
        attributes.insert("charge".to_string(), Value::Bool(charging));
    }
    if let Some(activity) = first(params, &["activity"]) {
        attributes.insert("activity".to_string(), Value::String(activity.to_string()));
    }
    if attributes.is_empty() {
        None
    } else {
        Some(attributes)
    }
}

fn numeric(params: &HashMap<String, String>, keys: &[&str]) -> Option<Value> {
    first(params, keys)
        .and_then(|raw| raw.parse::<f64>().ok())
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
