use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, Uri};
use axum_client_ip::InsecureClientIp;
use bytes::Bytes;
use metrics::counter;
use tracing::{error, warn};

use tracker_common::ingest::IncomingPosition;

use crate::api::OsmAndError;
use crate::params;
use crate::router;

/// Prefix namespacing OsmAnd identifiers away from other protocols.
pub const DEVICE_ID_PREFIX: &str = "osmand";

/// Accepts a location report on any path, OsmAnd clients are not consistent
/// about the one they call.
pub async fn position(
    state: State<router::State>,
    InsecureClientIp(ip): InsecureClientIp,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<&'static str, OsmAndError> {
    state
        .rawlog
        .push(state.port, Some(ip.to_string()), render_raw(&method, &uri, &body));

    if method != Method::GET && method != Method::POST {
        return Err(OsmAndError::MethodNotAllowed);
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let params = params::collect(uri.query(), content_type, &body);

    let Some(id) = params::device_id(&params) else {
        return Err(OsmAndError::MissingDeviceId);
    };

    let (Some(latitude), Some(longitude)) = (
        params::first(&params, &params::LATITUDE_KEYS),
        params::first(&params, &params::LONGITUDE_KEYS),
    ) else {
        // No fix in this request, the device is just phoning home.
        counter!("osmand_pings_total").increment(1);
        return Ok("OK");
    };

    let latitude = parse_coordinate(latitude, 90.0).ok_or(OsmAndError::InvalidCoordinates)?;
    let longitude = parse_coordinate(longitude, 180.0).ok_or(OsmAndError::InvalidCoordinates)?;

    let incoming = IncomingPosition {
        device_id: format!("{}-{}", DEVICE_ID_PREFIX, id),
        timestamp: params::parse_timestamp(params.get("timestamp").map(String::as_str)),
        latitude,
        longitude,
        speed: params::parse_speed(params.get("speed").map(String::as_str)),
        attributes: params::attributes(&params),
    };

    match state.ingestor.record(incoming).await {
        Ok(_) => Ok("OK"),
        Err(rejection) => {
            if rejection.is_validation() {
                warn!("rejected position report: {}", rejection);
            } else {
                error!("failed to record position: {}", rejection);
            }
            Err(rejection.into())
        }
    }
}

fn parse_coordinate(raw: &str, bound: f64) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| (-bound..=bound).contains(value))
}

fn render_raw(method: &Method, uri: &Uri, body: &Bytes) -> String {
    let mut raw = format!("{} {}", method, uri);
    if !body.is_empty() {
        raw.push(' ');
        raw.push_str(&String::from_utf8_lossy(body));
    }
    raw
}
