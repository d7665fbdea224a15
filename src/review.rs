//! Adapters between the two `AdmissionReview` wire versions and the single
//! request/response pair the engine works on.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use serde_json::Value;
use thiserror::Error;

const REVIEW_KIND: &str = "AdmissionReview";

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("unsupported group version kind: {api_version}, Kind={kind}")]
    Unsupported { api_version: String, kind: String },
    #[error("failed to deserialize AdmissionReview: {source}")]
    Decode {
        version: ReviewVersion,
        uid: String,
        source: serde_json::Error,
    },
    #[error("missing request field in AdmissionReview")]
    MissingRequest { version: ReviewVersion },
}

impl ReviewError {
    /// Envelope version and request uid to answer with, when the envelope was recognized.
    pub fn envelope(&self) -> Option<(ReviewVersion, &str)> {
        match self {
            ReviewError::Unsupported { .. } => None,
            ReviewError::Decode { version, uid, .. } => Some((*version, uid.as_str())),
            ReviewError::MissingRequest { version } => Some((*version, "")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVersion {
    V1,
    V1Beta1,
}

impl ReviewVersion {
    pub fn api_version(self) -> &'static str {
        match self {
            ReviewVersion::V1 => "admission.k8s.io/v1",
            ReviewVersion::V1Beta1 => "admission.k8s.io/v1beta1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewVersion::V1 => "v1",
            ReviewVersion::V1Beta1 => "v1beta1",
        }
    }

    pub fn detect(body: &Value) -> Result<Self, ReviewError> {
        let (api_version, kind) = (str_field(body, "apiVersion"), str_field(body, "kind"));

        match (api_version, kind) {
            ("admission.k8s.io/v1", REVIEW_KIND) => Ok(ReviewVersion::V1),
            ("admission.k8s.io/v1beta1", REVIEW_KIND) => Ok(ReviewVersion::V1Beta1),
            _ => Err(ReviewError::Unsupported {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
        }
    }
}

fn str_field<'a>(body: &'a Value, name: &str) -> &'a str {
    body.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn request_uid(body: &Value) -> &str {
    body.get("request")
        .and_then(|request| request.get("uid"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Both versions share the request layout; only the envelope differs.
pub fn decode(body: Value) -> Result<(ReviewVersion, AdmissionRequest<DynamicObject>), ReviewError> {
    let version = ReviewVersion::detect(&body)?;
    let uid = request_uid(&body).to_string();
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(body).map_err(|source| ReviewError::Decode { version, uid, source })?;
    let request = review
        .try_into()
        .map_err(|_| ReviewError::MissingRequest { version })?;
    Ok((version, request))
}

pub fn encode(version: ReviewVersion, response: AdmissionResponse) -> Result<Value, serde_json::Error> {
    let mut review = serde_json::to_value(response.into_review())?;
    if let Some(envelope) = review.as_object_mut() {
        envelope.insert("apiVersion".to_string(), Value::from(version.api_version()));
        envelope.insert("kind".to_string(), Value::from(REVIEW_KIND));
    }
    Ok(review)
}

/// Deny answer for a review that was recognized but could not be decoded.
pub fn reject(version: ReviewVersion, uid: &str, message: String) -> Result<Value, serde_json::Error> {
    let mut review = encode(version, AdmissionResponse::invalid(message))?;
    if let Some(response) = review.get_mut("response").and_then(Value::as_object_mut) {
        response.insert("uid".to_string(), Value::from(uid));
    }
    Ok(review)
}
