//! HTTP producer edge.
//!
//! Provides:
//! - `POST /api/edge/product`       — publish one producer message
//! - `POST /api/edge/product/async` — identical, but replies as soon as the
//!   form is accepted (the publish itself never waits on consumers either
//!   way, so the two differ only in contract, not in mechanics)
//!
//! Request body: `{token, topic, key, value}` where `value` is base64 of the
//! (optionally encrypted) payload.  An empty token means plaintext; a
//! non-empty token must match the broker token and makes the edge decrypt
//! the payload with the broker's crypto capability.
//!
//! # Failure mapping
//! base64 error → `UnmarshalFailed`; token mismatch or decrypt failure →
//! `TokenIncorrect`; everything else → `Refused`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mq_engine::Engine;
use mq_protocol::{PMessage, RespStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Producer message submission form.
#[derive(Debug, Deserialize)]
pub struct ProducerForm {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub key: String,
    /// Base64 of the (optionally encrypted) payload.
    #[serde(default)]
    pub value: String,
}

/// Edge response.  Only `status == "Accepted"` means the message was taken.
#[derive(Debug, Serialize)]
pub struct ProductResponse {
    pub status: String,
    pub offset: u64,
    pub response_time: u64,
    pub message: String,
}

pub fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/edge/product", post(post_producer_message))
        .route("/api/edge/product/async", post(async_post_producer_message))
        .with_state(engine)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn failure(status: RespStatus, message: impl Into<String>) -> ProductResponse {
    ProductResponse {
        status: status.text().to_owned(),
        offset: 0,
        response_time: unix_now(),
        message: message.into(),
    }
}

/// Translate the JSON form into a wire message.
fn to_pmessage(engine: &Engine, form: &ProducerForm) -> Result<PMessage, ProductResponse> {
    if form.topic.is_empty() {
        return Err(failure(RespStatus::Refused, "topic must not be empty"));
    }
    let decoded = BASE64
        .decode(&form.value)
        .map_err(|err| failure(RespStatus::UnmarshalFailed, err.to_string()))?;

    let value = if form.token.is_empty() {
        // No token: the payload is plaintext.
        decoded
    } else if !engine.is_token_correct(&form.token) {
        return Err(failure(RespStatus::TokenIncorrect, "token mismatch"));
    } else {
        engine
            .crypto()
            .decrypt(&decoded)
            .map_err(|err| failure(RespStatus::TokenIncorrect, err.to_string()))?
    };

    Ok(PMessage {
        topic: form.topic.clone().into_bytes(),
        key: form.key.clone().into_bytes(),
        value,
    })
}

fn publish(engine: &Engine, form: &ProducerForm) -> ProductResponse {
    match to_pmessage(engine, form) {
        Ok(pm) => {
            let offset = engine.publisher(pm);
            debug!(topic = %form.topic, offset, "edge publish");
            ProductResponse {
                status: RespStatus::Accepted.text().to_owned(),
                offset,
                response_time: unix_now(),
                message: String::new(),
            }
        }
        Err(resp) => resp,
    }
}

/// Synchronous submit: replies after the publish has assigned an offset.
async fn post_producer_message(
    State(engine): State<Arc<Engine>>,
    Json(form): Json<ProducerForm>,
) -> Json<ProductResponse> {
    Json(publish(&engine, &form))
}

/// Async-contract submit: the reply promises nothing about delivery, only
/// that the form was accepted.
async fn async_post_producer_message(
    State(engine): State<Arc<Engine>>,
    Json(form): Json<ProducerForm>,
) -> Json<ProductResponse> {
    Json(publish(&engine, &form))
}
