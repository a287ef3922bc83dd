// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.
//!
//! Everything here runs at the gateway boundary, before any room mutation.
//! Failing payloads are dropped and logged by the caller; nothing is echoed
//! back for malformed input.

use base64::Engine;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

use crate::config::{CanvasSettings, Settings};
use sketchsync_common::{ClientMessage, DrawEvent};

// Common validation constants
const MAX_ROOM_ID_LENGTH: usize = 64;
const MAX_USERNAME_LENGTH: usize = 64;
const MAX_LINE_WIDTH: f64 = 200.0;

// Regex patterns for validation
static ROOM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap());
static COLOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").unwrap());
static IMAGE_DATA_URI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^data:image/(png|jpeg|jpg|webp);base64,").unwrap());

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("invalid draw payload: {0}")]
    InvalidDraw(String),

    #[error("invalid chat payload: {0}")]
    InvalidChat(String),

    #[error("invalid image payload: {0}")]
    InvalidImage(String),

    #[error("image payload of {actual} bytes exceeds the {limit} byte limit")]
    ImageTooLarge { actual: usize, limit: usize },

    #[error("image payload of {actual} bytes is below the {minimum} byte content threshold")]
    ImageTooSmall { actual: usize, minimum: usize },
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a room id
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    if room_id.is_empty() {
        return Err(ValidationError::InvalidRoomId(
            "room id must not be empty".to_string(),
        ));
    }

    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err(ValidationError::InvalidRoomId(format!(
            "room id must not exceed {MAX_ROOM_ID_LENGTH} characters"
        )));
    }

    if !ROOM_ID_REGEX.is_match(room_id) {
        return Err(ValidationError::InvalidRoomId(
            "room id must contain only alphanumerics, dots, hyphens and underscores".to_string(),
        ));
    }

    Ok(room_id)
}

/// Validate a draw event against the configured canvas geometry.
/// Out-of-range coordinates are a hard rejection, not a clamp, so a buggy
/// or malicious client cannot corrupt the shared canvas.
pub fn validate_draw(event: &DrawEvent, canvas: &CanvasSettings) -> ValidationResult<()> {
    let in_bounds = |x: f64, y: f64| {
        x.is_finite() && y.is_finite() && (0.0..=canvas.width).contains(&x)
            && (0.0..=canvas.height).contains(&y)
    };

    if !in_bounds(event.x, event.y) || !in_bounds(event.prev_x, event.prev_y) {
        return Err(ValidationError::InvalidDraw(format!(
            "coordinates outside [0, {}] x [0, {}]",
            canvas.width, canvas.height
        )));
    }

    if !COLOR_REGEX.is_match(&event.color) {
        return Err(ValidationError::InvalidDraw(format!(
            "color {:?} is not #RRGGBB",
            event.color
        )));
    }

    if !event.line_width.is_finite()
        || event.line_width <= 0.0
        || event.line_width > MAX_LINE_WIDTH
    {
        return Err(ValidationError::InvalidDraw(format!(
            "line width {} outside (0, {MAX_LINE_WIDTH}]",
            event.line_width
        )));
    }

    if event.sender_id.is_empty() {
        return Err(ValidationError::InvalidDraw(
            "sender id must not be empty".to_string(),
        ));
    }

    Ok(())
}

/// A decoded image payload: raw bytes plus the declared MIME type.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Decode a size-bounded `data:image/...;base64,...` payload.
///
/// The ceiling is checked against the encoded length first so an oversized
/// payload is rejected without allocating its decoded form.
pub fn decode_image_payload(
    data_uri: &str,
    max_bytes: usize,
    min_bytes: usize,
) -> ValidationResult<DecodedImage> {
    let header = IMAGE_DATA_URI_REGEX.find(data_uri).ok_or_else(|| {
        ValidationError::InvalidImage("not a base64 image data URI".to_string())
    })?;

    let subtype = data_uri[header.range()]
        .trim_start_matches("data:image/")
        .trim_end_matches(";base64,");
    let mime_type = match subtype {
        "jpg" => "image/jpeg".to_string(),
        other => format!("image/{other}"),
    };

    let encoded = &data_uri[header.end()..];
    // 4 base64 chars decode to 3 bytes, minus trailing padding
    let padding = encoded.bytes().rev().take_while(|&b| b == b'=').count();
    let estimated = (encoded.len() / 4 * 3).saturating_sub(padding.min(2));
    if estimated > max_bytes {
        return Err(ValidationError::ImageTooLarge {
            actual: estimated,
            limit: max_bytes,
        });
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ValidationError::InvalidImage(format!("base64 decode failed: {e}")))?;

    if bytes.len() > max_bytes {
        return Err(ValidationError::ImageTooLarge {
            actual: bytes.len(),
            limit: max_bytes,
        });
    }
    if bytes.len() < min_bytes {
        return Err(ValidationError::ImageTooSmall {
            actual: bytes.len(),
            minimum: min_bytes,
        });
    }

    Ok(DecodedImage { bytes, mime_type })
}

/// Truncate a chat body to at most `max_chars` characters, respecting
/// char boundaries.
pub fn truncate_chat(message: &str, max_chars: usize) -> &str {
    match message.char_indices().nth(max_chars) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

/// Light structural check that a snapshot at least looks like an image data
/// URI. Snapshots are opaque to the server, so no decode happens here.
fn validate_snapshot_shape(image_data: &str) -> ValidationResult<()> {
    if image_data.is_empty() {
        return Err(ValidationError::InvalidImage(
            "snapshot must not be empty".to_string(),
        ));
    }
    if !IMAGE_DATA_URI_REGEX.is_match(image_data) {
        return Err(ValidationError::InvalidImage(
            "snapshot is not a base64 image data URI".to_string(),
        ));
    }
    Ok(())
}

/// Validates a client message before it reaches any handler
pub fn validate_client_message(
    message: &ClientMessage,
    settings: &Settings,
) -> ValidationResult<()> {
    validate_room_id(message.room_id())?;

    match message {
        ClientMessage::Draw(event) => validate_draw(event, &settings.canvas)?,
        ClientMessage::EndStroke { stroke_id, .. } => {
            if stroke_id.is_empty() {
                return Err(ValidationError::InvalidDraw(
                    "stroke id must not be empty".to_string(),
                ));
            }
        },
        ClientMessage::AddPage { image_data, .. }
        | ClientMessage::UpdatePageState { image_data, .. } => {
            validate_snapshot_shape(image_data)?;
        },
        ClientMessage::ChatMessage { username, .. } => {
            if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
                return Err(ValidationError::InvalidChat(format!(
                    "username must be 1..={MAX_USERNAME_LENGTH} characters"
                )));
            }
        },
        ClientMessage::AiSubmit { image, .. } => {
            // The gate re-checks the full bounds before any external call;
            // this only keeps obviously-not-an-image payloads away from it.
            if !IMAGE_DATA_URI_REGEX.is_match(image) {
                return Err(ValidationError::InvalidImage(
                    "submission is not a base64 image data URI".to_string(),
                ));
            }
        },
        ClientMessage::JoinRoom { .. }
        | ClientMessage::ClearCanvas { .. }
        | ClientMessage::RemovePage { .. }
        | ClientMessage::RequestInitialState { .. } => {},
    }

    Ok(())
}
