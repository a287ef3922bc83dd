// ============================
// crates/backend-lib/src/error.rs
// ============================
//! Central error type for room and page operations.
//!
//! Every variant maps onto the wire `error` event: a stable code plus a
//! sanitized message. Internal detail (ids, paths) stays in the `Display`
//! form, which only reaches logs.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("a room must keep at least one page")]
    LastPage,

    #[error("room is full")]
    RoomFull,
}

impl AppError {
    /// Stable code for the `code` field of the `error` wire event.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            AppError::PageNotFound(_) => "PAGE_NOT_FOUND",
            AppError::LastPage => "LAST_PAGE",
            AppError::RoomFull => "ROOM_FULL",
        }
    }

    /// Get a sanitized message suitable for sending to clients
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::RoomNotFound(_) => "Room not found".to_string(),
            AppError::PageNotFound(_) => "Page not found".to_string(),
            AppError::LastPage => "The last page of a room cannot be removed".to_string(),
            AppError::RoomFull => "The room is full, try again later".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let not_found = AppError::RoomNotFound("r1".to_string());
        assert_eq!(not_found.to_string(), "room not found: r1");

        let last_page = AppError::LastPage;
        assert_eq!(last_page.to_string(), "a room must keep at least one page");
    }

    #[test]
    fn test_app_error_error_codes() {
        assert_eq!(
            AppError::RoomNotFound("r1".to_string()).error_code(),
            "ROOM_NOT_FOUND"
        );
        assert_eq!(
            AppError::PageNotFound("p1".to_string()).error_code(),
            "PAGE_NOT_FOUND"
        );
        assert_eq!(AppError::RoomFull.error_code(), "ROOM_FULL");
        assert_eq!(AppError::LastPage.error_code(), "LAST_PAGE");
    }

    #[test]
    fn test_sanitized_messages_leak_no_identifiers() {
        let not_found = AppError::RoomNotFound("secret-room-token".to_string());
        assert!(!not_found.sanitized_message().contains("secret-room-token"));

        let page = AppError::PageNotFound("1700000000000".to_string());
        assert!(!page.sanitized_message().contains("1700000000000"));
    }
}
