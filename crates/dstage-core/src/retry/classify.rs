//! Classify HTTP status, curl errors and local I/O errors into retry kinds.

use crate::retry::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        401 | 403 => ErrorKind::Auth,
        404 | 410 => ErrorKind::NotFound,
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return ErrorKind::Connection;
    }
    if e.is_login_denied() || e.is_peer_failed_verification() || e.is_ssl_connect_error() {
        return ErrorKind::Auth;
    }
    // 78 = CURLE_REMOTE_FILE_NOT_FOUND (curl 0.4 has no named accessor for it).
    if e.code() == 78 || e.is_file_couldnt_read_file() {
        return ErrorKind::NotFound;
    }
    if e.is_write_error() {
        return ErrorKind::Storage;
    }
    ErrorKind::Other
}

/// Classify a local I/O error.
pub fn classify_io_error(e: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match e.kind() {
        Io::NotFound => ErrorKind::NotFound,
        Io::PermissionDenied => ErrorKind::Auth,
        Io::AlreadyExists => ErrorKind::DestinationExists,
        Io::TimedOut => ErrorKind::Timeout,
        Io::Interrupted | Io::WouldBlock => ErrorKind::Connection,
        _ => ErrorKind::Storage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_and_503_throttled() {
        assert_eq!(classify_http_status(429), ErrorKind::Throttled);
        assert_eq!(classify_http_status(503), ErrorKind::Throttled);
    }

    #[test]
    fn http_5xx_retryable() {
        assert_eq!(classify_http_status(502), ErrorKind::Http5xx(502));
        assert!(classify_http_status(500).is_transient());
    }

    #[test]
    fn http_4xx_permanent() {
        assert_eq!(classify_http_status(404), ErrorKind::NotFound);
        assert_eq!(classify_http_status(403), ErrorKind::Auth);
        assert!(!classify_http_status(400).is_transient());
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(classify_io_error(&e), ErrorKind::NotFound);
        let e = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "there");
        assert_eq!(classify_io_error(&e), ErrorKind::DestinationExists);
        let e = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(classify_io_error(&e), ErrorKind::Storage);
    }
}
