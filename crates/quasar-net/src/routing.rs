//! Connect-target routing: extract session and room identifiers.
//!
//! Clients address a room with a URL-style target string:
//!
//! ```text
//! /<process>/<roomId>?sessionId=<id>
//! ```
//!
//! The room identifier is the trailing path segment, the session identifier
//! comes from the `sessionId` query parameter. Malformed targets produce a
//! [`RouteError`]; the listener maps those onto the same failure path as an
//! unresolvable room, so a bad client sees a normal join rejection rather
//! than a protocol-level hangup.

/// Identifiers extracted from a connect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// The process segment of the path (reserved for multi-process setups).
    pub process_id: String,
    /// The room the client wants to join.
    pub room_id: String,
    /// The session identifier the seat was reserved for.
    pub session_id: String,
    /// The original target string, for room-side inspection.
    pub target: String,
}

/// Errors produced while parsing a connect target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The path does not match `/<process>/<roomId>`.
    #[error("malformed connect path")]
    MalformedPath,

    /// The `sessionId` query parameter is missing or empty.
    #[error("missing sessionId query parameter")]
    MissingSessionId,
}

/// Identifier charset shared by process, room, and session ids.
fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a connect target into its routing identifiers.
pub fn parse_target(target: &str) -> Result<RouteInfo, RouteError> {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    // Path must end in /<process>/<roomId>.
    let mut segments = path.trim_end_matches('/').rsplit('/');
    let room_id = segments.next().filter(|s| is_identifier(s));
    let process_id = segments.next().filter(|s| is_identifier(s));
    let (Some(room_id), Some(process_id)) = (room_id, process_id) else {
        return Err(RouteError::MalformedPath);
    };

    let session_id = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "sessionId")
        .map(|(_, value)| value)
        .filter(|value| is_identifier(value))
        .ok_or(RouteError::MissingSessionId)?;

    Ok(RouteInfo {
        process_id: process_id.to_string(),
        room_id: room_id.to_string(),
        session_id: session_id.to_string(),
        target: target.to_string(),
    })
}
