use relay_protocol::{RunId, SessionId};
use serde::Deserialize;

use crate::error::{StreamError, StreamResult};

/// Which history buffers are replayed before live delivery starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayMode {
    /// Global history, then session history.
    #[default]
    Full,
    Session,
    None,
}

impl ReplayMode {
    pub fn parse(raw: &str) -> StreamResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "full" => Ok(Self::Full),
            "session" => Ok(Self::Session),
            "none" => Ok(Self::None),
            other => Err(StreamError::InvalidReplayMode(other.to_owned())),
        }
    }

    pub fn includes_global(self) -> bool {
        matches!(self, Self::Full)
    }

    pub fn includes_session(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Raw query string of a stream request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub session_id: Option<String>,
    pub replay: Option<String>,
    pub debug: Option<String>,
    pub run_id: Option<String>,
    pub parent_run_id: Option<String>,
}

/// A validated stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub parent_run_id: RunId,
    pub replay: ReplayMode,
    pub debug: bool,
}

impl ConnectionRequest {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            run_id: RunId::default(),
            parent_run_id: RunId::default(),
            replay: ReplayMode::Full,
            debug: false,
        }
    }

    pub fn with_replay(mut self, replay: ReplayMode) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate a raw query. Nothing is subscribed on failure.
    pub fn from_query(query: &StreamQuery, max_session_id_len: usize) -> StreamResult<Self> {
        let session_id = query.session_id.as_deref().unwrap_or_default().trim();
        validate_session_id(session_id, max_session_id_len)?;
        let replay = ReplayMode::parse(query.replay.as_deref().unwrap_or_default())?;
        let debug = query.debug.as_deref().is_some_and(|raw| {
            let raw = raw.trim();
            raw == "1" || raw.eq_ignore_ascii_case("true")
        });
        let id = |raw: &Option<String>| RunId::from(raw.as_deref().unwrap_or_default().trim());

        Ok(Self {
            session_id: SessionId::from(session_id),
            run_id: id(&query.run_id),
            parent_run_id: id(&query.parent_run_id),
            replay,
            debug,
        })
    }
}

/// Accept only non-empty ids of `[A-Za-z0-9_-]` up to `max_len` bytes.
pub fn validate_session_id(session_id: &str, max_len: usize) -> StreamResult<()> {
    if session_id.is_empty() {
        return Err(StreamError::InvalidSessionId(
            "session_id is required".to_owned(),
        ));
    }
    if session_id.len() > max_len {
        return Err(StreamError::InvalidSessionId(
            "session_id is too long".to_owned(),
        ));
    }
    let valid = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(StreamError::InvalidSessionId(
            "session_id contains invalid characters".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(session: &str, replay: &str, debug: &str) -> StreamQuery {
        StreamQuery {
            session_id: Some(session.to_owned()),
            replay: Some(replay.to_owned()),
            debug: Some(debug.to_owned()),
            ..StreamQuery::default()
        }
    }

    #[test]
    fn session_id_validation() {
        assert!(validate_session_id("task-42_A", 128).is_ok());
        assert!(validate_session_id("", 128).is_err());
        assert!(validate_session_id("../../etc/passwd", 128).is_err());
        assert!(validate_session_id("has space", 128).is_err());
        assert!(validate_session_id(&"a".repeat(129), 128).is_err());

        let err = validate_session_id("a/b", 128).unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
        assert!(err.is_client_error());
    }

    #[test]
    fn replay_modes() {
        assert_eq!(ReplayMode::parse("").unwrap(), ReplayMode::Full);
        assert_eq!(ReplayMode::parse(" Session ").unwrap(), ReplayMode::Session);
        assert_eq!(ReplayMode::parse("none").unwrap(), ReplayMode::None);
        assert!(matches!(
            ReplayMode::parse("latest"),
            Err(StreamError::InvalidReplayMode(_))
        ));
        assert!(ReplayMode::Session.includes_session());
        assert!(!ReplayMode::Session.includes_global());
    }

    #[test]
    fn parses_full_query() {
        let request = ConnectionRequest::from_query(&query(" s1 ", "session", "TRUE"), 128).unwrap();
        assert_eq!(request.session_id.as_str(), "s1");
        assert_eq!(request.replay, ReplayMode::Session);
        assert!(request.debug);

        let request = ConnectionRequest::from_query(&query("s1", "", "yes"), 128).unwrap();
        assert!(!request.debug);

        assert!(ConnectionRequest::from_query(&StreamQuery::default(), 128).is_err());
    }
}
