/// The part of a session the request executor routes on.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SessionInfo {
    pub session_id: i32,
}

impl SessionInfo {
    pub fn new(session_id: i32) -> Self {
        Self { session_id }
    }
}
