//! Store key layout
//!
//! Every piece of shared state lives under one of these keys. Services never
//! format keys by hand so that separate processes sharing one store agree on
//! the layout.

/// Dedup claim for one request id
pub fn processed(user_id: &str, request_id: &str) -> String {
    format!("processed:{}:{}", user_id, request_id)
}

/// Ordered list of JSON-encoded rounds
pub fn history(user_id: &str) -> String {
    format!("session:{}:history", user_id)
}

/// Accumulated summary text
pub fn summary_text(user_id: &str) -> String {
    format!("session:{}:summary:text", user_id)
}

/// Summarization checkpoint: index of the first unsummarized round
pub fn summary_rounds(user_id: &str) -> String {
    format!("session:{}:summary:rounds", user_id)
}

/// Per-user snapshot of emitted alerts
pub fn user_alerts(user_id: &str) -> String {
    format!("session:{}:alerts", user_id)
}

/// Session state marker (`ACTIVE` while history exists)
pub fn session_state(user_id: &str) -> String {
    format!("session:{}:state", user_id)
}

/// Buffered partial transcript fragments of one audio unit
pub fn audio_segments(user_id: &str, audio_id: &str) -> String {
    format!("audio:{}:{}:segments", user_id, audio_id)
}

/// Lock state of one audio unit
pub fn audio_lock(user_id: &str, audio_id: &str) -> String {
    format!("audio:{}:{}:lock", user_id, audio_id)
}

/// Cached final reply of one audio unit
pub fn audio_result(user_id: &str, audio_id: &str) -> String {
    format!("audio:{}:{}:result", user_id, audio_id)
}

/// All keys that make up a user's conversation session
pub fn session_keys(user_id: &str) -> Vec<String> {
    vec![
        history(user_id),
        summary_text(user_id),
        summary_rounds(user_id),
        user_alerts(user_id),
        session_state(user_id),
    ]
}
