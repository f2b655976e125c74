//! Close-code Classification
//!
//! A transport close is either recoverable (the shard keeps its session and
//! resumes) or not (the session is discarded and a fresh identify is needed).

/// Normal closure; the server has dropped the session.
pub const CLOSE_NORMAL: u16 = 1000;

/// Abnormal closure synthesized when the transport fails without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Self-initiated close used when the shard wants to resume (e.g. a zombie
/// connection that stopped acknowledging heartbeats).
pub const CLOSE_RESUMING: u16 = 4200;

/// The server rejected a second authentication on the same connection.
pub const CLOSE_ALREADY_AUTHENTICATED: u16 = 4005;

/// The server saw an invalid resume sequence; the session is gone.
pub const CLOSE_INVALID_SEQ: u16 = 4007;

/// Whether a close code leaves the session resumable.
///
/// Everything outside the unresumable set is treated as recoverable; the
/// shard additionally needs a stored session to actually attempt the resume.
pub fn is_resumable(code: u16) -> bool {
    !matches!(
        code,
        CLOSE_NORMAL | CLOSE_ALREADY_AUTHENTICATED | CLOSE_INVALID_SEQ
    )
}
