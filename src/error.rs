//! Error taxonomy for the playback core.
//!
//! Everything the orchestrator, playlist, streamers and connections can fail
//! with ends up here so the API layer can turn it into a failed envelope with a
//! readable message. Startup and persistence code keeps using `anyhow`.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A start request without a usable item name.
    #[error("empty item name")]
    EmptyItem,

    /// Command name is not in the command table.
    #[error("command not found: {0}")]
    UnknownCommand(String),

    /// Next/previous requested while nothing is current.
    #[error("no current item")]
    NoCurrentItem,

    /// Requested item is not part of the playlist.
    #[error("item not in the playlist: {0}")]
    ItemNotFound(String),

    #[error("can't read directory '{dir}': {reason}")]
    DirectoryUnavailable { dir: String, reason: String },

    #[error("failed to start renderer process: {0}")]
    ProcessSpawnFailed(String),

    /// The renderer process exited with a status we did not cause.
    #[error("renderer process exited: {0}")]
    ProcessExitError(String),

    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    /// The browser renderer answered with `success: false`.
    #[error("renderer refused: {0}")]
    Renderer(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The orchestrator task is gone (shutdown in progress).
    #[error("player is not running")]
    PlayerUnavailable,
}
