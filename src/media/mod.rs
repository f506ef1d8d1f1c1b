use std::fmt;

pub mod binder;
pub mod loopback;

pub use binder::MediaBinder;
pub use loopback::LoopbackMedia;

/// Opaque reference to the media of one session, resolved by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub String);

impl MediaHandle {
    pub fn new(id: impl Into<String>) -> Self {
        MediaHandle(id.into())
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audio playback and capture. Implementations must not block: the line
/// calls these from its event loop.
#[cfg_attr(test, mockall::automock)]
pub trait MediaEngine: Send + Sync {
    /// Routes the remote stream of `media` to the playback `sink`.
    fn bind_remote_stream(&self, media: &MediaHandle, sink: &str) -> anyhow::Result<()>;
    fn unbind(&self, sink: &str);
    /// Enables or silences the local capture track.
    fn set_local_track_enabled(&self, enabled: bool);
}
