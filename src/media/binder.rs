use super::{MediaEngine, MediaHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Attaches the remote stream of the connected session to the playback sink
/// and keeps the local mute state applied.
pub struct MediaBinder {
    engine: Arc<dyn MediaEngine>,
    sink: String,
    bound: Option<MediaHandle>,
    muted: bool,
}

impl MediaBinder {
    pub fn new(engine: Arc<dyn MediaEngine>, sink: impl Into<String>) -> Self {
        Self {
            engine,
            sink: sink.into(),
            bound: None,
            muted: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Binding while already bound to the same media is a no-op.
    pub fn bind(&mut self, media: &MediaHandle) -> anyhow::Result<()> {
        if self.bound.as_ref() == Some(media) {
            return Ok(());
        }
        if self.bound.is_some() {
            self.unbind();
        }
        self.engine.bind_remote_stream(media, &self.sink)?;
        info!(%media, sink = self.sink, "remote stream bound");
        self.bound = Some(media.clone());
        self.engine.set_local_track_enabled(!self.muted);
        Ok(())
    }

    pub fn unbind(&mut self) {
        if let Some(media) = self.bound.take() {
            self.engine.unbind(&self.sink);
            debug!(%media, sink = self.sink, "remote stream unbound");
        }
    }

    /// Records the mute flag; it reaches the engine only while bound.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if self.bound.is_some() {
            self.engine.set_local_track_enabled(!muted);
        } else {
            debug!(muted, "no bound media, mute recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MockMediaEngine;
    use mockall::predicate::*;

    #[test]
    fn test_bind_applies_mute_state() {
        let mut engine = MockMediaEngine::new();
        engine
            .expect_bind_remote_stream()
            .with(eq(MediaHandle::new("m1")), eq("default"))
            .times(1)
            .returning(|_, _| Ok(()));
        engine
            .expect_set_local_track_enabled()
            .with(eq(false))
            .times(1)
            .return_const(());

        let mut binder = MediaBinder::new(Arc::new(engine), "default");
        binder.set_muted(true);
        binder.bind(&MediaHandle::new("m1")).unwrap();
        assert!(binder.is_bound());
        // same media again must not rebind
        binder.bind(&MediaHandle::new("m1")).unwrap();
    }

    #[test]
    fn test_unbind_only_when_bound() {
        let mut engine = MockMediaEngine::new();
        engine.expect_unbind().times(1).return_const(());
        engine.expect_bind_remote_stream().returning(|_, _| Ok(()));
        engine.expect_set_local_track_enabled().return_const(());

        let mut binder = MediaBinder::new(Arc::new(engine), "speaker");
        binder.unbind();
        binder.bind(&MediaHandle::new("m2")).unwrap();
        binder.unbind();
        binder.unbind();
        assert!(!binder.is_bound());
    }

    #[test]
    fn test_bind_failure_leaves_unbound() {
        let mut engine = MockMediaEngine::new();
        engine
            .expect_bind_remote_stream()
            .returning(|_, _| Err(anyhow::anyhow!("no such device")));
        engine.expect_set_local_track_enabled().never();

        let mut binder = MediaBinder::new(Arc::new(engine), "missing");
        let err = binder.bind(&MediaHandle::new("m3")).unwrap_err();
        assert_eq!(err.to_string(), "no such device");
        assert!(!binder.is_bound());
    }

    #[test]
    fn test_mute_reaches_engine_only_when_bound() {
        let mut engine = MockMediaEngine::new();
        engine.expect_bind_remote_stream().returning(|_, _| Ok(()));
        engine
            .expect_set_local_track_enabled()
            .with(eq(true))
            .times(1)
            .return_const(());
        engine
            .expect_set_local_track_enabled()
            .with(eq(false))
            .times(1)
            .return_const(());

        let mut binder = MediaBinder::new(Arc::new(engine), "default");
        binder.bind(&MediaHandle::new("m4")).unwrap();
        binder.set_muted(true);
        assert!(binder.is_muted());
    }
}
