use super::{MediaEngine, MediaHandle};
use std::{collections::HashMap, sync::Mutex};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackMediaState {
    /// sink -> bound media
    pub bindings: HashMap<String, MediaHandle>,
    pub local_track_enabled: bool,
}

/// Media engine without audio devices. Records what the line asked for.
pub struct LoopbackMedia {
    state: Mutex<LoopbackMediaState>,
}

impl Default for LoopbackMedia {
    fn default() -> Self {
        Self {
            state: Mutex::new(LoopbackMediaState {
                bindings: HashMap::new(),
                local_track_enabled: true,
            }),
        }
    }
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoopbackMediaState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn bound(&self, sink: &str) -> Option<MediaHandle> {
        self.state().bindings.get(sink).cloned()
    }
}

impl MediaEngine for LoopbackMedia {
    fn bind_remote_stream(&self, media: &MediaHandle, sink: &str) -> anyhow::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("media state poisoned"))?;
        info!(%media, sink, "loopback: playing remote stream");
        state.bindings.insert(sink.to_string(), media.clone());
        Ok(())
    }

    fn unbind(&self, sink: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.bindings.remove(sink);
        }
    }

    fn set_local_track_enabled(&self, enabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.local_track_enabled = enabled;
        }
    }
}
