use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a stream's tracks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamSource {
    Camera,
    Screen,
    /// Placeholder with no tracks, used by spectators without a camera.
    Silent,
}

/// One capture track. Tracks are shared by reference with every session the
/// stream is attached to, so toggling `enabled` is seen by all peers at once.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: watch::Sender<bool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        let (live, _) = watch::channel(true);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            enabled: AtomicBool::new(true),
            live,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Stop the track. Stopping is permanent.
    pub fn stop(&self) {
        self.live.send_replace(false);
    }

    /// Resolves once the track has been stopped, by us or by the device.
    pub async fn ended(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }
}

#[derive(Debug)]
pub struct MediaStream {
    id: String,
    source: StreamSource,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(source: StreamSource, tracks: Vec<Arc<MediaTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            source,
            tracks,
        })
    }

    pub fn silent() -> Arc<Self> {
        Self::new(StreamSource::Silent, Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> StreamSource {
        self.source
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            source: self.source,
            audio_enabled: self.audio_tracks().any(|t| t.is_enabled()),
            video_enabled: self.video_tracks().any(|t| t.is_enabled()),
            live: self.is_live(),
        }
    }
}

/// Serializable view of a stream for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub source: StreamSource,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub live: bool,
}

/// Platform capture APIs. Errors are `MeshError::DeviceUnavailable` carrying
/// the platform's message.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Camera + microphone.
    async fn open_camera(&self) -> Result<Arc<MediaStream>>;
    /// Display capture. The platform stops the video track when the user
    /// ends sharing through the native control.
    async fn open_display(&self) -> Result<Arc<MediaStream>>;
}

/// Capture backend producing synthetic audio/video tracks. Used by headless
/// runs and in-process bots.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticDevices;

#[async_trait]
impl CaptureDevices for SyntheticDevices {
    async fn open_camera(&self) -> Result<Arc<MediaStream>> {
        Ok(MediaStream::new(
            StreamSource::Camera,
            vec![MediaTrack::new(TrackKind::Audio), MediaTrack::new(TrackKind::Video)],
        ))
    }

    async fn open_display(&self) -> Result<Arc<MediaStream>> {
        Ok(MediaStream::new(
            StreamSource::Screen,
            vec![MediaTrack::new(TrackKind::Video), MediaTrack::new(TrackKind::Audio)],
        ))
    }
}

/// Holds at most one live local capture stream.
pub struct LocalMediaSource {
    devices: Arc<dyn CaptureDevices>,
    current: Option<Arc<MediaStream>>,
    muted: bool,
    video_enabled: bool,
}

impl LocalMediaSource {
    pub fn new(devices: Arc<dyn CaptureDevices>) -> Self {
        Self {
            devices,
            current: None,
            muted: false,
            video_enabled: true,
        }
    }

    pub fn current(&self) -> Option<&Arc<MediaStream>> {
        self.current.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.is_live())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.source() == StreamSource::Screen)
    }

    /// The current stream is stopped before the camera is opened; the
    /// device is exclusive. A failed open leaves no stream at all.
    pub async fn acquire_camera(&mut self) -> Result<Arc<MediaStream>> {
        if let Some(previous) = self.current.take() {
            previous.stop();
            debug!("Stopped local stream {} before reopening camera", previous.id());
        }
        let stream = self.devices.open_camera().await?;
        self.install(stream.clone());
        info!("Camera acquired (stream {})", stream.id());
        Ok(stream)
    }

    pub async fn acquire_screen_share(&mut self) -> Result<Arc<MediaStream>> {
        let stream = self.devices.open_display().await?;
        self.install(stream.clone());
        info!("Screen share acquired (stream {})", stream.id());
        Ok(stream)
    }

    /// Install a placeholder stream with no tracks.
    pub fn use_silent(&mut self) -> Arc<MediaStream> {
        let stream = MediaStream::silent();
        self.install(stream.clone());
        stream
    }

    /// Resolves when the current screen share is ended from outside (the
    /// native "stop sharing" control). Pending forever otherwise.
    pub async fn screen_share_ended(&self) {
        let track = self
            .current
            .as_ref()
            .filter(|s| s.source() == StreamSource::Screen)
            .and_then(|s| s.video_tracks().next().cloned());
        match track {
            Some(track) => track.ended().await,
            None => std::future::pending::<()>().await,
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(stream) = &self.current {
            for track in stream.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        debug!("Local audio muted={}", muted);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        if let Some(stream) = &self.current {
            for track in stream.video_tracks() {
                track.set_enabled(enabled);
            }
        }
        debug!("Local video enabled={}", enabled);
    }

    /// Stop every track and forget the stream. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(stream) = self.current.take() {
            stream.stop();
            info!("Local media released (stream {})", stream.id());
        }
        self.muted = false;
        self.video_enabled = true;
    }

    /// Display capture is opened before the old stream is stopped, so a
    /// cancelled picker leaves the camera running.
    fn install(&mut self, stream: Arc<MediaStream>) {
        if let Some(previous) = self.current.take() {
            previous.stop();
            debug!("Stopped previous local stream {}", previous.id());
        }
        for track in stream.audio_tracks() {
            track.set_enabled(!self.muted);
        }
        for track in stream.video_tracks() {
            track.set_enabled(self.video_enabled);
        }
        self.current = Some(stream);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::error::{DeviceFailure, MeshError};

    /// Scripted capture devices: camera may be denied, every opened stream
    /// is recorded so tests can inspect track state.
    #[derive(Default)]
    pub struct ScriptedDevices {
        pub deny_camera: bool,
        /// Refuse a camera open while an earlier camera stream is live.
        pub exclusive_camera: bool,
        pub opened: Mutex<Vec<Arc<MediaStream>>>,
    }

    impl ScriptedDevices {
        pub fn denying_camera() -> Self {
            Self {
                deny_camera: true,
                ..Default::default()
            }
        }

        pub fn exclusive_camera() -> Self {
            Self {
                exclusive_camera: true,
                ..Default::default()
            }
        }

        pub fn opened(&self) -> Vec<Arc<MediaStream>> {
            self.opened.lock().map(|v| v.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl CaptureDevices for ScriptedDevices {
        async fn open_camera(&self) -> Result<Arc<MediaStream>> {
            if self.deny_camera {
                return Err(MeshError::DeviceUnavailable {
                    kind: DeviceFailure::PermissionDenied,
                    reason: "Permission denied".to_string(),
                });
            }
            let camera_busy = self
                .opened()
                .iter()
                .any(|s| s.source() == StreamSource::Camera && s.is_live());
            if self.exclusive_camera && camera_busy {
                return Err(MeshError::DeviceUnavailable {
                    kind: DeviceFailure::DeviceBusy,
                    reason: "Could not start video source".to_string(),
                });
            }
            let stream = SyntheticDevices.open_camera().await?;
            self.opened.lock().unwrap().push(stream.clone());
            Ok(stream)
        }

        async fn open_display(&self) -> Result<Arc<MediaStream>> {
            let stream = SyntheticDevices.open_display().await?;
            self.opened.lock().unwrap().push(stream.clone());
            Ok(stream)
        }
    }
}
