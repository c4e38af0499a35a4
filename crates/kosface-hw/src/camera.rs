//! V4L2 camera frame source via the `v4l` crate.
//!
//! A dedicated capture thread owns the device. It decodes every buffer to
//! RGB8 and publishes the newest frame on a watch channel; `start()` resolves
//! once the first frame has been decoded. Dequeues are bounded so a stalled
//! device still notices `stop()`.

use crate::convert::{self, PixelFormat};
use crate::source::{CameraError, FrameSource, StreamInfo};
use async_trait::async_trait;
use kosface_core::Frame;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Number of mmap buffers requested from the driver.
    pub buffers: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            buffers: 4,
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Longest a dequeue blocks before the capture thread re-checks its stop flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// How often `start()` checks whether a retired capture thread has exited.
const RETIRE_POLL: Duration = Duration::from_millis(20);

/// Formats tried in order during negotiation.
const PREFERRED_FORMATS: [PixelFormat; 4] =
    [PixelFormat::Yuyv, PixelFormat::Mjpg, PixelFormat::Grey, PixelFormat::Y16];

struct Running {
    stop: Arc<AtomicBool>,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    thread: JoinHandle<()>,
    /// Set once the first frame arrived.
    info: Option<StreamInfo>,
}

#[derive(Default)]
struct CameraState {
    running: Option<Running>,
    /// Stopped capture thread that may still hold the device.
    retired: Option<JoinHandle<()>>,
}

/// V4L2 camera implementing [`FrameSource`].
pub struct Camera {
    config: CameraConfig,
    state: Mutex<CameraState>,
}

impl Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CameraState::default()),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, CameraState> {
        // Capture state stays consistent across a panic in another holder.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the capture thread and register it as running.
    ///
    /// Registered before readiness so that `stop()` during start reaches the thread.
    fn spawn_capture(
        &self,
        state: &mut CameraState,
    ) -> Result<oneshot::Receiver<Result<StreamInfo, CameraError>>, CameraError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();

        let config = self.config.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("kosface-camera".into())
            .spawn(move || run_capture(config, thread_stop, frame_tx, ready_tx))
            .map_err(|e| CameraError::Unavailable(format!("failed to spawn capture thread: {e}")))?;

        state.running = Some(Running {
            stop,
            frames: frame_rx,
            thread,
            info: None,
        });
        Ok(ready_rx)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

#[async_trait]
impl FrameSource for Camera {
    async fn start(&self) -> Result<StreamInfo, CameraError> {
        let ready_rx = loop {
            {
                let mut state = self.state();
                if let Some(running) = &state.running {
                    return match &running.info {
                        Some(info) => Ok(info.clone()),
                        None => Err(CameraError::Unavailable("camera start already in progress".into())),
                    };
                }
                // The previous capture thread must release the device first; its
                // handle stays in `retired` until the thread has exited.
                match state.retired.take() {
                    Some(thread) if !thread.is_finished() => state.retired = Some(thread),
                    retired => {
                        if let Some(thread) = retired {
                            if thread.join().is_err() {
                                tracing::warn!(device = %self.config.device, "previous capture thread panicked");
                            }
                        }
                        break self.spawn_capture(&mut state)?;
                    }
                }
            }
            tokio::time::sleep(RETIRE_POLL).await;
        };

        let result = ready_rx
            .await
            .unwrap_or_else(|_| Err(CameraError::Unavailable("capture thread exited".into())));

        let mut state = self.state();
        match result {
            Ok(info) => match state.running.as_mut() {
                Some(running) => {
                    running.info = Some(info.clone());
                    Ok(info)
                }
                // Stopped while starting.
                None => Err(CameraError::Unavailable("camera stopped during start".into())),
            },
            Err(e) => {
                if let Some(running) = state.running.take() {
                    running.stop.store(true, Ordering::Release);
                    state.retired = Some(running.thread);
                }
                Err(e)
            }
        }
    }

    fn stop(&self) {
        let mut state = self.state();
        let Some(running) = state.running.take() else {
            return;
        };
        running.stop.store(true, Ordering::Release);
        state.retired = Some(running.thread);
        tracing::info!(device = %self.config.device, "camera stopped");
    }

    fn latest_frame(&self) -> Option<Arc<Frame>> {
        let state = self.state();
        let running = state.running.as_ref()?;
        let frame = running.frames.borrow().clone();
        frame
    }

    fn is_active(&self) -> bool {
        self.state().running.as_ref().is_some_and(|r| r.info.is_some())
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the device and negotiate a supported format near the requested size.
fn open_device(config: &CameraConfig) -> Result<(Device, StreamInfo), CameraError> {
    let path = config.device.as_str();
    if !Path::new(path).exists() {
        return Err(CameraError::NotFound(path.to_string()));
    }

    let device = Device::with_path(path).map_err(|e| CameraError::from_io(path, &e))?;
    let caps = device
        .query_caps()
        .map_err(|e| CameraError::from_io("query capabilities", &e))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::NotFound(format!("{path}: not a video capture device")));
    }
    tracing::info!(device = path, driver = %caps.driver, card = %caps.card, "opened camera");

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::from_io("get format", &e))?;

    for wanted in PREFERRED_FORMATS {
        fmt.fourcc = wanted.fourcc();
        fmt.width = config.width;
        fmt.height = config.height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::from_io("set format", &e))?;

        if let Some(format) = PixelFormat::from_fourcc(negotiated.fourcc) {
            tracing::info!(
                width = negotiated.width,
                height = negotiated.height,
                fourcc = ?negotiated.fourcc,
                "negotiated format"
            );
            let info = StreamInfo {
                device: path.to_string(),
                width: negotiated.width,
                height: negotiated.height,
                format,
            };
            return Ok((device, info));
        }
        tracing::debug!(requested = ?wanted, got = ?negotiated.fourcc, "format rejected");
    }

    Err(CameraError::Unavailable(format!(
        "{path}: no supported pixel format (need YUYV, MJPG, GREY or Y16)"
    )))
}

/// Raw driver buffers with their sequence numbers.
trait BufferStream {
    fn next_buffer(&mut self) -> io::Result<(&[u8], u32)>;
}

impl BufferStream for MmapStream<'_> {
    fn next_buffer(&mut self) -> io::Result<(&[u8], u32)> {
        let (buf, meta) = CaptureStream::next(self)?;
        Ok((buf, meta.sequence))
    }
}

/// Capture thread body. Exits when `stop` is set or the stream fails.
fn run_capture(
    config: CameraConfig,
    stop: Arc<AtomicBool>,
    frames: watch::Sender<Option<Arc<Frame>>>,
    ready: oneshot::Sender<Result<StreamInfo, CameraError>>,
) {
    let (device, info) = match open_device(&config) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream =
        match MmapStream::with_buffers(&device, BufType::VideoCapture, config.buffers) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(CameraError::from_io("create mmap stream", &e)));
                return;
            }
        };
    stream.set_timeout(DEQUEUE_TIMEOUT);

    pump_frames(&mut stream, info, &stop, &frames, ready);
}

/// Decode buffers and publish frames until `stop` is set or the stream fails.
///
/// A dequeue timeout is not an error: a stalled device keeps the thread
/// polling the stop flag so it can release the device.
fn pump_frames(
    stream: &mut impl BufferStream,
    mut info: StreamInfo,
    stop: &AtomicBool,
    frames: &watch::Sender<Option<Arc<Frame>>>,
    ready: oneshot::Sender<Result<StreamInfo, CameraError>>,
) {
    let mut ready = Some(ready);
    while !stop.load(Ordering::Acquire) {
        let (buf, seq) = match stream.next_buffer() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                tracing::trace!(device = %info.device, "no buffer within dequeue timeout");
                continue;
            }
            Err(e) => {
                let err = CameraError::from_io("dequeue buffer", &e);
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => tracing::error!(error = %err, "camera stream failed"),
                }
                break;
            }
        };

        let rgb = match convert::to_rgb(info.format, buf, info.width, info.height) {
            Ok(rgb) => rgb,
            Err(e) => {
                tracing::debug!(seq, error = %e, "dropping undecodable buffer");
                continue;
            }
        };
        let frame = match Frame::from_rgb(rgb.data, rgb.width, rgb.height, seq) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(seq, error = %e, "dropping malformed frame");
                continue;
            }
        };

        if let Some(tx) = ready.take() {
            // MJPG streams report their decoded size.
            info.width = frame.width;
            info.height = frame.height;
            tracing::info!(device = %info.device, width = info.width, height = info.height, "camera ready");
            if tx.send(Ok(info.clone())).is_err() {
                // Nobody is waiting any more.
                break;
            }
        }
        frames.send_replace(Some(Arc::new(frame)));
    }

    tracing::debug!(device = %info.device, "capture thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_device() -> CameraConfig {
        CameraConfig {
            device: "/dev/kosface-does-not-exist".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_missing_device_is_not_found() {
        let camera = Camera::new(missing_device());
        let err = camera.start().await.unwrap_err();
        assert!(matches!(err, CameraError::NotFound(_)), "got {err:?}");
        assert!(!camera.is_active());
        assert!(camera.latest_frame().is_none());
    }

    #[tokio::test]
    async fn test_restart_after_failure() {
        let camera = Camera::new(missing_device());
        assert!(camera.start().await.is_err());
        // The retired thread is joined before the second attempt.
        assert!(camera.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_waits_for_retired_thread() {
        let camera = Camera::new(missing_device());
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        camera.state().retired = Some(std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Release);
        }));

        assert!(camera.start().await.is_err());
        assert!(released.load(Ordering::Acquire), "device opened before the old thread exited");
    }

    /// Device that never delivers a buffer.
    struct StalledStream;

    impl BufferStream for StalledStream {
        fn next_buffer(&mut self) -> io::Result<(&[u8], u32)> {
            std::thread::sleep(Duration::from_millis(10));
            Err(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF"))
        }
    }

    /// Grey 4x2 buffers with increasing sequence numbers.
    struct GreyStream {
        buf: Vec<u8>,
        seq: u32,
    }

    impl BufferStream for GreyStream {
        fn next_buffer(&mut self) -> io::Result<(&[u8], u32)> {
            std::thread::sleep(Duration::from_millis(5));
            self.seq += 1;
            Ok((&self.buf, self.seq))
        }
    }

    fn stream_info(format: PixelFormat) -> StreamInfo {
        StreamInfo { device: "/dev/fake0".into(), width: 4, height: 2, format }
    }

    fn wait_finished(thread: &JoinHandle<()>) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !thread.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        thread.is_finished()
    }

    #[test]
    fn test_stalled_stream_exits_after_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            pump_frames(&mut StalledStream, stream_info(PixelFormat::Grey), &thread_stop, &frame_tx, ready_tx);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!thread.is_finished(), "timeouts must not end the stream");

        stop.store(true, Ordering::Release);
        assert!(wait_finished(&thread), "capture thread still holds the device after stop");
        thread.join().unwrap();

        assert!(ready_rx.blocking_recv().is_err(), "a stalled device never reports ready");
        assert!(frame_rx.borrow().is_none());
    }

    #[test]
    fn test_pump_reports_ready_and_publishes_frames() {
        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            let mut stream = GreyStream { buf: vec![200; 8], seq: 0 };
            pump_frames(&mut stream, stream_info(PixelFormat::Grey), &thread_stop, &frame_tx, ready_tx);
        });

        let info = ready_rx.blocking_recv().unwrap().unwrap();
        assert_eq!((info.width, info.height), (4, 2));
        std::thread::sleep(Duration::from_millis(30));
        let frame = frame_rx.borrow().clone().expect("frame published");
        assert_eq!(frame.rgb_at(0, 0), [200, 200, 200]);

        stop.store(true, Ordering::Release);
        assert!(wait_finished(&thread));
        thread.join().unwrap();
    }

    #[test]
    fn test_stop_when_not_started_is_noop() {
        let camera = Camera::new(CameraConfig::default());
        camera.stop();
        camera.stop();
        assert!(!camera.is_active());
    }

    #[test]
    fn test_default_config() {
        let config = CameraConfig::default();
        assert_eq!((config.width, config.height, config.buffers), (640, 480, 4));
    }
}
