//! V4L2 camera access.
//!
//! Currently, only V4L2 `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are
//! supported. [`CaptureSource`] opens every such device at once and yields one [`FrameSet`] per
//! poll.

use std::{
    cmp,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, SyncSender, TrySendError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::bail;
use linuxvideo::{
    format::{FrameIntervals, FrameSizes, PixFormat, PixelFormat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device, Fract,
};

use crate::image::{Image, Resolution};
use crate::preview::FrameSource;
use crate::timer::{FpsCounter, Timer};

/// How long [`CaptureSource::read`] waits for every camera to deliver a frame before giving up.
///
/// A stalled device turns into a [`CaptureError::Timeout`] instead of hanging the process.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Error raised when opening the capture source fails. Fatal, the preview loop never starts.
#[derive(Debug)]
pub enum DeviceError {
    /// No connected device supports video capture in a format we can decode.
    NoDevice,
    /// A capture-capable device was found but could not be initialized.
    Init { device: String, reason: String },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "no supported camera device found"),
            Self::Init { device, reason } => {
                write!(f, "failed to initialize camera device {device}: {reason}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Error raised while streaming. Fatal, the preview loop propagates it without cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The device stopped producing frames mid-stream.
    Disconnected { camera: usize },
    /// The device produced no frame within [`READ_TIMEOUT`].
    Timeout { camera: usize },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected { camera } => {
                write!(f, "camera {camera} stopped producing frames")
            }
            Self::Timeout { camera } => write!(
                f,
                "camera {camera} produced no frame within {}s",
                READ_TIMEOUT.as_secs()
            ),
        }
    }
}

impl std::error::Error for CaptureError {}

/// An ordered set of frames, one per opened camera, captured at approximately the same instant.
pub struct FrameSet {
    frames: Vec<Image>,
    timestamp: Instant,
}

impl FrameSet {
    /// Creates a frame set from one frame per camera, in camera order.
    pub fn new(frames: Vec<Image>, timestamp: Instant) -> Self {
        Self { frames, timestamp }
    }

    /// Returns the frames in camera order (frame `i` belongs to camera `i`).
    #[inline]
    pub fn frames(&self) -> &[Image] {
        &self.frames
    }

    /// Returns the instant at which this set was assembled.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Returns the number of frames (and thus cameras) in this set.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Clone, Copy)]
struct FrameFormat {
    resolution: Resolution,
    frame_interval: Fract,
}

impl FrameFormat {
    fn frame_rate(&self) -> f32 {
        1.0 / self.frame_interval.as_f32()
    }
}

/// Picks the format with the highest resolution, breaking ties by the highest frame rate.
fn select_format(formats: &[FrameFormat]) -> Option<FrameFormat> {
    let mut formats = formats.to_vec();
    formats.sort_by(|a, b| {
        (a.resolution.num_pixels(), a.frame_rate())
            .partial_cmp(&(b.resolution.num_pixels(), b.frame_rate()))
            .unwrap_or(cmp::Ordering::Equal)
    });
    formats.last().copied()
}

/// Negotiates a frame format with `device`.
///
/// Returns `None` if the device offers no JPEG or MJPG format (the device is skipped, not an
/// error).
fn negotiate_format(device: &Device) -> anyhow::Result<Option<(PixFormat, Fract)>> {
    let mut pixel_format = None;
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?;
        if format.pixel_format() == PixelFormat::JPEG || format.pixel_format() == PixelFormat::MJPG {
            pixel_format = Some(format.pixel_format());
            break;
        }
    }

    let Some(pixel_format) = pixel_format else {
        return Ok(None);
    };

    let mut formats = Vec::new();
    match device.frame_sizes(pixel_format)? {
        FrameSizes::Discrete(sizes) => {
            for size in sizes {
                let intervals =
                    match device.frame_intervals(pixel_format, size.width(), size.height())? {
                        FrameIntervals::Discrete(intervals) => intervals,
                        FrameIntervals::Stepwise(_) | FrameIntervals::Continuous(_) => {
                            bail!("stepwise or continuous frame rates are not supported")
                        }
                    };
                for rate in intervals {
                    formats.push(FrameFormat {
                        resolution: Resolution::new(size.width(), size.height()),
                        frame_interval: *rate.fract(),
                    });
                }
            }
        }
        FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
            bail!("stepwise or continuous resolutions are not supported");
        }
    }

    match select_format(&formats) {
        Some(fmt) => Ok(Some((
            PixFormat::new(
                fmt.resolution.width(),
                fmt.resolution.height(),
                pixel_format,
            ),
            fmt.frame_interval,
        ))),
        None => bail!("failed to negotiate a camera format"),
    }
}

/// A single open camera device yielding a stream of [`Image`]s.
struct Camera {
    stream: ReadStream,
    width: u32,
    height: u32,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl Camera {
    /// Opens `dev` if it is a supported capture device.
    ///
    /// This function can block for a significant amount of time while the camera initializes (on
    /// the order of hundreds of milliseconds).
    fn open(dev: Device) -> anyhow::Result<Option<Self>> {
        let caps = dev.capabilities()?;
        let cap_flags = caps.device_capabilities();
        let path = dev.path()?;
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );

        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            return Ok(None);
        }

        let Some((pixfmt, fract)) = negotiate_format(&dev)? else {
            log::debug!("device {} has no supported pixel format, skipping", caps.card());
            return Ok(None);
        };

        let capture = dev.video_capture(pixfmt)?;

        let format = capture.format();
        let width = format.width();
        let height = format.height();

        let actual = capture.set_frame_interval(fract)?;

        log::info!(
            "opened {} ({}), {}x{} @ {:.1}Hz",
            caps.card(),
            path.display(),
            width,
            height,
            1.0 / actual.as_f32(),
        );

        let stream = capture.into_stream()?;

        Ok(Some(Self {
            stream,
            width,
            height,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        }))
    }

    /// Reads the next frame from the camera, blocking until one is available.
    fn read(&mut self) -> anyhow::Result<Image> {
        let dequeue_guard = self.t_dequeue.start();
        self.stream
            .dequeue(|buf| {
                drop(dequeue_guard);
                let image = match self.t_decode.time(|| Image::decode_jpeg(&buf)) {
                    Ok(image) => image,
                    Err(e) => {
                        // As sad as it is, but even high-quality webcams produce occasional
                        // corrupted MJPG frames, presumably due to USB data corruption. Hand back
                        // a blank image instead of skipping the frame, which causes 2x latency
                        // spikes.
                        log::error!("camera decode error: {}", e);
                        Image::new(self.width, self.height)
                    }
                };
                Ok(image)
            })
            .map_err(Into::into)
    }

    /// Returns profiling timers for camera access and decoding.
    fn timers(&self) -> impl IntoIterator<Item = &Timer> + '_ {
        [&self.t_dequeue, &self.t_decode]
    }

    /// Capture thread body: keeps the most recent frame buffered in `tx` until `stop` is set or
    /// the device fails.
    fn run(&mut self, index: usize, tx: SyncSender<Result<Image, CaptureError>>, stop: Arc<AtomicBool>) {
        let mut fps = FpsCounter::new(format!("camera {index}"));
        while !stop.load(Ordering::Relaxed) {
            match self.read() {
                Ok(frame) => {
                    fps.tick_with(self.timers());
                    match tx.try_send(Ok(frame)) {
                        // A full buffer means the consumer hasn't caught up yet; the frame it
                        // already holds is recent enough.
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                Err(e) => {
                    log::error!("camera {index}: {e}");
                    let _ = tx.try_send(Err(CaptureError::Disconnected { camera: index }));
                    return;
                }
            }
        }
    }
}

/// Receives the next frame from one camera's channel, observing `deadline`.
///
/// Anything that queued up while the caller was busy is drained so that the newest frame wins.
fn recv_latest(
    rx: &mpsc::Receiver<Result<Image, CaptureError>>,
    camera: usize,
    deadline: Instant,
) -> Result<Image, CaptureError> {
    let timeout = deadline.saturating_duration_since(Instant::now());
    let mut frame = match rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(RecvTimeoutError::Timeout) => return Err(CaptureError::Timeout { camera }),
        Err(RecvTimeoutError::Disconnected) => return Err(CaptureError::Disconnected { camera }),
    };
    while let Ok(result) = rx.try_recv() {
        frame = result?;
    }
    Ok(frame)
}

struct CaptureWorker {
    index: usize,
    rx: mpsc::Receiver<Result<Image, CaptureError>>,
    thread: JoinHandle<()>,
}

/// The open connection to all camera devices.
///
/// Created once by [`CaptureSource::open`], polled by the preview loop, and released exactly once
/// by [`CaptureSource::close`]. Dropping it without closing only signals the capture threads to
/// stop, so the fatal-error path cannot hang on a stalled device.
pub struct CaptureSource {
    workers: Vec<CaptureWorker>,
    stop: Arc<AtomicBool>,
}

impl CaptureSource {
    /// Detects and opens all supported camera devices.
    ///
    /// Devices that are not capture-capable or yield no decodable format are skipped. A
    /// capture-capable device that fails to initialize aborts the whole open.
    pub fn open() -> Result<Self, DeviceError> {
        let list = linuxvideo::list().map_err(|e| DeviceError::Init {
            device: "/dev".into(),
            reason: e.to_string(),
        })?;

        let mut cameras = Vec::new();
        for res in list {
            match res {
                Ok(dev) => {
                    let device = match dev.path() {
                        Ok(path) => path.display().to_string(),
                        Err(_) => "<unknown>".into(),
                    };
                    match Camera::open(dev) {
                        Ok(Some(camera)) => cameras.push(camera),
                        Ok(None) => {}
                        Err(e) => {
                            return Err(DeviceError::Init {
                                device,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                Err(e) => {
                    log::warn!("{}", e);
                }
            }
        }

        if cameras.is_empty() {
            return Err(DeviceError::NoDevice);
        }
        log::info!("opened {} camera(s)", cameras.len());

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(cameras.len());
        for (index, mut camera) in cameras.into_iter().enumerate() {
            let (tx, rx) = mpsc::sync_channel(1);
            let thread_stop = Arc::clone(&stop);
            let thread = thread::Builder::new()
                .name(format!("camera-{index}"))
                .spawn(move || camera.run(index, tx, thread_stop))
                .map_err(|e| DeviceError::Init {
                    device: format!("camera {index}"),
                    reason: e.to_string(),
                })?;
            workers.push(CaptureWorker { index, rx, thread });
        }

        Ok(Self { workers, stop })
    }

    /// Returns the number of opened cameras.
    pub fn cameras(&self) -> usize {
        self.workers.len()
    }

    /// Blocks until every camera has delivered a frame, for at most [`READ_TIMEOUT`].
    ///
    /// Frames that arrived while the caller was busy are discarded in favor of the most recent
    /// one, so repeated calls always observe fresh data.
    pub fn read(&mut self) -> Result<FrameSet, CaptureError> {
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut frames = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            frames.push(recv_latest(&worker.rx, worker.index, deadline)?);
        }

        Ok(FrameSet::new(frames, Instant::now()))
    }

    /// Releases all camera handles.
    ///
    /// Consumes the source, so it can only be called once. Blocks until every capture thread has
    /// exited, which takes at most one frame interval per healthy camera.
    pub fn close(mut self) -> Result<(), CaptureError> {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            drop(worker.rx);
            if worker.thread.join().is_err() {
                log::error!("camera {} capture thread panicked", worker.index);
            }
        }
        log::info!("all cameras released");
        Ok(())
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        // Signal the capture threads without joining them: on the fatal-error path a stalled
        // device must not be able to hang process shutdown. The threads release their camera
        // handles as soon as they notice the flag.
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl FrameSource for CaptureSource {
    fn read(&mut self) -> Result<FrameSet, CaptureError> {
        CaptureSource::read(self)
    }

    fn close(self) -> Result<(), CaptureError> {
        CaptureSource::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(width: u32, height: u32, num: u32, denom: u32) -> FrameFormat {
        FrameFormat {
            resolution: Resolution::new(width, height),
            frame_interval: Fract::new(num, denom),
        }
    }

    #[test]
    fn select_format_empty() {
        assert!(select_format(&[]).is_none());
    }

    #[test]
    fn select_format_prefers_resolution() {
        let selected = select_format(&[
            fmt(640, 480, 1, 60),
            fmt(1920, 1080, 1, 30),
            fmt(1280, 720, 1, 60),
        ])
        .unwrap();
        assert_eq!(selected.resolution, Resolution::new(1920, 1080));
    }

    #[test]
    fn select_format_breaks_ties_by_frame_rate() {
        let selected = select_format(&[
            fmt(1280, 720, 1, 30),
            fmt(1280, 720, 1, 60),
            fmt(1280, 720, 1, 10),
        ])
        .unwrap();
        assert!((selected.frame_rate() - 60.0).abs() < 0.01);
    }

    #[test]
    fn recv_latest_times_out_on_stalled_channel() {
        let (tx, rx) = mpsc::channel::<Result<Image, CaptureError>>();
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = recv_latest(&rx, 3, deadline).unwrap_err();
        assert_eq!(err, CaptureError::Timeout { camera: 3 });
        drop(tx);
    }

    #[test]
    fn recv_latest_keeps_only_the_newest_frame() {
        let (tx, rx) = mpsc::channel();
        tx.send(Ok(Image::new(2, 2))).unwrap();
        tx.send(Ok(Image::new(4, 4))).unwrap();
        tx.send(Ok(Image::new(8, 8))).unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let frame = recv_latest(&rx, 0, deadline).unwrap();
        assert_eq!(frame.resolution(), Resolution::new(8, 8));
        // The backlog was consumed, not just peeked at.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn recv_latest_reports_hung_up_channel_as_disconnect() {
        let (tx, rx) = mpsc::channel::<Result<Image, CaptureError>>();
        drop(tx);
        let deadline = Instant::now() + Duration::from_millis(100);
        let err = recv_latest(&rx, 1, deadline).unwrap_err();
        assert_eq!(err, CaptureError::Disconnected { camera: 1 });
    }

    #[test]
    fn recv_latest_forwards_capture_errors() {
        let (tx, rx) = mpsc::channel();
        tx.send(Ok(Image::new(2, 2))).unwrap();
        tx.send(Err(CaptureError::Disconnected { camera: 5 })).unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = recv_latest(&rx, 5, deadline).unwrap_err();
        assert_eq!(err, CaptureError::Disconnected { camera: 5 });
    }

    #[test]
    fn frame_set_preserves_camera_order() {
        let set = FrameSet::new(vec![Image::new(4, 2), Image::new(8, 4)], Instant::now());
        assert_eq!(set.len(), 2);
        assert_eq!(set.frames()[0].resolution(), Resolution::new(4, 2));
        assert_eq!(set.frames()[1].resolution(), Resolution::new(8, 4));
    }
}
