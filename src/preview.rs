//! The preview loop: polls the capture source and renders every camera's frame into its own
//! window until the quit key is pressed.

use std::time::Duration;

use crate::camera::{CaptureError, FrameSet};
use crate::image::Image;
use crate::timer::FpsCounter;

/// The key that stops the preview loop.
pub const QUIT_KEY: char = 'q';

/// How long each iteration waits for a key press.
///
/// This wait is also the point where control yields to the display subsystem, so it must not be
/// zero.
const KEY_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Produces synchronized frame sets, one frame per camera.
pub trait FrameSource {
    /// Blocks until the next frame set is available.
    fn read(&mut self) -> Result<FrameSet, CaptureError>;

    /// Releases all camera handles. Consumes the source, so it can only be called once.
    fn close(self) -> Result<(), CaptureError>
    where
        Self: Sized;
}

/// Renders frames into named windows and reports key presses.
pub trait PreviewSink {
    /// Displays `frame` in the window named `window`, creating it on first use.
    fn show(&mut self, window: &str, frame: &Image);

    /// Waits up to `timeout` for a key press.
    fn wait_key(&mut self, timeout: Duration) -> Option<char>;

    /// Destroys all windows.
    fn close_all(&mut self);
}

enum State {
    Running,
    Stopping,
}

/// Returns the window title for the camera at `index` (0-based).
pub fn window_title(index: usize) -> String {
    format!("Camera {} Frame", index + 1)
}

/// Runs the preview loop until [`QUIT_KEY`] is pressed.
///
/// On a clean quit the source is closed exactly once and all windows are destroyed once, in that
/// order. A [`CaptureError`] is fatal and propagates without reaching either cleanup step.
pub fn run<S, D>(mut source: S, sink: &mut D) -> Result<(), CaptureError>
where
    S: FrameSource,
    D: PreviewSink,
{
    let mut fps = FpsCounter::new("preview");
    let mut state = State::Running;
    while let State::Running = state {
        let set = source.read()?;
        for (i, frame) in set.frames().iter().enumerate() {
            sink.show(&window_title(i), frame);
        }
        fps.tick();

        if sink.wait_key(KEY_POLL_TIMEOUT) == Some(QUIT_KEY) {
            state = State::Stopping;
        }
    }

    source.close()?;
    sink.close_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{cell::Cell, collections::VecDeque, rc::Rc, time::Instant};

    struct FakeSource {
        cameras: usize,
        reads: Rc<Cell<usize>>,
        closed: Rc<Cell<usize>>,
        /// 1-based read index that fails with a capture error.
        fail_on: Option<usize>,
    }

    impl FakeSource {
        fn new(cameras: usize) -> Self {
            Self {
                cameras,
                reads: Rc::new(Cell::new(0)),
                closed: Rc::new(Cell::new(0)),
                fail_on: None,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn read(&mut self) -> Result<FrameSet, CaptureError> {
            let n = self.reads.get() + 1;
            self.reads.set(n);
            if self.fail_on == Some(n) {
                return Err(CaptureError::Disconnected { camera: 0 });
            }
            let frames = (0..self.cameras).map(|_| Image::new(2, 2)).collect();
            Ok(FrameSet::new(frames, Instant::now()))
        }

        fn close(self) -> Result<(), CaptureError> {
            self.closed.set(self.closed.get() + 1);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        shown: Vec<String>,
        keys: VecDeque<Option<char>>,
        close_all_calls: usize,
    }

    impl FakeSink {
        fn with_keys(keys: impl IntoIterator<Item = Option<char>>) -> Self {
            Self {
                keys: keys.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl PreviewSink for FakeSink {
        fn show(&mut self, window: &str, _frame: &Image) {
            self.shown.push(window.to_string());
        }

        fn wait_key(&mut self, _timeout: Duration) -> Option<char> {
            self.keys.pop_front().flatten()
        }

        fn close_all(&mut self) {
            self.close_all_calls += 1;
        }
    }

    #[test]
    fn window_titles_are_one_based() {
        assert_eq!(window_title(0), "Camera 1 Frame");
        assert_eq!(window_title(1), "Camera 2 Frame");
        assert_eq!(window_title(9), "Camera 10 Frame");
    }

    #[test]
    fn renders_one_window_per_camera() {
        let source = FakeSource::new(2);
        let reads = Rc::clone(&source.reads);
        let closed = Rc::clone(&source.closed);
        let mut sink = FakeSink::with_keys([None, None, Some(QUIT_KEY)]);

        run(source, &mut sink).unwrap();

        assert_eq!(reads.get(), 3);
        assert_eq!(sink.shown.len(), 6);
        for pair in sink.shown.chunks(2) {
            assert_eq!(pair, ["Camera 1 Frame", "Camera 2 Frame"]);
        }
        assert_eq!(closed.get(), 1);
        assert_eq!(sink.close_all_calls, 1);
    }

    #[test]
    fn quit_key_stops_within_one_iteration() {
        let source = FakeSource::new(1);
        let reads = Rc::clone(&source.reads);
        let mut sink = FakeSink::with_keys([Some(QUIT_KEY)]);

        run(source, &mut sink).unwrap();

        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn other_keys_are_ignored() {
        let source = FakeSource::new(1);
        let reads = Rc::clone(&source.reads);
        let mut sink = FakeSink::with_keys([Some('a'), Some('Q'), Some(QUIT_KEY)]);

        run(source, &mut sink).unwrap();

        assert_eq!(reads.get(), 3);
    }

    #[test]
    fn capture_error_skips_cleanup() {
        let mut source = FakeSource::new(1);
        source.fail_on = Some(2);
        let closed = Rc::clone(&source.closed);
        let mut sink = FakeSink::with_keys([None, None, None]);

        let err = run(source, &mut sink).unwrap_err();

        assert_eq!(err, CaptureError::Disconnected { camera: 0 });
        assert_eq!(closed.get(), 0);
        assert_eq!(sink.close_all_calls, 0);
        // The first iteration still rendered its frame.
        assert_eq!(sink.shown, ["Camera 1 Frame"]);
    }
}
