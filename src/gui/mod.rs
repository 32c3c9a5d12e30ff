//! Window management: one window per camera, keyboard input, teardown.
//!
//! The display server connection and the event loop live on the main thread, so application code
//! runs on a second thread started by [`run`] and talks to this module through a global
//! [`Display`] handle.

mod renderer;

use std::{
    collections::HashMap,
    convert::Infallible,
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    rc::Rc,
    sync::{mpsc, Mutex, OnceLock},
    time::Duration,
};

use winit::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopBuilder, EventLoopProxy},
    window::WindowId,
};

use crate::{
    image::{Image, Resolution},
    preview::PreviewSink,
};

use self::renderer::{Gpu, Renderer, Window};

struct Gui {
    gpu: Rc<Gpu>,
    windows: HashMap<String, Renderer>,
    win_id_to_key: HashMap<WindowId, String>,
    key_tx: mpsc::Sender<char>,
}

impl Gui {
    fn new(key_tx: mpsc::Sender<char>) -> Self {
        Self {
            gpu: Rc::new(pollster::block_on(Gpu::open()).unwrap()),
            windows: HashMap::new(),
            win_id_to_key: HashMap::new(),
            key_tx,
        }
    }

    fn get_renderer_mut(&mut self, win: WindowId) -> Option<&mut Renderer> {
        // The window might be gone already if a `CloseAll` arrived before a queued redraw.
        let key = self.win_id_to_key.get(&win)?;
        self.windows.get_mut(key)
    }

    fn run(mut self, event_loop: EventLoop<Msg>) -> ! {
        event_loop.run(move |event, target, flow| {
            *flow = ControlFlow::Wait;
            match event {
                Event::UserEvent(msg) => match msg {
                    Msg::Image { key, res, data } => {
                        let renderer = self.windows.entry(key.clone()).or_insert_with(|| {
                            log::debug!("creating window '{key}' at {res}");

                            let win = Window::open(target, &key, res).unwrap();
                            let win_id = win.win.id();
                            let renderer = Renderer::new(win, self.gpu.clone()).unwrap();

                            self.win_id_to_key.insert(win_id, key.clone());

                            renderer
                        });

                        renderer.update_texture(res, &data);
                        renderer.window().request_redraw();
                    }
                    Msg::CloseAll => {
                        log::debug!("destroying {} window(s)", self.windows.len());
                        self.windows.clear();
                        self.win_id_to_key.clear();
                    }
                },
                Event::RedrawRequested(window) => {
                    if let Some(renderer) = self.get_renderer_mut(window) {
                        renderer.redraw();
                    }
                }
                Event::WindowEvent { event, window_id } => match event {
                    WindowEvent::ReceivedCharacter(ch) => {
                        self.key_tx.send(ch).ok();
                    }
                    WindowEvent::CloseRequested => {
                        // Windows are only torn down via `close_all`. The quit key is the supported
                        // way to exit.
                        log::debug!("ignoring close request for window {window_id:?}");
                    }
                    _ => {}
                },
                _ => {}
            }
        });
    }
}

#[derive(Debug)]
enum Msg {
    Image {
        key: String,
        res: Resolution,
        data: Vec<u8>,
    },
    CloseAll,
}

/// A connection to the windowing event loop.
pub struct Display {
    proxy: Mutex<EventLoopProxy<Msg>>,
    keys: Mutex<mpsc::Receiver<char>>,
}

impl Display {
    pub fn get() -> &'static Display {
        DISPLAY.get().expect("display not initialized")
    }
}

static DISPLAY: OnceLock<Display> = OnceLock::new();

fn send(msg: Msg) {
    Display::get()
        .proxy
        .lock()
        .unwrap()
        .send_event(msg)
        .unwrap();
}

/// Extends [`std::process::Termination`] with success introspection.
///
/// Not all platforms allow returning from the event loop handler, so [`run`] exits the process
/// itself depending on the [`Termination`] value returned by the application code.
pub trait Termination: process::Termination {
    fn is_success(&self) -> bool;
}

impl Termination for Infallible {
    fn is_success(&self) -> bool {
        match *self {}
    }
}

impl Termination for () {
    fn is_success(&self) -> bool {
        true
    }
}

impl<T: Termination, E: Debug> Termination for Result<T, E> {
    fn is_success(&self) -> bool {
        match self {
            Ok(term) => term.is_success(),
            Err(_) => false,
        }
    }
}

/// Takes over the main thread for the event loop and runs `cb` on a second thread.
///
/// Never returns. When `cb` finishes or panics, the process exits with a matching status code.
pub fn run<F, R>(cb: F) -> !
where
    F: FnOnce() -> R + Send + 'static,
    R: Termination + Send,
{
    let event_loop = EventLoopBuilder::with_user_event().build();
    let proxy = event_loop.create_proxy();
    let (key_tx, key_rx) = mpsc::channel();
    let display = Display {
        proxy: Mutex::new(proxy),
        keys: Mutex::new(key_rx),
    };
    DISPLAY
        .set(display)
        .ok()
        .expect("display already initialized");

    // Display is now reachable; spawn another thread to run the application code.
    std::thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(cb));
        match result {
            Ok(r) => {
                if r.is_success() {
                    process::exit(0);
                } else {
                    r.report(); // may print the error message
                    process::exit(1);
                }
            }
            Err(_payload) => {
                // Panic handler has printed the panic message and backtrace already, exit with 101
                // to mimick libstd behavior.
                process::exit(101);
            }
        }
    });

    let gui = Gui::new(key_tx);
    gui.run(event_loop);
}

/// Displays an image in the window named `key`, creating the window on first use.
pub fn show_image(key: impl Into<String>, image: &Image) {
    // Image data is RGBA8 internally so that no conversion before GPU upload is needed.
    let data = image.data().to_vec();

    send(Msg::Image {
        key: key.into(),
        res: image.resolution(),
        data,
    });
}

/// Waits up to `timeout` for a key press in any window.
pub fn wait_key(timeout: Duration) -> Option<char> {
    Display::get().keys.lock().unwrap().recv_timeout(timeout).ok()
}

/// Destroys all windows.
pub fn close_all() {
    send(Msg::CloseAll);
}

/// [`PreviewSink`] backed by the windows of this module.
pub struct GuiSink;

impl PreviewSink for GuiSink {
    fn show(&mut self, window: &str, frame: &Image) {
        show_image(window, frame);
    }

    fn wait_key(&mut self, timeout: Duration) -> Option<char> {
        wait_key(timeout)
    }

    fn close_all(&mut self) {
        close_all();
    }
}
