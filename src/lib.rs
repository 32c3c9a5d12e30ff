//! Live preview windows for all connected V4L2 cameras.
//!
//! The [`camera`] module opens every supported capture device and yields
//! synchronized frame sets, and the [`preview`] module renders each camera's
//! stream into its own window until `q` is pressed.
//!
//! # Environment Variables
//!
//! * `CAMVIEW_JPEG_BACKEND`: Configures the JPEG image decoder to use. Allowed values are:
//!   * `jpeg-decoder`: uses the [jpeg-decoder] crate, robust but slow.
//!   * `zune-jpeg`: uses the [zune-jpeg] crate, somewhat faster.
//!
//! [jpeg-decoder]: https://github.com/image-rs/jpeg-decoder/
//! [zune-jpeg]: https://github.com/etemesi254/zune-jpeg

use log::LevelFilter;

pub mod camera;
pub mod gui;
pub mod image;
pub mod preview;
pub mod timer;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and camview will log at *debug* level, `wgpu` at *warn* level. `RUST_LOG` can
/// override both.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
