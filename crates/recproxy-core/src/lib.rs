//! recproxy core - capture layout, capture sink and access log.
//!
//! This crate holds everything the recording proxy does with the filesystem.
//! The proxy engine computes a [`CaptureTarget`] with the [`PathMapper`],
//! streams the response into a [`CaptureSink`] and, once the exchange
//! completes, appends a line through the [`AccessLogger`].
//!
//! ## Layout
//!
//! ```text
//! {root}/
//!   10.0.0.5/
//!     access_log.txt
//!     http/www.example.com/80/index.html.2024-03-05T07-08-09-042
//!     https/www.example.com/443/no-name.txt.2024-03-05T07-08-10-117
//!   10.0.0.6/
//!     http/cdn.example.net/8080/img/logo.png.2024-03-05T07-09-00-000
//! ```

pub mod access_log;
mod error;
pub mod path_map;
pub mod sink;
pub mod target;

pub use access_log::{AccessLogEntry, AccessLogger, ResponseSize, ACCESS_LOG_FILE};
pub use error::{CaptureError, Result};
pub use path_map::{map_to_path, normalize, CaptureTarget, PathMapper, DEFAULT_FILE_NAME};
pub use sink::{CaptureOutcome, CaptureSink};
pub use target::{ClientAddress, Scheme, TargetUrl};
