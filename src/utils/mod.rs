//! 通用工具

pub mod clock;
pub mod event_stream;
pub mod multipart;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use event_stream::{EventStream, EventStreamData};
pub use multipart::{FormPart, MultipartForm, boundary_of, parse_form};
