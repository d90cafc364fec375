mod handle;
mod managed;

pub use handle::{GcField, RawHandle};
pub use managed::Managed;
