pub mod access_log;
pub mod entry;
pub mod migrate;
pub mod side_store;
pub mod writer;

pub use access_log::JsonlMirror;
pub use entry::{AuthInfo, FailoverInfo, LogEntry, RequestType, SideRefs};
pub use side_store::{SideKind, SideStore};
pub use writer::AccessLogWriter;
