//! File inputs and outputs around the engine: the firewall log, the
//! exclusion file and the status heartbeat.

pub mod exclusion_loader;
pub mod log_reader;
pub mod status_writer;

pub use exclusion_loader::{
    load_exclusions, parse_exclusions, ExclusionLoadError, LoadedExclusions, RejectedEntry,
};
pub use log_reader::{parse_line, LogAction, LogLine, LogRead, LogReadError, LogReader};
pub use status_writer::{StatusLine, StatusWriter, StatusWriterError};
