//! Control-plane lifecycle for Linux loop devices.
//!
//! Binds regular files to loop block devices, discovers free and in-use
//! devices without a kernel listing API, answers "is this device already
//! bound to this file" queries, and detaches bindings. On-disk formats and
//! block I/O through the bound device are out of scope; this crate only
//! manages the device-to-file association.

pub mod associate;
pub mod bind;
pub mod enumerate;
pub mod error;
pub mod keys;
pub mod logging;
pub mod probe;
pub mod status;

pub use associate::{find_associated, find_free, is_associated, Association, FileIdentity};
pub use bind::{bind, unbind, BindReport, BindRequest, CipherSpec};
pub use enumerate::{
    DeviceTopology, FilterMode, LoopDeviceRef, LoopSearch, SearchCounters, DEFAULT_LOOP_COUNT,
};
pub use error::{LoopError, LoopResult};
pub use keys::{derive_key, FdReader, PassphraseSource, TerminalPrompt};
pub use probe::{is_loop_device, is_loop_used, LOOP_MAJOR};
pub use status::{query_status, BindingStatus, LO_FLAGS_AUTOCLEAR};
