//! LAN clipboard synchronisation.
//!
//! Local clipboard changes are broadcast as UDP datagrams on a fixed port and
//! every peer on the same broadcast domain applies what it receives. Content
//! too large for one datagram is split into base64 fragments and reassembled
//! on the other side.

pub mod runtime;

pub use runtime::{start_sync, RuntimeEvent, RuntimeLogEvent, SyncOptions, SyncTasks};
