//! Runloop: a single-threaded, mode-partitioned, cooperative
//! event-dispatch scheduler with timers, framed message ports, and byte
//! streams.
//!
//! # Overview
//!
//! A [`RunLoop`] interleaves heterogeneous event sources — [`Timer`]s,
//! descriptor watchers, [`SocketPort`]/[`MessagePort`] message arrivals,
//! and scheduled byte streams — under named [`Mode`]s. Each dispatch
//! pass computes a wake deadline from the nearest timer, blocks in one
//! multiplexed wait for everything registered under the running mode,
//! then fires due timers oldest-first before delivering at most one
//! event per ready source.
//!
//! # Core Guarantees
//!
//! - **Mode isolation**: a source fires only while the loop runs a mode
//!   it was registered under (or the common pseudo-mode)
//! - **Timers before I/O**: within a pass, due timers always fire before
//!   any descriptor or port, so housekeeping is never starved
//! - **Prompt cancellation**: invalidating a timer or port, or removing
//!   a watcher, from inside any callback prevents every later firing —
//!   including later in the same pass
//! - **Fault isolation**: a per-source I/O error invalidates only that
//!   source and notifies its delegate; the loop itself only surfaces
//!   unrecoverable multiplexing failures
//! - **Whole messages**: a port delegate only ever sees fully
//!   reassembled length-prefixed frames, however the bytes arrived
//!
//! # Module Structure
//!
//! - [`run_loop`]: the scheduler, its watcher interface, and the poll
//!   wrapper
//! - [`timer`]: fire-date/interval timers with repeat policy
//! - [`port`]: framed message endpoints over sockets or same-host queues
//! - [`stream`]: byte-stream state machine over memory, file, and
//!   socket backends
//! - [`mode`], [`time`], [`error`]: names, deadlines, and the error
//!   taxonomy

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod mode;
pub mod port;
pub mod run_loop;
pub mod stream;
pub mod time;
pub mod timer;
pub(crate) mod util;

pub use error::{Error, ErrorKind, Result};
pub use mode::Mode;
pub use port::{
    FrameCodec, HandleId, MessagePort, MessagePortSender, Port, PortDelegate, PortId,
    PortMessage, SocketPort,
};
pub use run_loop::watcher::{SourceIdent, WatchEvent, WatchKind, Watcher};
pub use run_loop::{RunLoop, RunLoopBuilder, WeakRunLoop};
pub use stream::{
    InputStream, OutputStream, ServerStream, StreamEvent, StreamHandler, StreamStatus,
};
pub use time::Deadline;
pub use timer::Timer;
