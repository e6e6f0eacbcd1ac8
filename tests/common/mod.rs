#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use runloop::{
    Deadline, Error, ErrorKind, Mode, PortDelegate, PortMessage, RunLoop, StreamEvent,
    StreamHandler,
};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Initializes tracing output once for the whole test binary. Controlled
/// by `RUST_LOG`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Default patience for loop-driven expectations.
pub const DRIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs passes in `mode` until `done` answers true or `timeout` expires.
/// Returns the final verdict of `done`.
pub fn drive_until(
    run_loop: &RunLoop,
    mode: &Mode,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let give_up = Instant::now() + timeout;
    while Instant::now() < give_up {
        if done() {
            return true;
        }
        match run_loop.run_mode(mode, Deadline::after(Duration::from_millis(10))) {
            Ok(true) => {}
            // Nothing registered; let external state advance.
            Ok(false) => std::thread::sleep(Duration::from_millis(1)),
            Err(err) => panic!("run loop failed: {err}"),
        }
    }
    done()
}

/// Port delegate collecting every delivery and error.
#[derive(Default)]
pub struct MessageRecorder {
    pub messages: RefCell<Vec<PortMessage>>,
    pub errors: RefCell<Vec<ErrorKind>>,
}

impl MessageRecorder {
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn payload(&self, index: usize) -> Vec<u8> {
        self.messages.borrow()[index].payload().to_vec()
    }
}

impl PortDelegate for MessageRecorder {
    fn handle_message(&self, message: PortMessage) {
        self.messages.borrow_mut().push(message);
    }

    fn handle_error(&self, error: &Error) {
        self.errors.borrow_mut().push(error.kind());
    }
}

/// Stream handler collecting lifecycle events.
#[derive(Default)]
pub struct EventRecorder {
    pub events: RefCell<Vec<StreamEvent>>,
}

impl EventRecorder {
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn count_of(&self, event: StreamEvent) -> usize {
        self.events.borrow().iter().filter(|e| **e == event).count()
    }
}

impl StreamHandler for EventRecorder {
    fn on_event(&self, event: StreamEvent) {
        self.events.borrow_mut().push(event);
    }
}
