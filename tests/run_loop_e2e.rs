//! Scheduler integration tests over real descriptors.
//!
//! Covered behavior:
//! - Mode isolation for watchers and timers
//! - Common pseudo-mode sources firing under any mode
//! - Watcher removal from inside its own callback
//! - Timed-out callbacks renewing or ending a registration

mod common;

use std::cell::Cell;
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::*;
use runloop::{Deadline, Mode, RunLoop, SourceIdent, WatchEvent, WatchKind, Watcher};

struct CountingWatcher {
    fd: RawFd,
    fires: Cell<usize>,
    remove_after_first: bool,
}

impl CountingWatcher {
    fn shared(fd: RawFd, remove_after_first: bool) -> Rc<Self> {
        Rc::new(Self {
            fd,
            fires: Cell::new(0),
            remove_after_first,
        })
    }
}

impl Watcher for CountingWatcher {
    fn ready(&self, run_loop: &RunLoop, mode: &Mode, event: WatchEvent) {
        assert_eq!(event.fd, self.fd);
        self.fires.set(self.fires.get() + 1);
        if self.remove_after_first {
            run_loop.remove_watcher(
                SourceIdent::Descriptor(self.fd),
                WatchKind::Readable,
                mode,
                true,
            );
        }
    }
}

fn readable_pair() -> (UnixStream, UnixStream) {
    let (writer, reader) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    (writer, reader)
}

#[test]
fn test_watcher_fires_only_in_its_mode() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let (mut writer, reader) = readable_pair();
    writer.write_all(b"ping").unwrap();

    let mode_a = Mode::new("a");
    let watcher = CountingWatcher::shared(reader.as_raw_fd(), false);
    rl.add_watcher(
        SourceIdent::Descriptor(reader.as_raw_fd()),
        WatchKind::Readable,
        watcher.clone(),
        &mode_a,
    );

    // Mode "b" has nothing registered at all.
    assert!(!rl.run_mode(&Mode::new("b"), Deadline::after(Duration::from_millis(20))).unwrap());
    assert_eq!(watcher.fires.get(), 0);

    rl.accept_input(&mode_a, Deadline::after(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(watcher.fires.get(), 1);
}

#[test]
fn test_common_mode_watcher_fires_under_any_mode() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let (mut writer, reader) = readable_pair();
    writer.write_all(b"ping").unwrap();

    let watcher = CountingWatcher::shared(reader.as_raw_fd(), false);
    rl.add_watcher(
        SourceIdent::Descriptor(reader.as_raw_fd()),
        WatchKind::Readable,
        watcher.clone(),
        &Mode::common(),
    );

    rl.accept_input(&Mode::new("whatever"), Deadline::after(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(watcher.fires.get(), 1);

    rl.accept_input(&Mode::default_mode(), Deadline::after(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(watcher.fires.get(), 2);
}

#[test]
fn test_removing_self_from_callback_prevents_refire() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    let (mut writer, reader) = readable_pair();
    writer.write_all(b"pending forever").unwrap();

    let mode = Mode::default_mode();
    let watcher = CountingWatcher::shared(reader.as_raw_fd(), true);
    rl.add_watcher(
        SourceIdent::Descriptor(reader.as_raw_fd()),
        WatchKind::Readable,
        watcher.clone(),
        &mode,
    );

    // The data is never read, so the descriptor stays readable; only the
    // removal keeps the watcher quiet.
    for _ in 0..3 {
        let _ = rl
            .run_mode(&mode, Deadline::after(Duration::from_millis(20)))
            .unwrap();
    }
    assert_eq!(watcher.fires.get(), 1);
    assert!(rl.limit_date(&mode).is_none());
}

struct ExpiringWatcher {
    timeouts: Cell<usize>,
    renewals: usize,
}

impl Watcher for ExpiringWatcher {
    fn ready(&self, _run_loop: &RunLoop, _mode: &Mode, _event: WatchEvent) {
        panic!("quiet descriptor fired");
    }

    fn timed_out(&self, _run_loop: &RunLoop, _mode: &Mode, _kind: WatchKind) -> Option<Instant> {
        let seen = self.timeouts.get() + 1;
        self.timeouts.set(seen);
        if seen <= self.renewals {
            Some(Instant::now() + Duration::from_millis(20))
        } else {
            None
        }
    }
}

#[test]
fn test_timed_out_watcher_renews_then_expires() {
    init_logging();
    let rl = RunLoop::new().unwrap();
    // Keep both ends alive but never write: the watcher only ever times
    // out.
    let (_writer, reader) = readable_pair();

    let mode = Mode::default_mode();
    let watcher = Rc::new(ExpiringWatcher {
        timeouts: Cell::new(0),
        renewals: 1,
    });
    rl.add_watcher_with_limit(
        SourceIdent::Descriptor(reader.as_raw_fd()),
        WatchKind::Readable,
        watcher.clone(),
        &mode,
        Some(Instant::now() + Duration::from_millis(20)),
    );

    assert!(drive_until(&rl, &mode, DRIVE_TIMEOUT, || {
        rl.limit_date(&mode).is_none()
    }));
    // Once renewed, once declined; the decline removed the registration.
    assert_eq!(watcher.timeouts.get(), 2);
}
