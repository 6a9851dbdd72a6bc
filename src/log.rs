//! Debug logging for the dispatch runtime.
//!
//! To use in a debug build, set the env var `DISPATCH_LOG` as described
//! below. In a release build, logging is compiled in but events are only
//! constructed if the env var is set at pool creation, so the fast path is
//! a branch on an `Option`.
//!
//! env variable
//!     DISPATCH_LOG=tail:<file>    dumps the last events into `<file>`
//!                                 when the pool shuts down
//!     DISPATCH_LOG=all:<file>     streams every event into `<file>` as it
//!                                 arrives (much slower)

use crossbeam_channel::{self, Receiver, Sender};
use std::collections::VecDeque;
use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};

/// Number of events retained in `tail` mode.
const TAIL_LEN: usize = 10_000;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum Event {
    /// A worker thread entered its main loop.
    ThreadStart { worker: usize },

    /// A worker thread is exiting.
    ThreadTerminate { worker: usize },

    /// A worker exhausted its spin phase and parked on the wake gate.
    ThreadParked { worker: usize },

    /// A worker returned from the wake gate.
    ThreadUnparked { worker: usize },

    /// The dispatcher published an assignment: flag IDLE -> AVAILABLE.
    FlagAvailable { worker: usize, first: usize, last: usize },

    /// The dispatcher had no items for a worker: flag IDLE -> DONE.
    FlagSkipped { worker: usize },

    /// A worker finished its assignment: flag AVAILABLE -> DONE.
    FlagDone { worker: usize },

    /// The dispatcher retired a finished worker: flag DONE -> IDLE.
    FlagReset { worker: usize },

    /// A dispatch began on the owner thread.
    DispatchBegin { count: usize, mode: &'static str },

    /// The dispatch completed and every flag is IDLE again.
    DispatchEnd { count: usize },

    /// The wake hint was raised to `hint`.
    HintRaised { hint: i32 },

    /// The wake hint was lowered to `hint`.
    HintLowered { hint: i32 },

    /// The pool is shutting down; `parks` is the lifetime park total.
    PoolTerminate { parks: usize },

    /// Forces the logger thread to write out anything buffered.
    Flush,
}

/// Handle for emitting events; cheap to clone, no-op unless enabled.
#[derive(Clone)]
pub(super) struct Logger {
    sender: Option<Sender<Event>>,
}

impl Logger {
    pub(super) fn new() -> Logger {
        let env_log = match env::var("DISPATCH_LOG") {
            Ok(s) => s,
            Err(_) => return Logger::disabled(),
        };

        let (sender, receiver) = crossbeam_channel::unbounded();

        if let Some(filename) = env_log.strip_prefix("tail:") {
            let writer = Logger::open(filename);
            ::std::thread::spawn(move || Logger::tail_logger_thread(receiver, writer));
        } else if let Some(filename) = env_log.strip_prefix("all:") {
            let writer = Logger::open(filename);
            ::std::thread::spawn(move || Logger::all_logger_thread(receiver, writer));
        } else {
            panic!("DISPATCH_LOG should be 'tail:<file>' or 'all:<file>'");
        }

        Logger {
            sender: Some(sender),
        }
    }

    fn disabled() -> Logger {
        Logger { sender: None }
    }

    /// Emits an event. The closure is only invoked when logging is
    /// enabled, so event arguments can be computed lazily.
    #[inline]
    pub(super) fn log(&self, event: impl FnOnce() -> Event) {
        if let Some(sender) = &self.sender {
            sender.send(event()).unwrap();
        }
    }

    fn open(filename: &str) -> BufWriter<File> {
        let file = File::create(filename)
            .unwrap_or_else(|err| panic!("failed to open log file `{}`: {}", filename, err));
        BufWriter::new(file)
    }

    /// Streams every event as it arrives. Each line is flushed eagerly so
    /// the file is complete even if the process aborts.
    fn all_logger_thread(receiver: Receiver<Event>, mut writer: BufWriter<File>) {
        for event in receiver {
            if event != Event::Flush {
                Logger::write_event(&mut writer, event).unwrap();
            }
            writer.flush().unwrap();
        }
        writer.flush().unwrap();
    }

    /// Retains a bounded tail of events and dumps it when the channel
    /// disconnects (pool shutdown) or a `Flush` event arrives.
    fn tail_logger_thread(receiver: Receiver<Event>, mut writer: BufWriter<File>) {
        let mut tail = VecDeque::with_capacity(TAIL_LEN);
        let mut skipped = false;

        for event in receiver {
            if event == Event::Flush {
                Logger::dump_tail(&mut writer, &mut tail, &mut skipped).unwrap();
                continue;
            }
            if tail.len() == TAIL_LEN {
                tail.pop_front();
                skipped = true;
            }
            tail.push_back(event);
        }

        Logger::dump_tail(&mut writer, &mut tail, &mut skipped).unwrap();
    }

    fn dump_tail(
        writer: &mut BufWriter<File>,
        tail: &mut VecDeque<Event>,
        skipped: &mut bool,
    ) -> io::Result<()> {
        if *skipped {
            writeln!(writer, "...")?;
            *skipped = false;
        }
        for event in tail.drain(..) {
            Logger::write_event(writer, event)?;
        }
        writer.flush()
    }

    fn write_event(writer: &mut BufWriter<File>, event: Event) -> io::Result<()> {
        writeln!(writer, "{:?}", event)
    }
}

impl ::std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        f.debug_struct("Logger")
            .field("enabled", &self.sender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_never_builds_events() {
        let logger = Logger::disabled();
        logger.log(|| unreachable!("event closure invoked on a disabled logger"));
    }
}
