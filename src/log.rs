// Filesystem operation accounting.
//
// A filesystem system call brackets itself with an `Operation` so that the
// number of operations in flight is bounded and observable. Against an
// on-disk store this is where the write-ahead log would reserve space and
// hold commits back; here the bracket remains so that teardown paths
// (closing files, releasing the working directory) run under the same
// discipline they would with a disk.

use crate::param::MAXOPS;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

#[derive(Debug)]
struct LogInner {
    /// how many operations are currently in flight
    outstanding: usize,
}

static LOG: SpinLock<LogInner> = SpinLock::new(LogInner { outstanding: 0 }, "log");

/// A filesystem operation in flight (xv6's begin_op/end_op pair, as a
/// guard). Starting one blocks while the system is saturated.
#[derive(Debug)]
pub struct Operation;

impl Operation {
    pub fn begin() -> Self {
        let mut log = LOG.lock();

        loop {
            if log.outstanding >= MAXOPS {
                log = proc::sleep(Channel::Log, log);
            } else {
                log.outstanding += 1;
                return Operation;
            }
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        {
            let mut log = LOG.lock();
            assert!(log.outstanding >= 1, "end op");
            log.outstanding -= 1;
        }

        proc::wakeup(Channel::Log);
    }
}
