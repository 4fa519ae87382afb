// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Thread groups.

use std::fmt;
use std::io;
use std::mem::drop;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, info};

////////////////////////////////////////////////////////////////////////
// THREAD GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// A group of threads managed together.
///
/// A `ThreadGroup` supports one-shot threads
/// ([`ThreadGroup::start_oneshot`]) and respawnable threads
/// ([`ThreadGroup::start_respawnable`]), the latter being restarted if
/// their task exits or panics.
///
/// A `ThreadGroup` may be shut down through [`ThreadGroup::shut_down`].
/// New threads cannot be started once shutdown is initiated, and
/// respawnable threads are no longer restarted.
/// [`ThreadGroup::await_shutdown`] waits for all threads to exit;
/// long-running tasks should hold an [`Arc`] reference to the group and
/// poll [`ThreadGroup::is_shutting_down`] so that they can exit in a
/// timely fashion.
pub struct ThreadGroup {
    records: Mutex<GroupRecords>,

    /// Used with the `records` mutex. All waiting threads are notified
    /// when (1) shutdown is initiated and (2) shutdown is complete.
    shutdown_wakeup: Condvar,
}

#[derive(Default)]
struct GroupRecords {
    thread_count: usize,
    shutting_down: bool,
}

impl ThreadGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(GroupRecords::default()),
            shutdown_wakeup: Condvar::new(),
        })
    }

    /// Starts a thread that executes `task` once. The task is not
    /// restarted, even if the thread panics.
    pub fn start_oneshot<F>(self: &Arc<Self>, name: Option<String>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            Err(Error::ShuttingDown)
        } else {
            start_oneshot(self.clone(), &mut records, name, task).map_err(Into::into)
        }
    }

    /// Starts a thread that executes `task`, starting a replacement
    /// thread if `task` exits or panics while the group is not shutting
    /// down. A short delay between successive respawn attempts is
    /// enforced to keep a crash loop from using excessive CPU time.
    pub fn start_respawnable<F>(
        self: &Arc<Self>,
        name: Option<String>,
        task: F,
    ) -> Result<(), Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            Err(Error::ShuttingDown)
        } else {
            start_respawnable(self.clone(), &mut records, name, Arc::new(task)).map_err(Into::into)
        }
    }

    /// Initiates shutdown of the `ThreadGroup`.
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        self.shutdown_wakeup.notify_all();
    }

    /// Waits until shutdown has been initiated and the thread count has
    /// dropped to zero. Calling this from a thread within the group
    /// deadlocks, since the count can then never reach zero.
    pub fn await_shutdown(&self) {
        let records = self.records.lock().unwrap();
        let _guard = self
            .shutdown_wakeup
            .wait_while(records, |r| !r.shutting_down || r.thread_count > 0)
            .unwrap();
    }

    /// Returns whether the `ThreadGroup` is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }
}

////////////////////////////////////////////////////////////////////////
// THREAD IMPLEMENTATION                                              //
////////////////////////////////////////////////////////////////////////

/// A handle owned by a one-shot thread. Dropping it (on thread exit or
/// panic) performs the bookkeeping in [`end_thread`].
struct OneshotHandle {
    group: Arc<ThreadGroup>,
    parent: ThreadId,
}

fn start_oneshot<F>(
    group: Arc<ThreadGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: Option<String>,
    task: F,
) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    records.thread_count += 1;
    let handle = OneshotHandle {
        group,
        parent: thread::current().id(),
    };
    let result = thread::Builder::new()
        .name(name.unwrap_or_else(|| "anonymous".to_owned()))
        .spawn(move || {
            task();
            drop(handle);
        });
    if result.is_err() {
        records.thread_count -= 1;
    }
    result.and(Ok(()))
}

impl Drop for OneshotHandle {
    fn drop(&mut self) {
        let current_thread = thread::current();

        // If we are being dropped in the parent thread, the new thread
        // failed to start on the OS level and start_oneshot does the
        // clean-up. This matters: otherwise we would lock the records
        // mutex twice from the same thread.
        if current_thread.id() == self.parent {
            return;
        }

        if thread::panicking() {
            let thread_name = current_thread.name().unwrap_or("anonymous");
            error!("One-shot thread {} panicked", thread_name);
        }

        let mut records = self.group.records.lock().unwrap();
        end_thread(&mut records, &self.group.shutdown_wakeup);
    }
}

/// How long to wait between successive starts of a respawnable thread.
const THREAD_RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// A handle owned by a respawnable thread. Dropping it performs the
/// bookkeeping in [`end_thread`] and, when appropriate, a respawn.
struct RespawnableHandle<F>
where
    F: Fn() + Send + Sync + 'static,
{
    group: Arc<ThreadGroup>,
    parent: ThreadId,
    task: Arc<F>,
    last_start: Instant,
}

fn start_respawnable<F>(
    group: Arc<ThreadGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: Option<String>,
    task: Arc<F>,
) -> io::Result<()>
where
    F: Fn() + Send + Sync + 'static,
{
    records.thread_count += 1;
    let handle = RespawnableHandle {
        group,
        parent: thread::current().id(),
        task,
        last_start: Instant::now(),
    };
    let result = thread::Builder::new()
        .name(name.unwrap_or_else(|| "anonymous".to_owned()))
        .spawn(move || {
            (handle.task)();
            drop(handle);
        });
    if result.is_err() {
        records.thread_count -= 1;
    }
    result.and(Ok(()))
}

impl<F> Drop for RespawnableHandle<F>
where
    F: Fn() + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let current_thread = thread::current();
        let thread_name = current_thread.name().unwrap_or("anonymous");

        // See the note in OneshotHandle::drop; the same principle
        // applies.
        if current_thread.id() == self.parent {
            return;
        }

        if thread::panicking() {
            error!("Respawnable thread {} panicked", thread_name);
        }

        let mut records = self.group.records.lock().unwrap();
        if !records.shutting_down {
            if !thread::panicking() {
                error!("Respawnable thread {} exited prematurely", thread_name);
            }

            let since_last_start = Instant::now().duration_since(self.last_start);
            if since_last_start < THREAD_RESPAWN_DELAY {
                // Throttle the respawn, releasing the records mutex
                // while we wait. The wait may be cut short by shutdown
                // notifications on the group's condition variable, in
                // which case there is no point in finishing the delay.
                let wait_for = THREAD_RESPAWN_DELAY - since_last_start;
                info!(
                    "Respawn of thread {} throttled: delayed by {} ms",
                    thread_name,
                    wait_for.as_millis()
                );
                records = self
                    .group
                    .shutdown_wakeup
                    .wait_timeout(records, wait_for)
                    .unwrap()
                    .0;
            }

            if !records.shutting_down {
                let result = start_respawnable(
                    self.group.clone(),
                    &mut records,
                    Some(thread_name.to_owned()),
                    self.task.clone(),
                );
                if let Err(e) = result {
                    error!("Respawn of thread {} failed: {}", thread_name, e);
                }
            }
        }
        end_thread(&mut records, &self.group.shutdown_wakeup);
    }
}

/// Performs clean-up actions when a thread exits.
fn end_thread(records: &mut MutexGuard<GroupRecords>, shutdown_wakeup: &Condvar) {
    records.thread_count -= 1;
    if records.shutting_down && records.thread_count == 0 {
        shutdown_wakeup.notify_all();
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error type for [`ThreadGroup`] operations.
#[derive(Debug)]
pub enum Error {
    /// An OS-level error occurred during the creation of a thread.
    Io(io::Error),

    /// The [`ThreadGroup`] is shutting down.
    ShuttingDown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::ShuttingDown => f.write_str("thread group is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn await_shutdown_works() {
        let exited = Arc::new(Mutex::new(0));
        let group = ThreadGroup::new();
        const SLEEP_DURATION: Duration = Duration::from_millis(100);
        let start = Instant::now();
        for _ in 0..2 {
            let exited_cloned = exited.clone();
            let group_cloned = group.clone();
            group
                .start_oneshot(None, move || loop {
                    thread::sleep(SLEEP_DURATION);
                    if group_cloned.is_shutting_down() {
                        *exited_cloned.lock().unwrap() += 1;
                        return;
                    }
                })
                .unwrap();
        }
        group.shut_down();
        group.await_shutdown();
        assert!(Instant::now().duration_since(start) > SLEEP_DURATION);
        assert_eq!(*exited.lock().unwrap(), 2);
    }

    #[test]
    fn respawnable_threads_respawn() {
        let times_executed = Arc::new(Mutex::new(0));
        let times_executed_cloned = times_executed.clone();
        let wakeup = Arc::new(Condvar::new());
        let wakeup_cloned = wakeup.clone();
        let group = ThreadGroup::new();
        group
            .start_respawnable(None, move || {
                let mut times_executed = times_executed_cloned.lock().unwrap();
                *times_executed += 1;
                wakeup_cloned.notify_all();
            })
            .unwrap();
        let times_executed = times_executed.lock().unwrap();
        let times_executed = wakeup.wait_while(times_executed, |n| *n < 2).unwrap();
        assert!(*times_executed >= 2);
        group.shut_down();
    }

    #[test]
    fn thread_group_rejects_new_threads_after_shutdown() {
        let group = ThreadGroup::new();
        group.shut_down();
        assert!(matches!(
            group.start_oneshot(None, || ()),
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            group.start_respawnable(None, || ()),
            Err(Error::ShuttingDown)
        ));
    }
}
