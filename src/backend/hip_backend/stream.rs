//! HIP stream emulation
//!
//! A stream is an ordered launch queue bound to one device. Enqueueing never
//! runs work on the calling thread; launches execute in order when the owner
//! calls [`HipStream::synchronize`] (or drops the stream). The first failing
//! launch is reported by `synchronize` and every launch queued after it is
//! discarded, like a faulted HIP stream.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::backend::hip_backend::device::HipDevice;
use crate::error::{FlashError, FlashResult};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type LaunchFn = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

struct Launch {
    kernel: String,
    run: LaunchFn,
}

/// HIP stream
///
/// Not `Clone`: the owner controls when queued work runs.
pub struct HipStream {
    device: HipDevice,
    id: u64,
    queue: Mutex<VecDeque<Launch>>,
    // Serializes synchronize() callers so launches never interleave
    exec: Mutex<()>,
    launched: AtomicU64,
    completed: AtomicU64,
}

impl fmt::Debug for HipStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HipStream")
            .field("id", &self.id)
            .field("device", &self.device.ordinal())
            .field("pending", &self.pending_launches())
            .finish()
    }
}

impl HipStream {
    /// Create a stream on `device`
    pub fn new(device: &HipDevice) -> FlashResult<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "HipStream::new: stream {} on device {} ({})",
            id,
            device.ordinal(),
            device.arch()
        );
        Ok(HipStream {
            device: device.clone(),
            id,
            queue: Mutex::new(VecDeque::new()),
            exec: Mutex::new(()),
            launched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &HipDevice {
        &self.device
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue a host-emulated kernel launch. `run` executes on a later
    /// `synchronize`; an `Err` return is the device-side failure reason.
    pub fn enqueue<F>(&self, kernel: impl Into<String>, run: F) -> FlashResult<()>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        let kernel = kernel.into();
        let mut queue = self.queue.lock()?;
        tracing::trace!(
            "HipStream::enqueue: {} on stream {} (position {})",
            kernel,
            self.id,
            queue.len()
        );
        queue.push_back(Launch {
            kernel,
            run: Box::new(run),
        });
        self.launched.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Block until all queued work has executed.
    ///
    /// Returns `DeviceExecutionFailure` for the first launch that failed;
    /// launches queued behind it are dropped without running.
    pub fn synchronize(&self) -> FlashResult<()> {
        let _exec = self.exec.lock()?;
        loop {
            let next = self.queue.lock()?.pop_front();
            let Some(Launch { kernel, run }) = next else {
                return Ok(());
            };

            tracing::trace!("HipStream::synchronize: running {} on stream {}", kernel, self.id);
            let outcome = panic::catch_unwind(AssertUnwindSafe(run))
                .unwrap_or_else(|payload| Err(panic_reason(payload.as_ref())));
            self.completed.fetch_add(1, Ordering::AcqRel);

            if let Err(reason) = outcome {
                let discarded = {
                    let mut queue = self.queue.lock()?;
                    let n = queue.len();
                    queue.clear();
                    n
                };
                tracing::error!(
                    "HipStream::synchronize: {} failed on stream {}: {} ({} queued launch(es) discarded)",
                    kernel,
                    self.id,
                    reason,
                    discarded
                );
                return Err(FlashError::DeviceExecutionFailure { kernel, reason });
            }
        }
    }

    /// True when no work is queued or running
    pub fn query(&self) -> bool {
        let idle_queue = self.queue.lock().map(|q| q.is_empty()).unwrap_or(false);
        idle_queue && self.exec.try_lock().is_ok()
    }

    /// Launches enqueued but not yet executed
    pub fn pending_launches(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Total launches ever enqueued on this stream
    pub fn launch_count(&self) -> u64 {
        self.launched.load(Ordering::Acquire)
    }

    /// Launches that have executed (successfully or not)
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn poison_queue(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.queue.lock();
                    panic!("queue holder panicked");
                })
                .join();
        });
    }
}

impl Drop for HipStream {
    fn drop(&mut self) {
        if self.pending_launches() > 0 {
            tracing::debug!(
                "HipStream::drop: draining {} launch(es) on stream {}",
                self.pending_launches(),
                self.id
            );
        }
        if let Err(e) = self.synchronize() {
            tracing::warn!("HipStream::drop: stream {} ended with {}", self.id, e);
        }
    }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("kernel panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("kernel panicked: {}", s)
    } else {
        "kernel panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::hip_backend::device::GfxArch;
    use std::sync::{Arc, Mutex as StdMutex};

    fn stream() -> HipStream {
        HipStream::new(&HipDevice::emulated(GfxArch::Gfx90a)).unwrap()
    }

    #[test]
    fn test_enqueue_defers_execution() {
        let stream = stream();
        let ran = Arc::new(AtomicU64::new(0));
        let ran_clone = Arc::clone(&ran);
        stream
            .enqueue("k", move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(stream.pending_launches(), 1);
        assert!(!stream.query());

        stream.synchronize().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(stream.query());
        assert_eq!(stream.launch_count(), 1);
        assert_eq!(stream.completed_count(), 1);
    }

    #[test]
    fn test_launches_run_in_order() {
        let stream = stream();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            stream
                .enqueue(format!("k{}", i), move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failure_discards_rest() {
        let stream = stream();
        let ran_after = Arc::new(AtomicU64::new(0));
        stream.enqueue("ok", || Ok(())).unwrap();
        stream
            .enqueue("bad", || Err("illegal address".to_string()))
            .unwrap();
        let flag = Arc::clone(&ran_after);
        stream
            .enqueue("after", move || {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let err = stream.synchronize().unwrap_err();
        assert_eq!(
            err,
            FlashError::DeviceExecutionFailure {
                kernel: "bad".into(),
                reason: "illegal address".into()
            }
        );
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
        assert_eq!(stream.pending_launches(), 0);

        // Stream stays usable
        stream.enqueue("again", || Ok(())).unwrap();
        assert!(stream.synchronize().is_ok());
    }

    #[test]
    fn test_panicking_kernel_reported() {
        let stream = stream();
        stream
            .enqueue("boom", || -> Result<(), String> { panic!("index out of bounds") })
            .unwrap();
        match stream.synchronize() {
            Err(FlashError::DeviceExecutionFailure { kernel, reason }) => {
                assert_eq!(kernel, "boom");
                assert!(reason.contains("index out of bounds"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_drop_drains_queue() {
        let ran = Arc::new(AtomicU64::new(0));
        {
            let stream = stream();
            let ran = Arc::clone(&ran);
            stream
                .enqueue("k", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
