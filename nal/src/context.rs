//! Contexts: completion queues, the trigger loop, and progress
//! coordination.
//!
//! A context owns a bounded lock-free *fast queue* of completion records
//! and an unbounded mutex-guarded *backfill queue* that absorbs bursts
//! when the fast queue is full. Records are produced by plugin engines
//! through [`Context::completion_add`] and consumed exactly once by
//! [`Context::trigger`].
//!
//! When several threads drive one context, the *multi-progress gate*
//! admits exactly one of them into the plugin's blocking progress call;
//! the others wait on a condition variable for the remaining time. The
//! trigger loop and the gate intentionally share neither mutex nor
//! condvar.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::class::Class;
use crate::error::{Error, Result};
use crate::plugin::ProgressMode;
use shmq::Ring;

/// Depth of the fast completion queue.
const COMPLETION_QUEUE_DEPTH: usize = 1024;

/// Bit 31 of the progress word: a thread is running the plugin's progress.
const PROGRESS_LOCK: u32 = 0x8000_0000;

/// A queued completion: user callback plus plugin release hook.
///
/// Plugins implement this on their operation type; `invoke` runs the
/// user callback and `release` retires plugin resources afterwards.
/// Neither may panic across the boundary.
pub trait CompletionData: Send + Sync {
    /// Run the user callback; the return value is collected by the
    /// trigger when the caller asked for callback return codes.
    fn invoke(&self) -> i32;

    /// Release plugin resources bound to this completion.
    fn release(&self) {}
}

/// One completion queue entry.
pub struct CompletionRecord {
    data: Arc<dyn CompletionData>,
}

impl CompletionRecord {
    pub fn new(data: Arc<dyn CompletionData>) -> Self {
        CompletionRecord { data }
    }
}

struct ContextInner {
    class: Class,
    id: u8,
    /// Fast path: ring of `Box<CompletionRecord>` raw pointers.
    queue: Box<Ring<COMPLETION_QUEUE_DEPTH>>,
    /// Overflow path, FIFO, guarded by `backfill`'s mutex.
    backfill: Mutex<VecDeque<Box<CompletionRecord>>>,
    backfill_count: AtomicU32,
    queue_cond: Condvar,
    trigger_waiting: AtomicU32,
    /// Low 31 bits: threads inside `progress`; bit 31: progress lock.
    progressing: AtomicU32,
    progress_mutex: Mutex<()>,
    progress_cond: Condvar,
}

/// A completion domain inside a class.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context with id 0.
    pub fn new(class: &Class) -> Result<Context> {
        Context::with_id(class, 0)
    }

    /// Create a context with a caller-chosen id.
    pub fn with_id(class: &Class, id: u8) -> Result<Context> {
        Ok(Context {
            inner: Arc::new(ContextInner {
                class: class.clone(),
                id,
                queue: Ring::boxed(),
                backfill: Mutex::new(VecDeque::new()),
                backfill_count: AtomicU32::new(0),
                queue_cond: Condvar::new(),
                trigger_waiting: AtomicU32::new(0),
                progressing: AtomicU32::new(0),
                progress_mutex: Mutex::new(()),
                progress_cond: Condvar::new(),
            }),
        })
    }

    /// Class this context belongs to.
    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    /// Caller-chosen context id.
    pub fn id(&self) -> u8 {
        self.inner.id
    }

    /// Queue a completion record. Never blocks beyond short critical
    /// sections; falls back to the backfill queue when the fast queue is
    /// full, and wakes any thread waiting in the trigger.
    pub fn completion_add(&self, record: CompletionRecord) {
        let inner = &*self.inner;
        let boxed = Box::new(record);
        let raw = Box::into_raw(boxed) as u64;
        if inner.queue.push(raw).is_err() {
            // Fast queue full; reclaim the box and take the slow path.
            let boxed = unsafe { Box::from_raw(raw as *mut CompletionRecord) };
            let mut backfill = inner.backfill.lock().unwrap();
            backfill.push_back(boxed);
            inner.backfill_count.fetch_add(1, Ordering::AcqRel);
        }

        if inner.trigger_waiting.load(Ordering::Acquire) > 0 {
            // Completions are pushed when something finishes; wake anyone
            // waiting in the trigger.
            let _guard = inner.backfill.lock().unwrap();
            inner.queue_cond.notify_one();
        }
    }

    fn pop_record(&self) -> Option<Box<CompletionRecord>> {
        let inner = &*self.inner;
        if let Some(raw) = inner.queue.pop() {
            return Some(unsafe { Box::from_raw(raw as *mut CompletionRecord) });
        }
        if inner.backfill_count.load(Ordering::Acquire) > 0 {
            let mut backfill = inner.backfill.lock().unwrap();
            if let Some(rec) = backfill.pop_front() {
                inner.backfill_count.fetch_sub(1, Ordering::AcqRel);
                return Some(rec);
            }
        }
        None
    }

    fn queues_empty(&self) -> bool {
        self.inner.queue.is_empty() && self.inner.backfill_count.load(Ordering::Acquire) == 0
    }

    /// Dispatch up to `max_count` completions, waiting up to `timeout_ms`
    /// for the first one. Returns the number dispatched; `Err(Timeout)`
    /// when the deadline expires with nothing dispatched. Callback return
    /// codes are appended to `callback_rets` when provided.
    pub fn trigger_into(
        &self,
        timeout_ms: u32,
        max_count: u32,
        mut callback_rets: Option<&mut Vec<i32>>,
    ) -> Result<usize> {
        let inner = &*self.inner;
        let mut remaining = Duration::from_millis(timeout_ms as u64);
        let mut count: usize = 0;

        while (count as u32) < max_count {
            let record = match self.pop_record() {
                Some(rec) => rec,
                None => {
                    // If something was already processed, leave.
                    if count > 0 {
                        break;
                    }
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }

                    let start = Instant::now();
                    inner.trigger_waiting.fetch_add(1, Ordering::AcqRel);
                    let mut timed_out = false;
                    {
                        let mut backfill = inner.backfill.lock().unwrap();
                        while inner.queue.is_empty() && backfill.is_empty() {
                            let (guard, wait_res) = inner
                                .queue_cond
                                .wait_timeout(backfill, remaining)
                                .unwrap();
                            backfill = guard;
                            if wait_res.timed_out() {
                                timed_out = true;
                                break;
                            }
                        }
                    }
                    inner.trigger_waiting.fetch_sub(1, Ordering::AcqRel);
                    if timed_out {
                        return Err(Error::Timeout);
                    }
                    remaining = remaining.saturating_sub(start.elapsed());
                    continue; // Give another chance to grab a record.
                }
            };

            let ret = record.data.invoke();
            if let Some(rets) = callback_rets.as_mut() {
                rets.push(ret);
            }
            record.data.release();
            count += 1;
        }

        Ok(count)
    }

    /// [`Context::trigger_into`] without return-code collection.
    pub fn trigger(&self, timeout_ms: u32, max_count: u32) -> Result<usize> {
        self.trigger_into(timeout_ms, max_count, None)
    }

    /// Make progress on the class, blocking up to `timeout_ms`.
    ///
    /// At most one thread runs the plugin's progress per context; others
    /// wait on the gate for the remaining time. Returns `Ok(())` when the
    /// context progressed (a completion is available or the plugin
    /// reported progress), `Err(Timeout)` otherwise.
    pub fn progress(&self, timeout_ms: u32) -> Result<()> {
        let inner = &*self.inner;
        let mut remaining = Duration::from_millis(timeout_ms as u64);

        // Gate entry: count ourselves, then race for the lock bit.
        inner.progressing.fetch_add(1, Ordering::AcqRel);
        loop {
            let old = inner.progressing.load(Ordering::Acquire) & !PROGRESS_LOCK;
            let num = old | PROGRESS_LOCK;
            if inner
                .progressing
                .compare_exchange(old, num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break; // No other thread is progressing.
            }

            if remaining.is_zero() {
                inner.progressing.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::Timeout);
            }

            let start = Instant::now();
            {
                let guard = inner.progress_mutex.lock().unwrap();
                // No need to wait if the lock was released meanwhile.
                let num = inner.progressing.load(Ordering::Acquire);
                if num & PROGRESS_LOCK != 0 {
                    let (_guard, wait_res) = inner
                        .progress_cond
                        .wait_timeout(guard, remaining)
                        .unwrap();
                    if wait_res.timed_out() {
                        inner.progressing.fetch_sub(1, Ordering::AcqRel);
                        return Err(Error::Timeout);
                    }
                }
            }
            remaining = remaining.saturating_sub(start.elapsed());
        }

        // Holding the lock bit: if a completion is already available we
        // have progressed; otherwise run the plugin for the remaining
        // time.
        let ret = if !self.queues_empty() {
            Ok(())
        } else {
            self.inner
                .class
                .transport()
                .progress(remaining.as_millis() as u32)
        };

        // Gate exit: drop our count and the lock bit in one CAS, then
        // hand off to a waiter if any remain.
        let mut old;
        let mut num;
        loop {
            old = inner.progressing.load(Ordering::Acquire);
            num = (old - 1) ^ PROGRESS_LOCK;
            if inner
                .progressing
                .compare_exchange(old, num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if num & !PROGRESS_LOCK > 0 {
            let _guard = inner.progress_mutex.lock().unwrap();
            inner.progress_cond.notify_one();
        }

        ret
    }

    /// Whether it is safe to block on the class's poll fd: true only when
    /// both completion paths are empty and the plugin reports no pending
    /// transport work.
    pub fn poll_try_wait(&self) -> bool {
        let inner = &*self.inner;
        if inner
            .class
            .progress_mode()
            .contains(ProgressMode::NO_BLOCK)
        {
            return false;
        }
        if !self.queues_empty() {
            return false;
        }
        inner.class.transport().poll_try_wait()
    }

    /// Tear down the context. Fails with [`Error::Busy`] when completions
    /// are still queued.
    pub fn destroy(self) -> Result<()> {
        if !self.queues_empty() {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Reclaim any records left in the fast queue so their boxes are
        // not leaked.
        while let Some(raw) = self.queue.pop() {
            drop(unsafe { Box::from_raw(raw as *mut CompletionRecord) });
        }
    }
}
