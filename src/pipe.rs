//! A back-to-back in-process duplex stream pair with fiber rendezvous.
//!
//! Two [`PipeStream`] handles share one mutex. Each side's `pending_reader` holds a fiber
//! waiting for the *peer's* buffer to gain data; each side's `pending_writer` holds a fiber
//! waiting for *its own* buffer to free space. A side wakes the other's waiter exactly when it
//! performs the operation that satisfies it: `write` fills the peer's buffer and wakes this
//! side's `pending_reader`; `read` drains this side's own buffer and wakes this side's own
//! `pending_writer`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Result, WeaveError};
use crate::scheduler::{current, current_handle, yield_to_scheduler, FiberHandle, Scheduler};

/// A parked fiber together with the scheduler it belongs to, so whoever wakes it doesn't need to
/// be running on that scheduler itself (mirrors `io::poll`'s `EventContext`).
struct Waiter {
    handle: FiberHandle,
    scheduler: Arc<Scheduler>,
}

impl Waiter {
    fn capture() -> Waiter {
        Waiter {
            handle: current_handle().expect("PipeStream operation called outside a fiber"),
            scheduler: current().expect("PipeStream operation called outside a fiber"),
        }
    }
}

struct Side {
    read_buffer: VecDeque<u8>,
    closed_read: bool,
    closed_write: bool,
    pending_reader: Option<Waiter>,
    pending_writer: Option<Waiter>,
    cancelled_read: bool,
    cancelled_write: bool,
}

impl Side {
    fn new() -> Side {
        Side {
            read_buffer: VecDeque::new(),
            closed_read: false,
            closed_write: false,
            pending_reader: None,
            pending_writer: None,
            cancelled_read: false,
            cancelled_write: false,
        }
    }
}

struct PipeState {
    a: Side,
    b: Side,
}

impl PipeState {
    fn sides_mut(&mut self, is_a: bool) -> (&mut Side, &mut Side) {
        if is_a {
            (&mut self.a, &mut self.b)
        } else {
            (&mut self.b, &mut self.a)
        }
    }
}

struct PipeCore {
    buffer_size: usize,
    state: Mutex<PipeState>,
}

/// One end of an in-process duplex byte stream.
///
/// Created in pairs via [`pipe_stream`]; bytes written to one end are read from the other.
pub struct PipeStream {
    core: Arc<PipeCore>,
    is_a: bool,
}

/// Creates a connected pair of in-process streams, each buffering up to `buffer_size` bytes of
/// unread data from the other side.
pub fn pipe_stream(buffer_size: usize) -> (PipeStream, PipeStream) {
    let core = Arc::new(PipeCore {
        buffer_size,
        state: Mutex::new(PipeState { a: Side::new(), b: Side::new() }),
    });
    (PipeStream { core: core.clone(), is_a: true }, PipeStream { core, is_a: false })
}

fn wake(waiter: Option<Waiter>) {
    if let Some(waiter) = waiter {
        waiter.scheduler.schedule_handle(waiter.handle);
    }
}

impl PipeStream {
    /// Reads up to `buf.len()` bytes, blocking the current fiber until data is available, the
    /// peer closes its write side (returns `Ok(0)`, EOF), or the read is cancelled.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut state = self.core.state.lock().expect("pipe lock poisoned");
            let (me, peer) = state.sides_mut(self.is_a);

            if me.closed_read {
                return Err(WeaveError::BrokenPipe);
            }

            if !me.read_buffer.is_empty() {
                let n = buf.len().min(me.read_buffer.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = me.read_buffer.pop_front().expect("checked non-empty");
                }
                let woken = me.pending_writer.take();
                drop(state);
                wake(woken);
                return Ok(n);
            }

            if peer.closed_write {
                return Ok(0);
            }

            if me.cancelled_read {
                me.cancelled_read = false;
                return Err(WeaveError::OperationAborted);
            }

            peer.pending_reader = Some(Waiter::capture());
            drop(state);
            yield_to_scheduler();
        }
    }

    /// Writes `buf`, blocking the current fiber until the peer's buffer has room or its read
    /// side closes (returns `Err(BrokenPipe)`).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let mut state = self.core.state.lock().expect("pipe lock poisoned");
            let (me, peer) = state.sides_mut(self.is_a);

            if me.closed_write {
                return Err(WeaveError::BrokenPipe);
            }
            if peer.closed_read {
                return Err(WeaveError::BrokenPipe);
            }

            let available = self.core.buffer_size.saturating_sub(peer.read_buffer.len());
            if available > 0 {
                let n = buf.len().min(available);
                peer.read_buffer.extend(buf[..n].iter().copied());
                let woken = me.pending_reader.take();
                drop(state);
                wake(woken);
                return Ok(n);
            }

            if me.cancelled_write {
                me.cancelled_write = false;
                return Err(WeaveError::OperationAborted);
            }

            peer.pending_writer = Some(Waiter::capture());
            drop(state);
            yield_to_scheduler();
        }
    }

    /// Cancels a pending [`PipeStream::read`] on this side, if any, waking it with
    /// [`WeaveError::OperationAborted`].
    pub fn cancel_read(&self) {
        let mut state = self.core.state.lock().expect("pipe lock poisoned");
        let (me, peer) = state.sides_mut(self.is_a);
        me.cancelled_read = true;
        let woken = peer.pending_reader.take();
        drop(state);
        wake(woken);
    }

    /// Cancels a pending [`PipeStream::write`] on this side, if any.
    pub fn cancel_write(&self) {
        let mut state = self.core.state.lock().expect("pipe lock poisoned");
        let (me, peer) = state.sides_mut(self.is_a);
        me.cancelled_write = true;
        let woken = peer.pending_writer.take();
        drop(state);
        wake(woken);
    }

    /// Blocks until the peer has drained everything written so far, or closes its read side.
    pub fn flush(&self) -> Result<()> {
        loop {
            let mut state = self.core.state.lock().expect("pipe lock poisoned");
            let (me, peer) = state.sides_mut(self.is_a);
            if peer.closed_read {
                return Err(WeaveError::BrokenPipe);
            }
            if peer.read_buffer.is_empty() {
                return Ok(());
            }
            peer.pending_writer = Some(Waiter::capture());
            drop(state);
            yield_to_scheduler();
        }
    }

    /// Half-closes the write side: future peer reads observe EOF once the buffer drains.
    pub fn close_write(&self) {
        let mut state = self.core.state.lock().expect("pipe lock poisoned");
        let (me, peer) = state.sides_mut(self.is_a);
        me.closed_write = true;
        let woken = peer.pending_reader.take();
        drop(state);
        wake(woken);
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        let mut state = self.core.state.lock().expect("pipe lock poisoned");
        let (me, peer) = state.sides_mut(self.is_a);
        me.closed_read = true;
        me.closed_write = true;
        let reader = peer.pending_reader.take();
        let writer = peer.pending_writer.take();
        let my_reader = me.pending_reader.take();
        let my_writer = me.pending_writer.take();
        drop(state);
        wake(reader);
        wake(writer);
        wake(my_reader);
        wake(my_writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn write_then_read_round_trips() {
        let scheduler = Scheduler::new(1, true, 4);
        scheduler.start();
        let (a, b) = pipe_stream(64);
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            a.write(b"hello").unwrap();
            let mut buf = [0u8; 5];
            let n = b.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello");
            scheduler_ref.stop();
        }));
        scheduler.dispatch();
    }

    #[test]
    fn blocked_reader_wakes_on_write_across_fibers() {
        let scheduler = Scheduler::new(1, true, 4);
        scheduler.start();
        let (a, b) = pipe_stream(64);
        let reads = Arc::new(AtomicUsize::new(0));

        let reads_clone = reads.clone();
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            let mut buf = [0u8; 3];
            let n = b.read(&mut buf).unwrap();
            reads_clone.fetch_add(n, Ordering::SeqCst);
            scheduler_ref.stop();
        }));
        scheduler.schedule(Box::new(move || {
            a.write(b"hi!").unwrap();
        }));
        scheduler.dispatch();
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn eof_after_peer_closes_write() {
        let scheduler = Scheduler::new(1, true, 4);
        scheduler.start();
        let (a, b) = pipe_stream(64);
        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            drop(a);
            let mut buf = [0u8; 1];
            assert_eq!(b.read(&mut buf).unwrap(), 0);
            scheduler_ref.stop();
        }));
        scheduler.dispatch();
    }

    #[test]
    fn blocked_reader_on_one_scheduler_wakes_from_a_write_on_another() {
        let reader_scheduler = Scheduler::new(1, true, 4);
        reader_scheduler.start();
        let writer_scheduler = Scheduler::new(1, true, 4);
        writer_scheduler.start();

        let (a, b) = pipe_stream(64);
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_clone = reads.clone();
        let reader_scheduler_ref = reader_scheduler.clone();
        reader_scheduler.schedule(Box::new(move || {
            let mut buf = [0u8; 3];
            let n = b.read(&mut buf).unwrap();
            reads_clone.fetch_add(n, Ordering::SeqCst);
            reader_scheduler_ref.stop();
        }));

        let writer_scheduler_ref = writer_scheduler.clone();
        writer_scheduler.schedule(Box::new(move || {
            a.write(b"hi!").unwrap();
            writer_scheduler_ref.stop();
        }));

        reader_scheduler.dispatch();
        writer_scheduler.stop();
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn drop_from_a_thread_with_no_running_fiber_still_wakes_the_peer() {
        let scheduler = Scheduler::new(1, true, 4);
        scheduler.start();
        let (a, b) = pipe_stream(1);

        let scheduler_ref = scheduler.clone();
        scheduler.schedule(Box::new(move || {
            let mut buf = [0u8; 1];
            assert_eq!(b.read(&mut buf).unwrap(), 0);
            scheduler_ref.stop();
        }));

        // Give the reader a chance to park on `a`'s peer-owned `pending_reader` slot before the
        // plain (non-fiber) main test thread drops `a`, exercising the wake path with no `current()`.
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(a);
        scheduler.stop();
    }
}
