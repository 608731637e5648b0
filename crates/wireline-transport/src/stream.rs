//! Stream id multiplexing and response delivery.
//!
//! Each in-flight request borrows a stream id for exactly the life of the
//! request. The table hands out the lowest free id, maps ids back to their
//! pending requests when responses arrive, and supports draining everything
//! at once when the connection dies.
//!
//! Delivery is exactly-once: a pending request resolves to a response, a
//! timeout, or a connection error, whichever lands first, and the losers of
//! that race are silently dropped.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use wireline_core::{Error, Result};

use crate::protocol::Response;
use crate::timer::TimerHandle;

// ==================== Result delivery ====================

/// Shared slot a `ResponseHandle` blocks on.
///
/// `complete` succeeds at most once; later attempts report `false` so the
/// caller knows it lost the race and should do nothing further.
#[derive(Debug)]
pub(crate) struct ResponseCell {
    slot: Mutex<CellState>,
    ready: Condvar,
}

#[derive(Debug)]
struct CellState {
    result: Option<Result<Response>>,
    delivered: bool,
}

impl ResponseCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(CellState {
                result: None,
                delivered: false,
            }),
            ready: Condvar::new(),
        })
    }

    /// Store the result if nothing has been stored yet. Returns whether this
    /// call won the race.
    pub(crate) fn complete(&self, result: Result<Response>) -> bool {
        let mut state = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if state.delivered {
            return false;
        }
        state.delivered = true;
        state.result = Some(result);
        drop(state);
        self.ready.notify_all();
        true
    }

    fn wait(&self, timeout: Duration) -> Option<Result<Response>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if state.result.is_some() {
                return state.result.take();
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
    }

    fn is_done(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delivered
    }
}

/// Where a resolved request's result goes: a blocking handle or an inline
/// callback.
pub(crate) enum ResultSink {
    Handle(Arc<ResponseCell>),
    Callback(Box<dyn FnOnce(Result<Response>) + Send>),
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultSink::Handle(_) => f.write_str("ResultSink::Handle"),
            ResultSink::Callback(_) => f.write_str("ResultSink::Callback"),
        }
    }
}

/// Caller-facing handle for one submitted request.
///
/// `wait` consumes the result; it can only be taken once.
#[derive(Debug)]
pub struct ResponseHandle {
    pub(crate) cell: Arc<ResponseCell>,
    stream_id: i32,
    timestamp: Option<u64>,
}

impl ResponseHandle {
    pub(crate) fn new(cell: Arc<ResponseCell>, stream_id: i32, timestamp: Option<u64>) -> Self {
        Self {
            cell,
            stream_id,
            timestamp,
        }
    }

    /// Block until the request resolves or `timeout` elapses locally.
    ///
    /// A local wait timeout reports `Error::RequestTimeout` but does not
    /// cancel the in-flight request; the connection-side timer still owns
    /// reclaiming the stream.
    pub fn wait(&self, timeout: Duration) -> Result<Response> {
        match self.cell.wait(timeout) {
            Some(result) => result,
            None => Err(Error::RequestTimeout),
        }
    }

    /// Whether the request has already resolved.
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// Stream id the request went out on.
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Client timestamp stamped on the request, if one was drawn.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }
}

// ==================== Pending requests ====================

/// Book-keeping for one in-flight request, held by the stream table.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) stream_id: i32,
    /// Distinguishes reuses of the same stream id across requests.
    pub(crate) seq: u64,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) sink: ResultSink,
}

impl PendingRequest {
    /// Deliver the result. Must be called with no connection lock held; the
    /// sink may run caller code.
    pub(crate) fn complete(self, result: Result<Response>) {
        match self.sink {
            ResultSink::Handle(cell) => {
                cell.complete(result);
            }
            ResultSink::Callback(callback) => callback(result),
        }
    }
}

// ==================== Stream table ====================

/// Allocator and registry for stream ids.
#[derive(Debug)]
pub(crate) struct StreamTable {
    /// Free ids, kept so the lowest id pops first.
    free: Vec<i32>,
    in_use: HashMap<i32, PendingRequest>,
}

impl StreamTable {
    pub(crate) fn new(limit: usize) -> Self {
        let mut free: Vec<i32> = (0..limit as i32).collect();
        free.reverse();
        Self {
            free,
            in_use: HashMap::new(),
        }
    }

    /// Borrow the lowest free stream id.
    pub(crate) fn acquire(&mut self) -> Result<i32> {
        self.free.pop().ok_or(Error::AllStreamsBusy)
    }

    /// Return an id that was acquired but never bound (submission failed
    /// before the frame went out).
    pub(crate) fn release(&mut self, id: i32) {
        debug_assert!(!self.in_use.contains_key(&id));
        self.free.push(id);
    }

    /// Register the pending request for an acquired id.
    pub(crate) fn bind(&mut self, id: i32, pending: PendingRequest) {
        let previous = self.in_use.insert(id, pending);
        debug_assert!(previous.is_none(), "stream id {id} double-bound");
    }

    /// Resolve an id back to its pending request, freeing the id.
    ///
    /// A response for an id with no pending request means the connection has
    /// lost protocol sync.
    pub(crate) fn resolve(&mut self, id: i32) -> Result<PendingRequest> {
        match self.in_use.remove(&id) {
            Some(pending) => {
                self.free.push(id);
                Ok(pending)
            }
            None => Err(Error::UnknownStream { id }),
        }
    }

    /// Resolve only if the pending request still carries `seq`.
    ///
    /// Used by the timeout path: if the id has already been freed and reused
    /// for a newer request, the stale timer must not touch it.
    pub(crate) fn resolve_matching(&mut self, id: i32, seq: u64) -> Option<PendingRequest> {
        match self.in_use.get(&id) {
            Some(pending) if pending.seq == seq => {
                let pending = self.in_use.remove(&id);
                self.free.push(id);
                pending
            }
            _ => None,
        }
    }

    /// Take every pending request, freeing all ids. Used when the connection
    /// is marked defunct or closed.
    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        let drained: Vec<PendingRequest> = self
            .in_use
            .drain()
            .map(|(id, pending)| {
                self.free.push(id);
                pending
            })
            .collect();
        drained
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;

    fn pending(id: i32, seq: u64) -> (PendingRequest, Arc<ResponseCell>) {
        let cell = ResponseCell::new();
        let pending = PendingRequest {
            stream_id: id,
            seq,
            timer: None,
            sink: ResultSink::Handle(Arc::clone(&cell)),
        };
        (pending, cell)
    }

    fn response(id: i32) -> Response {
        Response {
            stream_id: id,
            opcode: Opcode::Result,
            body: Vec::new(),
        }
    }

    #[test]
    fn test_lowest_free_id_first() {
        let mut table = StreamTable::new(4);
        assert_eq!(table.acquire().unwrap(), 0);
        assert_eq!(table.acquire().unwrap(), 1);
        assert_eq!(table.acquire().unwrap(), 2);

        table.release(1);
        assert_eq!(table.acquire().unwrap(), 1);
    }

    #[test]
    fn test_exhaustion_is_an_error_not_a_block() {
        let mut table = StreamTable::new(2);
        table.acquire().unwrap();
        table.acquire().unwrap();
        assert!(matches!(table.acquire(), Err(Error::AllStreamsBusy)));

        // Resolving an id makes it available again.
        let (p, _cell) = pending(0, 1);
        table.bind(0, p);
        table.resolve(0).unwrap();
        assert_eq!(table.acquire().unwrap(), 0);
    }

    #[test]
    fn test_unknown_stream_is_an_error() {
        let mut table = StreamTable::new(4);
        assert!(matches!(
            table.resolve(3),
            Err(Error::UnknownStream { id: 3 })
        ));
    }

    #[test]
    fn test_resolve_matching_ignores_reused_id() {
        let mut table = StreamTable::new(4);
        let id = table.acquire().unwrap();
        let (p, _c) = pending(id, 1);
        table.bind(id, p);

        // Response wins; id gets reused by a newer request with seq 2.
        table.resolve(id).unwrap();
        let id2 = table.acquire().unwrap();
        assert_eq!(id2, id);
        let (p2, _c2) = pending(id, 2);
        table.bind(id, p2);

        // The stale timer for seq 1 must not resolve the newer request.
        assert!(table.resolve_matching(id, 1).is_none());
        assert_eq!(table.in_flight(), 1);
        assert!(table.resolve_matching(id, 2).is_some());
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_drain_frees_everything() {
        let mut table = StreamTable::new(4);
        for seq in 0..3 {
            let id = table.acquire().unwrap();
            let (p, _c) = pending(id, seq);
            table.bind(id, p);
        }
        let drained = table.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(table.in_flight(), 0);
        for _ in 0..4 {
            table.acquire().unwrap();
        }
    }

    #[test]
    fn test_cell_delivers_exactly_once() {
        let cell = ResponseCell::new();
        assert!(cell.complete(Ok(response(1))));
        assert!(!cell.complete(Err(Error::RequestTimeout)));

        let handle = ResponseHandle::new(Arc::clone(&cell), 1, None);
        let got = handle.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.stream_id, 1);
    }

    #[test]
    fn test_handle_wait_times_out_locally() {
        let cell = ResponseCell::new();
        let handle = ResponseHandle::new(cell, 0, None);
        assert!(matches!(
            handle.wait(Duration::from_millis(5)),
            Err(Error::RequestTimeout)
        ));
        assert!(!handle.is_done());
    }

    #[test]
    fn test_handle_unblocks_from_another_thread() {
        let cell = ResponseCell::new();
        let handle = ResponseHandle::new(Arc::clone(&cell), 2, Some(42));
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            cell.complete(Ok(response(2)));
        });
        let got = handle.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(got.stream_id, 2);
        assert_eq!(handle.timestamp(), Some(42));
        assert!(handle.is_done());
        completer.join().unwrap();
    }

    #[test]
    fn test_callback_sink_runs_inline() {
        let hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hit2 = Arc::clone(&hit);
        let pending = PendingRequest {
            stream_id: 0,
            seq: 0,
            timer: None,
            sink: ResultSink::Callback(Box::new(move |result| {
                assert!(result.is_ok());
                hit2.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
        };
        pending.complete(Ok(response(0)));
        assert!(hit.load(std::sync::atomic::Ordering::SeqCst));
    }
}
