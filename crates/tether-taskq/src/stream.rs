//! Per-stream state on the task worker.
//!
//! Chunks are read ahead eagerly into a buffer; `stream_read` requests are served from it, or
//! parked until more data arrives or the stream ends. A stream holds at most one parked read.
//!
//! Once a read has reported a stream's end, the stream is dropped from the table. Its final
//! value is remembered for a while, so late reads still see 0 or the error sentinel.

use std::collections::{HashMap, VecDeque};

use tether_mem::LinearMemory;
use tracing::{error, trace, warn};

use crate::retval::{send_i32_return_value, RETURN_ERROR};
use crate::source::SourceError;

/// Ended streams whose final read value is remembered.
const ENDED_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRead {
    ret_ptr: u32,
    buf_ptr: u32,
    buf_len: u32,
}

#[derive(Debug, Default)]
struct StreamState {
    chunks: VecDeque<Vec<u8>>,
    done: bool,
    error: Option<SourceError>,
    pending_read: Option<PendingRead>,
}

impl StreamState {
    fn ended(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// Streams opened on one worker. Not thread-safe; lives on the worker thread.
#[derive(Debug)]
pub(crate) struct StreamTable {
    memory: LinearMemory,
    next_id: i32,
    streams: HashMap<i32, StreamState>,
    /// `(id, final value)` of recently ended streams, oldest first.
    ended: VecDeque<(i32, i32)>,
}

impl StreamTable {
    pub(crate) fn new(memory: LinearMemory) -> Self {
        Self {
            memory,
            next_id: 1,
            streams: HashMap::new(),
            ended: VecDeque::new(),
        }
    }

    /// Register a newly opened stream and return its id. Ids start at 1 and are never negative.
    pub(crate) fn open(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.streams.contains_key(&id) {
                self.ended.retain(|&(ended, _)| ended != id);
                self.streams.insert(id, StreamState::default());
                return id;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    /// Handle a `stream_read` request.
    pub(crate) fn read(&mut self, ret_ptr: u32, stream_id: i32, buf_ptr: u32, buf_len: u32) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            match self.ended.iter().find(|&&(id, _)| id == stream_id) {
                Some(&(_, value)) => {
                    trace!(stream_id, value, "read from ended stream");
                    self.respond(ret_ptr, value);
                }
                None => {
                    warn!(stream_id, "read from unknown stream");
                    self.respond(ret_ptr, RETURN_ERROR);
                }
            }
            return;
        };
        if state.pending_read.is_some() {
            warn!(
                stream_id,
                "ConcurrentReadViolation: stream already has a pending read"
            );
            self.respond(ret_ptr, RETURN_ERROR);
            return;
        }

        let read = PendingRead {
            ret_ptr,
            buf_ptr,
            buf_len,
        };
        if state.chunks.is_empty() && !state.ended() && buf_len > 0 {
            trace!(stream_id, "parking read until data arrives");
            state.pending_read = Some(read);
            return;
        }
        let value = fill(&self.memory, state, read);
        self.respond(ret_ptr, value);
        self.evict_if_drained(stream_id);
    }

    /// Buffer a chunk produced by the read-ahead, serving a parked read if there is one.
    pub(crate) fn push_chunk(&mut self, stream_id: i32, chunk: Vec<u8>) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if chunk.is_empty() {
            return;
        }
        state.chunks.push_back(chunk);
        if let Some(read) = state.pending_read.take() {
            let value = fill(&self.memory, state, read);
            self.respond(read.ret_ptr, value);
        }
    }

    /// Mark the stream complete (`None`) or failed, answering a parked read.
    pub(crate) fn finish(&mut self, stream_id: i32, failure: Option<SourceError>) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match failure {
            Some(err) => state.error = Some(err),
            None => state.done = true,
        }
        if let Some(read) = state.pending_read.take() {
            let value = fill(&self.memory, state, read);
            self.respond(read.ret_ptr, value);
            self.evict_if_drained(stream_id);
        }
    }

    /// Drop an ended stream with nothing left to read.
    fn evict_if_drained(&mut self, stream_id: i32) {
        let drained = self
            .streams
            .get(&stream_id)
            .is_some_and(|state| state.ended() && state.chunks.is_empty());
        if !drained {
            return;
        }
        let Some(state) = self.streams.remove(&stream_id) else {
            return;
        };
        let value = if state.error.is_some() { RETURN_ERROR } else { 0 };
        if self.ended.len() == ENDED_HISTORY {
            self.ended.pop_front();
        }
        self.ended.push_back((stream_id, value));
        trace!(stream_id, "stream drained");
    }

    fn respond(&self, ret_ptr: u32, value: i32) {
        if let Err(err) = send_i32_return_value(&self.memory, ret_ptr, value) {
            error!(ret_ptr, value, %err, "failed to write stream return value");
        }
    }
}

/// Copy buffered bytes into the reader's buffer, across chunk boundaries.
///
/// Returns the byte count, 0 once a completed stream is drained, or the error sentinel once a
/// failed stream is drained.
fn fill(memory: &LinearMemory, state: &mut StreamState, read: PendingRead) -> i32 {
    if state.chunks.is_empty() {
        return if state.error.is_some() { RETURN_ERROR } else { 0 };
    }

    // Return values are i32, so one read never reports more than i32::MAX bytes.
    let want = read.buf_len.min(i32::MAX as u32) as usize;
    let mut written = 0usize;
    while written < want {
        let Some(chunk) = state.chunks.front_mut() else {
            break;
        };
        let n = chunk.len().min(want - written);
        if let Err(err) = memory.write(read.buf_ptr + written as u32, &chunk[..n]) {
            warn!(buf_ptr = read.buf_ptr, buf_len = read.buf_len, %err, "stream read buffer is invalid");
            return RETURN_ERROR;
        }
        written += n;
        if n == chunk.len() {
            state.chunks.pop_front();
        } else {
            chunk.drain(..n);
        }
    }
    written as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retval::RETURN_INITIAL;
    use std::sync::atomic::Ordering;

    const RET: u32 = 0;
    const BUF: u32 = 16;

    fn table() -> StreamTable {
        StreamTable::new(LinearMemory::new(256).unwrap())
    }

    fn reset(t: &StreamTable) {
        t.memory
            .atomic_i32(RET)
            .unwrap()
            .store(RETURN_INITIAL, Ordering::SeqCst);
    }

    fn ret(t: &StreamTable) -> i32 {
        t.memory.atomic_i32(RET).unwrap().load(Ordering::SeqCst)
    }

    fn buf(t: &StreamTable, len: usize) -> Vec<u8> {
        t.memory.read_vec(BUF, len).unwrap()
    }

    #[test]
    fn ids_start_at_one() {
        let mut t = table();
        assert_eq!(t.open(), 1);
        assert_eq!(t.open(), 2);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn reads_fill_across_chunks_then_report_end() {
        let mut t = table();
        let id = t.open();
        t.push_chunk(id, b"hello ".to_vec());
        t.push_chunk(id, b"world".to_vec());
        t.finish(id, None);

        reset(&t);
        t.read(RET, id, BUF, 4);
        assert_eq!(ret(&t), 4);
        assert_eq!(buf(&t, 4), b"hell");

        reset(&t);
        t.read(RET, id, BUF, 64);
        assert_eq!(ret(&t), 7);
        assert_eq!(buf(&t, 7), b"o world");

        for _ in 0..2 {
            reset(&t);
            t.read(RET, id, BUF, 64);
            assert_eq!(ret(&t), 0);
        }
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn drained_streams_leave_the_table() {
        let mut t = table();
        for round in 0..(ENDED_HISTORY * 2) {
            let id = t.open();
            t.push_chunk(id, vec![round as u8; 3]);
            reset(&t);
            t.read(RET, id, BUF, 8);
            assert_eq!(ret(&t), 3);

            // Parked until the stream ends; answering it drains the stream.
            reset(&t);
            t.read(RET, id, BUF, 8);
            assert_eq!(ret(&t), RETURN_INITIAL);
            if round % 2 == 0 {
                t.finish(id, None);
                assert_eq!(ret(&t), 0);
            } else {
                t.finish(id, Some(SourceError::Transport("reset".into())));
                assert_eq!(ret(&t), RETURN_ERROR);
            }
            assert_eq!(t.len(), 0);
        }
        assert_eq!(t.ended.len(), ENDED_HISTORY);
    }

    #[test]
    fn ended_streams_leave_once_their_data_is_read() {
        let mut t = table();
        let id = t.open();
        t.push_chunk(id, b"tail".to_vec());
        t.finish(id, None);
        assert_eq!(t.len(), 1);

        reset(&t);
        t.read(RET, id, BUF, 2);
        assert_eq!(ret(&t), 2);
        assert_eq!(t.len(), 1);

        reset(&t);
        t.read(RET, id, BUF, 8);
        assert_eq!(ret(&t), 2);
        assert_eq!(buf(&t, 2), b"il");
        assert_eq!(t.len(), 0);

        reset(&t);
        t.read(RET, id, BUF, 8);
        assert_eq!(ret(&t), 0);
    }

    #[test]
    fn parked_read_is_served_by_the_next_chunk() {
        let mut t = table();
        let id = t.open();
        reset(&t);
        t.read(RET, id, BUF, 8);
        assert_eq!(ret(&t), RETURN_INITIAL);

        t.push_chunk(id, b"abc".to_vec());
        assert_eq!(ret(&t), 3);
        assert_eq!(buf(&t, 3), b"abc");
    }

    #[test]
    fn second_concurrent_read_reports_the_error_sentinel() {
        let mut t = table();
        let id = t.open();
        reset(&t);
        t.read(RET, id, BUF, 8);

        let second_ret = 4;
        t.memory
            .atomic_i32(second_ret)
            .unwrap()
            .store(RETURN_INITIAL, Ordering::SeqCst);
        t.read(second_ret, id, BUF, 8);
        assert_eq!(
            t.memory.atomic_i32(second_ret).unwrap().load(Ordering::SeqCst),
            RETURN_ERROR
        );
        // The first read is still parked.
        assert_eq!(ret(&t), RETURN_INITIAL);
        t.finish(id, None);
        assert_eq!(ret(&t), 0);
    }

    #[test]
    fn failed_streams_serve_buffered_data_first() {
        let mut t = table();
        let id = t.open();
        t.push_chunk(id, b"xy".to_vec());
        t.finish(id, Some(SourceError::Transport("reset".into())));

        reset(&t);
        t.read(RET, id, BUF, 8);
        assert_eq!(ret(&t), 2);
        reset(&t);
        t.read(RET, id, BUF, 8);
        assert_eq!(ret(&t), RETURN_ERROR);
        assert_eq!(t.len(), 0);

        // Still reported after the stream left the table.
        reset(&t);
        t.read(RET, id, BUF, 8);
        assert_eq!(ret(&t), RETURN_ERROR);
    }

    #[test]
    fn unknown_streams_and_bad_buffers_report_errors() {
        let mut t = table();
        reset(&t);
        t.read(RET, 42, BUF, 8);
        assert_eq!(ret(&t), RETURN_ERROR);

        let id = t.open();
        t.push_chunk(id, b"data".to_vec());
        reset(&t);
        t.read(RET, id, 1 << 20, 8);
        assert_eq!(ret(&t), RETURN_ERROR);
    }
}
