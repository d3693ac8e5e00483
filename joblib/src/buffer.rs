//! An in-memory byte log that can simultaneously be written to by a single
//! writer and read from by any number of readers, such that every reader
//! observes the same byte stream.
//!
//! The buffer is an ordered list of fixed-capacity chunks. The last chunk is
//! open; every earlier chunk is sealed and immutable. Readers keep their own
//! cursor (chunk index + offset), so a slow reader never delays the writer or
//! any other reader. A new chunk is linked into the list before its
//! predecessor is sealed, so a reader that finishes a sealed chunk observes a
//! successor if and only if one will ever exist.
//!
//! Call [`StreamBuffer::new_stream`] to read. The returned channel first
//! replays everything written so far, then delivers new bytes as they are
//! written, and closes once the buffer is closed and fully drained. Writes
//! after [`StreamBuffer::close`] fail with a closed-pipe error, and the buffer
//! must always be closed when no more writes are expected, or readers will
//! block indefinitely.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const MAX_CHUNK_SIZE: usize = 4 * 1024;

pub struct StreamBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    chunks: Vec<Arc<Chunk>>,
    closed: bool,
}

struct Chunk {
    state: Mutex<ChunkState>,
    changed: Notify,
}

struct ChunkState {
    buf: Vec<u8>,
    sealed: bool,
}

impl Chunk {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChunkState {
                buf: Vec::with_capacity(MAX_CHUNK_SIZE),
                sealed: false,
            }),
            changed: Notify::new(),
        }
    }

    fn seal(&self) {
        self.state.lock().unwrap().sealed = true;
        self.changed.notify_waiters();
    }

    /// Copies out the bytes at `offset`, if any. The second value is false
    /// once the chunk is sealed and nothing more can ever appear.
    fn read_from(&self, offset: usize) -> (Bytes, bool) {
        let state = self.state.lock().unwrap();
        let bytes = if offset < state.buf.len() {
            Bytes::copy_from_slice(&state.buf[offset..])
        } else {
            Bytes::new()
        };
        (bytes, !state.sealed)
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: vec![Arc::new(Chunk::new())],
                closed: false,
            }),
        }
    }

    /// Appends `data` to the buffer, splitting it across chunks as needed,
    /// and wakes any readers waiting on the tail. Never blocks on readers.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write on closed stream buffer",
            ));
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            let tail = inner.chunks.last().expect("chunk list is never empty").clone();
            let mut state = tail.state.lock().unwrap();
            let capacity = MAX_CHUNK_SIZE - state.buf.len();
            if capacity == 0 {
                // Link the successor before sealing, so a reader finishing
                // this chunk never observes a dangling tail.
                inner.chunks.push(Arc::new(Chunk::new()));
                state.sealed = true;
                drop(state);
                tail.changed.notify_waiters();
                continue;
            }
            let n = capacity.min(remaining.len());
            state.buf.extend_from_slice(&remaining[..n]);
            drop(state);
            tail.changed.notify_waiters();
            remaining = &remaining[n..];
        }
        Ok(data.len())
    }

    /// Closes the buffer. Idempotent. All readers drain the remaining bytes
    /// and then observe end-of-stream.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let tail = inner.chunks.last().expect("chunk list is never empty").clone();
        drop(inner);
        tail.seal();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Opens an independent reader over the full contents of the buffer. The
    /// channel replays all bytes written so far, follows new writes, and
    /// closes after [`close`](Self::close) once everything has been
    /// delivered, or as soon as `cancel` fires.
    pub fn new_stream(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(1);
        let buf = Arc::clone(self);
        tokio::spawn(async move {
            let mut index = 0;
            while let Some(chunk) = buf.chunk_at(index) {
                let mut offset = 0;
                loop {
                    // Register for the wakeup before inspecting the chunk, so
                    // an append between the check and the await is not missed.
                    let notified = chunk.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let (bytes, open) = chunk.read_from(offset);
                    if !bytes.is_empty() {
                        offset += bytes.len();
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return,
                            sent = tx.send(bytes) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                        continue;
                    }
                    if !open {
                        break;
                    }
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        () = &mut notified => {}
                    }
                }
                index += 1;
            }
        });
        rx
    }

    fn chunk_at(&self, index: usize) -> Option<Arc<Chunk>> {
        self.inner.lock().unwrap().chunks.get(index).cloned()
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::time::{Duration, Instant};

    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(bytes) = rx.recv().await {
            out.extend_from_slice(&bytes);
        }
        out
    }

    #[tokio::test]
    async fn replays_history_in_write_order() {
        let buf = Arc::new(StreamBuffer::new());
        let early = buf.new_stream(CancellationToken::new());
        for i in 0..=255u8 {
            assert_eq!(buf.write(&[i]).unwrap(), 1);
        }
        let late = buf.new_stream(CancellationToken::new());
        buf.close();

        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(drain(early).await, expected);
        assert_eq!(drain(late).await, expected);
    }

    #[tokio::test]
    async fn reader_created_after_close_sees_full_history() {
        let buf = Arc::new(StreamBuffer::new());
        buf.write(b"hello").unwrap();
        buf.write(b" ").unwrap();
        buf.write(b"world").unwrap();
        buf.close();

        let rx = buf.new_stream(CancellationToken::new());
        assert_eq!(drain(rx).await, b"hello world");
    }

    #[tokio::test]
    async fn write_after_close_fails_with_closed_pipe() {
        let buf = StreamBuffer::new();
        buf.close();
        let err = buf.write(b"hello").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);

        // close is idempotent
        buf.close();
        assert!(buf.is_closed());
    }

    #[tokio::test]
    async fn canceled_reader_stops_receiving() {
        let buf = Arc::new(StreamBuffer::new());
        let mut steady = buf.new_stream(CancellationToken::new());
        let cancel = CancellationToken::new();
        let mut canceled = buf.new_stream(cancel.clone());

        buf.write(b"hello ").unwrap();
        assert_eq!(steady.recv().await.unwrap(), Bytes::from_static(b"hello "));
        assert_eq!(canceled.recv().await.unwrap(), Bytes::from_static(b"hello "));

        cancel.cancel();
        assert!(canceled.recv().await.is_none());

        buf.write(b"world").unwrap();
        assert_eq!(steady.recv().await.unwrap(), Bytes::from_static(b"world"));
        buf.close();
        assert!(steady.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fans_out_to_many_concurrent_readers() {
        const TOTAL: usize = 10 * 1024 * 1024;

        // pseudo-random contents, shared so each reader verifies its stream
        // incrementally instead of accumulating 10 MiB apiece
        let mut expected = Vec::with_capacity(TOTAL);
        let mut state = 0x9e3779b97f4a7c15u64;
        while expected.len() < TOTAL {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            expected.extend_from_slice(&state.to_le_bytes());
        }
        expected.truncate(TOTAL);
        let expected = Arc::new(expected);

        let buf = Arc::new(StreamBuffer::new());
        let mut readers = Vec::new();
        for _ in 0..100 {
            let mut rx = buf.new_stream(CancellationToken::new());
            let expected = expected.clone();
            readers.push(tokio::spawn(async move {
                let mut offset = 0;
                while let Some(bytes) = rx.recv().await {
                    assert_eq!(&bytes[..], &expected[offset..offset + bytes.len()]);
                    offset += bytes.len();
                }
                offset
            }));
        }

        let mut written = 0;
        while written < TOTAL {
            let n = (TOTAL - written).min(8 * 1024);
            assert_eq!(buf.write(&expected[written..written + n]).unwrap(), n);
            written += n;
        }
        buf.close();

        for reader in readers {
            assert_eq!(reader.await.unwrap(), TOTAL);
        }
    }

    #[tokio::test]
    async fn slow_reader_does_not_block_fast_reader() {
        let buf = Arc::new(StreamBuffer::new());
        let fast = buf.new_stream(CancellationToken::new());
        let mut slow = buf.new_stream(CancellationToken::new());

        let contents: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

        let fast_task = tokio::spawn(drain(fast));
        let slow_contents = contents.clone();
        let slow_task = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(bytes) = slow.recv().await {
                out.extend_from_slice(&bytes);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(out, slow_contents);
        });

        buf.write(&contents).unwrap();
        buf.close();

        let start = Instant::now();
        assert_eq!(fast_task.await.unwrap(), contents);
        let fast_time = start.elapsed();
        slow_task.await.unwrap();
        let slow_time = start.elapsed();

        // 10x is a sanity bound; in practice the gap is orders of magnitude
        assert!(
            fast_time * 10 < slow_time,
            "fast reader took {fast_time:?}, slow reader took {slow_time:?}"
        );
    }

    proptest! {
        // Any interleaving of writes and reader creations, followed by close:
        // every reader sees the concatenation of all writes, in order.
        #[test]
        fn all_readers_observe_identical_streams(
            writes in pvec(pvec(any::<u8>(), 0..9000), 0..20),
            reader_points in pvec(0usize..21, 1..5),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let buf = Arc::new(StreamBuffer::new());
                let mut readers = Vec::new();
                let mut expected = Vec::new();
                for (i, data) in writes.iter().enumerate() {
                    for _ in reader_points.iter().filter(|p| **p == i) {
                        readers.push(buf.new_stream(CancellationToken::new()));
                    }
                    prop_assert_eq!(buf.write(data).unwrap(), data.len());
                    expected.extend_from_slice(data);
                }
                for _ in reader_points.iter().filter(|p| **p >= writes.len()) {
                    readers.push(buf.new_stream(CancellationToken::new()));
                }
                buf.close();
                for rx in readers {
                    prop_assert_eq!(drain(rx).await, expected.clone());
                }
                Ok(())
            })?;
        }

        // A canceled reader delivers a prefix of the written stream.
        #[test]
        fn canceled_reader_receives_a_prefix(
            writes in pvec(pvec(any::<u8>(), 1..5000), 1..10),
            cancel_after in 0usize..20000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let buf = Arc::new(StreamBuffer::new());
                let cancel = CancellationToken::new();
                let mut rx = buf.new_stream(cancel.clone());
                let mut expected = Vec::new();
                for data in &writes {
                    buf.write(data).unwrap();
                    expected.extend_from_slice(data);
                }
                buf.close();

                let mut received = Vec::new();
                while received.len() < cancel_after {
                    match rx.recv().await {
                        Some(bytes) => received.extend_from_slice(&bytes),
                        None => break,
                    }
                }
                cancel.cancel();
                // at most one in-flight message after cancellation
                if let Some(bytes) = rx.recv().await {
                    received.extend_from_slice(&bytes);
                }
                assert!(rx.recv().await.is_none());
                prop_assert!(received.len() <= expected.len());
                prop_assert_eq!(&received[..], &expected[..received.len()]);
                Ok(())
            })?;
        }
    }
}
