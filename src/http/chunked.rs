//! Chunked transfer encoding support
//!
//! Incremental encoder and decoder for the HTTP chunked transfer
//! coding. Both sides are byte-stream state machines: `feed` never
//! blocks, it either queues complete chunk records out of the bytes
//! seen so far or reports that more input is needed. The caller
//! drains the queue with `flush`.

use super::{Error, Result};
use bytes::{Buf, BytesMut};

/// One chunk record. A size of zero marks the end of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub size: usize,
    pub data: Vec<u8>,
}

/// Outcome of a `feed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No complete chunk record yet; feed more bytes.
    Pending,
    /// At least one chunk record is queued; call `flush`.
    ChunksReady,
    /// The codec is done. The queue may still hold the terminal
    /// record, so `flush` once more.
    Finished,
}

/// Common surface of the chunked encoder and decoder.
pub trait ChunkCodec: std::fmt::Debug {
    /// Consume more raw bytes. Feeding a finished codec is a no-op.
    fn feed(&mut self, data: &[u8]) -> Result<Progress>;

    /// Drain the queue of complete chunk records.
    fn flush(&mut self) -> Vec<Chunk>;

    /// True once the terminal chunk has been seen or produced.
    fn finished(&self) -> bool;

    /// Take any buffered input bytes that were not part of the coded
    /// body (bytes past the terminal chunk).
    fn take_cache(&mut self) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    SizeLine,
    Body { size: usize },
    Finished,
}

/// Chunked decoder
///
/// Decodes a chunked-coded byte stream into chunk records.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: DecoderState,
    cache: BytesMut,
    queue: Vec<Chunk>,
    body: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        ChunkDecoder {
            state: DecoderState::SizeLine,
            cache: BytesMut::new(),
            queue: Vec::new(),
            body: Vec::new(),
        }
    }

    /// All payload bytes decoded so far, concatenated.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn progress(&self) -> Progress {
        if self.state == DecoderState::Finished {
            Progress::Finished
        } else if self.queue.is_empty() {
            Progress::Pending
        } else {
            Progress::ChunksReady
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCodec for ChunkDecoder {
    fn feed(&mut self, data: &[u8]) -> Result<Progress> {
        if self.state == DecoderState::Finished {
            return Ok(Progress::Finished);
        }

        self.cache.extend_from_slice(data);

        loop {
            match self.state {
                DecoderState::SizeLine => {
                    let Some(crlf_pos) = find_crlf(&self.cache) else {
                        break;
                    };

                    let line = self.cache.split_to(crlf_pos);
                    self.cache.advance(2);

                    let text = String::from_utf8_lossy(&line);
                    let size = usize::from_str_radix(text.trim(), 16)
                        .map_err(|_| Error::Chunk("could not parse".to_string()))?;

                    if size == 0 {
                        self.queue.push(Chunk {
                            size: 0,
                            data: Vec::new(),
                        });
                        self.state = DecoderState::Finished;
                        break;
                    }

                    self.state = DecoderState::Body { size };
                }

                DecoderState::Body { size } => {
                    // chunk data plus its trailing CRLF
                    if self.cache.len() < size + 2 {
                        break;
                    }

                    let data = self.cache.split_to(size).to_vec();
                    self.cache.advance(2);

                    self.body.extend_from_slice(&data);
                    self.queue.push(Chunk { size, data });

                    self.state = DecoderState::SizeLine;
                }

                DecoderState::Finished => break,
            }
        }

        Ok(self.progress())
    }

    fn flush(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.queue)
    }

    fn finished(&self) -> bool {
        self.state == DecoderState::Finished
    }

    fn take_cache(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.cache).to_vec()
    }
}

/// Chunked encoder
///
/// Wraps raw payloads into chunk records; an empty payload produces
/// the terminal record and finishes the stream.
#[derive(Debug)]
pub struct ChunkEncoder {
    finished: bool,
    queue: Vec<Chunk>,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        ChunkEncoder {
            finished: false,
            queue: Vec::new(),
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCodec for ChunkEncoder {
    fn feed(&mut self, data: &[u8]) -> Result<Progress> {
        if self.finished {
            return Ok(Progress::Finished);
        }

        if data.is_empty() {
            self.queue.push(Chunk {
                size: 0,
                data: Vec::new(),
            });
            self.finished = true;

            return Ok(Progress::Finished);
        }

        self.queue.push(Chunk {
            size: data.len(),
            data: data.to_vec(),
        });

        Ok(Progress::ChunksReady)
    }

    fn flush(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.queue)
    }

    fn finished(&self) -> bool {
        self.finished
    }

    fn take_cache(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Find CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
