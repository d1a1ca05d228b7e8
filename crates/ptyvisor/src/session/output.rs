//! Output buffering and debounced delivery.
//!
//! Bytes read from the PTY master are handed to an [`OutputPipeline`] over an
//! ordered channel. The pipeline task is the only writer of the session's
//! [`OutputBuffer`], so chunk order is preserved and every callback observes
//! the buffer exactly as it was when the chunk was appended.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Channel capacity between the read loop and the pipeline task.
const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Callback receiving decoded output text.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Bounded text accumulator that keeps the most recent output.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    max_chars: usize,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `max_chars` characters.
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            max_chars,
        }
    }

    /// Appends `text`, then drops the oldest content if the cap is exceeded.
    ///
    /// On overflow only the newest `max_chars / 2` characters are kept.
    pub fn push(&mut self, text: &str) {
        self.text.push_str(text);
        self.chars += text.chars().count();

        if self.chars > self.max_chars {
            let keep = self.max_chars / 2;
            let skip = self.chars - keep;
            let cut = self
                .text
                .char_indices()
                .nth(skip)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = keep;
        }
    }

    /// Returns the buffered text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of characters currently buffered.
    pub fn len(&self) -> usize {
        self.chars
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    /// Maximum number of characters retained.
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Discards all buffered text.
    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }
}

/// Incremental UTF-8 decoder.
///
/// Invalid byte sequences are dropped. A multi-byte character split across
/// two reads is held back until the rest of it arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes `bytes`, prefixed by whatever was held back last time.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(bad) => rest = &tail[bad..],
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Callbacks fired by the output pipeline.
#[derive(Clone, Default)]
pub struct OutputHandlers {
    /// Fired once per read with the text just decoded.
    pub on_chunk: Option<OutputCallback>,
    /// Fired once per quiet period with the whole buffer.
    pub on_flush: Option<OutputCallback>,
}

impl std::fmt::Debug for OutputHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHandlers")
            .field("on_chunk", &self.on_chunk.is_some())
            .field("on_flush", &self.on_flush.is_some())
            .finish()
    }
}

/// Shared handle to a session's output buffer.
#[derive(Debug, Clone)]
pub struct SharedBuffer(Arc<Mutex<OutputBuffer>>);

impl SharedBuffer {
    /// Creates a shared, empty buffer.
    pub fn new(max_chars: usize) -> Self {
        Self(Arc::new(Mutex::new(OutputBuffer::new(max_chars))))
    }

    /// Locks the buffer.
    pub fn lock(&self) -> MutexGuard<'_, OutputBuffer> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a copy of the buffered text.
    pub fn snapshot(&self) -> String {
        self.lock().as_str().to_owned()
    }
}

/// Serialized consumer of PTY output.
///
/// Owns the debounce timer: each chunk re-arms it, and when it expires the
/// flush handler receives the full buffer. Only one flush is ever pending.
pub struct OutputPipeline {
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OutputPipeline {
    /// Spawns the pipeline task on the current runtime.
    pub fn spawn(buffer: SharedBuffer, debounce: Duration, handlers: OutputHandlers) -> Self {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_pipeline(
            rx,
            buffer,
            debounce,
            handlers,
            cancel.clone(),
        ));
        Self { tx, cancel, task }
    }

    /// Returns a sender feeding raw bytes into the pipeline.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    /// Cancels the pipeline without waiting for it to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the pipeline, dropping any pending flush, and waits for it.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run_pipeline(
    mut rx: mpsc::Receiver<Vec<u8>>,
    buffer: SharedBuffer,
    debounce: Duration,
    handlers: OutputHandlers,
    cancel: CancellationToken,
) {
    let mut decoder = Utf8Decoder::default();
    let timer = tokio::time::sleep(debounce);
    tokio::pin!(timer);
    let mut armed = false;
    let mut input_open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Chunks already queued still reach the buffer; the pending
                // flush does not fire.
                while let Ok(bytes) = rx.try_recv() {
                    apply_chunk(&mut decoder, &bytes, &buffer, &handlers);
                }
                tracing::trace!("Output pipeline cancelled");
                break;
            }

            chunk = rx.recv(), if input_open => match chunk {
                Some(bytes) => {
                    if apply_chunk(&mut decoder, &bytes, &buffer, &handlers) {
                        timer.as_mut().reset(Instant::now() + debounce);
                        armed = true;
                    }
                }
                None => {
                    // Reader is gone; let a pending flush run out first.
                    input_open = false;
                    if !armed {
                        break;
                    }
                }
            },

            () = &mut timer, if armed => {
                armed = false;
                let snapshot = buffer.snapshot();
                if let Some(on_flush) = &handlers.on_flush {
                    on_flush(&snapshot);
                }
                if !input_open {
                    break;
                }
            }
        }
    }
}

/// Decodes one chunk into the buffer. Returns false if it held no text.
fn apply_chunk(
    decoder: &mut Utf8Decoder,
    bytes: &[u8],
    buffer: &SharedBuffer,
    handlers: &OutputHandlers,
) -> bool {
    let text = decoder.decode(bytes);
    if text.is_empty() {
        return false;
    }
    buffer.lock().push(&text);
    if let Some(on_chunk) = &handlers.on_chunk {
        on_chunk(&text);
    }
    true
}
