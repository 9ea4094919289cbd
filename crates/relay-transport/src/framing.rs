//! Newline-delimited framing for byte streams.
//!
//! Both the process transport (stdout of a child process) and the HTTP push
//! stream deliver JSON payloads one per line, but the underlying reads do
//! not respect line boundaries: a single line may arrive split across
//! several reads, and several complete lines may arrive in one read. The
//! [`LineBuffer`] accumulates raw bytes and yields only complete lines,
//! keeping any trailing partial line buffered for the next read.

/// Incremental splitter for newline-delimited streams.
///
/// The buffer holds raw bytes and only converts to UTF-8 once a complete
/// line is available, so a multi-byte character split across two reads is
/// reassembled intact.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of raw bytes to the buffer.
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pops the next complete line, without its terminator. Returns `None`
    /// once only a partial line (or nothing) remains buffered.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Extracts the payload of a server-push line.
///
/// Lines beginning with the `data:` marker carry a JSON payload; everything
/// else (comments, event names, blank keep-alive lines) is ignored by this
/// layer.
pub(crate) fn push_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.trim_start())
}
