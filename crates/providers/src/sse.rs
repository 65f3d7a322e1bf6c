//! Shared SSE streaming infrastructure for all provider adapters.
//!
//! Every adapter follows the same pattern: receive a
//! `reqwest::Response`, buffer chunks, split on blank lines, extract
//! `data:` payloads, and feed each payload to a provider-specific
//! normalizer. `\r\n` and `\n` line endings are both accepted and
//! produce identical event sequences.

use futures_util::StreamExt;

use hub_domain::error::{Error, Result};
use hub_domain::stream::{BoxStream, StreamEvent};

use crate::SseNormalizer;

/// Extract complete `data:` payloads from an SSE buffer.
///
/// The buffer is drained in place: consumed bytes are removed and any
/// trailing partial event remains for the next call. CRLF sequences are
/// normalized before splitting; a lone trailing `\r` (a chunk boundary
/// landing mid-CRLF) is kept for the next chunk.
pub fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    if buffer.contains('\r') {
        // A lone trailing `\r` (chunk boundary mid-CRLF) survives the
        // replacement and is completed by the next chunk.
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut data_lines = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }
    data_lines
}

/// Build a canonical event stream from an SSE response and a
/// normalizer. The stream flushes the remaining buffer when the body
/// closes and guarantees a trailing `MessageStop`.
pub fn sse_event_stream(
    response: reqwest::Response,
    mut normalizer: Box<dyn SseNormalizer>,
) -> BoxStream<'static, Result<StreamEvent>> {
    let stream = async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        let mut stop_emitted = false;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for event in normalizer.normalize(&data) {
                            if matches!(&event, Ok(StreamEvent::MessageStop)) {
                                stop_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Err(e) => {
                    yield Err(Error::Proxy {
                        provider: "stream".into(),
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }

        // Flush a trailing partial event.
        if !buffer.trim().is_empty() {
            buffer.push_str("\n\n");
            for data in drain_data_lines(&mut buffer) {
                for event in normalizer.normalize(&data) {
                    if matches!(&event, Ok(StreamEvent::MessageStop)) {
                        stop_emitted = true;
                    }
                    yield event;
                }
            }
        }

        if !stop_emitted {
            yield Ok(StreamEvent::MessageStop);
        }
    };

    Box::pin(stream)
}
