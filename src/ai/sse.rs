// src/ai/sse.rs
// Server-sent-event line framing for provider streams
use super::AiError;
use futures::stream::{BoxStream, Stream, StreamExt};

/// Turns a raw byte stream into the payloads of its `data:` lines.
///
/// Bytes are buffered until a full line is available, so a multi-byte character split across
/// network chunks is decoded intact.
pub fn data_lines<S, B, E>(bytes: S) -> BoxStream<'static, Result<String, AiError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<AiError> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Ok(Some(data)) => yield Ok(data),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        // Trailing line without a newline
        if !buffer.is_empty() {
            match parse_line(&buffer) {
                Ok(Some(data)) => yield Ok(data),
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        }
    }
    .boxed()
}

fn parse_line(raw: &[u8]) -> Result<Option<String>, AiError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| AiError::Parse(format!("invalid UTF-8 in event stream: {}", e)))?;
    let line = line.trim_end_matches(['\n', '\r']);
    Ok(line
        .strip_prefix("data:")
        .map(|data| data.strip_prefix(' ').unwrap_or(data).to_string()))
}
