use crate::error::GatewayError;
use crate::traits::TextStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_BUFFER: usize = 32;

/// Splits a server-sent-events byte stream into `data:` payloads. Bytes are
/// buffered until a full line arrives, so multi-byte characters split across
/// network chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// Pumps an SSE response through a bounded channel. The producer stops when
/// the upstream ends, sends `[DONE]`, fails, or the consumer drops the stream.
pub(crate) fn text_stream<F>(provider: &str, response: reqwest::Response, extract: F) -> TextStream
where
    F: Fn(&str) -> Result<Option<String>, GatewayError> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
    let provider = provider.to_string();

    tokio::spawn(async move {
        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    let _ = sender.send(Err(GatewayError::Http(error))).await;
                    return;
                }
            };

            for payload in decoder.push(&chunk) {
                if payload == "[DONE]" {
                    return;
                }
                let item = match extract(&payload) {
                    Ok(Some(text)) if !text.is_empty() => Ok(text),
                    Ok(_) => continue,
                    Err(error) => Err(error),
                };
                let failed = item.is_err();
                if sender.send(item).await.is_err() || failed {
                    return;
                }
            }
        }
        tracing::debug!(provider = %provider, "completion stream finished");
    });

    Box::pin(ReceiverStream::new(receiver))
}
