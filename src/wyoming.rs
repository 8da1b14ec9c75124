//! Wyoming protocol client for networked speech recognition.
//!
//! Each event is one JSON header line, optionally followed by `data_length`
//! bytes of extra JSON data and `payload_length` bytes of binary payload.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Samples per `audio-chunk` event (0.1 s at 16 kHz).
const CHUNK_SAMPLES: usize = 1600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WyomingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_length: Option<usize>,
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl WyomingEvent {
    pub fn new(event_type: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            data_length: None,
            payload_length: None,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_length = Some(payload.len());
        self.payload = payload;
        self
    }
}

fn network(context: &str, e: impl std::fmt::Display) -> AssistantError {
    AssistantError::Network(format!("{context}: {e}"))
}

pub struct WyomingClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl WyomingClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .map_err(|e| network(&format!("connect {host}:{port}"), e))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Ask the server to describe itself. Returns the `info` data.
    pub async fn describe(&mut self) -> Result<serde_json::Value> {
        self.write_event(&WyomingEvent::new("describe", None)).await?;
        loop {
            let event = self.read_event().await?;
            if event.event_type == "info" {
                return Ok(event.data.unwrap_or(serde_json::Value::Null));
            }
            debug!(event = %event.event_type, "ignoring event while waiting for info");
        }
    }

    /// Transcribe one utterance of 16 kHz mono audio.
    pub async fn transcribe(&mut self, samples: &[i16], rate: u32) -> Result<String> {
        self.write_event(&WyomingEvent::new("transcribe", None)).await?;
        self.start_audio(rate).await?;
        for chunk in samples.chunks(CHUNK_SAMPLES) {
            let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
            self.send_chunk(&bytes, rate).await?;
        }
        self.stop_audio().await?;
        self.wait_for_transcript().await
    }

    pub async fn start_audio(&mut self, rate: u32) -> Result<()> {
        self.write_event(&WyomingEvent::new(
            "audio-start",
            Some(json!({ "rate": rate, "width": 2, "channels": 1 })),
        ))
        .await
    }

    pub async fn send_chunk(&mut self, audio: &[u8], rate: u32) -> Result<()> {
        let event = WyomingEvent::new(
            "audio-chunk",
            Some(json!({ "rate": rate, "width": 2, "channels": 1 })),
        )
        .with_payload(audio.to_vec());
        self.write_event(&event).await
    }

    pub async fn stop_audio(&mut self) -> Result<()> {
        self.write_event(&WyomingEvent::new("audio-stop", None)).await
    }

    pub async fn wait_for_transcript(&mut self) -> Result<String> {
        loop {
            let event = self.read_event().await?;
            match event.event_type.as_str() {
                "transcript" => {
                    let text = event
                        .data
                        .as_ref()
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    return Ok(text);
                }
                "error" => {
                    let text = event
                        .data
                        .as_ref()
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    return Err(AssistantError::Network(format!("server error: {text}")));
                }
                other => debug!(event = other, "ignoring event while waiting for transcript"),
            }
        }
    }

    async fn write_event(&mut self, event: &WyomingEvent) -> Result<()> {
        let header = serde_json::to_string(event).map_err(|e| network("encode event", e))?;
        self.writer
            .write_all(header.as_bytes())
            .await
            .map_err(|e| network("write", e))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|e| network("write", e))?;
        if !event.payload.is_empty() {
            self.writer
                .write_all(&event.payload)
                .await
                .map_err(|e| network("write", e))?;
        }
        self.writer.flush().await.map_err(|e| network("flush", e))
    }

    async fn read_event(&mut self) -> Result<WyomingEvent> {
        read_event(&mut self.reader).await
    }
}

/// Read one event, including its extra data and payload, from `reader`.
pub async fn read_event<R>(reader: &mut R) -> Result<WyomingEvent>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|e| network("read", e))?;
    if read == 0 {
        return Err(AssistantError::Network("connection closed".into()));
    }

    let mut event: WyomingEvent =
        serde_json::from_str(line.trim()).map_err(|e| network("decode event", e))?;

    if let Some(len) = event.data_length.filter(|&l| l > 0) {
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| network("read data", e))?;
        let extra: serde_json::Value =
            serde_json::from_slice(&buf).map_err(|e| network("decode data", e))?;
        event.data = Some(match (event.data.take(), extra) {
            (Some(serde_json::Value::Object(mut base)), serde_json::Value::Object(more)) => {
                base.extend(more);
                serde_json::Value::Object(base)
            }
            (_, extra) => extra,
        });
    }

    if let Some(len) = event.payload_length.filter(|&l| l > 0) {
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| network("read payload", e))?;
        event.payload = buf;
    }

    Ok(event)
}

/// Blocking facade over [`WyomingClient`] for the capture threads.
///
/// Owns a current-thread runtime, so it must not be called from inside
/// another tokio runtime.
pub struct WyomingTranscriber {
    host: String,
    port: u16,
    timeout: Duration,
    runtime: tokio::runtime::Runtime,
}

impl WyomingTranscriber {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            host: host.to_string(),
            port,
            timeout,
            runtime,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// One connection per utterance, bounded by the configured timeout.
    pub fn transcribe(&self, samples: &[i16], rate: u32) -> Result<String> {
        let fut = async {
            let mut client = WyomingClient::connect(&self.host, self.port).await?;
            client.transcribe(samples, rate).await
        };
        let text = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, fut).await })
            .map_err(|_| {
                AssistantError::Network(format!(
                    "transcription timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;
        debug!(chars = text.len(), "wyoming transcript");
        Ok(text)
    }

    /// Connect and describe. Returns the server's program name if it sent one.
    pub fn probe(&self) -> Result<String> {
        let fut = async {
            let mut client = WyomingClient::connect(&self.host, self.port).await?;
            client.describe().await
        };
        let info = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, fut).await })
            .map_err(|_| AssistantError::Network("describe timed out".into()))??;

        let name = info
            .get("asr")
            .and_then(|asr| asr.get(0))
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();
        info!(address = %self.address(), program = %name, "wyoming server reachable");
        Ok(name)
    }
}
