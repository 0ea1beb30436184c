//! Byte-level framing shared by every channel.
//!
//! Two layers:
//! - the attached sandbox stream is multiplexed into 8-byte headers
//!   `{type: u8, 0, 0, 0, length: u32 BE}` followed by `length` bytes
//!   (type 1 = stdout, type 2 = stderr);
//! - messages are a big-endian `u32` length followed by a JSON object.
//!
//! The same message layer is used on the agent/dispatcher TCP link.

use std::collections::BTreeMap;

use ggd_types::{DebugMode, GradeGridError, JobId, Limits, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;
pub const STREAM_HEADER_LEN: usize = 8;
/// Largest message accepted from a sandbox.
pub const MAX_SANDBOX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Messages exchanged with the grading process inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMessage {
    /// Host to sandbox: begin grading.
    Start {
        job_id: JobId,
        course_id: String,
        task_id: String,
        input: serde_json::Value,
        debug: DebugMode,
        limits: Limits,
    },
    /// Sandbox to host: final grading result.
    Result {
        result: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        grade: Option<f64>,
        /// Problem id to `[status, text]`.
        #[serde(default)]
        problems: BTreeMap<String, (String, String)>,
        #[serde(default)]
        tests: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        custom: serde_json::Map<String, serde_json::Value>,
        #[serde(default)]
        state: String,
        #[serde(default)]
        archive: Option<String>,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    /// Sandbox to host: start a nested student container.
    RunStudent {
        socket_id: String,
        #[serde(default)]
        environment: Option<String>,
        #[serde(default)]
        memory_limit: Option<u64>,
        #[serde(default)]
        time_limit: Option<u64>,
        #[serde(default)]
        hard_time_limit: Option<u64>,
        #[serde(default)]
        share_network: bool,
        #[serde(default)]
        ssh: bool,
        #[serde(default)]
        run_as_root: bool,
    },
    /// Host to sandbox: the student container exists.
    RunStudentStarted {
        socket_id: String,
        container_id: String,
    },
    /// Host to sandbox: the student container ended.
    RunStudentRetval { socket_id: String, retval: i32 },
    /// Sandbox to host: debugging key for an ssh session.
    SshKey { ssh_key: String },
}

impl SandboxMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Result { .. } => "result",
            Self::RunStudent { .. } => "run_student",
            Self::RunStudentStarted { .. } => "run_student_started",
            Self::RunStudentRetval { .. } => "run_student_retval",
            Self::SshKey { .. } => "ssh_key",
        }
    }
}

// ---------------------------------------------------------------------------
// Multiplexed stream
// ---------------------------------------------------------------------------

/// Build the 8-byte multiplex header.
pub fn encode_stream_header(stream: u8, len: u32) -> [u8; STREAM_HEADER_LEN] {
    let l = len.to_be_bytes();
    [stream, 0, 0, 0, l[0], l[1], l[2], l[3]]
}

/// Write one multiplexed chunk.
pub async fn write_stream_chunk<W>(writer: &mut W, stream: u8, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "chunk too large")
    })?;
    writer.write_all(&encode_stream_header(stream, len)).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Read one multiplexed chunk; `None` on a clean end of stream.
pub async fn read_stream_chunk<R>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; STREAM_HEADER_LEN];
    if !read_exact_or_eof(reader, &mut header).await? {
        return Ok(None);
    }
    let stream = header[0];
    if stream != STREAM_STDOUT && stream != STREAM_STDERR {
        return Err(GradeGridError::Protocol(format!(
            "unknown stream type {stream}"
        )));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some((stream, data)))
}

// ---------------------------------------------------------------------------
// Length-prefixed JSON messages
// ---------------------------------------------------------------------------

/// Encode a message as `u32 BE length` + JSON.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let len = u32::try_from(body.len())
        .map_err(|_| GradeGridError::Protocol("message too large".to_string()))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Write one length-prefixed message.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message; `None` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R, max_len: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf).await? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(GradeGridError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Incremental decoder for messages arriving in arbitrary chunks.
#[derive(Debug)]
pub struct MessageBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl MessageBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete message.
    ///
    /// A body that is not valid JSON for `T` is consumed and reported as an
    /// error; decoding can continue with the following message. An oversized
    /// length is unrecoverable.
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_len {
            return Err(GradeGridError::Protocol(format!(
                "message of {len} bytes exceeds limit of {}",
                self.max_len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf.drain(..4 + len).skip(4).collect();
        Ok(Some(serde_json::from_slice(&body)?))
    }
}

/// Fill `buf` completely; `false` if the stream ended before the first byte.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(GradeGridError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame",
            )));
        }
        filled += n;
    }
    Ok(true)
}
