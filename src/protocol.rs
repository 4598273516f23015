//! The worker wire protocol: a tagged-union message set framed with a
//! 4-byte big-endian length prefix. The tag name on the wire (`"type"`) is
//! the class identity the original transport preserved out of band.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::PUCTPlayerConfig;
use crate::error::ProtocolError;
use crate::sample::Sample;

/// Largest accepted frame body, guarding against a misbehaving peer sending
/// an unbounded length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Worker kind as declared during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    SelfPlay,
    Trainer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Ping,
    Pong,

    Hello,
    HelloResponse {
        kind: WorkerKind,
    },

    /// Coordinator asking a self-play worker to confirm it has the named
    /// generation's networks available.
    SelfPlayQuery {
        game: String,
        policy_gen: String,
        score_gen: String,
    },
    /// Worker's confirmation that it has those networks.
    SelfPlayResponse,

    /// Coordinator handing a self-play worker its full playing
    /// configuration for the current generation.
    ConfigureApproxTrainer {
        game: String,
        policy_generation: String,
        score_generation: String,
        temperature: f64,
        policy_puct_player_conf: PUCTPlayerConfig,
        score_puct_player_conf: PUCTPlayerConfig,
    },

    /// `message` is `"configured"` (self-play worker, after
    /// `ConfigureApproxTrainer`) or `"network_trained"` (trainer, after
    /// `TrainNNRequest`).
    Ok {
        message: String,
    },

    /// Coordinator → configured self-play worker: states it has already
    /// seen, so the worker knows what not to report as new.
    RequestSample {
        new_states: Vec<crate::sample::State>,
    },
    RequestSampleResponse {
        sample: Option<Sample>,
        duplicates_seen: usize,
    },

    TrainNNRequest {
        game: String,
        generation_prefix: String,
        store_path: String,
        current_step: u64,
        network_size: String,
        generation: String,
        validation_split: f64,
        batch_size: u32,
        epochs: u32,
    },
}

impl Message {
    /// The wire tag name, used only for error messages (`UnexpectedMessage`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Hello => "Hello",
            Message::HelloResponse { .. } => "HelloResponse",
            Message::SelfPlayQuery { .. } => "SelfPlayQuery",
            Message::SelfPlayResponse => "SelfPlayResponse",
            Message::ConfigureApproxTrainer { .. } => "ConfigureApproxTrainer",
            Message::Ok { .. } => "Ok",
            Message::RequestSample { .. } => "RequestSample",
            Message::RequestSampleResponse { .. } => "RequestSampleResponse",
            Message::TrainNNRequest { .. } => "TrainNNRequest",
        }
    }
}

/// Write one framed message: a 4-byte big-endian length prefix followed by
/// its JSON body.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(message)?;
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message, or `ProtocolError::ConnectionClosed` if the peer
/// closed the connection cleanly before a new frame began.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body)?;
    Ok(message)
}

/// Assert that `message` matches the expected variant, returning it back if
/// a closure confirms the match, or `UnexpectedMessage` otherwise. Used
/// during the handshake where exactly one message kind is valid next.
pub fn expect_kind(message: Message, expected: &'static str) -> Result<Message, ProtocolError> {
    if message.kind_name() == expected {
        Ok(message)
    } else {
        Err(ProtocolError::UnexpectedMessage {
            got: message.kind_name(),
            expected,
        })
    }
}
