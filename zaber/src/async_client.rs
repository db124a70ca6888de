use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::{Instruction, Request};
use crate::reply::{LineKind, ParseError, Reply};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("malformed reply: {0}")]
    Parse(#[from] ParseError),
    #[error("device {device} rejected the command: {reason}")]
    Rejected { device: u8, reason: String },
}

/// Writes `request` and waits for the matching reply. Alerts, info lines and
/// replies addressed to other devices on the chain are skipped.
pub async fn exchange<S>(stream: &mut S, request: &Request) -> Result<Reply, ExchangeError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream.write_all(request.encode().as_bytes()).await?;
    stream.flush().await?;

    loop {
        let line = read_line(stream).await?;
        if LineKind::of(&line) != LineKind::Reply {
            continue;
        }
        let reply = Reply::parse(&line)?;
        if reply.device != request.device || (request.axis != 0 && reply.axis != request.axis) {
            continue;
        }
        if !reply.accepted {
            return Err(ExchangeError::Rejected {
                device: reply.device,
                reason: reply.data,
            });
        }
        return Ok(reply);
    }
}

/// Broadcasts an empty command and collects every reply that arrives before
/// the line stays quiet for `settle`.
pub async fn detect<S>(stream: &mut S, settle: Duration) -> Result<Vec<Reply>, ExchangeError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream
        .write_all(Request::broadcast(Instruction::Status).encode().as_bytes())
        .await?;
    stream.flush().await?;

    let mut replies = Vec::new();
    while let Ok(line) = tokio::time::timeout(settle, read_line(stream)).await {
        let line = line?;
        if LineKind::of(&line) == LineKind::Reply {
            let reply = Reply::parse(&line)?;
            if !replies.iter().any(|r: &Reply| r.device == reply.device) {
                replies.push(reply);
            }
        }
    }
    replies.sort_by_key(|r| r.device);
    Ok(replies)
}

async fn read_line<S>(stream: &mut S) -> Result<String, ExchangeError>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(ExchangeError::Closed);
    }
    Ok(line)
}

/// One axis of a device on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZaberDevice {
    pub device: u8,
    pub axis: u8,
}

impl ZaberDevice {
    pub fn new(device: u8, axis: u8) -> Self {
        ZaberDevice { device, axis }
    }

    async fn send(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
        instruction: Instruction,
    ) -> Result<Reply, ExchangeError> {
        exchange(stream, &Request::new(self.device, self.axis, instruction)).await
    }

    pub async fn status(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
    ) -> Result<Reply, ExchangeError> {
        self.send(stream, Instruction::Status).await
    }

    /// Position in microsteps together with the busy flag and warnings.
    pub async fn position(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
    ) -> Result<(i64, Reply), ExchangeError> {
        let reply = self.send(stream, Instruction::GetPosition).await?;
        let steps = reply.data_as_i64()?;
        Ok((steps, reply))
    }

    pub async fn move_absolute(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
        steps: i64,
    ) -> Result<Reply, ExchangeError> {
        self.send(stream, Instruction::MoveAbsolute(steps)).await
    }

    pub async fn home(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
    ) -> Result<Reply, ExchangeError> {
        self.send(stream, Instruction::Home).await
    }

    pub async fn stop(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
    ) -> Result<Reply, ExchangeError> {
        self.send(stream, Instruction::Stop).await
    }

    pub async fn set_max_speed(
        &self,
        stream: &mut (impl AsyncBufRead + AsyncWrite + Unpin),
        speed: u64,
    ) -> Result<Reply, ExchangeError> {
        self.send(stream, Instruction::SetMaxSpeed(speed)).await
    }
}
