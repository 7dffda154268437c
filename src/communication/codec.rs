use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CommunicationError;

use super::message::Message;

/// Upper bound on a single frame payload.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
const LENGTH_PREFIX_BYTES: usize = 4;

/// Reads one length-prefixed JSON frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
///
/// # Errors
///
/// Returns an error on I/O failure, when the stream ends part way through a
/// frame, when the frame exceeds [`MAX_MESSAGE_BYTES`], or when the payload
/// does not decode.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, CommunicationError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let first = reader
        .read(&mut prefix)
        .await
        .map_err(|err| CommunicationError::Io {
            context: "read frame length",
            source: err,
        })?;
    if first == 0 {
        return Ok(None);
    }
    if let Some(rest) = prefix.get_mut(first..) {
        read_exact_or_truncated(reader, rest).await?;
    }

    let length = usize::try_from(u32::from_be_bytes(prefix)).unwrap_or(usize::MAX);
    if length > MAX_MESSAGE_BYTES {
        return Err(CommunicationError::WireMessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }

    let mut payload = vec![0u8; length];
    read_exact_or_truncated(reader, &mut payload).await?;
    serde_json::from_slice::<Message>(&payload)
        .map(Some)
        .map_err(|err| CommunicationError::Deserialize {
            context: "wire message",
            source: err,
        })
}

/// Writes one length-prefixed JSON frame and flushes.
///
/// # Errors
///
/// Returns an error when the message cannot be encoded, is too large, or the
/// write fails.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), CommunicationError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = serde_json::to_vec(message).map_err(|err| CommunicationError::Serialize {
        context: "wire message",
        source: err,
    })?;
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(CommunicationError::WireMessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_err| {
        CommunicationError::WireMessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        }
    })?;

    writer
        .write_all(&length.to_be_bytes())
        .await
        .map_err(|err| CommunicationError::Io {
            context: "send frame length",
            source: err,
        })?;
    writer
        .write_all(&payload)
        .await
        .map_err(|err| CommunicationError::Io {
            context: "send frame payload",
            source: err,
        })?;
    writer.flush().await.map_err(|err| CommunicationError::Io {
        context: "flush frame",
        source: err,
    })
}

async fn read_exact_or_truncated<R>(reader: &mut R, buffer: &mut [u8]) -> Result<(), CommunicationError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buffer).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(CommunicationError::TruncatedFrame)
        }
        Err(err) => Err(CommunicationError::Io {
            context: "read frame",
            source: err,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::message::StartMessage;
    use crate::error::{AppError, AppResult};
    use crate::test_support::run_async_test;

    #[test]
    fn frames_preserve_order_and_end_cleanly() -> AppResult<()> {
        run_async_test(async {
            let (mut client, mut server) = tokio::io::duplex(1024);
            write_message(&mut client, &Message::Reset).await?;
            write_message(
                &mut client,
                &Message::Start(StartMessage {
                    script: Some("load.sh".into()),
                }),
            )
            .await?;
            drop(client);

            let first = read_message(&mut server).await?;
            if first != Some(Message::Reset) {
                return Err(AppError::validation(format!("Unexpected first frame {:?}", first)));
            }
            let second = read_message(&mut server).await?;
            if !matches!(second, Some(Message::Start(_))) {
                return Err(AppError::validation(format!("Unexpected second frame {:?}", second)));
            }
            if read_message(&mut server).await?.is_some() {
                return Err(AppError::validation("Expected clean end of stream"));
            }
            Ok(())
        })
    }

    #[test]
    fn truncated_frame_is_an_error() -> AppResult<()> {
        run_async_test(async {
            let (mut client, mut server) = tokio::io::duplex(1024);
            client
                .write_all(&[0, 0, 0, 10, b'{'])
                .await
                .map_err(|err| AppError::validation(format!("write failed: {}", err)))?;
            drop(client);
            match read_message(&mut server).await {
                Err(CommunicationError::TruncatedFrame) => Ok(()),
                other => Err(AppError::validation(format!("Expected truncation, got {:?}", other))),
            }
        })
    }

    #[test]
    fn oversized_frame_is_rejected() -> AppResult<()> {
        run_async_test(async {
            let (mut client, mut server) = tokio::io::duplex(1024);
            client
                .write_all(&u32::MAX.to_be_bytes())
                .await
                .map_err(|err| AppError::validation(format!("write failed: {}", err)))?;
            match read_message(&mut server).await {
                Err(CommunicationError::WireMessageTooLarge { .. }) => Ok(()),
                other => Err(AppError::validation(format!("Expected size error, got {:?}", other))),
            }
        })
    }
}
