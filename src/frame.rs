use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;
use crate::MAX_MESSAGE_SIZE;

/// Discriminator for a control frame carrying a serialized `Message`.
pub const MESSAGE_FRAME: u8 = 0x01;
/// Discriminator announcing that the bytes that follow on this
/// connection are a bulk payload, not frames.
pub const STREAM_FRAME: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: bool,
    pub payload: Vec<u8>,
}

/// Decodes a single frame from `r`.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly
/// between frames. A stream marker is returned as-is with nothing
/// further consumed: the caller owns the bulk bytes that follow.
pub async fn decode<R>(r: &mut R) -> Result<Option<Frame>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut discriminator = [0u8; 1];
    if r.read(&mut discriminator).await? == 0 {
        return Ok(None);
    }

    match discriminator[0] {
        STREAM_FRAME => Ok(Some(Frame {
            stream: true,
            payload: Vec::new(),
        })),
        MESSAGE_FRAME => {
            let len = r.read_u32().await? as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(Error::Decode(format!(
                    "control frame of {} bytes exceeds the {} byte cap",
                    len, MAX_MESSAGE_SIZE
                )));
            }
            let mut payload = vec![0u8; len];
            r.read_exact(&mut payload).await?;
            Ok(Some(Frame {
                stream: false,
                payload,
            }))
        }
        other => Err(Error::Decode(format!(
            "unknown frame discriminator {:#04x}",
            other
        ))),
    }
}

/// Wraps a serialized message into a control frame: discriminator,
/// big-endian length, payload.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Decode(format!(
            "message of {} bytes exceeds the {} byte cap",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(1 + 4 + payload.len());
    frame.push(MESSAGE_FRAME);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}
