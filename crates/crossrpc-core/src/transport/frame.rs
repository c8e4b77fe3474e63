//! Length-prefixed framing for stream transports.
//!
//! ```text
//! [u32 BE: len][UTF-8 envelope bytes of len]
//! ```

use crate::config::TransportConfig;
use crate::{Result, RpcError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame. Returns `None` on clean EOF (peer closed the stream).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::Transport {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| RpcError::Transport {
            message: "invalid UTF-8 in frame".to_string(),
        })
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &str) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::Transport {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
