//! Newline-delimited JSON over a byte stream
//!
//! One command per input line, one reply per output line. Blank lines are
//! skipped; every other line gets exactly one reply, errors included. Lines
//! are read as raw bytes, so input that is not UTF-8 is just a bad payload.

use ear_core::domain::Server;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Serve commands until `reader` hits EOF, returning how many were handled
#[instrument(skip_all)]
pub async fn serve<R, W>(server: &Server, mut reader: R, mut writer: W) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    let mut handled = 0;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let reply = server.handle_bytes(&line);
        let request = String::from_utf8_lossy(&line);
        debug!(request = %request.trim(), reply = %reply, "Command handled");

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        handled += 1;
    }

    Ok(handled)
}
