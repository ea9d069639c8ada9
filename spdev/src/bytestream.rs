//! Line oriented I/O on top of any async byte stream.

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use spdev_protocol::scpi::TERMINATOR;

use crate::Error;

/// How long to wait for more bytes when emptying the input buffer.
const DRAIN_TIMEOUT: Duration = Duration::from_micros(100);

/// A bidirectional byte stream a session can run on, such as a serial port or
/// one end of an in-memory duplex pipe.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ByteStream for T {}

/// Read everything which is already buffered, without waiting for more.
pub async fn read_all<T: AsyncRead + Unpin>(stream: &mut T) -> crate::Result<Vec<u8>> {
    let mut ret = Vec::new();
    loop {
        let fut = AsyncReadExt::read_buf(stream, &mut ret);
        match timeout(DRAIN_TIMEOUT, fut).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(x)) => return Err(x.into()),
            Err(_) => break,
        }
    }
    Ok(ret)
}

pub async fn write_line<T: AsyncWrite + Unpin>(stream: &mut T, line: &str) -> crate::Result<()> {
    log::debug!("write: {:?}", line);
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(TERMINATOR);
    AsyncWriteExt::write_all(stream, &data).await?;
    AsyncWriteExt::flush(stream).await?;
    Ok(())
}

pub async fn read_line<T: AsyncRead + Unpin>(stream: &mut T, timeout_duration: Duration) -> crate::Result<String> {
    let data = read_to_term_timeout(stream, TERMINATOR, timeout_duration).await?;
    let ret = decode_line(data)?;
    log::debug!("read: {:?}", ret);
    Ok(ret)
}

/// Write `line` and wait for a single reply line. Bytes lingering from earlier
/// exchanges are discarded before writing.
pub async fn query_line<T: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut T,
    line: &str,
    timeout_duration: Duration,
) -> crate::Result<String> {
    let stale = read_all(stream).await?;
    if !stale.is_empty() {
        log::warn!("Discarding stale data: {:?}", String::from_utf8_lossy(&stale));
    }
    write_line(stream, line).await?;
    read_line(stream, timeout_duration).await
}

/// Split buffered data into lines, ignoring a trailing fragment without terminator.
pub fn split_lines(data: &[u8]) -> Vec<String> {
    let mut ret = Vec::new();
    let mut parts = data.split(|x| *x == TERMINATOR).peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if !part.is_empty() {
                log::debug!("Dropping incomplete line: {:?}", String::from_utf8_lossy(part));
            }
            break;
        }
        let line = String::from_utf8_lossy(part);
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            ret.push(line.to_string());
        }
    }
    ret
}

fn decode_line(mut data: Vec<u8>) -> crate::Result<String> {
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    String::from_utf8(data).map_err(|x| Error::protocol(anyhow!("Reply is not valid UTF-8: {}", x)))
}

async fn read_to_term_timeout<T: AsyncRead + Unpin>(
    stream: &mut T,
    term: u8,
    timeout_duration: Duration,
) -> crate::Result<Vec<u8>> {
    let fut = read_to_term(stream, term);
    match timeout(timeout_duration, fut).await {
        Ok(x) => x,
        Err(_) => Err(Error::protocol_timeout()),
    }
}

async fn read_to_term<T: AsyncRead + Unpin>(stream: &mut T, term: u8) -> crate::Result<Vec<u8>> {
    let mut ret = Vec::new();
    loop {
        let x = AsyncReadExt::read_u8(stream).await?;
        if x == term {
            break;
        }
        ret.push(x);
    }
    Ok(ret)
}
