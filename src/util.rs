use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use crate::parse::BodyFraming;

pub(crate) mod prebuffered;

/// Bidirectionally forward data between the external connection and a
/// tunnel socket.
///
/// Each direction shuts down the opposite writer when it finishes, so
/// end-of-stream or an error on either side tears the other down instead of
/// leaving a half-open pair. Returns the byte counts copied
/// (external-to-tunnel, tunnel-to-external).
pub(crate) async fn forward_bidi(
    external_recv: &mut (impl AsyncRead + Send + Unpin),
    external_send: &mut (impl AsyncWrite + Send + Unpin),
    tunnel_recv: &mut (impl AsyncRead + Send + Unpin),
    tunnel_send: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<(u64, u64)> {
    let start = Instant::now();
    let (to_tunnel, to_external) = tokio::join!(
        async {
            let res = tokio::io::copy(external_recv, tunnel_send).await;
            tunnel_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "external-to-tunnel finished");
            res
        },
        async {
            let res = tokio::io::copy(tunnel_recv, external_send).await;
            external_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "tunnel-to-external finished");
            res
        }
    );
    Ok((to_tunnel?, to_external?))
}

/// Copies one HTTP message body, delimited by `framing`, from `reader` to
/// `writer`.
///
/// Tunnel sockets outlive the HTTP exchange, so the copy must stop where the
/// message framing says the body ends, not at end-of-stream. Chunked bodies
/// are forwarded verbatim, chunk headers and trailers included. Returns the
/// number of bytes written.
pub(crate) async fn copy_framed_body(
    framing: BodyFraming,
    reader: &mut (impl AsyncRead + Send + Unpin),
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<u64> {
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(len) => tokio::io::copy(&mut reader.take(len), writer).await,
        BodyFraming::Chunked => copy_chunked(reader, writer).await,
        BodyFraming::UntilClose => tokio::io::copy(reader, writer).await,
    }
}

/// Forwards a chunked transfer coding verbatim through to the terminal
/// chunk and trailer section.
async fn copy_chunked(
    reader: &mut (impl AsyncRead + Send + Unpin),
    writer: &mut (impl AsyncWrite + Send + Unpin),
) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let line = read_crlf_line(reader).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        // Chunk data plus its trailing CRLF.
        let len = size
            .checked_add(2)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "chunk size overflow"))?;
        let copied = tokio::io::copy(&mut (&mut *reader).take(len), writer).await?;
        if copied != len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        total += copied;
    }
    // Trailer section, through the terminating empty line.
    loop {
        let line = read_crlf_line(reader).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }
    Ok(total)
}

/// Reads a single line including its terminating `\n`. Byte-at-a-time: only
/// used for chunk-size and trailer lines, which are tiny.
async fn read_crlf_line(reader: &mut (impl AsyncRead + Unpin)) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() > 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk line too long",
            ));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size line"))?;
    let size = text
        .trim_end()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forward_bidi_copies_both_directions() {
        let (external, mut external_peer) = tokio::io::duplex(64);
        let (tunnel, mut tunnel_peer) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move {
            let (mut ext_recv, mut ext_send) = tokio::io::split(external);
            let (mut tun_recv, mut tun_send) = tokio::io::split(tunnel);
            forward_bidi(&mut ext_recv, &mut ext_send, &mut tun_recv, &mut tun_send).await
        });

        external_peer.write_all(b"request").await.unwrap();
        external_peer.shutdown().await.unwrap();

        let mut seen = [0u8; 7];
        tunnel_peer.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"request");

        tunnel_peer.write_all(b"response").await.unwrap();
        tunnel_peer.shutdown().await.unwrap();

        let mut out = Vec::new();
        external_peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"response");

        let (to_tunnel, to_external) = relay.await.unwrap().unwrap();
        assert_eq!(to_tunnel, 7);
        assert_eq!(to_external, 8);
    }

    #[tokio::test]
    async fn peer_close_tears_down_other_side() {
        let (external, external_peer) = tokio::io::duplex(64);
        let (tunnel, mut tunnel_peer) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move {
            let (mut ext_recv, mut ext_send) = tokio::io::split(external);
            let (mut tun_recv, mut tun_send) = tokio::io::split(tunnel);
            forward_bidi(&mut ext_recv, &mut ext_send, &mut tun_recv, &mut tun_send).await
        });

        // Dropping the external peer ends both copies; the tunnel peer sees
        // EOF rather than a dangling half-open stream.
        drop(external_peer);
        let mut out = Vec::new();
        tunnel_peer.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        drop(tunnel_peer);
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn framed_copy_stops_at_content_length() {
        let mut reader = std::io::Cursor::new(b"helloNEXT".to_vec());
        let mut out = Vec::new();
        let n = copy_framed_body(BodyFraming::Length(5), &mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");

        // The reader is left positioned right after the body.
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn framed_copy_forwards_chunked_coding_verbatim() {
        let raw: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nEXTRA";
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let mut out = Vec::new();
        copy_framed_body(BodyFraming::Chunked, &mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec());

        // The terminal chunk ends the copy; later bytes are untouched.
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"EXTRA");
    }

    #[tokio::test]
    async fn chunked_copy_forwards_extensions_and_trailers() {
        let raw: &[u8] = b"3;ext=1\r\nabc\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut reader = std::io::Cursor::new(raw.to_vec());
        let mut out = Vec::new();
        copy_framed_body(BodyFraming::Chunked, &mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, raw.to_vec());
    }

    #[tokio::test]
    async fn truncated_chunk_is_an_error() {
        let mut reader = std::io::Cursor::new(b"a\r\nonly4".to_vec());
        let mut out = Vec::new();
        let err = copy_framed_body(BodyFraming::Chunked, &mut reader, &mut out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn framed_copy_none_writes_nothing() {
        let mut reader = std::io::Cursor::new(b"unread".to_vec());
        let mut out = Vec::new();
        let n = copy_framed_body(BodyFraming::None, &mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }
}
