/* Relay Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::net::SocketAddr;

use anyhow::{anyhow, bail, Context, Result};
use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, Method, Uri, Version,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::utils::RelayError;

use super::{
    flow::{BodyBuffer, RequestParts},
    relay::Relay,
    response::ProxyResponse,
};

const MAX_HEADER_LINES: usize = 128;

/// Serves one HTTP/1.x request on a client connection, then closes it.
///
/// The request is fully buffered (bodies are small relayed form submissions), handed to
/// the relay, and the response is written with an exact `Content-Length`.
pub async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, relay: Relay) -> Result<()> {
    let parsed = {
        let mut reader = BufReader::new(&mut socket);
        if reader.fill_buf().await?.is_empty() {
            tracing::debug!(%peer, "client closed without sending a request");
            return Ok(());
        }
        parse_http_request(&mut reader, relay.max_body_bytes()).await
    };

    let (response, version) = match parsed {
        Ok(request) => {
            tracing::debug!(%peer, method = %request.method, uri = %request.uri, "parsed HTTP/1.1 request");
            let version = request.version;
            (relay.handle(request).await, version)
        }
        Err(err) => match err.downcast::<RelayError>() {
            Ok(relay_err) => (ProxyResponse::from_error(&relay_err), Version::HTTP_11),
            Err(err) => {
                tracing::debug!(%peer, error = %err, "malformed request");
                (ProxyResponse::malformed_request(&err.to_string()), Version::HTTP_11)
            }
        },
    };

    send_response_to_client(&mut socket, &response, version).await?;
    tracing::debug!(%peer, status = %response.status, "response delivered to client");
    Ok(())
}

/// Reads the request line, headers and body. An oversized body surfaces as
/// [`RelayError::PayloadTooLarge`] inside the anyhow error so the caller can answer 413.
pub async fn parse_http_request<R>(reader: &mut BufReader<R>, max_body: usize) -> Result<RequestParts>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();

    // "GET /relay?url=… HTTP/1.1"
    if reader.read_line(&mut line).await? == 0 {
        bail!("connection closed before request line");
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        bail!("malformed HTTP request line");
    }

    let method = parts[0].parse::<Method>()?;
    let uri = parts[1].parse::<Uri>()?;
    let version = match parts[2] {
        "HTTP/1.0" => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::new();
    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                headers.append(name, value);
            }
        }
    }

    let mut body = BodyBuffer::default();
    if has_chunked_encoding(&headers) {
        read_chunked_body(reader, &mut body, max_body).await?;
    } else if let Some(len) = content_length(&headers)? {
        if len > max_body {
            return Err(RelayError::PayloadTooLarge { limit: max_body }.into());
        }
        read_fixed_body(reader, len, &mut body).await?;
    }

    Ok(RequestParts {
        method,
        uri,
        version,
        headers,
        body,
    })
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(None);
    };
    let len = value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .ok_or_else(|| anyhow!("invalid Content-Length header"))?;
    Ok(Some(len))
}

fn has_chunked_encoding(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("chunked"))
}

async fn read_fixed_body<R>(reader: &mut BufReader<R>, len: usize, body: &mut BodyBuffer) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| format!("expected {len} body bytes, hit EOF"))?;
    body.push_bytes(&buf);
    Ok(())
}

/// Decodes a chunked request body, enforcing `max_body` across all chunks.
async fn read_chunked_body<R>(reader: &mut BufReader<R>, body: &mut BodyBuffer, max_body: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut size_line = String::new();
        if reader
            .read_line(&mut size_line)
            .await
            .context("failed to read chunk size line")?
            == 0
        {
            bail!("unexpected EOF while reading chunk size");
        }

        let size_str = size_line.trim_end_matches(['\r', '\n']);
        let size_token = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = usize::from_str_radix(size_token, 16)
            .with_context(|| format!("invalid chunk size: {size_token}"))?;

        if size == 0 {
            // Trailer section, discarded.
            loop {
                let mut trailer = String::new();
                let read = reader.read_line(&mut trailer).await?;
                if read == 0 || trailer.trim().is_empty() {
                    break;
                }
            }
            return Ok(());
        }

        if body.len().saturating_add(size) > max_body {
            return Err(RelayError::PayloadTooLarge { limit: max_body }.into());
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .await
            .with_context(|| format!("expected {size} chunk bytes, hit EOF"))?;
        body.push_bytes(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .context("failed to read chunk terminator")?;
        if crlf != *b"\r\n" {
            bail!("chunk missing CRLF terminator");
        }
    }
}

/// Writes the response head and body. Binary bodies go out as raw bytes; framing headers
/// are always recomputed here.
pub async fn send_response_to_client<W>(client: &mut W, response: &ProxyResponse, version: Version) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = response.body_bytes()?;

    let reason = response.status.canonical_reason().unwrap_or("");
    let status_line = format!(
        "{} {} {}\r\n",
        match version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        },
        response.status.as_u16(),
        reason
    );

    let mut head = status_line.into_bytes();
    for (name, value) in response.headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    head.extend_from_slice(b"connection: close\r\n\r\n");

    client.write_all(&head).await?;
    if !body.is_empty() {
        client.write_all(&body).await?;
    }
    client.flush().await?;
    Ok(())
}
