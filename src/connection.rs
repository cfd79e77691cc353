use crate::error::ConnectionError;
use crate::utils::{preview, trim_line_end};

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Ligne la plus longue acceptée, terminateur compris (RFC 5321, 4.5.3.1.6).
pub const MAX_LINE_LENGTH: usize = 1000;

const PREVIEW_LENGTH: usize = 120;

/// Transport SMTP orienté lignes, commun aux flux en clair et passés en TLS.
#[async_trait]
pub trait Connection: Send {
    /// Lit une ligne, sans son terminateur, en moins de `limit`.
    async fn read_line(&mut self, limit: Duration) -> Result<String, ConnectionError>;

    /// Lit une ligne et la découpe en verbe et arguments.
    async fn read_command(&mut self, limit: Duration) -> Result<(String, String), ConnectionError> {
        let line = self.read_line(limit).await?;
        Ok(split_command(&line))
    }

    /// Attend n'importe quelle entrée. `None` : rien n'est arrivé à temps.
    async fn wait_for_input(&mut self, limit: Duration) -> Result<Option<String>, ConnectionError>;

    async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError>;

    /// Écrit une réponse, avec `-` comme séparateur sauf sur la dernière ligne.
    async fn reply(&mut self, code: u16, lines: &[&str]) -> Result<(), ConnectionError>;

    /// Lit un corps de message terminé par un point, en retirant les points doublés.
    async fn read_dot_body(&mut self, limit: Duration, max_size: usize) -> Result<Vec<u8>, ConnectionError>;

    async fn start_tls(&mut self, acceptor: &TlsAcceptor) -> Result<(), ConnectionError>;

    /// Lit et jette tout jusqu'à ce que le client parte ou reste muet pendant
    /// `idle`. Renvoie le nombre d'octets avalés et le temps passé.
    async fn tarpit_drain(&mut self, idle: Duration) -> (usize, Duration);

    async fn close(&mut self);

    fn remote_addr(&self) -> SocketAddr;

    fn is_tls(&self) -> bool;
}

/// Coupe une ligne de commande sur son premier espace.
pub fn split_command(line: &str) -> (String, String) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_string(), rest.to_string()),
        None => (line.to_string(), String::new()),
    }
}

enum Stream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> AsyncRead for Stream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for Stream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// [`Connection`] sur n'importe quel flux d'octets, passé en TLS sur place.
pub struct NetConnection<S> {
    reader: Option<BufReader<Stream<S>>>,
    peer: SocketAddr,
    write_timeout: Duration,
}

impl<S> NetConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: SocketAddr, write_timeout: Duration) -> Self {
        Self {
            reader: Some(BufReader::new(Stream::Plain(stream))),
            peer,
            write_timeout,
        }
    }

    fn reader(&mut self) -> Result<&mut BufReader<Stream<S>>, ConnectionError> {
        self.reader.as_mut().ok_or(ConnectionError::Closed)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let deadline = self.write_timeout;
        let stream = self.reader()?.get_mut();
        timeout(deadline, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }
}

/// Lit jusqu'au prochain LF inclus, en échouant dès que `limit` octets
/// ont été lus sans en trouver.
async fn read_limited<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Err(ConnectionError::Closed);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    line.extend_from_slice(&available[..=end]);
                    (true, end + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if line.len() > limit {
            return Err(ConnectionError::LineTooLong(limit));
        }
        if found {
            trim_line_end(&mut line);
            return Ok(line);
        }
    }
}

/// Lit jusqu'au prochain LF inclus sans jamais garder plus de `keep` octets.
/// Le booléen indique que la ligne a été tronquée.
async fn read_capped<R>(reader: &mut R, keep: usize) -> Result<(Vec<u8>, bool), ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut truncated = false;
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Err(ConnectionError::Closed);
            }
            let (found, used) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (true, end + 1),
                None => (false, available.len()),
            };
            let room = keep.saturating_sub(line.len());
            if used > room {
                truncated = true;
            }
            line.extend_from_slice(&available[..used.min(room)]);
            (found, used)
        };
        reader.consume(used);

        if found {
            if !truncated {
                trim_line_end(&mut line);
            }
            return Ok((line, truncated));
        }
    }
}

async fn read_dot_lines<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    // Une ligne doublée peut porter un point de plus et son CRLF.
    let line_limit = max_size.saturating_add(3);
    let mut body = Vec::new();
    let mut overflow = false;

    loop {
        let (line, truncated) = read_capped(reader, line_limit).await?;
        if !truncated && line == b"." {
            break;
        }
        if overflow {
            continue;
        }
        if truncated {
            overflow = true;
            body = Vec::new();
            continue;
        }
        let content = line.strip_prefix(b".").unwrap_or(&line);
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
        if body.len() > max_size {
            // On lit quand même jusqu'au point final pour rester synchronisé.
            overflow = true;
            body = Vec::new();
        }
    }

    if overflow {
        return Err(ConnectionError::BodyTooLarge(max_size));
    }
    Ok(body)
}

#[async_trait]
impl<S> Connection for NetConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_line(&mut self, limit: Duration) -> Result<String, ConnectionError> {
        let reader = self.reader()?;
        let line = timeout(limit, read_limited(reader, MAX_LINE_LENGTH))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    async fn wait_for_input(&mut self, limit: Duration) -> Result<Option<String>, ConnectionError> {
        let reader = self.reader()?;
        match timeout(limit, reader.fill_buf()).await {
            Err(_) => Ok(None),
            Ok(Ok(available)) if available.is_empty() => Err(ConnectionError::Closed),
            Ok(Ok(available)) => Ok(Some(preview(available, PREVIEW_LENGTH))),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut buffer = Vec::with_capacity(line.len() + 2);
        buffer.extend_from_slice(line.as_bytes());
        buffer.extend_from_slice(b"\r\n");
        self.send(&buffer).await
    }

    async fn reply(&mut self, code: u16, lines: &[&str]) -> Result<(), ConnectionError> {
        let lines = if lines.is_empty() { &[""][..] } else { lines };
        let mut buffer = String::new();
        for (i, text) in lines.iter().enumerate() {
            let sep = if i + 1 < lines.len() { '-' } else { ' ' };
            buffer.push_str(&format!("{:03}{}{}\r\n", code, sep, text));
        }
        self.send(buffer.as_bytes()).await
    }

    async fn read_dot_body(&mut self, limit: Duration, max_size: usize) -> Result<Vec<u8>, ConnectionError> {
        let reader = self.reader()?;
        timeout(limit, read_dot_lines(reader, max_size))
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    async fn start_tls(&mut self, acceptor: &TlsAcceptor) -> Result<(), ConnectionError> {
        if self.is_tls() {
            return Err(ConnectionError::AlreadyTls);
        }
        let reader = self.reader.take().ok_or(ConnectionError::Closed)?;
        let buffered = reader.buffer().len();
        if buffered > 0 {
            debug!(bytes = buffered, "discarding plaintext sent ahead of the TLS handshake");
        }
        let plain = match reader.into_inner() {
            Stream::Plain(stream) => stream,
            Stream::Tls(_) => return Err(ConnectionError::AlreadyTls),
        };

        let tls = timeout(self.write_timeout, acceptor.accept(plain))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        self.reader = Some(BufReader::new(Stream::Tls(Box::new(tls))));
        Ok(())
    }

    async fn tarpit_drain(&mut self, idle: Duration) -> (usize, Duration) {
        let start = Instant::now();
        let mut total = 0;
        if let Some(reader) = self.reader.as_mut() {
            loop {
                let n = match timeout(idle, reader.fill_buf()).await {
                    Ok(Ok(available)) => available.len(),
                    _ => 0,
                };
                if n == 0 {
                    break;
                }
                reader.consume(n);
                total += n;
            }
        }
        (total, start.elapsed())
    }

    async fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            let _ = timeout(self.write_timeout, reader.get_mut().shutdown()).await;
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn is_tls(&self) -> bool {
        matches!(self.reader.as_ref().map(BufReader::get_ref), Some(Stream::Tls(_)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_rustls::rustls;
    use tokio_rustls::TlsConnector;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn pair() -> (NetConnection<DuplexStream>, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let peer = "192.0.2.1:4567".parse().unwrap();
        (NetConnection::new(server, peer, secs(5)), client)
    }

    #[tokio::test]
    async fn reply_uses_continuation_separators() {
        let (mut conn, mut client) = pair();
        conn.reply(25, &["Ok"]).await.unwrap();
        conn.reply(100, &["Yes", "No", "Maybe"]).await.unwrap();

        let expected = "025 Ok\r\n100-Yes\r\n100-No\r\n100 Maybe\r\n";
        let mut buf = vec![0; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    #[tokio::test]
    async fn read_command_splits_on_first_space() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"HELO localhost\r\nHELO\r\nMAIL FROM:<a@b.tld> BODY=8BITMIME\n")
            .await
            .unwrap();

        assert_eq!(
            conn.read_command(secs(5)).await.unwrap(),
            ("HELO".to_string(), "localhost".to_string())
        );
        assert_eq!(conn.read_command(secs(5)).await.unwrap(), ("HELO".to_string(), String::new()));
        assert_eq!(
            conn.read_command(secs(5)).await.unwrap(),
            ("MAIL".to_string(), "FROM:<a@b.tld> BODY=8BITMIME".to_string())
        );
    }

    #[tokio::test]
    async fn read_command_reports_peer_close() {
        let (mut conn, client) = pair();
        drop(client);
        assert!(matches!(conn.read_command(secs(5)).await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn read_command_times_out() {
        let (mut conn, _client) = pair();
        let result = conn.read_command(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
    }

    #[tokio::test]
    async fn overlong_lines_are_an_error() {
        let (mut conn, mut client) = pair();
        let line = format!("HELO {}\r\n", "a".repeat(1024));
        client.write_all(line.as_bytes()).await.unwrap();

        let result = conn.read_command(secs(5)).await;
        assert!(matches!(result, Err(ConnectionError::LineTooLong(MAX_LINE_LENGTH))));
    }

    #[tokio::test]
    async fn line_at_the_ceiling_is_accepted() {
        let (mut conn, mut client) = pair();
        let line = format!("HELO {}\r\n", "a".repeat(MAX_LINE_LENGTH - 7));
        assert_eq!(line.len(), MAX_LINE_LENGTH);
        client.write_all(line.as_bytes()).await.unwrap();

        let (verb, args) = conn.read_command(secs(5)).await.unwrap();
        assert_eq!(verb, "HELO");
        assert_eq!(args.len(), MAX_LINE_LENGTH - 7);
    }

    #[tokio::test]
    async fn dot_body_is_unstuffed() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"Hello\r\n..leading dot\r\n.\r\nNOOP\r\n")
            .await
            .unwrap();

        let body = conn.read_dot_body(secs(5), 1024).await.unwrap();
        assert_eq!(body, b"Hello\r\n.leading dot\r\n");
        assert_eq!(conn.read_command(secs(5)).await.unwrap().0, "NOOP");
    }

    #[tokio::test]
    async fn oversized_body_is_consumed_then_rejected() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"0123456789abc\r\nmore\r\n.\r\nNOOP\r\n")
            .await
            .unwrap();

        let result = conn.read_dot_body(secs(5), 10).await;
        assert!(matches!(result, Err(ConnectionError::BodyTooLarge(10))));
        assert_eq!(conn.read_command(secs(5)).await.unwrap().0, "NOOP");
    }

    #[tokio::test]
    async fn single_overlong_body_line_is_drained() {
        let (mut conn, mut client) = pair();
        let body = format!("{}\r\n.\r\nNOOP\r\n", "x".repeat(2000));
        client.write_all(body.as_bytes()).await.unwrap();

        let result = conn.read_dot_body(secs(5), 10).await;
        assert!(matches!(result, Err(ConnectionError::BodyTooLarge(10))));
        assert_eq!(conn.read_command(secs(5)).await.unwrap().0, "NOOP");
    }

    #[tokio::test]
    async fn unterminated_body_fails_on_close() {
        let (mut conn, mut client) = pair();
        client.write_all(b"Hello\r\n").await.unwrap();
        drop(client);
        let result = conn.read_dot_body(secs(5), 1024).await;
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn wait_for_input_leaves_data_in_place() {
        let (mut conn, mut client) = pair();
        let waited = conn.wait_for_input(Duration::from_millis(20)).await.unwrap();
        assert_eq!(waited, None);

        client.write_all(b"EHLO early\r\n").await.unwrap();
        let waited = conn.wait_for_input(secs(5)).await.unwrap();
        assert_eq!(waited.as_deref(), Some("EHLO early\\r\\n"));
        assert_eq!(conn.read_command(secs(5)).await.unwrap().0, "EHLO");
    }

    #[tokio::test]
    async fn tarpit_swallows_everything_until_eof() {
        let (mut conn, mut client) = pair();
        client.write_all(b"FOO\r\nrest").await.unwrap();
        assert_eq!(conn.read_command(secs(5)).await.unwrap().0, "FOO");

        for _ in 0..1024 {
            client.write_all(b"line\r\n").await.unwrap();
        }
        drop(client);

        let (bytes, _) = conn.tarpit_drain(secs(5)).await;
        assert_eq!(bytes, 4 + 6 * 1024);
    }

    #[tokio::test]
    async fn tarpit_gives_up_after_idle_period() {
        let (mut conn, _client) = pair();
        let (bytes, elapsed) = conn.tarpit_drain(Duration::from_millis(20)).await;
        assert_eq!(bytes, 0);
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut conn, mut client) = pair();
        conn.close().await;
        conn.close().await;

        assert!(matches!(conn.read_line(secs(1)).await, Err(ConnectionError::Closed)));
        assert!(matches!(conn.reply(250, &["Ok"]).await, Err(ConnectionError::Closed)));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    /// Accepteur et connecteur qui fait confiance à son certificat `localhost` auto-signé.
    pub(crate) fn tls_pair() -> (TlsAcceptor, TlsConnector) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = cert.serialize_der().unwrap();
        let key = cert.serialize_private_key_der();

        let server = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![rustls::Certificate(der.clone())], rustls::PrivateKey(key))
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(&rustls::Certificate(der)).unwrap();
        let client = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (TlsAcceptor::from(Arc::new(server)), TlsConnector::from(Arc::new(client)))
    }

    #[tokio::test]
    async fn start_tls_drops_plaintext_sent_ahead() {
        let (mut conn, client) = pair();
        let (acceptor, connector) = tls_pair();

        let server = tokio::spawn(async move {
            let (verb, _) = conn.read_command(secs(5)).await.unwrap();
            assert_eq!(verb, "STARTTLS");
            conn.reply(220, &["Ready to start TLS"]).await.unwrap();
            conn.start_tls(&acceptor).await.unwrap();
            assert!(conn.is_tls());

            let (verb, args) = conn.read_command(secs(5)).await.unwrap();
            conn.reply(250, &[&format!("{} {}", verb, args)]).await.unwrap();

            let again = conn.start_tls(&acceptor).await;
            assert!(matches!(again, Err(ConnectionError::AlreadyTls)));
            assert!(conn.is_tls());
        });

        let mut client = tokio::io::BufReader::new(client);
        client
            .get_mut()
            .write_all(b"STARTTLS\r\nMAIL FROM:<injected@example.net>\r\n")
            .await
            .unwrap();
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "220 Ready to start TLS\r\n");

        let domain = rustls::ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(domain, client.into_inner()).await.unwrap();
        let mut tls = tokio::io::BufReader::new(tls);
        tls.get_mut().write_all(b"EHLO secure\r\n").await.unwrap();
        tls.get_mut().flush().await.unwrap();

        line.clear();
        tls.read_line(&mut line).await.unwrap();
        assert_eq!(line, "250 EHLO secure\r\n");
        server.await.unwrap();
    }
}
