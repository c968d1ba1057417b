use crate::client_types::{MultiLineResponse, ResponseLine};
use crate::{
    AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, EsmtpParameter, ForwardPath, Response,
    ReversePath, SmtpClientTimeouts,
};
use memchr::memmem::Finder;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tokio::time::{timeout, Instant};

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("Timed Out connecting to {address} after {duration:?}")]
    TimeOutConnect {
        address: SocketAddr,
        duration: Duration,
    },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
}

impl ClientError {
    /// The response that the peer sent, if this error was caused
    /// by the peer rejecting a command
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Rejected(response) => Some(response),
            _ => None,
        }
    }

    /// Describe the error as an SMTP style response so that it can
    /// be logged and classified alongside genuine peer responses.
    pub fn to_response(&self) -> Response {
        match self {
            Self::Rejected(response) => response.clone(),
            err => Response::with_code_and_message(451, &format!("4.4.2 {err:#}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The TCP session is established and the banner was accepted
    Connected,
    HelloSent,
    MailFromSet,
    RcptAccepted,
    DataInProgress,
    /// A transaction completed and the session may be reused
    Idle,
    Closed,
}

/// Transfer encoding declared for message payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    SevenBit,
    EightBit,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
    state: ConnectionState,
    encoding: DataEncoding,
    messages_sent: usize,
    max_messages: Option<usize>,
    last_activity: Instant,
    service_unavailable: bool,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    }
}

impl SmtpClient {
    /// Open a TCP session to `address`, optionally binding the local
    /// side to `source` so that the session originates from a specific
    /// sending IP. The banner is not read; see `read_greeting`.
    pub async fn connect(
        source: Option<IpAddr>,
        address: SocketAddr,
        peer_hostname: &str,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(source) = source {
            if let Err(err) = socket.bind(SocketAddr::new(source, 0)) {
                tracing::error!("bind {source:?} for {address:?} failed: {err:#}");
                return Err(err.into());
            }
        }

        let stream = match timeout(timeouts.connect_timeout, socket.connect(address)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    address,
                    duration: timeouts.connect_timeout,
                })
            }
        };
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, peer_hostname, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
            state: ConnectionState::Connected,
            encoding: DataEncoding::SevenBit,
            messages_sent: 0,
            max_messages: None,
            last_activity: Instant::now(),
            service_unavailable: false,
        }
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn encoding(&self) -> DataEncoding {
        self.encoding
    }

    pub fn capabilities(&self) -> &HashMap<String, EsmtpCapability> {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some() && self.state != ConnectionState::Closed
    }

    /// True once the peer has signalled 421 on this session
    pub fn is_service_unavailable(&self) -> bool {
        self.service_unavailable
    }

    pub fn messages_sent(&self) -> usize {
        self.messages_sent
    }

    /// Close the session after this many messages were accepted.
    /// `None` means no limit.
    pub fn set_max_messages(&mut self, max_messages: Option<usize>) {
        self.max_messages = max_messages;
    }

    pub fn max_messages(&self) -> Option<usize> {
        self.max_messages
    }

    /// How long since the last byte was written or read
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn abandon(&mut self) {
        self.socket.take();
        self.state = ConnectionState::Closed;
    }

    /// Drop the session if `result` indicates that its state can no
    /// longer be trusted. Rejections leave the session usable unless
    /// the peer said that it is going away.
    fn check<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        match &result {
            Ok(_) => {}
            Err(ClientError::Rejected(response)) => {
                if response.is_service_unavailable() {
                    self.service_unavailable = true;
                    self.abandon();
                }
            }
            Err(_) => self.abandon(),
        }
        result
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.last_activity = Instant::now();
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let mut reply = MultiLineResponse::start(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line)?;
            reply
                .push(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = reply.finish(command.map(|cmd| cmd.encode()));
        tracing::trace!(
            "{}: {command:?} response: {}",
            self.hostname,
            response.to_single_line()
        );
        Ok(response)
    }

    async fn write_all(&mut self, data: &[u8], command: &Command) -> Result<(), ClientError> {
        let duration = command.client_timeout_request(&self.timeouts);
        match self.socket.as_mut() {
            Some(socket) => match timeout(duration, socket.write_all(data)).await {
                Ok(result) => result.map_err(|_| ClientError::NotConnected)?,
                Err(_) => {
                    return Err(ClientError::TimeOutRequest {
                        command: command.clone(),
                        duration,
                    })
                }
            },
            None => return Err(ClientError::NotConnected),
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, line.escape_debug());
        self.write_all(line.as_bytes(), command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Issue `command` and require one of the `expected` codes
    async fn transact(
        &mut self,
        command: &Command,
        expected: &[u16],
    ) -> Result<Response, ClientError> {
        let result = match self.send_command(command).await {
            Ok(response) if expected.contains(&response.code) => Ok(response),
            Ok(response) => Err(ClientError::Rejected(response)),
            Err(err) => Err(err),
        };
        self.check(result)
    }

    /// Read the initial 220 banner
    pub async fn read_greeting(&mut self) -> Result<Response, ClientError> {
        let result = match self.read_response(None, self.timeouts.banner_timeout).await {
            Ok(response) if response.code == 220 => Ok(response),
            Ok(response) => Err(ClientError::Rejected(response)),
            Err(err) => Err(err),
        };
        let result = self.check(result);
        if let Err(ClientError::Rejected(_)) = &result {
            // A non-220 banner means that the peer won't talk to us
            self.quit().await;
        }
        result
    }

    /// Introduce ourselves with EHLO, falling back to HELO when the peer
    /// refuses EHLO. Records the advertised extensions.
    pub async fn hello(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let ehlo = Command::Ehlo(ehlo_name.to_string());
        let response = match self.send_command(&ehlo).await {
            Ok(response) => response,
            Err(err) => return self.check(Err(err)),
        };

        let mut capabilities = HashMap::new();
        if response.code == 250 {
            for line in response.content.lines().skip(1) {
                let mut fields = line.splitn(2, ' ');
                if let Some(name) = fields.next() {
                    let param = fields.next().map(|s| s.to_string());
                    let cap = EsmtpCapability {
                        name: name.to_string(),
                        param,
                    };
                    capabilities.insert(name.to_ascii_uppercase(), cap);
                }
            }
        } else if response.is_service_unavailable() {
            return self.check(Err(ClientError::Rejected(response)));
        } else {
            tracing::debug!(
                "{} rejected EHLO with {}, trying HELO",
                self.hostname,
                response.to_single_line()
            );
            self.transact(&Command::Helo(ehlo_name.to_string()), &[250])
                .await?;
        }

        self.encoding = if capabilities.contains_key("8BITMIME") {
            DataEncoding::EightBit
        } else {
            DataEncoding::SevenBit
        };
        self.capabilities = capabilities;
        self.state = ConnectionState::HelloSent;
        Ok(&self.capabilities)
    }

    /// Abort any transaction so that the session can be reused
    pub async fn reset(&mut self) -> Result<Response, ClientError> {
        let response = self.transact(&Command::Rset, &[250]).await?;
        self.state = ConnectionState::HelloSent;
        Ok(response)
    }

    pub async fn mail_from(
        &mut self,
        sender: ReversePath,
        eight_bit: bool,
    ) -> Result<Response, ClientError> {
        let mut parameters = vec![];
        if eight_bit {
            match self.encoding {
                DataEncoding::EightBit => {
                    parameters.push(EsmtpParameter::new("BODY", Some("8BITMIME")));
                }
                DataEncoding::SevenBit => {
                    tracing::warn!(
                        "{} did not advertise 8BITMIME; sending 8-bit payload as-is",
                        self.hostname
                    );
                }
            }
        }
        let response = self
            .transact(
                &Command::MailFrom {
                    address: sender,
                    parameters,
                },
                &[250],
            )
            .await?;
        self.state = ConnectionState::MailFromSet;
        Ok(response)
    }

    pub async fn rcpt_to(&mut self, recipient: ForwardPath) -> Result<Response, ClientError> {
        let response = self
            .transact(
                &Command::RcptTo {
                    address: recipient,
                    parameters: vec![],
                },
                &[250, 251],
            )
            .await?;
        self.state = ConnectionState::RcptAccepted;
        Ok(response)
    }

    /// Issue DATA, transmit the payload and return the final response.
    /// When the per-session message cap is reached, the session is
    /// closed with QUIT after the payload was accepted.
    pub async fn data<B: AsRef<[u8]>>(&mut self, data: B) -> Result<Response, ClientError> {
        self.transact(&Command::Data, &[354]).await?;
        self.state = ConnectionState::DataInProgress;

        let data: &[u8] = data.as_ref();
        let stuffed;
        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());
        let sent = match self.write_all(data, &Command::Data).await {
            Err(ClientError::TimeOutRequest { .. }) => Err(ClientError::TimeOutData),
            other => other,
        };
        self.check(sent)?;

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };
        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());
        let sent = self.write_all(marker.as_bytes(), &Command::DataDot).await;
        self.check(sent)?;

        let data_dot = Command::DataDot;
        let result = match self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await
        {
            Ok(response) if response.code == 250 => Ok(response),
            Ok(response) => Err(ClientError::Rejected(response)),
            Err(err) => Err(err),
        };
        let response = self.check(result);
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Idle;
        }
        let response = response?;

        self.messages_sent += 1;
        if let Some(max) = self.max_messages {
            if self.messages_sent >= max {
                tracing::debug!(
                    "{} reached {max} messages for this session, closing",
                    self.hostname
                );
                self.quit().await;
            }
        }
        Ok(response)
    }

    /// Run a complete transaction for a single message.
    /// Any rejection ends the transaction.
    pub async fn send_mail<B: AsRef<[u8]>>(
        &mut self,
        sender: ReversePath,
        recipients: &[ForwardPath],
        data: B,
    ) -> Result<Response, ClientError> {
        if recipients.is_empty() {
            return Err(ClientError::Rejected(Response::with_code_and_message(
                554,
                "5.5.1 no valid recipients",
            )));
        }
        let data = data.as_ref();
        let eight_bit = data.iter().any(|&b| b >= 0x80);
        self.mail_from(sender, eight_bit).await?;
        for recipient in recipients {
            self.rcpt_to(recipient.clone()).await?;
        }
        self.data(data).await
    }

    /// Politely end the session. Errors are ignored since the session
    /// is going away regardless.
    pub async fn quit(&mut self) {
        if self.socket.is_some() {
            if let Err(err) = self.send_command(&Command::Quit).await {
                tracing::trace!("{}: error during QUIT: {err:#}", self.hostname);
            }
            if let Some(mut socket) = self.socket.take() {
                socket.shutdown().await.ok();
            }
        }
        self.state = ConnectionState::Closed;
    }
}

fn parse_response_line(line: &str) -> Result<ResponseLine<'_>, ClientError> {
    ResponseLine::parse(line).ok_or_else(|| ClientError::MalformedResponseLine(line.to_string()))
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: LazyLock<Finder> = LazyLock::new(|| Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    #[test]
    fn test_stuffing() {
        assert_eq!(apply_dot_stuffing(b"foo"), None);
        assert_eq!(apply_dot_stuffing(b".foo").unwrap(), b"..foo");
        assert_eq!(apply_dot_stuffing(b"foo\n.bar").unwrap(), b"foo\n..bar");
        assert_eq!(
            apply_dot_stuffing(b"foo\n.bar\n..baz\n").unwrap(),
            b"foo\n..bar\n...baz\n"
        );
    }

    #[test]
    fn response_line_parsing() {
        assert_eq!(
            parse_response_line("220 woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        assert_eq!(
            parse_response_line("220-woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );
        assert_eq!(
            parse_response_line("250").unwrap(),
            ResponseLine {
                code: 250,
                is_final: true,
                content: ""
            }
        );

        assert!(matches!(
            parse_response_line("220_woot"),
            Err(ClientError::MalformedResponseLine(_))
        ));
        assert!(matches!(
            parse_response_line("not really"),
            Err(ClientError::MalformedResponseLine(_))
        ));
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(extract_hostname("foo"), "foo");
        assert_eq!(extract_hostname("foo:25"), "foo");
        assert_eq!(extract_hostname("[foo]:25"), "foo");
        assert_eq!(extract_hostname("[::1]:25"), "::1");
        assert_eq!(extract_hostname("::1:25"), "::1");
    }

    /// A scripted peer: for each line the client sends, the matching
    /// reply is written back. Returns everything the client sent.
    fn scripted_peer(
        stream: DuplexStream,
        banner: &'static str,
        replies: Vec<(&'static str, &'static str)>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut reader = BufReader::new(read);
            let mut received = vec![];
            write.write_all(banner.as_bytes()).await.unwrap();
            let mut in_data = false;
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.clone());
                if in_data {
                    if line == ".\r\n" {
                        in_data = false;
                    } else {
                        continue;
                    }
                }
                let verb = line.trim_end().to_ascii_uppercase();
                let reply = replies
                    .iter()
                    .find(|(prefix, _)| verb.starts_with(prefix))
                    .map(|(_, reply)| *reply);
                if let Some(reply) = reply {
                    if reply.starts_with("354") {
                        in_data = true;
                    }
                    write.write_all(reply.as_bytes()).await.unwrap();
                }
                if verb == "QUIT" {
                    break;
                }
            }
            received
        })
    }

    #[tokio::test]
    async fn full_transaction_with_multiline_ehlo() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let peer = scripted_peer(
            server_side,
            "220-mx.example.net ESMTP\r\n220 welcome\r\n",
            vec![
                (
                    "EHLO",
                    "250-mx.example.net\r\n250-PIPELINING\r\n250-8BITMIME\r\n250 SIZE 1000\r\n",
                ),
                ("MAIL FROM", "250 2.1.0 ok\r\n"),
                ("RCPT TO", "250 2.1.5 ok\r\n"),
                ("DATA", "354 go ahead\r\n"),
                (".", "250 2.0.0 queued as 123\r\n"),
                ("QUIT", "221 bye\r\n"),
            ],
        );

        let mut client =
            SmtpClient::with_stream(client_side, "mx.example.net:25", Default::default());
        let banner = client.read_greeting().await.unwrap();
        k9::assert_equal!(banner.content, "mx.example.net ESMTP\nwelcome");

        let caps = client.hello("mta1.example.com").await.unwrap();
        assert!(caps.contains_key("8BITMIME"));
        k9::assert_equal!(
            caps.get("SIZE").and_then(|c| c.param.clone()),
            Some("1000".to_string())
        );
        k9::assert_equal!(client.encoding(), DataEncoding::EightBit);

        let response = client
            .send_mail(
                ReversePath::try_from("sender@example.com").unwrap(),
                &[ForwardPath::try_from("user@example.net").unwrap()],
                "Subject: hi\r\n\r\n.leading dot\r\nbody \u{e9}\r\n",
            )
            .await
            .unwrap();
        k9::assert_equal!(response.code, 250);
        k9::assert_equal!(client.state(), ConnectionState::Idle);
        k9::assert_equal!(client.messages_sent(), 1);

        client.quit().await;
        assert!(!client.is_connected());

        let received = peer.await.unwrap();
        assert!(received.contains(&"MAIL FROM:<sender@example.com> BODY=8BITMIME\r\n".to_string()));
        assert!(received.contains(&"..leading dot\r\n".to_string()));
        k9::assert_equal!(received.last().map(|s| s.as_str()), Some("QUIT\r\n"));
    }

    #[tokio::test]
    async fn ehlo_falls_back_to_helo() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let _peer = scripted_peer(
            server_side,
            "220 old school\r\n",
            vec![
                ("EHLO", "502 5.5.2 what?\r\n"),
                ("HELO", "250 hello\r\n"),
            ],
        );
        let mut client = SmtpClient::with_stream(client_side, "old", Default::default());
        client.read_greeting().await.unwrap();
        let caps = client.hello("mta1.example.com").await.unwrap();
        assert!(caps.is_empty());
        k9::assert_equal!(client.encoding(), DataEncoding::SevenBit);
        k9::assert_equal!(client.state(), ConnectionState::HelloSent);
    }

    #[tokio::test]
    async fn service_unavailable_closes_session() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let _peer = scripted_peer(
            server_side,
            "220 ready\r\n",
            vec![
                ("EHLO", "250 ok\r\n"),
                ("MAIL FROM", "421 4.7.0 too busy, try later\r\n"),
            ],
        );
        let mut client = SmtpClient::with_stream(client_side, "busy", Default::default());
        client.read_greeting().await.unwrap();
        client.hello("mta1.example.com").await.unwrap();
        let err = client
            .send_mail(
                ReversePath::NullSender,
                &[ForwardPath::try_from("user@example.net").unwrap()],
                "body\r\n",
            )
            .await
            .unwrap_err();
        k9::assert_equal!(err.response().map(|r| r.code), Some(421));
        assert!(client.is_service_unavailable());
        assert!(!client.is_connected());
        k9::assert_equal!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn rejected_recipient_keeps_session() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let _peer = scripted_peer(
            server_side,
            "220 ready\r\n",
            vec![
                ("EHLO", "250 ok\r\n"),
                ("MAIL FROM", "250 ok\r\n"),
                ("RCPT TO", "550 5.1.1 no such user\r\n"),
                ("RSET", "250 reset\r\n"),
            ],
        );
        let mut client = SmtpClient::with_stream(client_side, "mx", Default::default());
        client.read_greeting().await.unwrap();
        client.hello("mta1.example.com").await.unwrap();
        let err = client
            .send_mail(
                ReversePath::NullSender,
                &[ForwardPath::try_from("nobody@example.net").unwrap()],
                "body\r\n",
            )
            .await
            .unwrap_err();
        let response = err.to_response();
        k9::assert_equal!(response.to_single_line(), "550 5.1.1 no such user");
        assert!(client.is_connected());
        client.reset().await.unwrap();
        k9::assert_equal!(client.state(), ConnectionState::HelloSent);
    }

    #[tokio::test]
    async fn message_cap_closes_session() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let peer = scripted_peer(
            server_side,
            "220 ready\r\n",
            vec![
                ("EHLO", "250 ok\r\n"),
                ("MAIL FROM", "250 ok\r\n"),
                ("RCPT TO", "250 ok\r\n"),
                ("DATA", "354 go\r\n"),
                (".", "250 queued\r\n"),
                ("QUIT", "221 bye\r\n"),
            ],
        );
        let mut client = SmtpClient::with_stream(client_side, "mx", Default::default());
        client.set_max_messages(Some(1));
        client.read_greeting().await.unwrap();
        client.hello("mta1.example.com").await.unwrap();
        client
            .send_mail(
                ReversePath::NullSender,
                &[ForwardPath::try_from("user@example.net").unwrap()],
                "body",
            )
            .await
            .unwrap();
        assert!(!client.is_connected());
        let received = peer.await.unwrap();
        assert!(received.contains(&"body\r\n".to_string()));
        k9::assert_equal!(received.last().map(|s| s.as_str()), Some("QUIT\r\n"));
    }

    #[tokio::test]
    async fn rejected_banner() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let _peer = scripted_peer(
            server_side,
            "421 4.3.2 not now\r\n",
            vec![("QUIT", "221 bye\r\n")],
        );
        let mut client = SmtpClient::with_stream(client_side, "mx", Default::default());
        let err = client.read_greeting().await.unwrap_err();
        k9::assert_equal!(err.response().map(|r| r.code), Some(421));
        assert!(client.is_service_unavailable());
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout() {
        let (client_side, _server_side) = tokio::io::duplex(8192);
        let mut client =
            SmtpClient::with_stream(client_side, "mx", SmtpClientTimeouts::short_timeouts());
        let err = client.read_greeting().await.unwrap_err();
        assert!(matches!(err, ClientError::TimeOutResponse { .. }));
        assert!(!client.is_connected());
    }
}
