//! A scriptable SMTP server on 127.0.0.1 for exercising the delivery
//! path end to end.
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct SinkScript {
    pub banner: &'static str,
    pub ehlo: &'static str,
    pub mail_from: &'static str,
    pub rcpt_to: &'static str,
    /// The reply to the terminating dot
    pub data: &'static str,
    pub rset: &'static str,
    /// Delay before the banner is sent
    pub banner_delay: Duration,
}

impl Default for SinkScript {
    fn default() -> Self {
        Self {
            banner: "220 sink.test ESMTP\r\n",
            ehlo: "250-sink.test\r\n250-PIPELINING\r\n250 8BITMIME\r\n",
            mail_from: "250 2.1.0 ok\r\n",
            rcpt_to: "250 2.1.5 ok\r\n",
            data: "250 2.0.0 queued\r\n",
            rset: "250 2.0.0 reset\r\n",
            banner_delay: Duration::ZERO,
        }
    }
}

#[derive(Default, Debug)]
pub struct SinkStats {
    pub connections: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rsets: AtomicUsize,
    /// Sessions between accept and the first EHLO/HELO
    pub handshaking: AtomicUsize,
    pub max_handshaking: AtomicUsize,
    pub messages: Mutex<Vec<String>>,
}

impl SinkStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn rsets(&self) -> usize {
        self.rsets.load(Ordering::SeqCst)
    }

    pub fn max_handshaking(&self) -> usize {
        self.max_handshaking.load(Ordering::SeqCst)
    }

    fn greeted(&self, handshaking: &mut bool) {
        if std::mem::take(handshaking) {
            self.handshaking.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct SmtpSink {
    pub addr: SocketAddr,
    pub stats: Arc<SinkStats>,
    task: JoinHandle<()>,
}

impl Drop for SmtpSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SmtpSink {
    pub async fn start(script: SinkScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(SinkStats::default());

        let task = {
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let stats = Arc::clone(&stats);
                    let script = script.clone();
                    tokio::spawn(async move {
                        stats.connections.fetch_add(1, Ordering::SeqCst);
                        let live = stats.live.fetch_add(1, Ordering::SeqCst) + 1;
                        stats.max_live.fetch_max(live, Ordering::SeqCst);
                        serve(stream, &script, &stats).await.ok();
                        stats.live.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        };

        Self { addr, stats, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn serve(stream: TcpStream, script: &SinkScript, stats: &SinkStats) -> std::io::Result<()> {
    let mut handshaking = true;
    let pending = stats.handshaking.fetch_add(1, Ordering::SeqCst) + 1;
    stats.max_handshaking.fetch_max(pending, Ordering::SeqCst);
    let result = converse(stream, script, stats, &mut handshaking).await;
    stats.greeted(&mut handshaking);
    result
}

async fn converse(
    stream: TcpStream,
    script: &SinkScript,
    stats: &SinkStats,
    handshaking: &mut bool,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    if !script.banner_delay.is_zero() {
        tokio::time::sleep(script.banner_delay).await;
    }
    write.write_all(script.banner.as_bytes()).await?;
    if !script.banner.starts_with("220") {
        return Ok(());
    }

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let verb = line.trim_end().to_ascii_uppercase();
        let reply: &str = if verb.starts_with("EHLO") {
            stats.greeted(handshaking);
            script.ehlo
        } else if verb.starts_with("HELO") {
            stats.greeted(handshaking);
            "250 sink.test\r\n"
        } else if verb.starts_with("MAIL FROM") {
            script.mail_from
        } else if verb.starts_with("RCPT TO") {
            script.rcpt_to
        } else if verb == "RSET" {
            stats.rsets.fetch_add(1, Ordering::SeqCst);
            script.rset
        } else if verb == "NOOP" {
            "250 2.0.0 ok\r\n"
        } else if verb == "QUIT" {
            write.write_all(b"221 2.0.0 bye\r\n").await?;
            return Ok(());
        } else if verb == "DATA" {
            write.write_all(b"354 go ahead\r\n").await?;
            let mut body = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" {
                    break;
                }
                body.push_str(&line);
            }
            if script.data.starts_with('2') {
                stats.accepted.fetch_add(1, Ordering::SeqCst);
                stats.messages.lock().push(body);
            }
            script.data
        } else {
            "500 5.5.1 unrecognized command\r\n"
        };
        write.write_all(reply.as_bytes()).await?;
        if reply.starts_with("421") {
            return Ok(());
        }
    }
}
