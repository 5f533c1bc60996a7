//! Framed request/response client
//!
//! One request is: take an idle connection to the target (or dial a new
//! one), write a frame, read the matching response frame. Transport
//! failures are retried on a fresh connection up to `retry_max` times;
//! protocol-level failures are not. Errors travel as errno-style codes
//! because that is what the wire's `error` field speaks.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::message::{read_packet, write_packet, Message, Packet};
use crate::protocol::{Command, DEFAULT_SIZE_LIMIT};
use crate::target::RemoteTarget;

#[derive(Clone, Debug)]
pub struct ClientParams {
    /// Extra transport attempts after the first failure.
    pub retry_max: u32,
    /// Milliseconds; negative = unbounded.
    pub send_timeout: i64,
    /// Milliseconds; negative = unbounded.
    pub receive_timeout: i64,
    /// How long an idle connection stays reusable. 0 disables reuse,
    /// negative keeps connections indefinitely.
    pub keep_alive_timeout: i64,
}

impl Default for ClientParams {
    fn default() -> ClientParams {
        ClientParams {
            retry_max: 0,
            send_timeout: -1,
            receive_timeout: -1,
            keep_alive_timeout: 60 * 1000,
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    since: Instant,
}

pub struct FcopyClient {
    params: ClientParams,
    size_limit: usize,
    pool: Mutex<HashMap<(String, u16), Vec<IdleConn>>>,
}

fn io_errno(e: io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

async fn io_phase<T, F>(timeout_ms: i64, fut: F) -> Result<T, i32>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    if timeout_ms < 0 {
        return fut.await.map_err(io_errno);
    }
    match timeout(Duration::from_millis(timeout_ms as u64), fut).await {
        Ok(r) => r.map_err(io_errno),
        Err(_) => Err(libc::ETIMEDOUT),
    }
}

impl FcopyClient {
    pub fn new(params: ClientParams) -> FcopyClient {
        FcopyClient {
            params,
            size_limit: DEFAULT_SIZE_LIMIT,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Send `message` (+ optional chunk payload) and await the matching
    /// response. Returns `EBADMSG` if the peer answers with anything but
    /// the request's response type; the header `error` inside the
    /// returned packet is the caller's to interpret.
    pub async fn request(
        &self,
        target: &RemoteTarget,
        message: &Message,
        data: &[u8],
    ) -> Result<Packet, i32> {
        let attempts = self.params.retry_max.saturating_add(1);
        let mut last_error = libc::EIO;

        for _ in 0..attempts {
            match self.request_once(target, message, data).await {
                Ok(resp) => {
                    let expect = message.command() as u16 | 0x1000;
                    if Command::from_u16(expect) != Some(resp.message.command()) {
                        return Err(libc::EBADMSG);
                    }
                    return Ok(resp);
                }
                // Transport-level failure: retry on a fresh connection.
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    async fn request_once(
        &self,
        target: &RemoteTarget,
        message: &Message,
        data: &[u8],
    ) -> Result<Packet, i32> {
        let mut stream = match self.take_idle(target) {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect((target.host.as_str(), target.port))
                    .await
                    .map_err(io_errno)?;
                stream.set_nodelay(true).map_err(io_errno)?;
                stream
            }
        };

        io_phase(
            self.params.send_timeout,
            write_packet(&mut stream, message, 0, data),
        )
        .await?;

        let packet = io_phase(
            self.params.receive_timeout,
            read_packet(&mut stream, self.size_limit),
        )
        .await?
        .ok_or(libc::ECONNRESET)?;

        self.put_idle(target, stream);
        Ok(packet)
    }

    fn take_idle(&self, target: &RemoteTarget) -> Option<TcpStream> {
        let keep_alive = self.params.keep_alive_timeout;
        if keep_alive == 0 {
            return None;
        }

        let mut pool = self.pool.lock();
        let conns = pool.get_mut(&(target.host.clone(), target.port))?;
        while let Some(conn) = conns.pop() {
            if keep_alive < 0 || conn.since.elapsed() < Duration::from_millis(keep_alive as u64) {
                return Some(conn.stream);
            }
            // Expired; dropping closes it.
        }
        None
    }

    fn put_idle(&self, target: &RemoteTarget, stream: TcpStream) {
        if self.params.keep_alive_timeout == 0 {
            return;
        }

        let mut pool = self.pool.lock();
        pool.entry((target.host.clone(), target.port))
            .or_default()
            .push(IdleConn {
                stream,
                since: Instant::now(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CloseFileReq;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn target_of(addr: std::net::SocketAddr) -> RemoteTarget {
        RemoteTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    #[tokio::test]
    async fn response_type_mismatch_is_ebadmsg() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_of(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_packet(&mut sock, DEFAULT_SIZE_LIMIT).await.unwrap();
            // Wrong response type for a CLOSE_FILE_REQ.
            write_packet(&mut sock, &Message::SetChainResp, 0, &[])
                .await
                .unwrap();
        });

        let cli = FcopyClient::new(ClientParams::default());
        let msg = Message::CloseFileReq(CloseFileReq {
            wait_close: 1,
            file_token: "t".into(),
        });
        let err = cli.request(&target, &msg, &[]).await.unwrap_err();
        assert_eq!(err, libc::EBADMSG);
    }

    #[tokio::test]
    async fn error_field_passes_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_of(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_packet(&mut sock, DEFAULT_SIZE_LIMIT).await.unwrap();
            write_packet(&mut sock, &Message::CloseFileResp, -libc::ENOENT as i16, &[])
                .await
                .unwrap();
        });

        let cli = FcopyClient::new(ClientParams::default());
        let msg = Message::CloseFileReq(CloseFileReq {
            wait_close: 0,
            file_token: "t".into(),
        });
        let resp = cli.request(&target, &msg, &[]).await.unwrap();
        assert_eq!(resp.error as i32, -libc::ENOENT);
    }

    #[tokio::test]
    async fn early_close_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_of(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_packet(&mut sock, DEFAULT_SIZE_LIMIT).await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let cli = FcopyClient::new(ClientParams::default());
        let msg = Message::CloseFileReq(CloseFileReq::default());
        assert!(cli.request(&target, &msg, &[]).await.is_err());
    }
}
