//! fcopyd service: dispatch loop and replication dataplane
//!
//! One task per connection, one request/response per frame. The SEND
//! handler is where the fan-out happens: every chunk is written locally
//! and forwarded to the node's chain targets at the same time, so the
//! per-chunk latency of a whole pipeline is the slower of the two legs,
//! not their sum.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::buffer::AlignedBuf;
use crate::client::{ClientParams, FcopyClient};
use crate::file_manager::{resolve_under_root, FileManager};
use crate::message::{
    read_packet, write_packet, CloseFileReq, CreateFileResp, Message, Packet, SendFileReq,
};
use crate::protocol::{app_error, Command, DEFAULT_SIZE_LIMIT};
use crate::target::{ChainTarget, RemoteTarget};

#[derive(Clone, Debug)]
pub struct ServiceParams {
    pub port: u16,
    pub max_connections: usize,
    /// Milliseconds to wait for the next request on an idle connection;
    /// non-positive = unbounded.
    pub keep_alive_timeout: i64,
    /// Milliseconds to finish receiving one request once started.
    pub receive_timeout: i64,
    /// Milliseconds to get a reply onto the wire.
    pub peer_response_timeout: i64,
    pub request_size_limit: usize,
    pub direct_io: bool,
    /// Root for requests that name no partition.
    pub default_partition: PathBuf,
    pub partitions: HashMap<String, PathBuf>,
    /// Forwarding client configuration (`cli-*` config keys).
    pub cli: ClientParams,
}

impl Default for ServiceParams {
    fn default() -> ServiceParams {
        ServiceParams {
            port: 0,
            max_connections: 4096,
            keep_alive_timeout: 300 * 1000,
            receive_timeout: -1,
            peer_response_timeout: 10 * 1000,
            request_size_limit: DEFAULT_SIZE_LIMIT,
            direct_io: true,
            default_partition: PathBuf::from("."),
            partitions: HashMap::new(),
            cli: ClientParams::default(),
        }
    }
}

struct Inner {
    params: ServiceParams,
    mng: FileManager,
    cli: FcopyClient,
}

/// A running replication node. Dropping the handle ends the accept
/// loop without waiting; [`Service::stop`] waits for in-flight work.
pub struct Service {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Service {
    pub async fn start(params: ServiceParams) -> Result<Service> {
        let listener = TcpListener::bind(("0.0.0.0", params.port))
            .await
            .with_context(|| format!("bind port {}", params.port))?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::new(Inner {
            cli: FcopyClient::new(params.cli.clone()),
            mng: FileManager::new(),
            params,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, inner.clone(), shutdown_rx));

        info!("ServerStart port:{}", local_addr.port());
        Ok(Service {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> RemoteTarget {
        RemoteTarget {
            host: "127.0.0.1".into(),
            port: self.local_addr.port(),
        }
    }

    /// Stop accepting, then wait for in-flight requests to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        info!("ServerStop port:{}", self.local_addr.port());
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let limit = Arc::new(Semaphore::new(inner.params.max_connections));
    let mut conns: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let Ok(permit) = limit.clone().try_acquire_owned() else {
                            warn!("ConnRejected peer:{} reason:max_connections", peer);
                            continue;
                        };
                        let inner = inner.clone();
                        let shutdown = shutdown.clone();
                        conns.spawn(async move {
                            let _permit = permit;
                            handle_conn(stream, peer, inner, shutdown).await;
                        });
                    }
                    Err(e) => warn!("AcceptFailed error:{}", e),
                }
                // Reap finished connections as we go.
                while conns.try_join_next().is_some() {}
            }
        }
    }

    drop(listener);
    while conns.join_next().await.is_some() {}
}

async fn read_request(stream: &mut TcpStream, inner: &Inner) -> io::Result<Option<Packet>> {
    let mut timeout_ms = i64::MAX;
    for t in [
        inner.params.keep_alive_timeout,
        inner.params.receive_timeout,
    ] {
        if t > 0 {
            timeout_ms = timeout_ms.min(t);
        }
    }

    let read = read_packet(stream, inner.params.request_size_limit);
    if timeout_ms == i64::MAX {
        return read.await;
    }
    match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), read).await {
        Ok(result) => result,
        Err(_) => Ok(None), // idle expiry closes the connection quietly
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Accept peer:{}", peer);

    loop {
        // In-flight requests run to completion; only the wait for the
        // next request yields to shutdown.
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = read_request(&mut stream, &inner) => read,
        };

        let packet = match read {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => {
                // Framing failures poison the stream; drop the peer.
                debug!("RecvFailed peer:{} error:{}", peer, e);
                break;
            }
        };

        let (message, error) = process(&inner, packet).await;

        let write = write_packet(&mut stream, &message, error, &[]);
        let result = if inner.params.peer_response_timeout > 0 {
            let timeout = Duration::from_millis(inner.params.peer_response_timeout as u64);
            match tokio::time::timeout(timeout, write).await {
                Ok(result) => result,
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        } else {
            write.await
        };

        if let Err(e) = result {
            debug!("ReplyFailed peer:{} error:{}", peer, e);
            break;
        }
    }
}

/// Dispatch one request. The UNKNOWN reply is the default so a handler
/// bailing on malformed input still answers something.
async fn process(inner: &Arc<Inner>, packet: Packet) -> (Message, i16) {
    match packet.message.command() {
        Command::CreateFileReq => handle_create_file(inner, packet).await,
        Command::SendFileReq => handle_send_file(inner, packet).await,
        Command::CloseFileReq => handle_close_file(inner, packet).await,
        Command::DeleteFileReq => handle_delete_file(inner, packet).await,
        Command::SetChainReq => handle_set_chain(inner, packet).await,
        _ => (Message::Unknown, 0),
    }
}

fn partition_dir(params: &ServiceParams, partition: &str) -> Option<PathBuf> {
    if partition.is_empty() {
        return Some(params.default_partition.clone());
    }
    params.partitions.get(partition).cloned()
}

async fn handle_create_file(inner: &Arc<Inner>, packet: Packet) -> (Message, i16) {
    let Message::CreateFileReq(req) = packet.message else {
        return (Message::Unknown, 0);
    };

    let Some(root) = partition_dir(&inner.params, &req.partition) else {
        info!("CreateFileRejected partition:{}", req.partition);
        return (
            Message::CreateFileResp(CreateFileResp::default()),
            app_error::ERR_NO_PARTITION,
        );
    };

    let (error, file_token) = match resolve_under_root(&root, &req.relative_path, &req.file_name) {
        Err(e) => (e, String::new()),
        Ok(path) => {
            let inner = inner.clone();
            let display = path.clone();
            let (file_size, chunk_size, file_perm) = (req.file_size, req.chunk_size, req.file_perm);
            let result = tokio::task::spawn_blocking(move || {
                inner.mng.create_file(
                    &path,
                    file_size,
                    chunk_size,
                    file_perm,
                    inner.params.direct_io,
                )
            })
            .await
            .expect("create task");

            let (error, token) = match result {
                Ok(token) => (0, token),
                Err(e) => (e, String::new()),
            };
            info!(
                "CreateFile file:{} size:{} error:{} token:{}",
                display.display(),
                file_size,
                error,
                token
            );
            (error, token)
        }
    };

    (
        Message::CreateFileResp(CreateFileResp { file_token }),
        error as i16,
    )
}

async fn handle_close_file(inner: &Arc<Inner>, packet: Packet) -> (Message, i16) {
    let Message::CloseFileReq(CloseFileReq {
        wait_close,
        file_token,
    }) = packet.message
    else {
        return (Message::Unknown, 0);
    };

    let error;
    if wait_close != 0 {
        // The close may block in ftruncate; run it off the reactor and
        // make the client observe completion.
        let inner = inner.clone();
        let token = file_token.clone();
        error = tokio::task::spawn_blocking(move || inner.mng.close_file(&token))
            .await
            .expect("close task");
        info!("CloseFile error:{} token:{}", error, file_token);
    } else {
        // Acknowledge right away; the actual close runs behind the
        // reply and only gets logged.
        error = if inner.mng.has_file(&file_token) {
            0
        } else {
            -libc::ENOENT
        };
        let inner = inner.clone();
        tokio::task::spawn_blocking(move || {
            let error = inner.mng.close_file(&file_token);
            info!("CloseFile error:{} token:{}", error, file_token);
        });
    }

    (Message::CloseFileResp, error as i16)
}

async fn handle_set_chain(inner: &Arc<Inner>, packet: Packet) -> (Message, i16) {
    let Message::SetChainReq(req) = packet.message else {
        return (Message::Unknown, 0);
    };

    let error = inner.mng.set_chain_targets(&req.file_token, req.targets);
    debug!("SetChain error:{} token:{}", error, req.file_token);
    (Message::SetChainResp, error as i16)
}

/// DELETE is accepted but intentionally inert: it confirms token
/// existence and leaves the upload to CLOSE_FILE.
async fn handle_delete_file(inner: &Arc<Inner>, packet: Packet) -> (Message, i16) {
    let Message::DeleteFileReq(req) = packet.message else {
        return (Message::Unknown, 0);
    };

    let error = if inner.mng.has_file(&req.file_token) {
        0
    } else {
        -libc::ENOENT
    };
    (Message::DeleteFileResp, error as i16)
}

async fn handle_send_file(inner: &Arc<Inner>, packet: Packet) -> (Message, i16) {
    let Message::SendFileReq(req) = packet.message else {
        return (Message::Unknown, 0);
    };

    let Some((file, children)) = inner.mng.get_file(&req.file_token) else {
        return (Message::SendFileResp, (-libc::ENOENT) as i16);
    };

    // Hop budget exhausted but forwarding still required: the client
    // sized max_chain_len wrong. Refuse before touching the disk.
    if req.max_chain_len <= 1 && !children.is_empty() {
        return (Message::SendFileResp, (-libc::ECANCELED) as i16);
    }

    let data = Arc::new(packet.data);

    let write_task = {
        let file = file.clone();
        let data = data.clone();
        let offset = req.offset;
        tokio::task::spawn_blocking(move || write_chunk(&file, &data, offset))
    };

    let (chain_errors, write_result) =
        tokio::join!(send_chain(inner, &req, &children, &data), write_task);

    let mut error = chain_errors.into_iter().find(|&e| e != 0).unwrap_or(0);
    if error == 0 {
        error = write_result.unwrap_or(libc::EIO);
    }

    (Message::SendFileResp, error as i16)
}

/// Positional write of one chunk, padded out to the alignment unit so
/// O_DIRECT accepts it; close restores the exact length.
fn write_chunk(file: &File, data: &AlignedBuf, offset: u64) -> i32 {
    use std::os::unix::fs::FileExt;

    if data.is_empty() {
        return 0;
    }
    match file.write_all_at(data.padded(), offset) {
        Ok(()) => 0,
        Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Forward one chunk to every chain target concurrently; returns the
/// per-child errors in target order.
async fn send_chain(
    inner: &Arc<Inner>,
    origin: &SendFileReq,
    children: &[ChainTarget],
    data: &Arc<AlignedBuf>,
) -> Vec<i32> {
    let sends = children.iter().map(|child| {
        let target = RemoteTarget {
            host: child.host.clone(),
            port: child.port,
        };
        let req = Message::SendFileReq(SendFileReq {
            max_chain_len: origin.max_chain_len - 1,
            compress_type: origin.compress_type,
            origin_size: origin.origin_size,
            crc32: origin.crc32,
            offset: origin.offset,
            file_token: child.file_token.clone(),
        });

        async move {
            let error = match inner.cli.request(&target, &req, &data[..]).await {
                Ok(resp) => resp.error as i32,
                Err(e) => e,
            };
            if error == 0 {
                debug!(
                    "ChainSendSuccess host:{} port:{} token:{}",
                    child.host, child.port, child.file_token
                );
            } else {
                error!(
                    "ChainSendFailed host:{} port:{} token:{} error:{}",
                    child.host, child.port, child.file_token, error
                );
            }
            error
        }
    });

    join_all(sends).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CreateFileReq, DeleteFileReq};

    async fn start_test_service() -> (Service, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let service = Service::start(ServiceParams {
            default_partition: dir.path().to_path_buf(),
            direct_io: false,
            ..Default::default()
        })
        .await
        .unwrap();
        (service, dir)
    }

    #[tokio::test]
    async fn unknown_partition_is_refused() {
        let (service, _dir) = start_test_service().await;
        let cli = FcopyClient::new(ClientParams::default());

        let req = Message::CreateFileReq(CreateFileReq {
            chunk_size: 8192,
            file_size: 10,
            partition: "nope".into(),
            relative_path: ".".into(),
            file_name: "f.bin".into(),
            ..Default::default()
        });
        let resp = cli.request(&service.target(), &req, &[]).await.unwrap();
        assert_eq!(resp.error, app_error::ERR_NO_PARTITION);

        service.stop().await;
    }

    #[tokio::test]
    async fn bad_chunk_size_is_einval() {
        let (service, _dir) = start_test_service().await;
        let cli = FcopyClient::new(ClientParams::default());

        let req = Message::CreateFileReq(CreateFileReq {
            chunk_size: 1000,
            file_size: 10,
            relative_path: ".".into(),
            file_name: "f.bin".into(),
            ..Default::default()
        });
        let resp = cli.request(&service.target(), &req, &[]).await.unwrap();
        assert_eq!(resp.error as i32, -libc::EINVAL);

        service.stop().await;
    }

    #[tokio::test]
    async fn send_without_token_is_enoent() {
        let (service, _dir) = start_test_service().await;
        let cli = FcopyClient::new(ClientParams::default());

        let req = Message::SendFileReq(SendFileReq {
            max_chain_len: 1,
            file_token: "missing".into(),
            ..Default::default()
        });
        let resp = cli.request(&service.target(), &req, b"x").await.unwrap();
        assert_eq!(resp.error as i32, -libc::ENOENT);

        service.stop().await;
    }

    #[tokio::test]
    async fn delete_is_a_stub() {
        let (service, _dir) = start_test_service().await;
        let cli = FcopyClient::new(ClientParams::default());

        let req = Message::DeleteFileReq(DeleteFileReq {
            file_token: "missing".into(),
        });
        let resp = cli.request(&service.target(), &req, &[]).await.unwrap();
        assert_eq!(resp.error as i32, -libc::ENOENT);

        service.stop().await;
    }
}
