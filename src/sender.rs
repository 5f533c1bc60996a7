//! Client-side replication dataplane
//!
//! One `FileSender` drives one local file to N remote nodes:
//! open → CREATE_FILE on every target → install the propagation
//! topology → parallel chunk workers against the root → CLOSE_FILE on
//! every target. Only the root ever sees chunk traffic from us; the
//! nodes forward amongst themselves along the installed edges.

use std::fs::File;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::Mutex;

use crate::buffer::AlignedBuf;
use crate::client::FcopyClient;
use crate::limiter::RateLimiter;
use crate::message::{
    CloseFileReq, CreateFileReq, Message, SendFileReq, SetChainReq,
};
use crate::target::{ChainTarget, RemoteTarget};

/// Upper bound on parallel send workers; values outside [1, MAX_PARALLEL]
/// are clamped silently.
pub const MAX_PARALLEL: usize = 900;

pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMethod {
    /// target[i] forwards to target[i+1].
    Chain,
    /// target[i] forwards to targets[2i+1] and [2i+2].
    Tree,
}

#[derive(Clone, Debug)]
pub struct SenderParams {
    pub file_path: PathBuf,
    /// Remote partition name; empty selects the server default.
    pub partition: String,
    pub remote_file_dir: String,
    pub remote_file_name: String,
    pub chunk_size: u32,
    /// 0 keeps the server's default file mode.
    pub file_perm: u32,
    pub parallel: usize,
    pub send_method: SendMethod,
    pub direct_io: bool,
    pub wait_close: bool,
    /// Bytes per second; 0 disables pacing.
    pub speed_limit: u64,
    pub targets: Vec<RemoteTarget>,
}

impl Default for SenderParams {
    fn default() -> SenderParams {
        SenderParams {
            file_path: PathBuf::new(),
            partition: String::new(),
            remote_file_dir: ".".into(),
            remote_file_name: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            file_perm: 0,
            parallel: 16,
            send_method: SendMethod::Chain,
            direct_io: true,
            wait_close: true,
            speed_limit: 0,
            targets: Vec::new(),
        }
    }
}

/// Forwarding edges for a chain over `n` targets: `(parent, children)`
/// by target index.
pub fn chain_edges(n: usize) -> Vec<(usize, Vec<usize>)> {
    (0..n.saturating_sub(1)).map(|i| (i, vec![i + 1])).collect()
}

/// Forwarding edges for a binary tree over `n` targets.
pub fn tree_edges(n: usize) -> Vec<(usize, Vec<usize>)> {
    let mut edges = Vec::new();
    let mut i = 0;
    while 2 * i + 1 < n {
        let mut children = vec![2 * i + 1];
        if 2 * i + 2 < n {
            children.push(2 * i + 2);
        }
        edges.push((i, children));
        i += 1;
    }
    edges
}

/// Shared state of one parallel send pass.
struct SendShared {
    cli: Arc<FcopyClient>,
    file: Arc<File>,
    file_size: u64,
    chunk_size: u64,
    target: RemoteTarget,
    file_token: String,
    max_chain_len: u16,
    cur_offset: Mutex<u64>,
    error: AtomicI32,
    limiter: Option<Arc<RateLimiter>>,
}

impl SendShared {
    fn publish(&self, error: i32) {
        let _ = self
            .error
            .compare_exchange(0, error, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn failed(&self) -> bool {
        self.error.load(Ordering::SeqCst) != 0
    }
}

pub struct FileSender {
    cli: Arc<FcopyClient>,
    params: SenderParams,
    file: Option<Arc<File>>,
    file_size: u64,
    file_tokens: Vec<String>,
    send_cost: Duration,
}

fn read_full(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn send_worker(sh: Arc<SendShared>) {
    let mut buf = AlignedBuf::with_len(sh.chunk_size as usize);

    while !sh.failed() {
        let local_offset = {
            let mut cur = sh.cur_offset.lock();
            if *cur >= sh.file_size {
                break;
            }
            let offset = *cur;
            *cur += sh.chunk_size;
            offset
        };

        if let Some(limiter) = &sh.limiter {
            let left = sh.file_size - local_offset;
            limiter.acquire(left.min(sh.chunk_size)).await;
        }

        // Positional read on the blocking pool. Always request the full
        // aligned chunk; the tail read comes back short.
        let file = sh.file.clone();
        let join = tokio::task::spawn_blocking(move || {
            let ret = read_full(&file, &mut buf, local_offset);
            (buf, ret)
        })
        .await;

        let read = match join {
            Ok((returned, read)) => {
                buf = returned;
                read
            }
            Err(_) => {
                sh.publish(libc::EIO);
                return;
            }
        };

        let nbytes = match read {
            Ok(n) => n,
            Err(e) => {
                sh.publish(e.raw_os_error().unwrap_or(libc::EIO));
                break;
            }
        };

        if sh.failed() {
            break;
        }

        let req = Message::SendFileReq(SendFileReq {
            max_chain_len: sh.max_chain_len,
            compress_type: 0,
            origin_size: nbytes as u32,
            crc32: 0,
            offset: local_offset,
            file_token: sh.file_token.clone(),
        });

        let err = match sh.cli.request(&sh.target, &req, &buf[..nbytes]).await {
            Ok(resp) => resp.error as i32,
            Err(e) => e,
        };

        if err != 0 {
            debug!(
                "SendChunkFailed target:{} offset:{} error:{}",
                sh.target, local_offset, err
            );
            sh.publish(err);
            break;
        }
    }
}

impl FileSender {
    pub fn new(cli: Arc<FcopyClient>, params: SenderParams) -> FileSender {
        FileSender {
            cli,
            params,
            file: None,
            file_size: 0,
            file_tokens: Vec::new(),
            send_cost: Duration::ZERO,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn send_cost(&self) -> Duration {
        self.send_cost
    }

    pub fn speed_str(&self) -> String {
        format_bps(self.file_size, self.send_cost)
    }

    /// Open the local file and create the upload on every target, then
    /// install the forwarding topology. Returns 0 or the first error;
    /// on error the caller still runs [`FileSender::close_file`] so
    /// already-created uploads are released.
    pub async fn create_file(&mut self) -> i32 {
        if self.params.targets.is_empty() {
            return libc::EINVAL;
        }

        if self.file.is_none() {
            let path = self.params.file_path.clone();
            let direct_io = self.params.direct_io;
            let opened = tokio::task::spawn_blocking(move || {
                let mut opts = std::fs::OpenOptions::new();
                opts.read(true);
                if direct_io {
                    opts.custom_flags(libc::O_DIRECT);
                }
                let file = opts.open(&path)?;
                let size = file.metadata()?.len();
                Ok::<_, std::io::Error>((file, size))
            })
            .await
            .expect("open task");

            match opened {
                Ok((file, size)) => {
                    self.file = Some(Arc::new(file));
                    self.file_size = size;
                }
                Err(e) => return e.raw_os_error().unwrap_or(libc::EIO),
            }
        }

        let error = self.remote_open().await;
        if error != 0 {
            return error;
        }

        match self.params.send_method {
            SendMethod::Chain => self.install_topology(chain_edges(self.params.targets.len())).await,
            SendMethod::Tree => self.install_topology(tree_edges(self.params.targets.len())).await,
        }
    }

    /// Stream the file body to the root target with the configured
    /// number of workers sharing one chunk cursor.
    pub async fn send_file(&mut self) -> i32 {
        let Some(file) = self.file.clone() else {
            return libc::EBADF;
        };
        if self.file_tokens.is_empty() {
            return libc::EINVAL;
        }

        let parallel = self.params.parallel.clamp(1, MAX_PARALLEL);
        let limiter = match self.params.speed_limit {
            0 => None,
            rate => Some(Arc::new(RateLimiter::new(rate))),
        };

        let shared = Arc::new(SendShared {
            cli: self.cli.clone(),
            file,
            file_size: self.file_size,
            chunk_size: self.params.chunk_size as u64,
            target: self.params.targets[0].clone(),
            file_token: self.file_tokens[0].clone(),
            max_chain_len: self.params.targets.len() as u16,
            cur_offset: Mutex::new(0),
            error: AtomicI32::new(0),
            limiter,
        });

        let start = Instant::now();
        let mut workers = Vec::with_capacity(parallel);
        for _ in 0..parallel {
            workers.push(tokio::spawn(send_worker(shared.clone())));
        }
        for worker in workers {
            let _ = worker.await;
        }
        self.send_cost = start.elapsed();

        shared.error.load(Ordering::SeqCst)
    }

    /// Close the upload on every target that still holds a token. All
    /// targets are visited even after a failure; the first error is
    /// what gets reported.
    pub async fn close_file(&mut self) -> i32 {
        let wait_close = u8::from(self.params.wait_close);
        let mut first_error = 0;

        for i in 0..self.file_tokens.len() {
            if self.file_tokens[i].is_empty() {
                continue;
            }

            let req = Message::CloseFileReq(CloseFileReq {
                wait_close,
                file_token: self.file_tokens[i].clone(),
            });

            let error = match self.cli.request(&self.params.targets[i], &req, &[]).await {
                Ok(resp) => resp.error as i32,
                Err(e) => e,
            };

            if error != 0 {
                error!(
                    "CloseFileFailed target:{} error:{}",
                    self.params.targets[i], error
                );
                if first_error == 0 {
                    first_error = error;
                }
            } else {
                self.file_tokens[i].clear();
            }
        }

        if first_error == 0 {
            self.file_tokens.clear();
        }

        self.file = None;
        first_error
    }

    async fn remote_open(&mut self) -> i32 {
        self.file_tokens.clear();
        self.file_tokens.reserve(self.params.targets.len());

        for target in &self.params.targets {
            let req = Message::CreateFileReq(CreateFileReq {
                chunk_size: self.params.chunk_size,
                file_perm: self.params.file_perm,
                file_size: self.file_size,
                partition: self.params.partition.clone(),
                relative_path: self.params.remote_file_dir.clone(),
                file_name: self.params.remote_file_name.clone(),
            });

            let resp = match self.cli.request(target, &req, &[]).await {
                Ok(resp) => resp,
                Err(e) => return e,
            };
            if resp.error != 0 {
                return resp.error as i32;
            }
            let Message::CreateFileResp(body) = resp.message else {
                return libc::EBADMSG;
            };

            debug!("CreateFileDone target:{} token:{}", target, body.file_token);
            self.file_tokens.push(body.file_token);
        }

        0
    }

    async fn install_topology(&mut self, edges: Vec<(usize, Vec<usize>)>) -> i32 {
        for (parent, children) in edges {
            let req = Message::SetChainReq(SetChainReq {
                file_token: self.file_tokens[parent].clone(),
                targets: children
                    .iter()
                    .map(|&c| ChainTarget {
                        host: self.params.targets[c].host.clone(),
                        port: self.params.targets[c].port,
                        file_token: self.file_tokens[c].clone(),
                    })
                    .collect(),
            });

            let error = match self.cli.request(&self.params.targets[parent], &req, &[]).await {
                Ok(resp) => resp.error as i32,
                Err(e) => e,
            };
            if error != 0 {
                return error;
            }
        }

        0
    }
}

/// Humanise a byte count over a duration: `12.3456MB/s`.
pub fn format_bps(bytes: u64, cost: Duration) -> String {
    const SUFFIX: [&str; 4] = ["B", "KB", "MB", "GB"];

    let usec = cost.as_micros().max(1) as f64;
    let mut rate = bytes as f64 * 1_000_000.0 / usec;
    let mut i = 0;
    while i + 1 < SUFFIX.len() && rate >= 512.0 {
        rate /= 1024.0;
        i += 1;
    }

    format!("{:.4}{}/s", rate, SUFFIX[i])
}
