//! Framed request/response messages
//!
//! A message is a 16-byte big-endian header, a command-specific body,
//! and an optional out-of-band data section for chunk payloads. The
//! data section is kept out of the body so the receiver can land it in
//! an aligned buffer and hand it straight to direct I/O.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::AlignedBuf;
use crate::protocol::{Command, HEADER_SIZE, MAGIC, VERSION};
use crate::target::ChainTarget;

/// Decode failure classes, mapped onto the errno the wire contract
/// names for each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Bad magic/version, unknown command, or a body that does not
    /// decode exactly.
    BadMessage,
    /// `16 + body_len + data_len` exceeds the configured limit.
    TooLarge,
}

impl FrameError {
    pub fn errno(self) -> i32 {
        match self {
            FrameError::BadMessage => libc::EBADMSG,
            FrameError::TooLarge => libc::EMSGSIZE,
        }
    }

    fn into_io(self) -> io::Error {
        io::Error::from_raw_os_error(self.errno())
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Cursor over a body buffer. Every read checks bounds; decoders must
/// consume the body exactly.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.pos + n > self.buf.len() {
            return Err(FrameError::BadMessage);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let n = self.u32()? as usize;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::BadMessage)
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateFileReq {
    pub chunk_size: u32,
    /// 0 keeps the server default mode.
    pub file_perm: u32,
    pub file_size: u64,
    /// Empty selects the server's default partition.
    pub partition: String,
    pub relative_path: String,
    pub file_name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateFileResp {
    pub file_token: String,
}

/// Chunk header; the payload itself travels in the frame's data section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendFileReq {
    /// TTL-like hop budget; decremented on every forward.
    pub max_chain_len: u16,
    /// Reserved, sent as zero.
    pub compress_type: u16,
    pub origin_size: u32,
    /// Reserved, sent as zero.
    pub crc32: u32,
    pub offset: u64,
    pub file_token: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloseFileReq {
    /// 1 = close before replying, 0 = reply then close.
    pub wait_close: u8,
    pub file_token: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteFileReq {
    pub file_token: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetChainReq {
    pub file_token: String,
    pub targets: Vec<ChainTarget>,
}

/// Decoded message, one variant per command.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Unknown,

    CreateFileReq(CreateFileReq),
    SendFileReq(SendFileReq),
    CloseFileReq(CloseFileReq),
    DeleteFileReq(DeleteFileReq),
    SetChainReq(SetChainReq),

    CreateFileResp(CreateFileResp),
    SendFileResp,
    CloseFileResp,
    DeleteFileResp,
    SetChainResp,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Unknown => Command::Unknown,
            Message::CreateFileReq(_) => Command::CreateFileReq,
            Message::SendFileReq(_) => Command::SendFileReq,
            Message::CloseFileReq(_) => Command::CloseFileReq,
            Message::DeleteFileReq(_) => Command::DeleteFileReq,
            Message::SetChainReq(_) => Command::SetChainReq,
            Message::CreateFileResp(_) => Command::CreateFileResp,
            Message::SendFileResp => Command::SendFileResp,
            Message::CloseFileResp => Command::CloseFileResp,
            Message::DeleteFileResp => Command::DeleteFileResp,
            Message::SetChainResp => Command::SetChainResp,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::Unknown
            | Message::SendFileResp
            | Message::CloseFileResp
            | Message::DeleteFileResp
            | Message::SetChainResp => {}

            Message::CreateFileReq(m) => {
                put_u32(out, m.chunk_size);
                put_u32(out, m.file_perm);
                put_u64(out, m.file_size);
                put_str(out, &m.partition);
                put_str(out, &m.relative_path);
                put_str(out, &m.file_name);
            }
            Message::CreateFileResp(m) => {
                put_str(out, &m.file_token);
            }
            Message::SendFileReq(m) => {
                put_u16(out, m.max_chain_len);
                put_u16(out, m.compress_type);
                put_u32(out, m.origin_size);
                put_u32(out, m.crc32);
                put_u64(out, m.offset);
                put_str(out, &m.file_token);
            }
            Message::CloseFileReq(m) => {
                out.push(m.wait_close);
                put_str(out, &m.file_token);
            }
            Message::DeleteFileReq(m) => {
                put_str(out, &m.file_token);
            }
            Message::SetChainReq(m) => {
                put_str(out, &m.file_token);
                put_u32(out, m.targets.len() as u32);
                for t in &m.targets {
                    put_str(out, &t.host);
                    put_u16(out, t.port);
                    put_str(out, &t.file_token);
                }
            }
        }
    }

    fn decode_body(cmd: Command, body: &[u8]) -> Result<Message, FrameError> {
        let mut r = Reader::new(body);

        let msg = match cmd {
            Command::Unknown => Message::Unknown,
            Command::SendFileResp => Message::SendFileResp,
            Command::CloseFileResp => Message::CloseFileResp,
            Command::DeleteFileResp => Message::DeleteFileResp,
            Command::SetChainResp => Message::SetChainResp,

            Command::CreateFileReq => Message::CreateFileReq(CreateFileReq {
                chunk_size: r.u32()?,
                file_perm: r.u32()?,
                file_size: r.u64()?,
                partition: r.string()?,
                relative_path: r.string()?,
                file_name: r.string()?,
            }),
            Command::CreateFileResp => Message::CreateFileResp(CreateFileResp {
                file_token: r.string()?,
            }),
            Command::SendFileReq => Message::SendFileReq(SendFileReq {
                max_chain_len: r.u16()?,
                compress_type: r.u16()?,
                origin_size: r.u32()?,
                crc32: r.u32()?,
                offset: r.u64()?,
                file_token: r.string()?,
            }),
            Command::CloseFileReq => Message::CloseFileReq(CloseFileReq {
                wait_close: r.u8()?,
                file_token: r.string()?,
            }),
            Command::DeleteFileReq => Message::DeleteFileReq(DeleteFileReq {
                file_token: r.string()?,
            }),
            Command::SetChainReq => {
                let file_token = r.string()?;
                let count = r.u32()?;
                let mut targets = Vec::with_capacity(count.min(16) as usize);
                for _ in 0..count {
                    targets.push(ChainTarget {
                        host: r.string()?,
                        port: r.u16()?,
                        file_token: r.string()?,
                    });
                }
                Message::SetChainReq(SetChainReq {
                    file_token,
                    targets,
                })
            }
        };

        if !r.done() {
            return Err(FrameError::BadMessage);
        }

        Ok(msg)
    }
}

/// One full frame: header error code, decoded body, and the out-of-band
/// data payload (empty for everything but SEND_FILE_REQ).
#[derive(Debug)]
pub struct Packet {
    pub error: i16,
    pub message: Message,
    pub data: AlignedBuf,
}

impl Packet {
    pub fn new(message: Message) -> Packet {
        Packet::with_error(message, 0)
    }

    pub fn with_error(message: Message, error: i16) -> Packet {
        Packet {
            error,
            message,
            data: AlignedBuf::with_len(0),
        }
    }

    /// Encode header + body into one contiguous buffer. The data
    /// payload is not copied here; the caller writes `data` right after
    /// these bytes.
    pub fn encode_head(message: &Message, error: i16, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        message.encode_body(&mut body);

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        put_u16(&mut out, MAGIC);
        put_u16(&mut out, VERSION);
        put_u16(&mut out, message.command() as u16);
        put_i16(&mut out, error);
        put_u32(&mut out, body.len() as u32);
        put_u32(&mut out, data.len() as u32);
        out.extend_from_slice(&body);
        out
    }
}

enum CodecState {
    Head,
    Payload {
        command: Command,
        error: i16,
        body_len: usize,
        body: Vec<u8>,
        data: AlignedBuf,
        data_pos: usize,
    },
}

/// Incremental frame parser: feed it raw stream bytes, get back a
/// [`Packet`] once header, body and data have all arrived. The data
/// section lands directly in an aligned buffer sized from the header.
pub struct FrameCodec {
    limit: usize,
    head: Vec<u8>,
    state: CodecState,
}

impl FrameCodec {
    pub fn new(limit: usize) -> FrameCodec {
        FrameCodec {
            limit,
            head: Vec::with_capacity(HEADER_SIZE),
            state: CodecState::Head,
        }
    }

    /// Bytes still required to finish the current frame. Exact once the
    /// header has been consumed; before that, the remainder of the
    /// header itself.
    pub fn needed(&self) -> usize {
        match &self.state {
            CodecState::Head => HEADER_SIZE - self.head.len(),
            CodecState::Payload {
                body_len,
                body,
                data,
                data_pos,
                ..
            } => (body_len - body.len()) + (data.len() - data_pos),
        }
    }

    fn decode_head(&mut self) -> Result<(), FrameError> {
        let h = &self.head;
        let magic = u16::from_be_bytes([h[0], h[1]]);
        let version = u16::from_be_bytes([h[2], h[3]]);
        let command = u16::from_be_bytes([h[4], h[5]]);
        let error = i16::from_be_bytes([h[6], h[7]]);
        let body_len = u32::from_be_bytes(h[8..12].try_into().unwrap()) as usize;
        let data_len = u32::from_be_bytes(h[12..16].try_into().unwrap()) as usize;

        if magic != MAGIC || version != VERSION {
            return Err(FrameError::BadMessage);
        }
        let command = Command::from_u16(command).ok_or(FrameError::BadMessage)?;
        if HEADER_SIZE + body_len + data_len > self.limit {
            return Err(FrameError::TooLarge);
        }

        self.state = CodecState::Payload {
            command,
            error,
            body_len,
            body: Vec::with_capacity(body_len),
            data: AlignedBuf::with_len(data_len),
            data_pos: 0,
        };
        Ok(())
    }

    /// Consume bytes from `buf`, returning how many were used and the
    /// completed packet, if any. Unconsumed bytes belong to the next
    /// frame; the codec resets itself after completing one.
    pub fn append(&mut self, buf: &[u8]) -> Result<(usize, Option<Packet>), FrameError> {
        let mut consumed = 0;

        if let CodecState::Head = self.state {
            let n = (HEADER_SIZE - self.head.len()).min(buf.len());
            self.head.extend_from_slice(&buf[..n]);
            consumed += n;

            if self.head.len() < HEADER_SIZE {
                return Ok((consumed, None));
            }
            self.decode_head()?;
        }

        let CodecState::Payload {
            command,
            error,
            body_len,
            body,
            data,
            data_pos,
        } = &mut self.state
        else {
            unreachable!()
        };

        if body.len() < *body_len {
            let n = (*body_len - body.len()).min(buf.len() - consumed);
            body.extend_from_slice(&buf[consumed..consumed + n]);
            consumed += n;

            if body.len() < *body_len {
                return Ok((consumed, None));
            }
        }

        if *data_pos < data.len() {
            let n = (data.len() - *data_pos).min(buf.len() - consumed);
            data[*data_pos..*data_pos + n].copy_from_slice(&buf[consumed..consumed + n]);
            *data_pos += n;
            consumed += n;

            if *data_pos < data.len() {
                return Ok((consumed, None));
            }
        }

        let message = Message::decode_body(*command, body)?;
        let error = *error;
        let data = std::mem::replace(data, AlignedBuf::with_len(0));

        self.head.clear();
        self.state = CodecState::Head;

        Ok((
            consumed,
            Some(Packet {
                error,
                message,
                data,
            }),
        ))
    }
}

/// Write one frame: header + body, then the data payload.
pub async fn write_packet<W>(
    w: &mut W,
    message: &Message,
    error: i16,
    data: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = Packet::encode_head(message, error, data);
    w.write_all(&head).await?;
    if !data.is_empty() {
        w.write_all(data).await?;
    }
    w.flush().await
}

/// Read one frame. `Ok(None)` means the peer closed the connection
/// cleanly at a frame boundary. Frame errors surface as raw-os errors
/// (`EBADMSG`/`EMSGSIZE`).
pub async fn read_packet<R>(r: &mut R, limit: usize) -> io::Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = r.read(&mut head[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }

    let mut codec = FrameCodec::new(limit);
    let (_, done) = codec.append(&head).map_err(FrameError::into_io)?;
    if let Some(packet) = done {
        return Ok(Some(packet));
    }

    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let want = codec.needed().min(chunk.len());
        r.read_exact(&mut chunk[..want]).await?;
        let (_, done) = codec.append(&chunk[..want]).map_err(FrameError::into_io)?;
        if let Some(packet) = done {
            return Ok(Some(packet));
        }
    }
}
