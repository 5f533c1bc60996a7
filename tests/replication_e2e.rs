//! End-to-end replication over loopback: real services, real sockets,
//! real files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fcopy::client::{ClientParams, FcopyClient};
use fcopy::message::{
    read_packet, write_packet, CloseFileReq, CreateFileReq, Message, SendFileReq, SetChainReq,
};
use fcopy::protocol::DEFAULT_SIZE_LIMIT;
use fcopy::sender::{FileSender, SendMethod, SenderParams};
use fcopy::service::{Service, ServiceParams};
use fcopy::target::ChainTarget;

fn write_patterned(path: &Path, size: usize) -> Result<()> {
    use std::io::Write;

    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

async fn start_node(dir: &Path) -> Service {
    Service::start(ServiceParams {
        default_partition: dir.to_path_buf(),
        direct_io: false,
        ..Default::default()
    })
    .await
    .expect("start node")
}

fn sender_params(
    file: &Path,
    remote_name: &str,
    nodes: &[&Service],
    chunk_size: u32,
    parallel: usize,
    send_method: SendMethod,
) -> SenderParams {
    SenderParams {
        file_path: file.to_path_buf(),
        remote_file_name: remote_name.into(),
        chunk_size,
        parallel,
        send_method,
        direct_io: false,
        targets: nodes.iter().map(|n| n.target()).collect(),
        ..Default::default()
    }
}

async fn upload(params: SenderParams) -> i32 {
    let cli = Arc::new(FcopyClient::new(ClientParams::default()));
    let mut sender = FileSender::new(cli, params);

    let mut error = sender.create_file().await;
    if error == 0 {
        error = sender.send_file().await;
    }
    let close_error = sender.close_file().await;

    if error != 0 {
        error
    } else {
        close_error
    }
}

fn assert_replica(src: &Path, root: &Path, name: &str) {
    let source = std::fs::read(src).expect("read source");
    let replica = std::fs::read(root.join(name)).expect("read replica");
    assert_eq!(replica.len(), source.len(), "size mismatch at {:?}", root);
    assert_eq!(replica, source, "content mismatch at {:?}", root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_target_parallel_workers() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let src = src_dir.path().join("one.bin");
    write_patterned(&src, 1 << 20)?;

    let node = start_node(dst.path()).await;
    let params = sender_params(&src, "one.bin", &[&node], 65536, 4, SendMethod::Chain);
    assert_eq!(upload(params).await, 0);

    assert_replica(&src, dst.path(), "one.bin");
    assert_eq!(std::fs::metadata(dst.path().join("one.bin"))?.len(), 1 << 20);

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_chain() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("chain.bin");
    write_patterned(&src, 10 << 20)?;

    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut nodes = Vec::new();
    for dir in &dirs {
        nodes.push(start_node(dir.path()).await);
    }

    let params = sender_params(
        &src,
        "chain.bin",
        &nodes.iter().collect::<Vec<_>>(),
        1 << 20,
        8,
        SendMethod::Chain,
    );
    assert_eq!(upload(params).await, 0);

    for dir in &dirs {
        assert_replica(&src, dir.path(), "chain.bin");
    }

    for node in nodes {
        node.stop().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seven_node_tree() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("tree.bin");
    write_patterned(&src, 4 << 20)?;

    let dirs: Vec<_> = (0..7).map(|_| tempfile::tempdir().unwrap()).collect();
    let mut nodes = Vec::new();
    for dir in &dirs {
        nodes.push(start_node(dir.path()).await);
    }

    let params = sender_params(
        &src,
        "tree.bin",
        &nodes.iter().collect::<Vec<_>>(),
        1 << 20,
        4,
        SendMethod::Tree,
    );
    assert_eq!(upload(params).await, 0);

    // Root, both internal nodes, and every leaf hold the full file.
    for dir in &dirs {
        assert_replica(&src, dir.path(), "tree.bin");
    }

    for node in nodes {
        node.stop().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unaligned_final_chunk_is_trimmed() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let src = src_dir.path().join("odd.bin");
    write_patterned(&src, 100_000)?;

    let node = start_node(dst.path()).await;
    let params = sender_params(&src, "odd.bin", &[&node], 65536, 2, SendMethod::Chain);
    assert_eq!(upload(params).await, 0);

    // Two chunks: 65536 + 34464. The server writes the padded tail and
    // the close trims it back to the byte.
    assert_eq!(std::fs::metadata(dst.path().join("odd.bin"))?.len(), 100_000);
    assert_replica(&src, dst.path(), "odd.bin");

    node.stop().await;
    Ok(())
}

async fn create_remote(
    cli: &FcopyClient,
    node: &Service,
    name: &str,
    file_size: u64,
) -> String {
    let req = Message::CreateFileReq(CreateFileReq {
        chunk_size: 8192,
        file_size,
        relative_path: ".".into(),
        file_name: name.into(),
        ..Default::default()
    });
    let resp = cli.request(&node.target(), &req, &[]).await.unwrap();
    assert_eq!(resp.error, 0);
    let Message::CreateFileResp(body) = resp.message else {
        panic!("bad response type");
    };
    body.file_token
}

async fn set_chain(
    cli: &FcopyClient,
    parent: &Service,
    parent_token: &str,
    child: &Service,
    child_token: &str,
) {
    let req = Message::SetChainReq(SetChainReq {
        file_token: parent_token.into(),
        targets: vec![ChainTarget {
            host: "127.0.0.1".into(),
            port: child.local_addr().port(),
            file_token: child_token.into(),
        }],
    });
    let resp = cli.request(&parent.target(), &req, &[]).await.unwrap();
    assert_eq!(resp.error, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_hop_budget_cancels_mid_chain() -> Result<()> {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let a = start_node(dirs[0].path()).await;
    let b = start_node(dirs[1].path()).await;
    let c = start_node(dirs[2].path()).await;

    let cli = FcopyClient::new(ClientParams::default());
    let ta = create_remote(&cli, &a, "hop.bin", 8192).await;
    let tb = create_remote(&cli, &b, "hop.bin", 8192).await;
    let tc = create_remote(&cli, &c, "hop.bin", 8192).await;

    set_chain(&cli, &a, &ta, &b, &tb).await;
    set_chain(&cli, &b, &tb, &c, &tc).await;

    // A buggy client sized the hop budget for two nodes, not three. A
    // forwards to B with max_chain_len = 1; B still has a child and
    // refuses; A reports B's error upstream.
    let req = Message::SendFileReq(SendFileReq {
        max_chain_len: 2,
        origin_size: 8192,
        offset: 0,
        file_token: ta.clone(),
        ..Default::default()
    });
    let data = vec![0xA5u8; 8192];
    let resp = cli.request(&a.target(), &req, &data).await.unwrap();
    assert_eq!(resp.error as i32, -libc::ECANCELED);

    // A correctly sized budget goes through.
    let req = Message::SendFileReq(SendFileReq {
        max_chain_len: 3,
        origin_size: 8192,
        offset: 0,
        file_token: ta.clone(),
        ..Default::default()
    });
    let resp = cli.request(&a.target(), &req, &data).await.unwrap();
    assert_eq!(resp.error, 0);

    for (node, token) in [(a, ta), (b, tb), (c, tc)] {
        let req = Message::CloseFileReq(CloseFileReq {
            wait_close: 1,
            file_token: token,
        });
        let resp = cli.request(&node.target(), &req, &[]).await.unwrap();
        assert_eq!(resp.error, 0);
        node.stop().await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deferred_close_still_closes() -> Result<()> {
    let src_dir = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let src = src_dir.path().join("defer.bin");
    write_patterned(&src, 100_000)?;

    let node = start_node(dst.path()).await;
    let mut params = sender_params(&src, "defer.bin", &[&node], 65536, 2, SendMethod::Chain);
    params.wait_close = false;
    assert_eq!(upload(params).await, 0);

    // The reply does not wait for the ftruncate, so poll for the trim.
    let path = dst.path().join("defer.bin");
    let mut size = 0;
    for _ in 0..50 {
        size = std::fs::metadata(&path)?.len();
        if size == 100_000 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(size, 100_000);

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrecognised_command_gets_unknown_reply() -> Result<()> {
    let dst = tempfile::tempdir()?;
    let node = start_node(dst.path()).await;

    let mut stream = tokio::net::TcpStream::connect(node.local_addr()).await?;
    write_packet(&mut stream, &Message::Unknown, 0, &[]).await?;
    let resp = read_packet(&mut stream, DEFAULT_SIZE_LIMIT)
        .await?
        .expect("reply");
    assert_eq!(resp.message, Message::Unknown);
    assert_eq!(resp.error, 0);

    node.stop().await;
    Ok(())
}
