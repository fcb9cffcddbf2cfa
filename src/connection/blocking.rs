//! 阻塞协议库（suppaftp / ssh2）与 async 字节流之间的桥接

use super::ByteStream;
use crate::error::{Result, TransferError};
use bytes::Bytes;
use futures::StreamExt;
use std::io::{self, Read};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// 单次读取块大小
pub const CHUNK_SIZE: usize = 64 * 1024;
/// 通道中最多缓存的块数
pub const STREAM_BUFFER: usize = 8;

/// 创建读取通道：blocking 线程写入 Sender，调用方得到 ByteStream
pub fn read_channel() -> (mpsc::Sender<Result<Bytes>>, ByteStream) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    (tx, Box::pin(ReceiverStream::new(rx)))
}

/// 把同步 reader 的内容按块推送到通道
///
/// 返回 `Ok(false)` 表示接收端已丢弃，调用方应停止读取。
pub fn pump<R: Read>(reader: &mut R, tx: &mpsc::Sender<Result<Bytes>>) -> io::Result<bool> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
            return Ok(false);
        }
    }
}

/// 基于通道的同步 reader，供 blocking 线程中的上传使用
pub struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    pub fn channel() -> (mpsc::Sender<io::Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (
            tx,
            Self {
                rx,
                current: Bytes::new(),
            },
        )
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

/// 将 async 字节流转发给 ChannelReader
///
/// 源端出错时先把错误送入通道，让上传中止而不是把截断的内容当作完整文件，
/// 然后返回该错误。接收端提前关闭（上传已失败）时静默结束。
pub async fn feed(mut stream: ByteStream, tx: mpsc::Sender<io::Result<Bytes>>) -> Result<()> {
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.clone()))).await;
                return Err(e);
            }
        }
    }
    Ok(())
}

/// blocking 任务 panic 或被取消
pub fn join_error(op: &'static str, path: &str, e: tokio::task::JoinError) -> TransferError {
    TransferError::remote_io(op, path, format!("后台任务异常: {}", e))
}
