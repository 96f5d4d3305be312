// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use tracing::debug;

use crate::procs::WorkerHandle;
use crate::Error;

/// Destination shared by all worker output readers
///
/// Each call receives one complete, labeled line, which must reach the underlying output
/// without being interleaved with any other line.
#[async_trait]
pub trait LineSink: Send + Sync {
    async fn write_line(&self, line: &[u8]) -> io::Result<()>;
}

/// A `LineSink` that serializes writers on a mutex, flushing after every line
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl WriterSink<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl WriterSink<Vec<u8>> {
    /// Everything written so far
    pub async fn contents(&self) -> Vec<u8> {
        self.writer.lock().await.clone()
    }
}

#[async_trait]
impl<W> LineSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await
    }
}

/// `[label] line\n`, the line's own terminator (`\n` or `\r\n`) is normalized
pub fn format_line(label: &str, line: &[u8]) -> Vec<u8> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let mut out = Vec::with_capacity(label.len() + line.len() + 4);
    out.push(b'[');
    out.extend_from_slice(label.as_bytes());
    out.extend_from_slice(b"] ");
    out.extend_from_slice(line);
    out.push(b'\n');
    out
}

/// Copy `reader` to `sink` line by line until EOF, returning the number of lines
pub async fn forward<R>(label: &str, reader: R, sink: &dyn LineSink) -> Result<u64, Error>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        sink.write_line(&format_line(label, &buf)).await?;
        lines += 1;
    }

    debug!("{}: output closed", label);
    Ok(lines)
}

/// Spawn the reader task for `handle`'s output.
///
/// The task owns only the read end of the pipe and a copy of the label, it ends when the
/// worker (and anything it passed its stdout to) has exited.
pub fn attach(handle: &mut WorkerHandle, sink: Arc<dyn LineSink>) -> Result<(), Error> {
    let output = handle
        .take_output()
        .ok_or("output of this worker is already attached")?;
    let label = handle.label().to_string();

    let reader = tokio::spawn(async move { forward(&label, output, &*sink).await });
    handle.set_reader(reader);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_format_line() {
        assert_eq!(format_line("a.cfg", b"ready\n"), b"[a.cfg] ready\n".to_vec());
        assert_eq!(format_line("a.cfg", b"ready\r\n"), b"[a.cfg] ready\n".to_vec());
        assert_eq!(format_line("a.cfg", b"no newline"), b"[a.cfg] no newline\n".to_vec());
        assert_eq!(format_line("a.cfg", b"\n"), b"[a.cfg] \n".to_vec());
    }

    #[tokio::test]
    async fn test_forward() {
        let sink = WriterSink::new(Vec::new());
        let input: &[u8] = b"one\ntwo\n\xff\xfe\nlast";

        let count = forward("bot.env", input, &sink).await.expect("forward failed");
        assert_eq!(count, 4);
        assert_eq!(
            sink.contents().await,
            b"[bot.env] one\n[bot.env] two\n[bot.env] \xff\xfe\n[bot.env] last\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_concurrent_lines_are_not_split() {
        let sink = Arc::new(WriterSink::new(Vec::new()));
        let long = "x".repeat(64 * 1024);
        let input = format!("{}\n", long).repeat(8).into_bytes();

        let tasks: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|&label| {
                let sink = Arc::clone(&sink);
                let input = input.clone();
                tokio::spawn(async move { forward(label, &input[..], &*sink).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.expect("join").expect("forward"), 8);
        }

        let contents = sink.contents().await;
        let lines = lines(&contents);
        assert_eq!(lines.len(), 32);
        for line in lines {
            let rest = ["[a] ", "[b] ", "[c] ", "[d] "]
                .iter()
                .find_map(|prefix| line.strip_prefix(prefix))
                .expect("missing label");
            assert_eq!(rest, long);
        }
    }
}
