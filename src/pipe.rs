// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs::File;
use std::io;
use std::os::unix::io::OwnedFd;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::unix::pipe::Receiver;

use crate::Error;

/// Stdio for a child, stdout and stderr share the same write end
pub struct StdIoConf {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

/// A pipe carrying the combined stdout and stderr of one child
#[derive(Debug)]
pub struct OutputPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl OutputPipe {
    /// Creates a new pipe, both ends atomically close-on-exec.
    ///
    /// Only the duplicates installed as the child's stdout and stderr survive the exec, so
    /// no other child ever holds this pipe open.
    pub fn new() -> Result<Self, Error> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self { read, write })
    }

    /// Splits into the async reader for the parent and the stdio for the child.
    ///
    /// The returned `StdIoConf` owns the only parent side copies of the write end, it must be
    /// dropped after spawning or the reader never sees EOF. Must be called within a tokio runtime.
    pub fn split(self) -> Result<(OutputReader, StdIoConf), Error> {
        let OutputPipe { read, write } = self;

        let stderr = write.try_clone()?;
        let stdio = StdIoConf {
            stdin: Stdio::null(),
            stdout: Stdio::from(write),
            stderr: Stdio::from(stderr),
        };

        Ok((OutputReader::from_owned_fd(read)?, stdio))
    }
}

/// Read end of an `OutputPipe`, registered with the tokio reactor
#[derive(Debug)]
pub struct OutputReader {
    pipe: Receiver,
}

impl OutputReader {
    fn from_owned_fd(fd: OwnedFd) -> Result<Self, Error> {
        // checks that this is a readable fifo and sets O_NONBLOCK
        Ok(Self {
            pipe: Receiver::from_file(File::from(fd))?,
        })
    }
}

impl AsyncRead for OutputReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let pipe = Pin::new(&mut self.pipe);
        pipe.poll_read(cx, buf)
    }
}
