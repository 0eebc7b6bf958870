//! Structural validation of a VHD disk stream.
//!
//! Checks the leading footer, the dynamic header, sector alignment and
//! the trailing footer copy as the bytes pass through. A violation fails
//! the stream with an `InvalidData` error; the export of that disk is
//! aborted.

use crate::stream::ByteStream;
use crate::vhd::{
    DiskType, DynamicHeader, Footer, DYNAMIC_HEADER_SIZE, FOOTER_SIZE, SECTOR_SIZE,
};
use bytes::BytesMut;
use futures::StreamExt;
use std::io;

const HEAD_SIZE: usize = FOOTER_SIZE + DYNAMIC_HEADER_SIZE;

struct Validator {
    disk: String,
    head: BytesMut,
    tail: BytesMut,
    total: u64,
    footer: Option<Footer>,
    header_checked: bool,
}

impl Validator {
    fn new(disk: String) -> Self {
        Self {
            disk,
            head: BytesMut::with_capacity(HEAD_SIZE),
            tail: BytesMut::with_capacity(2 * FOOTER_SIZE),
            total: 0,
            footer: None,
            header_checked: false,
        }
    }

    fn fail(&self, message: impl Into<String>) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("vhd validation failed for disk {}: {}", self.disk, message.into()),
        )
    }

    fn feed(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.total += chunk.len() as u64;

        if self.head.len() < HEAD_SIZE {
            let take = (HEAD_SIZE - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }

        self.tail.extend_from_slice(chunk);
        if self.tail.len() > FOOTER_SIZE {
            let drop = self.tail.len() - FOOTER_SIZE;
            let _ = self.tail.split_to(drop);
        }

        if self.footer.is_none() && self.head.len() >= FOOTER_SIZE {
            let footer = Footer::parse(&self.head)
                .map_err(|e| self.fail(format!("leading footer: {e}")))?;
            self.footer = Some(footer);
        }

        if let Some(footer) = &self.footer {
            if footer.disk_type != DiskType::Fixed
                && !self.header_checked
                && self.head.len() >= HEAD_SIZE
            {
                let header = DynamicHeader::parse(&self.head[FOOTER_SIZE..])
                    .map_err(|e| self.fail(format!("dynamic header: {e}")))?;
                if header.table_offset < HEAD_SIZE as u64
                    || header.table_offset % SECTOR_SIZE as u64 != 0
                {
                    return Err(self.fail(format!(
                        "table offset {} is not sector aligned past the header",
                        header.table_offset
                    )));
                }
                if header.block_size == 0
                    || !header.block_size.is_power_of_two()
                    || header.block_size as usize % SECTOR_SIZE != 0
                {
                    return Err(self.fail(format!("invalid block size {}", header.block_size)));
                }
                self.header_checked = true;
            }
        }
        Ok(())
    }

    fn finish(&self) -> io::Result<()> {
        let footer = self
            .footer
            .as_ref()
            .ok_or_else(|| self.fail("stream shorter than a footer"))?;
        if footer.disk_type != DiskType::Fixed && !self.header_checked {
            return Err(self.fail("stream ended before the dynamic header"));
        }
        if self.total % SECTOR_SIZE as u64 != 0 {
            return Err(self.fail(format!("length {} is not sector aligned", self.total)));
        }
        let trailing = Footer::parse(&self.tail)
            .map_err(|e| self.fail(format!("trailing footer: {e}")))?;
        if trailing.disk_type != footer.disk_type || trailing.uuid != footer.uuid {
            return Err(self.fail("trailing footer does not match the leading footer"));
        }
        Ok(())
    }
}

/// Insert a validating stage on a VHD disk stream.
pub fn validate_vhd(disk: impl Into<String>, stream: ByteStream) -> ByteStream {
    struct State {
        inner: ByteStream,
        validator: Validator,
        done: bool,
    }

    let state = State {
        inner: stream,
        validator: Validator::new(disk.into()),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        match state.inner.next().await {
            Some(Ok(chunk)) => match state.validator.feed(&chunk) {
                Ok(()) => Some((Ok(chunk), state)),
                Err(err) => {
                    state.done = true;
                    Some((Err(err), state))
                }
            },
            Some(Err(err)) => {
                state.done = true;
                Some((Err(err), state))
            }
            None => {
                state.done = true;
                match state.validator.finish() {
                    Ok(()) => None,
                    Err(err) => Some((Err(err), state)),
                }
            }
        }
    }))
}
