use std::borrow::Cow;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use memchr::memchr;

/// A decoding failure, annotated with the byte offset it occurred at. The
/// embedder is expected to add the file context when converting this into
/// its own error type ("path: offset: message").
#[derive(Debug, Clone)]
pub struct BufferError {
    pub offset: usize,
    pub message: Cow<'static, str>,
}

/// Bounds-checked sequential reader over a borrowed byte span.
///
/// Integer reads honor the buffer's byte order; everything else is
/// endian-agnostic. All reads advance the cursor only on success. The reader
/// itself never allocates.
pub struct BinaryBuffer<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> BinaryBuffer<'a> {
    pub fn new(data: &'a [u8], little_endian: bool) -> Self {
        BinaryBuffer {
            data,
            pos: 0,
            little_endian,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Jump to an absolute offset. `pos == len` is allowed; it leaves the
    /// buffer exhausted.
    pub fn set_pos(&mut self, pos: usize) -> Result<(), BufferError> {
        if pos > self.data.len() {
            return Err(self.error_at(pos, "offset is out of bounds"));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        self.take(n)?;
        Ok(())
    }

    pub fn next_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn next_u32(&mut self) -> Result<u32, BufferError> {
        let bytes = self.take(4)?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    /// Read a NUL-terminated string, consuming the terminator. The returned
    /// slice excludes the NUL.
    pub fn next_string(&mut self) -> Result<&'a [u8], BufferError> {
        match memchr(0, self.remaining()) {
            Some(len) => {
                let s = &self.data[self.pos..self.pos + len];
                self.pos += len + 1;
                Ok(s)
            }
            None => Err(self.error("expected NUL-terminated string")),
        }
    }

    /// An error at the current position, for format violations discovered by
    /// the embedder.
    pub fn error(&self, message: impl Into<Cow<'static, str>>) -> BufferError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, offset: usize, message: impl Into<Cow<'static, str>>) -> BufferError {
        BufferError {
            offset,
            message: message.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BufferError> {
        if n > self.data.len() - self.pos {
            return Err(self.error("unexpected end of data"));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }
}
