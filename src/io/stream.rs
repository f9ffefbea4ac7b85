//! Length-delimited row streams.
//!
//! Each record is a LEB128 varint byte length followed by a postcard-encoded
//! [`Row`]. Positions are plain byte offsets, so a [`StreamInterval`] taken
//! from a checkpoint can be handed to [`RowStreamReader::seek_to`] directly.
//!
//! [`StreamInterval`]: super::checkpoint::StreamInterval

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;

use crate::value::Row;

/// Longest varint a `u64` length can take.
const MAX_VARINT_LEN: usize = 10;

/// Errors raised while reading or writing a row stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),

    /// A record length prefix is malformed.
    #[error("invalid length prefix at byte {0}")]
    InvalidLength(u64),

    /// The stream ended inside a record.
    #[error("stream truncated at byte {position}: expected {expected} more bytes")]
    Truncated { position: u64, expected: usize },
}

fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> io::Result<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    writer.write_all(&buf[..len])?;
    Ok(len)
}

/// Appends rows to an underlying writer, tracking the byte position.
pub struct RowStreamWriter<W> {
    inner: W,
    position: u64,
}

impl<W: Write> RowStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write one row and return the offset it starts at.
    pub fn write_row(&mut self, row: &Row) -> Result<u64, StreamError> {
        let start = self.position;
        let body = postcard::to_allocvec(row)?;
        let prefix = write_varint(&mut self.inner, body.len() as u64)?;
        self.inner.write_all(&body)?;
        self.position += (prefix + body.len()) as u64;
        Ok(start)
    }

    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads rows back from a stream written by [`RowStreamWriter`].
pub struct RowStreamReader<R> {
    inner: R,
    position: u64,
    buf: Vec<u8>,
}

impl<R: Read> RowStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            position: 0,
            buf: Vec::new(),
        }
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next row, or `None` at a clean end of stream.
    pub fn read_row(&mut self) -> Result<Option<Row>, StreamError> {
        let start = self.position;
        let Some((len, prefix)) = self.read_varint()? else {
            return Ok(None);
        };
        let len = usize::try_from(len).map_err(|_| StreamError::InvalidLength(start))?;

        self.buf.clear();
        let read = (&mut self.inner).take(len as u64).read_to_end(&mut self.buf)?;
        if read != len {
            return Err(StreamError::Truncated {
                position: start,
                expected: len - read,
            });
        }
        let row = postcard::from_bytes(&self.buf)?;
        self.position = start + (prefix + len) as u64;
        Ok(Some(row))
    }

    /// Read until end of stream.
    pub fn read_all(&mut self) -> Result<Vec<Row>, StreamError> {
        let mut rows = Vec::new();
        while let Some(row) = self.read_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_varint(&mut self) -> Result<Option<(u64, usize)>, StreamError> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let mut byte = [0u8; 1];
            if self.inner.read(&mut byte)? == 0 {
                if i == 0 {
                    return Ok(None);
                }
                return Err(StreamError::Truncated {
                    position: self.position,
                    expected: 1,
                });
            }
            value |= u64::from(byte[0] & 0x7f) << (7 * i);
            if byte[0] & 0x80 == 0 {
                return Ok(Some((value, i + 1)));
            }
        }
        Err(StreamError::InvalidLength(self.position))
    }
}

impl<R: Read + Seek> RowStreamReader<R> {
    /// Jump to a record boundary previously returned by the writer.
    pub fn seek_to(&mut self, position: u64) -> Result<(), StreamError> {
        self.inner.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::value::Diff;

    fn row(id: u64) -> Row {
        Row::new(id, Diff::none())
    }

    #[test]
    fn varint_prefix_lengths() {
        let mut buf = Vec::new();
        assert_eq!(write_varint(&mut buf, 0).unwrap(), 1);
        assert_eq!(write_varint(&mut buf, 300).unwrap(), 2);
        assert_eq!(buf, vec![0x00, 0xac, 0x02]);
    }

    #[test]
    fn offsets_allow_seeking() {
        let mut writer = RowStreamWriter::new(Vec::new());
        let offsets: Vec<u64> = (0..5).map(|id| writer.write_row(&row(id)).unwrap()).collect();
        assert_eq!(offsets[0], 0);
        let bytes = writer.into_inner();

        let mut reader = RowStreamReader::new(Cursor::new(bytes));
        reader.seek_to(offsets[3]).unwrap();
        assert_eq!(reader.read_row().unwrap().map(|r| r.id), Some(3));
        assert_eq!(reader.position(), offsets[4]);
        assert_eq!(reader.read_row().unwrap().map(|r| r.id), Some(4));
        assert!(reader.read_row().unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut writer = RowStreamWriter::new(Vec::new());
        writer.write_row(&row(7)).unwrap();
        let mut bytes = writer.into_inner();
        bytes.pop();

        let mut reader = RowStreamReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_row(),
            Err(StreamError::Truncated { position: 0, .. })
        ));
    }
}
