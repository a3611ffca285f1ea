//! Verified reads: a stream wrapper that enforces a descriptor's declared
//! size and digest.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::descriptor::Descriptor;
use crate::digest::{Digester, Verifier};
use crate::errors::{ContentError, Result};

/// The first terminal error seen by a [`VerifyReader`], replayed on every
/// subsequent read.
#[derive(Clone, Debug)]
enum Sticky {
    UnexpectedEof { read: u64, expected: u64 },
    Io(io::ErrorKind, String),
}

impl Sticky {
    fn to_content_error(&self) -> ContentError {
        match self {
            Sticky::UnexpectedEof { read, expected } => ContentError::UnexpectedEof {
                read: *read,
                expected: *expected,
            },
            Sticky::Io(kind, msg) => ContentError::Io(io::Error::new(*kind, msg.clone())),
        }
    }

    fn to_io_error(&self) -> io::Error {
        match self {
            Sticky::UnexpectedEof { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, self.to_content_error())
            }
            Sticky::Io(kind, msg) => io::Error::new(*kind, msg.clone()),
        }
    }
}

/// Wraps a reader so that at most `desc.size` bytes can be read, every byte
/// is fed to a digester, and [`VerifyReader::verify`] can attest that the
/// stream matched the descriptor exactly.
///
/// Reads past the declared size return end-of-stream; a source that ends
/// early surfaces `unexpected end of stream` instead of a silent short read.
pub struct VerifyReader<R> {
    inner: R,
    verifier: Verifier,
    expected: u64,
    read: u64,
    sticky: Option<Sticky>,
    verified: bool,
}

impl<R: AsyncRead + Unpin> VerifyReader<R> {
    /// Creates a verifying reader for `desc`. Fails if the descriptor
    /// declares a negative size.
    pub fn new(inner: R, desc: &Descriptor) -> Result<VerifyReader<R>> {
        if desc.size < 0 {
            return Err(ContentError::InvalidDescriptorSize(desc.size));
        }
        Ok(VerifyReader {
            inner,
            verifier: Verifier::new(desc.digest.clone()),
            expected: desc.size as u64,
            read: 0,
            sticky: None,
            verified: false,
        })
    }

    /// Creates a verifying reader that continues a partially transferred
    /// blob: `digester` must already hold the hash state of the first
    /// `offset` bytes, and only `desc.size - offset` more bytes are accepted.
    pub fn resume(inner: R, desc: &Descriptor, digester: Digester, offset: u64) -> Result<VerifyReader<R>> {
        if desc.size < 0 {
            return Err(ContentError::InvalidDescriptorSize(desc.size));
        }
        Ok(VerifyReader {
            inner,
            verifier: Verifier::resume(desc.digest.clone(), digester),
            expected: desc.size as u64,
            read: offset,
            sticky: None,
            verified: false,
        })
    }

    /// Confirms the stream matched the descriptor.
    ///
    /// May only be called once the declared size has been fully read. It
    /// probes the source for one extra byte to rule out trailing data, then
    /// checks the digest. Success is latched; later calls are no-ops.
    pub async fn verify(&mut self) -> Result<()> {
        if self.verified {
            return Ok(());
        }
        if let Some(sticky) = &self.sticky {
            return Err(sticky.to_content_error());
        }
        if self.read < self.expected {
            return Err(ContentError::EarlyVerify {
                read: self.read,
                expected: self.expected,
            });
        }
        let mut probe = [0u8; 1];
        let n = self.inner.read(&mut probe).await?;
        if n != 0 {
            return Err(ContentError::TrailingData(self.verifier.expected().clone()));
        }
        if !self.verifier.verified() {
            return Err(ContentError::MismatchedDigest {
                expected: self.verifier.expected().clone(),
                computed: self.verifier.computed(),
            });
        }
        self.verified = true;
        Ok(())
    }

    /// Bytes delivered so far, counting any resumed prefix.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for VerifyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(sticky) = &this.sticky {
            return Poll::Ready(Err(sticky.to_io_error()));
        }
        let remaining = this.expected - this.read;
        if remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let limit = remaining.min(buf.remaining() as u64) as usize;
        let mut limited = buf.take(limit);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                this.sticky = Some(Sticky::Io(err.kind(), err.to_string()));
                Poll::Ready(Err(err))
            }
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                if n == 0 {
                    let sticky = Sticky::UnexpectedEof {
                        read: this.read,
                        expected: this.expected,
                    };
                    let err = sticky.to_io_error();
                    this.sticky = Some(sticky);
                    return Poll::Ready(Err(err));
                }
                this.verifier.update(limited.filled());
                this.read += n as u64;
                // The bytes were written into `buf`'s unfilled region via
                // the borrowed sub-buffer; account for them in `buf` itself.
                unsafe { buf.assume_init(n) };
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
        }
    }
}

/// Reads and verifies a blob in one step: allocates exactly `desc.size`
/// bytes, fills them from `reader`, and confirms size and digest.
pub async fn read_all<R: AsyncRead + Unpin>(reader: R, desc: &Descriptor) -> Result<Vec<u8>> {
    if desc.size < 0 {
        return Err(ContentError::InvalidDescriptorSize(desc.size));
    }
    let mut verified = VerifyReader::new(reader, desc)?;
    let mut buf = vec![0u8; desc.size as usize];
    verified
        .read_exact(&mut buf)
        .await
        .map_err(ContentError::from_io)?;
    verified.verify().await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hello_desc() -> Descriptor {
        Descriptor::from_bytes("test", b"hello world")
    }

    #[tokio::test]
    async fn reads_and_verifies_exact_content() -> anyhow::Result<()> {
        let desc = hello_desc();
        let bytes = read_all(Cursor::new(&b"hello world"[..]), &desc).await?;
        assert_eq!(b"hello world".to_vec(), bytes);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_mismatched_content() {
        let desc = hello_desc();
        let err = read_all(Cursor::new(&b"hello wOrld"[..]), &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::MismatchedDigest { .. }));
    }

    #[tokio::test]
    async fn rejects_short_stream() {
        let desc = hello_desc();
        let err = read_all(Cursor::new(&b"hello"[..]), &desc).await.unwrap_err();
        assert!(matches!(err, ContentError::UnexpectedEof { read: 5, expected: 11 }));
    }

    #[tokio::test]
    async fn rejects_trailing_data() {
        let desc = hello_desc();
        let err = read_all(Cursor::new(&b"hello world, and then some"[..]), &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::TrailingData(_)));
    }

    #[tokio::test]
    async fn rejects_negative_size() {
        let mut desc = hello_desc();
        desc.size = -1;
        let err = read_all(Cursor::new(&b"hello world"[..]), &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::InvalidDescriptorSize(-1)));
    }

    #[tokio::test]
    async fn verify_before_end_of_stream_fails() -> anyhow::Result<()> {
        let desc = hello_desc();
        let mut reader = VerifyReader::new(Cursor::new(&b"hello world"[..]), &desc)?;
        let mut partial = [0u8; 5];
        reader.read_exact(&mut partial).await?;
        let err = reader.verify().await.unwrap_err();
        assert!(matches!(err, ContentError::EarlyVerify { read: 5, expected: 11 }));
        Ok(())
    }

    #[tokio::test]
    async fn verify_is_idempotent_after_success() -> anyhow::Result<()> {
        let desc = hello_desc();
        let mut reader = VerifyReader::new(Cursor::new(&b"hello world"[..]), &desc)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        reader.verify().await?;
        reader.verify().await?;
        Ok(())
    }

    #[tokio::test]
    async fn short_stream_errors_are_sticky() -> anyhow::Result<()> {
        let desc = hello_desc();
        let mut reader = VerifyReader::new(Cursor::new(&b"hel"[..]), &desc)?;
        let mut buf = Vec::new();
        assert!(reader.read_to_end(&mut buf).await.is_err());
        // A second read replays the first terminal error.
        let err = reader.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        let err = reader.verify().await.unwrap_err();
        assert!(matches!(err, ContentError::UnexpectedEof { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn resume_accepts_the_remaining_suffix() -> anyhow::Result<()> {
        let desc = hello_desc();
        let mut digester = desc.digest.algorithm().digester();
        digester.update(b"hello ");
        let mut reader = VerifyReader::resume(Cursor::new(&b"world"[..]), &desc, digester, 6)?;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await?;
        assert_eq!(b"world".to_vec(), rest);
        reader.verify().await?;
        Ok(())
    }
}
