//! Destinations for serialized records.

use crate::output::OutputError;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[async_trait]
pub trait LogSink: Send {
    async fn write_batch(&mut self, bytes: &[u8]) -> Result<(), OutputError>;
    async fn flush(&mut self) -> Result<(), OutputError>;
}

/// Any async writer: stdout, an append-mode file, a pipe.
pub struct WriterSink<W> {
    inner: W,
}

impl<W> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LogSink for WriterSink<W> {
    async fn write_batch(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), OutputError> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// `stdout` or `-` writes to standard output; anything else is a file
/// opened for appending.
pub async fn open(destination: &str) -> Result<Box<dyn LogSink>, OutputError> {
    if destination == "stdout" || destination == "-" {
        return Ok(Box::new(WriterSink::new(tokio::io::stdout())));
    }
    let file = tokio::fs::OpenOptions::new().create(true).append(true).open(destination).await?;
    Ok(Box::new(WriterSink::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, b"old\n").unwrap();

        let mut sink = open(path.to_str().unwrap()).await.unwrap();
        sink.write_batch(b"new\n").await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
