//! Worker side of the IPC channel.
//!
//! A worker process builds a [`WorkerLink`] over its stdin/stdout, announces
//! readiness once it can take traffic, and then reads master messages until
//! the master closes the channel.
//!
//! ```ignore
//! let mut link = WorkerLink::from_env();
//! link.ready().await?;
//! while let Some(message) = link.next().await? {
//!     match message {
//!         MasterMessage::Shutdown => break,
//!         MasterMessage::Message { payload } => handle(payload),
//!     }
//! }
//! ```

use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};

use crate::error::Result;
use crate::protocol::{MasterMessage, WorkerMessage, WORKER_ID_ENV};
use crate::worker::WorkerId;

/// A worker's connection to its master.
pub struct WorkerLink<R, W> {
    id: Option<WorkerId>,
    reader: Lines<BufReader<R>>,
    writer: W,
}

impl WorkerLink<Stdin, Stdout> {
    /// Link over this process's stdin/stdout, with the id from
    /// `SHOAL_WORKER_ID` when the master set it.
    pub fn from_env() -> Self {
        let id = std::env::var(WORKER_ID_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(WorkerId::new);
        Self::new(id, tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> WorkerLink<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Link over arbitrary streams.
    pub fn new(id: Option<WorkerId>, reader: R, writer: W) -> Self {
        Self {
            id,
            reader: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// The id the master assigned to this worker.
    pub fn id(&self) -> Option<WorkerId> {
        self.id
    }

    async fn write(&mut self, message: &WorkerMessage) -> Result<()> {
        let line = message.to_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Tell the master this worker can take traffic.
    pub async fn ready(&mut self) -> Result<()> {
        self.write(&WorkerMessage::Ready).await
    }

    /// Send an application payload to the master.
    pub async fn send(&mut self, payload: impl Into<Value>) -> Result<()> {
        self.write(&WorkerMessage::message(payload)).await
    }

    /// Tell the master this worker is leaving on its own.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.write(&WorkerMessage::Disconnect).await
    }

    /// Next message from the master, or `None` once the master closed the
    /// channel.
    pub async fn next(&mut self) -> Result<Option<MasterMessage>> {
        while let Some(line) = self.reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(MasterMessage::from_line(&line)?));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_link_round_trip() {
        let (master_out, worker_in) = duplex(1024);
        let (worker_out, mut master_in) = duplex(1024);
        let mut link = WorkerLink::new(Some(WorkerId::new(3)), worker_in, worker_out);
        assert_eq!(link.id(), Some(WorkerId::new(3)));

        link.ready().await.unwrap();
        link.send(json!({"load": 1})).await.unwrap();
        link.disconnect().await.unwrap();
        drop(link);

        let mut written = String::new();
        master_in.read_to_string(&mut written).await.unwrap();
        assert_eq!(
            written,
            "{\"type\":\"ready\"}\n\
             {\"type\":\"message\",\"payload\":{\"load\":1}}\n\
             {\"type\":\"disconnect\"}\n"
        );
        drop(master_out);
    }

    #[tokio::test]
    async fn test_next_reads_until_close() {
        let (mut master_out, worker_in) = duplex(1024);
        let (worker_out, _master_in) = duplex(1024);
        let mut link = WorkerLink::new(None, worker_in, worker_out);

        master_out
            .write_all(b"\n{\"type\":\"message\",\"payload\":7}\n{\"type\":\"shutdown\"}\n")
            .await
            .unwrap();
        drop(master_out);

        assert_eq!(
            link.next().await.unwrap(),
            Some(MasterMessage::message(7))
        );
        assert_eq!(link.next().await.unwrap(), Some(MasterMessage::Shutdown));
        assert_eq!(link.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_from_master_is_an_error() {
        let (mut master_out, worker_in) = duplex(1024);
        let (worker_out, _master_in) = duplex(1024);
        let mut link = WorkerLink::new(None, worker_in, worker_out);

        master_out.write_all(b"not json\n").await.unwrap();
        assert!(link.next().await.is_err());
    }
}
