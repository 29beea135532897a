//! Byte-channel abstraction for one JSON-RPC peer.
//!
//! The [`Wire`] trait enables dependency injection for testing: production
//! code talks to child processes and the editor through [`StreamWire`],
//! while tests drive the router through the in-memory [`ChannelWire`]
//! without spawning anything.

use crate::codec;
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{
    io::BufReader, lock::Mutex as AsyncMutex, AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt,
};
use serde_json::Value;

/// A duplex message channel to one peer.
#[async_trait]
pub trait Wire: Send + Sync {
    /// Next message from the peer; `None` once the stream ends.
    async fn recv(&self) -> Result<Option<Value>>;

    /// Send one message to the peer.
    async fn send(&self, message: &Value) -> Result<()>;

    /// Half-close the outgoing direction. Further sends fail; the peer sees
    /// end of stream.
    async fn close(&self);
}

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Production wire over a pair of byte streams with LSP framing.
///
/// Each half sits behind its own async mutex so a reader task and writer
/// tasks can share the wire through an `Arc`; writes stay sequential, which
/// keeps frames from interleaving.
pub struct StreamWire {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<Option<BoxedWriter>>,
}

impl StreamWire {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: AsyncMutex::new(Box::new(BufReader::new(reader))),
            writer: AsyncMutex::new(Some(Box::new(writer))),
        }
    }

    /// Wire over this process's own stdin/stdout, bridged to async I/O.
    pub fn stdio() -> Self {
        Self::new(
            smol::Unblock::new(std::io::stdin()),
            smol::Unblock::new(std::io::stdout()),
        )
    }
}

#[async_trait]
impl Wire for StreamWire {
    async fn recv(&self) -> Result<Option<Value>> {
        let mut reader = self.reader.lock().await;
        codec::read_message(&mut *reader).await
    }

    async fn send(&self, message: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => codec::write_message(writer, message).await,
            None => bail!("stream already closed"),
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut writer) = writer.take() {
            let _ = writer.close().await;
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use self::mock::{ChannelWire, WirePeer};

#[cfg(any(test, feature = "test-support"))]
mod mock {
    use super::*;
    use std::time::Duration;

    /// In-memory wire for tests; messages travel over channels instead of
    /// framed byte streams.
    pub struct ChannelWire {
        incoming: async_channel::Receiver<Value>,
        outgoing: async_channel::Sender<Value>,
    }

    /// The far end of a [`ChannelWire`]: what the fake client or fake
    /// backend holds in a test.
    pub struct WirePeer {
        to_wire: async_channel::Sender<Value>,
        from_wire: async_channel::Receiver<Value>,
    }

    impl ChannelWire {
        pub fn pair() -> (Self, WirePeer) {
            let (to_wire, incoming) = async_channel::unbounded();
            let (outgoing, from_wire) = async_channel::unbounded();
            (
                Self { incoming, outgoing },
                WirePeer { to_wire, from_wire },
            )
        }
    }

    #[async_trait]
    impl Wire for ChannelWire {
        async fn recv(&self) -> Result<Option<Value>> {
            Ok(self.incoming.recv().await.ok())
        }

        async fn send(&self, message: &Value) -> Result<()> {
            self.outgoing
                .send(message.clone())
                .await
                .map_err(|_| anyhow::anyhow!("peer closed"))
        }

        async fn close(&self) {
            self.outgoing.close();
        }
    }

    impl WirePeer {
        /// Push a message toward the multiplexer.
        pub async fn send(&self, message: Value) {
            self.to_wire
                .send(message)
                .await
                .expect("wire side closed");
        }

        /// Next message from the multiplexer; `None` once it closed this
        /// direction.
        pub async fn recv(&self) -> Option<Value> {
            self.from_wire.recv().await.ok()
        }

        /// Like [`recv`](Self::recv) but gives up after `timeout`.
        pub async fn recv_timeout(&self, timeout: Duration) -> Option<Value> {
            smol::future::or(async { self.from_wire.recv().await.ok() }, async {
                smol::Timer::after(timeout).await;
                None
            })
            .await
        }

        /// Signal end of stream toward the multiplexer.
        pub fn close(&self) {
            self.to_wire.close();
        }
    }
}
