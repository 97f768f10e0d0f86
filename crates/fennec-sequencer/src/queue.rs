//! A cancellable FIFO of blocks with a single consumer.
//!
//! The chain source's event callback enqueues with [`BlockQueue::put`]
//! without blocking; [`BlockQueue::process`] spawns the one consumer task,
//! which invokes the handler strictly one block at a time in enqueue
//! order. [`BlockQueue::cancel`] stops the consumer after the in-flight
//! handler returns; cancellation is a clean exit, not an error.

use std::sync::Mutex;

use fennec_core::block::Block;
use futures::future::BoxFuture;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
};

pub type BlockHandler = Box<dyn Fn(Block) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct BlockQueue {
    tx: mpsc::UnboundedSender<Block>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Block>>>,
    cancellation: CancellationToken,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BlockQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            cancellation: CancellationToken::new(),
            consumer: tokio::sync::Mutex::new(None),
        }
    }

    /// Enqueues a block. Never blocks; safe to call from the chain
    /// source's callback context. Blocks enqueued after cancellation are
    /// dropped.
    pub fn put(&self, block: Block) {
        if self.tx.send(block).is_err() {
            debug!("block queue consumer is gone; dropping block");
        }
    }

    /// Spawns the consumer task, which invokes `handler` on each block in
    /// enqueue order.
    ///
    /// # Panics
    /// Panics if called more than once; the queue has exactly one
    /// consumer.
    pub fn process(&self, handler: BlockHandler) {
        let mut rx = self
            .rx
            .lock()
            .expect("block queue lock must not be poisoned")
            .take()
            .expect("block queue must only be given one consumer");
        let cancellation = self.cancellation.clone();
        let task = tokio::spawn(async move {
            loop {
                // The handler is awaited outside the select so an in-flight
                // block always completes before cancellation is observed.
                select!(
                    biased;

                    () = cancellation.cancelled() => {
                        info!("block queue cancelled; consumer exiting");
                        break;
                    }

                    block = rx.recv() => {
                        let Some(block) = block else {
                            break;
                        };
                        handler(block).await;
                    }
                );
            }
        });
        *self
            .consumer
            .try_lock()
            .expect("no other task holds the consumer handle during process") = Some(task);
    }

    /// Cancels the queue and waits for the consumer to exit.
    pub async fn cancel(&self) {
        self.cancellation.cancel();
        let task = self.consumer.lock().await.take();
        if let Some(task) = task {
            if task.await.is_err() {
                debug!("block queue consumer panicked before exiting");
            }
        }
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}
