use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::Error;

pub trait Message: 'static + Send {}

impl<T: 'static + Send> Message for T {}

#[async_trait]
pub trait IoHandler: Send {
    type Request: Message;
    type Response: Message;

    async fn handle(&mut self, req: Self::Request) -> crate::Result<Self::Response>;
}

enum RequestMsg<T: IoHandler> {
    Task {
        req: T::Request,
        answer: oneshot::Sender<crate::Result<T::Response>>,
    },
    Drop,
}

/// Owns an `IoHandler` on a background task and serializes all requests to it.
///
/// The task ends when `disconnect()` is called or when the last clone is dropped,
/// which drops the handler and closes the underlying stream.
pub struct IoTask<T: IoHandler> {
    tx: mpsc::UnboundedSender<RequestMsg<T>>,
}

impl<T: IoHandler> Clone for IoTask<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: 'static + IoHandler> IoTask<T> {
    pub fn new(mut handler: T) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestMsg<T>>();
        task::spawn(async move {
            while let Some(x) = rx.recv().await {
                match x {
                    RequestMsg::Task { req, answer } => {
                        let result = handler.handle(req).await;
                        let _ = answer.send(result);
                    }
                    RequestMsg::Drop => break,
                }
            }
            log::debug!("I/O task terminated");
        });
        IoTask { tx }
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(RequestMsg::Drop);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn request(&self, req: T::Request) -> crate::Result<T::Response> {
        let (tx, rx) = oneshot::channel();
        let msg = RequestMsg::Task { req, answer: tx };
        self.tx.send(msg).map_err(|_| disconnected())?;
        rx.await.map_err(|_| disconnected())?
    }
}

fn disconnected() -> Error {
    Error::internal(anyhow!("Instrument is disconnected"))
}
