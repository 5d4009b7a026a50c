//! Scripted upstream for tests
//!
//! Each `open` consumes the next scripted reply. With the script empty the
//! origin accepts the request and then stays silent.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::registry::ChannelName;

use super::source::{UpstreamBody, UpstreamSource};

/// One scripted origin response
pub(crate) enum Reply {
    /// Non-success status
    Refuse(u16),
    /// 416 for a resume request
    Unsatisfiable,
    /// Complete response
    Chunks(Vec<Bytes>),
    /// Some chunks, then a transport error
    Break(Vec<Bytes>),
    /// Chunks fed by the test as it goes
    Live(mpsc::UnboundedReceiver<Result<Bytes>>),
}

#[derive(Default)]
pub(crate) struct ScriptedUpstream {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(ChannelName, Option<u64>)>>,
    called: Notify,
}

impl ScriptedUpstream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn calls(&self) -> Vec<(ChannelName, Option<u64>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until `open` has been called at least `n` times
    pub(crate) async fn wait_calls(&self, n: usize) {
        loop {
            let called = self.called.notified();
            if self.calls.lock().unwrap().len() >= n {
                return;
            }
            called.await;
        }
    }
}

impl UpstreamSource for ScriptedUpstream {
    async fn open(&self, channel: &ChannelName, resume_from: Option<u64>) -> Result<UpstreamBody> {
        let reply = self.replies.lock().unwrap().pop_front();
        self.calls
            .lock()
            .unwrap()
            .push((channel.clone(), resume_from));
        self.called.notify_waiters();

        match reply {
            None => Ok(stream::pending().boxed()),
            Some(Reply::Refuse(status)) => Err(Error::UpstreamStatus(status)),
            Some(Reply::Unsatisfiable) => Err(Error::RangeNotSatisfiable(resume_from.unwrap_or(0))),
            Some(Reply::Chunks(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Some(Reply::Break(chunks)) => {
                let reset = io::Error::from(io::ErrorKind::ConnectionReset);
                Ok(stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::once(async move { Err(Error::Io(reset)) }))
                    .boxed())
            }
            Some(Reply::Live(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
        }
    }
}
