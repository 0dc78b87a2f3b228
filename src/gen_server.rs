// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Generic request/response servers over mailboxes.
//!
//! A generic server is a supervised task whose body is a receive loop: it
//! opens a mailbox, then dispatches every inbound message to one of three
//! callbacks depending on its shape.
//!
//! - a [`CallMessage`] (sent by [`call`]) reaches `handle_call`; the caller
//!   blocks until the server replies.
//! - a [`CastMessage`] (sent by [`cast`]) reaches `handle_cast`.
//! - anything else is an info message and reaches `handle_info`.
//!
//! The server state is the [`GenServer`] value itself; callbacks mutate it
//! in place and return an [`Outcome`] driving the loop.
//!
//! If a call replies with an `anyhow::Error` payload, the error is raised on
//! the caller side as [`CallError::Failure`]. This is how a server reports a
//! per-request failure without stopping.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use crate::envelope::{CallMessage, CastMessage, DynMessage, GenServerExited, ReplyTo};
use crate::mailbox::{self, MailboxError, MailboxId, Recipient};
use crate::node::Node;

/// Raised by the default callbacks: the server received a message shape it
/// has no handler for. Enforcement is lazy, at message reception.
#[derive(Debug, Error)]
#[error("no `{0}` callback implemented for this server")]
pub struct NotImplemented(pub &'static str);

/// A callback replied to a message that carries no reply channel.
#[derive(Debug, Error)]
#[error("`{0}` returned Outcome::Reply for a message it cannot reply to")]
pub struct InvalidReply(pub &'static str);

/// Error observed by a [`call`] caller.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    /// The server stopped before sending a reply, or stopped while handling
    /// this very call.
    #[error("the server exited before sending a reply")]
    ServerExited,
    #[error("no reply received within {0:?}")]
    Timeout(Duration),
    /// The server replied with an error value.
    #[error("the server replied with an error: {0}")]
    Failure(anyhow::Error),
}

/// Tells the server loop how to continue after a callback.
pub enum Outcome {
    /// Send this payload back to the caller, then keep looping. Only valid
    /// for calls.
    Reply(DynMessage),
    /// Keep looping without replying. For a call, the reply channel stays
    /// usable: reply later with [`reply`].
    NoReply,
    /// Terminate the loop. With a reason, the server fails and the reason
    /// enters the supervision policy; without one, the server stops cleanly.
    /// A pending caller receives [`GenServerExited`] either way.
    Stop(Option<anyhow::Error>),
}

impl Outcome {
    /// Shorthand building a [`Outcome::Reply`] from a concrete value.
    pub fn reply(value: impl Any + Send) -> Outcome {
        Outcome::Reply(Box::new(value))
    }

    pub fn stop() -> Outcome {
        Outcome::Stop(None)
    }

    pub fn stop_with(reason: anyhow::Error) -> Outcome {
        Outcome::Stop(Some(reason))
    }
}

/// Callbacks of a generic server. Only `init` has a meaningful default for
/// every server; implement the handlers for the message shapes you expect.
#[async_trait]
pub trait GenServer: Send + 'static {
    /// Called once before the loop starts. An error here aborts the server
    /// before any message is processed.
    async fn init(&mut self, _node: &Node) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles a synchronous request. `reply_to` can be cloned and moved
    /// into a background task to reply after returning [`Outcome::NoReply`].
    async fn handle_call(
        &mut self,
        _request: DynMessage,
        _reply_to: &ReplyTo,
        _node: &Node,
    ) -> anyhow::Result<Outcome> {
        Err(NotImplemented("handle_call").into())
    }

    /// Handles a fire-and-forget request.
    async fn handle_cast(&mut self, _request: DynMessage, _node: &Node) -> anyhow::Result<Outcome> {
        Err(NotImplemented("handle_cast").into())
    }

    /// Handles a raw message sent directly to the server's mailbox. The
    /// default ignores it and keeps the state untouched.
    async fn handle_info(&mut self, _message: DynMessage, _node: &Node) -> anyhow::Result<Outcome> {
        Ok(Outcome::NoReply)
    }

    /// Called once when the loop terminates, with the failure that caused it
    /// if any. The default logs that failure.
    async fn terminate(&mut self, reason: Option<&anyhow::Error>, _node: &Node) {
        if let Some(reason) = reason {
            error!(cause = %reason, "generic server terminated on error");
        }
    }
}

/// Runs a generic server until it stops.
///
/// Opens the server's mailbox (optionally registered under `name`), calls
/// `init`, then loops over inbound messages. The mailbox is destroyed on
/// every exit path; `terminate` runs on normal stops and on failures.
///
/// This is the task body to hand to a supervisor via
/// [`crate::supervisor::ChildSpec`].
pub async fn start<S: GenServer>(
    node: Node,
    mut server: S,
    name: Option<String>,
) -> anyhow::Result<()> {
    let inbox = mailbox::open(&node, name.as_deref())?;
    server.init(&node).await?;
    match serve(&node, &mut server, inbox.id()).await {
        Ok(()) => {
            server.terminate(None, &node).await;
            Ok(())
        }
        Err(error) => {
            server.terminate(Some(&error), &node).await;
            Err(error)
        }
    }
}

async fn serve<S: GenServer>(
    node: &Node,
    server: &mut S,
    mid: MailboxId,
) -> anyhow::Result<()> {
    loop {
        let message = mailbox::receive(node, mid).await?;

        let message = match message.downcast::<CallMessage>() {
            Ok(call) => {
                let CallMessage { reply_to, payload } = *call;
                match server.handle_call(payload, &reply_to, node).await? {
                    Outcome::Reply(value) => reply_to.send(value).await,
                    Outcome::NoReply => {}
                    Outcome::Stop(reason) => {
                        // Unblock the caller before terminating.
                        reply_to.send(Box::new(GenServerExited)).await;
                        return reason.map_or(Ok(()), Err);
                    }
                }
                continue;
            }
            Err(message) => message,
        };

        let message = match message.downcast::<CastMessage>() {
            Ok(cast) => {
                match server.handle_cast(cast.payload, node).await? {
                    Outcome::Reply(_) => return Err(InvalidReply("handle_cast").into()),
                    Outcome::NoReply => {}
                    Outcome::Stop(reason) => return reason.map_or(Ok(()), Err),
                }
                continue;
            }
            Err(message) => message,
        };

        match server.handle_info(message, node).await? {
            Outcome::Reply(_) => return Err(InvalidReply("handle_info").into()),
            Outcome::NoReply => {}
            Outcome::Stop(reason) => return reason.map_or(Ok(()), Err),
        }
    }
}

/// Sends a request to a generic server and awaits its reply.
///
/// A private rendezvous channel is created for the reply; exactly one of
/// three things happens: the reply arrives (an error-valued reply is raised
/// as [`CallError::Failure`]), the server stops mid-call
/// ([`CallError::ServerExited`]), or the deadline expires
/// ([`CallError::Timeout`]). On timeout the reply channel is discarded; a
/// late reply from the server is dropped on its side.
pub async fn call(
    node: &Node,
    target: impl Into<Recipient>,
    payload: impl Any + Send,
    timeout: Option<Duration>,
) -> Result<DynMessage, CallError> {
    let (reply_tx, reply_rx) = flume::bounded::<DynMessage>(0);
    let message = CallMessage {
        reply_to: ReplyTo::new(reply_tx),
        payload: Box::new(payload),
    };
    mailbox::send(node, target, message).await?;

    let received = match timeout {
        Some(duration) => tokio::time::timeout(duration, reply_rx.recv_async())
            .await
            .map_err(|_| CallError::Timeout(duration))?,
        None => reply_rx.recv_async().await,
    };
    let reply = received.map_err(|_| CallError::ServerExited)?;
    if reply.is::<GenServerExited>() {
        return Err(CallError::ServerExited);
    }
    match reply.downcast::<anyhow::Error>() {
        Ok(error) => Err(CallError::Failure(*error)),
        Err(value) => Ok(value),
    }
}

/// Sends a request to a generic server without waiting for a reply.
///
/// The send itself is still a rendezvous with the server's receive loop; it
/// resolves once the message is handed over, not once it is handled.
pub async fn cast(
    node: &Node,
    target: impl Into<Recipient>,
    payload: impl Any + Send,
) -> Result<(), MailboxError> {
    let message = CastMessage {
        payload: Box::new(payload),
    };
    mailbox::send(node, target, message).await
}

/// Replies to a call from outside the server loop.
///
/// Meant for `handle_call` implementations that return [`Outcome::NoReply`]
/// and finish the work in a background task. Replying to a caller that has
/// already timed out is a no-op.
pub async fn reply(reply_to: &ReplyTo, value: impl Any + Send) {
    reply_to.send(Box::new(value)).await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::task::JoinHandle;

    use super::*;
    use crate::node::Node;

    #[derive(Debug)]
    enum KvCall {
        Get(&'static str),
        Set(&'static str, &'static str),
        Unknown,
        Deferred,
        Never,
        StopNow,
        Crash,
    }

    #[derive(Debug)]
    enum KvCast {
        Touch,
        StopNow,
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Ready,
        Touched,
        Info(String),
        Terminated(Option<String>),
    }

    struct KvStore {
        data: HashMap<String, String>,
        events: flume::Sender<Event>,
    }

    impl KvStore {
        fn new(events: flume::Sender<Event>) -> Self {
            KvStore {
                data: HashMap::new(),
                events,
            }
        }
    }

    #[async_trait]
    impl GenServer for KvStore {
        async fn init(&mut self, _node: &Node) -> anyhow::Result<()> {
            let _ = self.events.send(Event::Ready);
            Ok(())
        }

        async fn handle_call(
            &mut self,
            request: DynMessage,
            reply_to: &ReplyTo,
            _node: &Node,
        ) -> anyhow::Result<Outcome> {
            let request = *request.downcast::<KvCall>().expect("unexpected call type");
            let outcome = match request {
                KvCall::Get(key) => Outcome::reply(self.data.get(key).cloned()),
                KvCall::Set(key, value) => {
                    let previous = self.data.insert(key.to_string(), value.to_string());
                    Outcome::reply(previous)
                }
                KvCall::Unknown => Outcome::reply(anyhow::anyhow!("unknown request")),
                KvCall::Deferred => {
                    let reply_to = reply_to.clone();
                    tokio::spawn(async move {
                        reply(&reply_to, "done").await;
                    });
                    Outcome::NoReply
                }
                KvCall::Never => Outcome::NoReply,
                KvCall::StopNow => Outcome::stop(),
                KvCall::Crash => Outcome::stop_with(anyhow::anyhow!("boom")),
            };
            Ok(outcome)
        }

        async fn handle_cast(
            &mut self,
            request: DynMessage,
            _node: &Node,
        ) -> anyhow::Result<Outcome> {
            let request = *request.downcast::<KvCast>().expect("unexpected cast type");
            match request {
                KvCast::Touch => {
                    let _ = self.events.send(Event::Touched);
                    Ok(Outcome::NoReply)
                }
                KvCast::StopNow => Ok(Outcome::stop()),
            }
        }

        async fn handle_info(
            &mut self,
            message: DynMessage,
            _node: &Node,
        ) -> anyhow::Result<Outcome> {
            if let Ok(text) = message.downcast::<&str>() {
                let _ = self.events.send(Event::Info(text.to_string()));
            }
            Ok(Outcome::NoReply)
        }

        async fn terminate(&mut self, reason: Option<&anyhow::Error>, _node: &Node) {
            let _ = self
                .events
                .send(Event::Terminated(reason.map(|error| error.to_string())));
        }
    }

    async fn spawn_kvstore(
        node: &Node,
        name: &str,
    ) -> (flume::Receiver<Event>, JoinHandle<anyhow::Result<()>>) {
        let (events_tx, events_rx) = flume::unbounded();
        let server = KvStore::new(events_tx);
        let handle = tokio::spawn(start(node.clone(), server, Some(name.to_string())));
        assert_eq!(events_rx.recv_async().await.unwrap(), Event::Ready);
        (events_rx, handle)
    }

    #[tokio::test]
    async fn test_kvstore_call_sequence() {
        let node = Node::new();
        let (_events, server) = spawn_kvstore(&node, "kvstore").await;

        let reply = call(&node, "kvstore", KvCall::Get("k"), None).await.unwrap();
        assert_eq!(*reply.downcast::<Option<String>>().unwrap(), None);

        let reply = call(&node, "kvstore", KvCall::Set("k", "v1"), None)
            .await
            .unwrap();
        assert_eq!(*reply.downcast::<Option<String>>().unwrap(), None);

        let reply = call(&node, "kvstore", KvCall::Get("k"), None).await.unwrap();
        assert_eq!(
            *reply.downcast::<Option<String>>().unwrap(),
            Some("v1".to_string())
        );

        let reply = call(&node, "kvstore", KvCall::Set("k", "v2"), None)
            .await
            .unwrap();
        assert_eq!(
            *reply.downcast::<Option<String>>().unwrap(),
            Some("v1".to_string())
        );

        let reply = call(&node, "kvstore", KvCall::Get("k"), None).await.unwrap();
        assert_eq!(
            *reply.downcast::<Option<String>>().unwrap(),
            Some("v2".to_string())
        );

        server.abort();
    }

    #[tokio::test]
    async fn test_call_error_reply_raises_at_caller() {
        let node = Node::new();
        let (_events, server) = spawn_kvstore(&node, "kvstore").await;

        let call_error = call(&node, "kvstore", KvCall::Unknown, None)
            .await
            .unwrap_err();
        let CallError::Failure(cause) = call_error else {
            panic!("expected the error reply to be raised");
        };
        assert!(cause.to_string().contains("unknown request"));

        // The server survived the failed request.
        let reply = call(&node, "kvstore", KvCall::Get("k"), None).await.unwrap();
        assert_eq!(*reply.downcast::<Option<String>>().unwrap(), None);
        server.abort();
    }

    #[tokio::test]
    async fn test_call_deferred_reply() {
        let node = Node::new();
        let (_events, server) = spawn_kvstore(&node, "kvstore").await;

        let reply = call(&node, "kvstore", KvCall::Deferred, None)
            .await
            .unwrap();
        assert_eq!(*reply.downcast::<&str>().unwrap(), "done");
        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_leaves_server_running() {
        let node = Node::new();
        let (_events, server) = spawn_kvstore(&node, "kvstore").await;

        let call_error = call(
            &node,
            "kvstore",
            KvCall::Never,
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
        assert!(matches!(call_error, CallError::Timeout(_)));

        // The abandoned reply channel did not hurt the server.
        let reply = call(&node, "kvstore", KvCall::Get("k"), None).await.unwrap();
        assert_eq!(*reply.downcast::<Option<String>>().unwrap(), None);
        server.abort();
    }

    #[tokio::test]
    async fn test_call_stop_unblocks_caller() {
        let node = Node::new();
        let (events, server) = spawn_kvstore(&node, "kvstore").await;

        let call_error = call(&node, "kvstore", KvCall::StopNow, None)
            .await
            .unwrap_err();
        assert!(matches!(call_error, CallError::ServerExited));

        server.await.unwrap().unwrap();
        assert_eq!(events.recv_async().await.unwrap(), Event::Terminated(None));
    }

    #[tokio::test]
    async fn test_call_stop_with_reason_fails_server() {
        let node = Node::new();
        let (events, server) = spawn_kvstore(&node, "kvstore").await;

        let call_error = call(&node, "kvstore", KvCall::Crash, None)
            .await
            .unwrap_err();
        // The caller only sees the exit sentinel; the reason goes to the
        // supervisor.
        assert!(matches!(call_error, CallError::ServerExited));

        let server_error = server.await.unwrap().unwrap_err();
        assert!(server_error.to_string().contains("boom"));
        assert_eq!(
            events.recv_async().await.unwrap(),
            Event::Terminated(Some("boom".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cast() {
        let node = Node::new();
        let (events, server) = spawn_kvstore(&node, "kvstore").await;

        cast(&node, "kvstore", KvCast::Touch).await.unwrap();
        assert_eq!(events.recv_async().await.unwrap(), Event::Touched);

        cast(&node, "kvstore", KvCast::StopNow).await.unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(events.recv_async().await.unwrap(), Event::Terminated(None));
    }

    #[tokio::test]
    async fn test_info_message() {
        let node = Node::new();
        let (events, server) = spawn_kvstore(&node, "kvstore").await;

        mailbox::send(&node, "kvstore", "printstate").await.unwrap();
        assert_eq!(
            events.recv_async().await.unwrap(),
            Event::Info("printstate".to_string())
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_unhandled_info_keeps_looping() {
        let node = Node::new();
        let (_events, server) = spawn_kvstore(&node, "kvstore").await;

        // Not a &str: the kvstore ignores it and keeps serving.
        mailbox::send(&node, "kvstore", 42u64).await.unwrap();
        let reply = call(&node, "kvstore", KvCall::Get("k"), None).await.unwrap();
        assert_eq!(*reply.downcast::<Option<String>>().unwrap(), None);
        server.abort();
    }

    struct Mute;

    #[async_trait]
    impl GenServer for Mute {}

    /// Calls the target, retrying while its mailbox is not registered yet.
    async fn call_once_up(
        node: &Node,
        target: &str,
        payload: impl Any + Send + Clone,
    ) -> Result<DynMessage, CallError> {
        loop {
            match call(node, target, payload.clone(), None).await {
                Err(CallError::Mailbox(MailboxError::MailboxDoesNotExist(_))) => {
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }

    #[tokio::test]
    async fn test_missing_call_handler_fails_server() {
        let node = Node::new();
        let server = tokio::spawn(start(node.clone(), Mute, Some("mute".to_string())));

        let call_error = call_once_up(&node, "mute", "anything").await.unwrap_err();
        assert!(matches!(call_error, CallError::ServerExited));

        let server_error = server.await.unwrap().unwrap_err();
        assert!(server_error.downcast_ref::<NotImplemented>().is_some());
    }

    struct ChattyCast;

    #[async_trait]
    impl GenServer for ChattyCast {
        async fn handle_cast(
            &mut self,
            _request: DynMessage,
            _node: &Node,
        ) -> anyhow::Result<Outcome> {
            Ok(Outcome::reply("you cannot hear me"))
        }
    }

    #[tokio::test]
    async fn test_cast_reply_is_a_contract_violation() {
        let node = Node::new();
        let server = tokio::spawn(start(node.clone(), ChattyCast, Some("chatty".to_string())));
        loop {
            match cast(&node, "chatty", ()).await {
                Err(MailboxError::MailboxDoesNotExist(_)) => tokio::task::yield_now().await,
                result => break result.unwrap(),
            }
        }
        let server_error = server.await.unwrap().unwrap_err();
        assert!(server_error.downcast_ref::<InvalidReply>().is_some());
    }

    struct FailingInit;

    #[async_trait]
    impl GenServer for FailingInit {
        async fn init(&mut self, _node: &Node) -> anyhow::Result<()> {
            anyhow::bail!("init went wrong")
        }
    }

    #[tokio::test]
    async fn test_init_failure_releases_mailbox() {
        let node = Node::new();
        let result = start(node.clone(), FailingInit, Some("stillborn".to_string())).await;
        assert!(result.unwrap_err().to_string().contains("init went wrong"));
        // The name was released by the mailbox guard.
        assert!(mailbox::open(&node, Some("stillborn")).is_ok());
    }
}
