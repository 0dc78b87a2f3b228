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

//! Named rendezvous mailboxes.
//!
//! A mailbox is a zero-capacity channel registered on a [`Node`]: a send
//! parks the sender until a receiver is ready to take the message. Mailboxes
//! are addressed by an opaque [`MailboxId`] or by any number of registered
//! names, and messages are delivered in FIFO order per sender.
//!
//! [`open`] is the everyday entry point: it creates the mailbox, optionally
//! registers a name, and hands back a guard that destroys the mailbox on
//! every exit path, including task abortion.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::envelope::DynMessage;
use crate::node::Node;
use crate::registry::MailboxRegistry;

/// Opaque mailbox identifier, unique within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(Uuid);

impl MailboxId {
    pub(crate) fn random() -> Self {
        MailboxId(Uuid::new_v4())
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl FromStr for MailboxId {
    type Err = uuid::Error;

    fn from_str(mailbox_id_str: &str) -> Result<Self, Self::Err> {
        Ok(MailboxId(Uuid::parse_str(mailbox_id_str)?))
    }
}

/// Address of a mailbox: a registered name or a raw id.
#[derive(Debug, Clone)]
pub enum Recipient {
    Name(String),
    Id(MailboxId),
}

impl From<&str> for Recipient {
    fn from(name: &str) -> Self {
        Recipient::Name(name.to_string())
    }
}

impl From<String> for Recipient {
    fn from(name: String) -> Self {
        Recipient::Name(name)
    }
}

impl From<MailboxId> for Recipient {
    fn from(mid: MailboxId) -> Self {
        Recipient::Id(mid)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Recipient::Name(name) => formatter.write_str(name),
            Recipient::Id(mid) => mid.fmt(formatter),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox `{0}` does not exist")]
    MailboxDoesNotExist(String),
    #[error("name `{0}` is already registered")]
    NameAlreadyExist(String),
    #[error("name `{0}` is not registered")]
    NameDoesNotExist(String),
    #[error("mailbox names must be non-empty")]
    InvalidName,
    #[error("no message received within {0:?}")]
    Timeout(Duration),
}

/// A mailbox bound to the current scope.
///
/// Dropping the guard destroys the mailbox and unregisters all of its
/// names. This is the release discipline of [`open`]; keep the guard alive
/// for as long as the mailbox should receive messages.
pub struct MailboxGuard {
    registry: MailboxRegistry,
    mid: MailboxId,
}

impl MailboxGuard {
    pub fn id(&self) -> MailboxId {
        self.mid
    }
}

impl Drop for MailboxGuard {
    fn drop(&mut self) {
        // Already-destroyed is fine: the guard only guarantees the mailbox
        // does not outlive the scope.
        let _ = self.registry.destroy(self.mid);
    }
}

impl fmt::Debug for MailboxGuard {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "MailboxGuard({})", self.mid)
    }
}

/// Creates a new mailbox on the node and returns its id.
///
/// The caller is responsible for destroying it; prefer [`open`].
pub fn create(node: &Node) -> MailboxId {
    node.mailboxes().create()
}

/// Closes and destroys a mailbox, unregistering its names first.
///
/// Tasks parked on a send to or receive from this mailbox observe
/// [`MailboxError::MailboxDoesNotExist`].
pub fn destroy(node: &Node, mid: MailboxId) -> Result<(), MailboxError> {
    node.mailboxes().destroy(mid)
}

/// Creates a mailbox, optionally registers `name`, and returns a scoped
/// guard: the mailbox is destroyed when the guard drops, on every exit path.
pub fn open(node: &Node, name: Option<&str>) -> Result<MailboxGuard, MailboxError> {
    let registry = node.mailboxes().clone();
    let mid = registry.create();
    let guard = MailboxGuard { registry, mid };
    if let Some(name) = name {
        // A name conflict destroys the fresh mailbox through the guard.
        register(node, mid, name)?;
    }
    Ok(guard)
}

/// Assigns an extra name to a mailbox. A mailbox may hold several names;
/// each name points to exactly one mailbox.
pub fn register(node: &Node, mid: MailboxId, name: &str) -> Result<(), MailboxError> {
    node.mailboxes().register(mid, name)
}

/// Removes a single name.
pub fn unregister(node: &Node, name: &str) -> Result<(), MailboxError> {
    node.mailboxes().unregister(name)
}

/// Removes every name currently pointing at `mid`.
pub fn unregister_all(node: &Node, mid: MailboxId) {
    node.mailboxes().unregister_all(mid)
}

/// Sends a message to a mailbox designated by name or id.
///
/// This is a rendezvous: the future resolves once a receiver has taken the
/// message. Destroying the target while the sender is parked fails the send
/// with [`MailboxError::MailboxDoesNotExist`].
pub async fn send(
    node: &Node,
    target: impl Into<Recipient>,
    message: impl Any + Send,
) -> Result<(), MailboxError> {
    let recipient = target.into();
    let sender = node.mailboxes().sender(&recipient)?;
    let message: DynMessage = Box::new(message);
    sender
        .send_async(message)
        .await
        .map_err(|_| MailboxError::MailboxDoesNotExist(recipient.to_string()))
}

/// Awaits the next message of a mailbox, in FIFO rendezvous order.
pub async fn receive(node: &Node, mid: MailboxId) -> Result<DynMessage, MailboxError> {
    let receiver = node.mailboxes().receiver(mid)?;
    receiver
        .recv_async()
        .await
        .map_err(|_| MailboxError::MailboxDoesNotExist(mid.to_string()))
}

/// Awaits the next message for at most `timeout`, failing with
/// [`MailboxError::Timeout`] on expiry.
pub async fn receive_timeout(
    node: &Node,
    mid: MailboxId,
    timeout: Duration,
) -> Result<DynMessage, MailboxError> {
    match tokio::time::timeout(timeout, receive(node, mid)).await {
        Ok(received) => received,
        Err(_) => Err(MailboxError::Timeout(timeout)),
    }
}

/// Like [`receive_timeout`], but on expiry returns the value produced by the
/// `on_timeout` fallback instead of an error.
pub async fn receive_or_else<F, Fut, T>(
    node: &Node,
    mid: MailboxId,
    timeout: Duration,
    on_timeout: F,
) -> Result<DynMessage, MailboxError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
    T: Any + Send,
{
    match receive_timeout(node, mid, timeout).await {
        Err(MailboxError::Timeout(_)) => {
            let fallback: DynMessage = Box::new(on_timeout().await);
            Ok(fallback)
        }
        received => received,
    }
}
