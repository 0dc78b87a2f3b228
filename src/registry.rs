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

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::envelope::DynMessage;
use crate::mailbox::{MailboxError, MailboxId, Recipient};

struct MailboxChannel {
    sender: flume::Sender<DynMessage>,
    receiver: flume::Receiver<DynMessage>,
}

#[derive(Default)]
struct Registries {
    mailboxes: HashMap<MailboxId, MailboxChannel>,
    names: HashMap<String, MailboxId>,
}

/// Per-node storage for mailboxes and their names.
///
/// Every mutation completes synchronously under the lock, so registry
/// updates are atomic with respect to the cooperative scheduler. Channel
/// halves are cloned out before any await.
#[derive(Clone, Default)]
pub(crate) struct MailboxRegistry {
    inner: Arc<Mutex<Registries>>,
}

impl MailboxRegistry {
    fn lock(&self) -> MutexGuard<'_, Registries> {
        self.inner.lock().unwrap()
    }

    /// Creates a fresh rendezvous mailbox and returns its id.
    pub(crate) fn create(&self) -> MailboxId {
        let mid = MailboxId::random();
        let (sender, receiver) = flume::bounded(0);
        self.lock()
            .mailboxes
            .insert(mid, MailboxChannel { sender, receiver });
        mid
    }

    /// Removes the mailbox, unregistering its names first.
    ///
    /// Dropping the stored channel halves disconnects every task currently
    /// parked on a send or receive for this mailbox.
    pub(crate) fn destroy(&self, mid: MailboxId) -> Result<(), MailboxError> {
        let mut registries = self.lock();
        if !registries.mailboxes.contains_key(&mid) {
            return Err(MailboxError::MailboxDoesNotExist(mid.to_string()));
        }
        registries.names.retain(|_, registered| *registered != mid);
        registries.mailboxes.remove(&mid);
        Ok(())
    }

    pub(crate) fn register(&self, mid: MailboxId, name: &str) -> Result<(), MailboxError> {
        if name.is_empty() {
            return Err(MailboxError::InvalidName);
        }
        let mut registries = self.lock();
        if !registries.mailboxes.contains_key(&mid) {
            return Err(MailboxError::MailboxDoesNotExist(mid.to_string()));
        }
        if registries.names.contains_key(name) {
            return Err(MailboxError::NameAlreadyExist(name.to_string()));
        }
        registries.names.insert(name.to_string(), mid);
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) -> Result<(), MailboxError> {
        if self.lock().names.remove(name).is_none() {
            return Err(MailboxError::NameDoesNotExist(name.to_string()));
        }
        Ok(())
    }

    pub(crate) fn unregister_all(&self, mid: MailboxId) {
        self.lock().names.retain(|_, registered| *registered != mid);
    }

    /// Resolves a recipient and clones out the sending half of its channel.
    ///
    /// Names are resolved against the name registry first; an unregistered
    /// name that parses as a mailbox id is retried as one.
    pub(crate) fn sender(
        &self,
        recipient: &Recipient,
    ) -> Result<flume::Sender<DynMessage>, MailboxError> {
        let registries = self.lock();
        let mid = match recipient {
            Recipient::Id(mid) => *mid,
            Recipient::Name(name) => match registries.names.get(name) {
                Some(mid) => *mid,
                None => name
                    .parse()
                    .map_err(|_| MailboxError::MailboxDoesNotExist(recipient.to_string()))?,
            },
        };
        registries
            .mailboxes
            .get(&mid)
            .map(|channel| channel.sender.clone())
            .ok_or_else(|| MailboxError::MailboxDoesNotExist(recipient.to_string()))
    }

    pub(crate) fn receiver(
        &self,
        mid: MailboxId,
    ) -> Result<flume::Receiver<DynMessage>, MailboxError> {
        self.lock()
            .mailboxes
            .get(&mid)
            .map(|channel| channel.receiver.clone())
            .ok_or_else(|| MailboxError::MailboxDoesNotExist(mid.to_string()))
    }
}
