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

use std::any::Any;
use std::fmt;

use tracing::debug;

/// Type-erased message payload.
///
/// Mailboxes carry arbitrary values; receivers recover concrete types with
/// [`Box::downcast`]. Pass concrete values to the send operations, which box
/// them exactly once.
pub type DynMessage = Box<dyn Any + Send>;

/// Envelope for a synchronous request.
///
/// Carries the caller's private reply channel next to the payload. A generic
/// server loop replies through `reply_to`; any other receiver is free to do
/// the same by hand.
pub struct CallMessage {
    pub(crate) reply_to: ReplyTo,
    pub payload: DynMessage,
}

/// Envelope for a fire-and-forget request.
pub struct CastMessage {
    pub payload: DynMessage,
}

/// Sentinel reply sent to a caller when the callee stopped before replying,
/// so the caller does not block forever.
#[derive(Debug, Clone, Copy)]
pub struct GenServerExited;

/// Sending half of a caller's private reply channel.
///
/// Clonable so a `handle_call` implementation can move it into a background
/// task and reply later (see [`crate::gen_server::reply`]).
#[derive(Clone)]
pub struct ReplyTo {
    tx: flume::Sender<DynMessage>,
}

impl ReplyTo {
    pub(crate) fn new(tx: flume::Sender<DynMessage>) -> Self {
        ReplyTo { tx }
    }

    /// Forwards a reply to the caller.
    ///
    /// A caller that timed out has dropped its receiving half; the reply is
    /// then dropped silently instead of crashing the replying task.
    pub(crate) async fn send(&self, value: DynMessage) {
        if self.tx.send_async(value).await.is_err() {
            debug!("dropping reply: the caller went away before receiving it");
        }
    }
}

impl fmt::Debug for ReplyTo {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("ReplyTo { .. }")
    }
}
