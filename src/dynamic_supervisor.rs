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

//! A supervisor accepting new children at runtime.
//!
//! A dynamic supervisor is a regular supervisor with one extra behavior: it
//! opens a mailbox and hot-attaches every [`ChildSpec`] received on it to its
//! own task group. An attached child runs under the same per-child monitor
//! as a static one and enjoys identical restart semantics.

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::debug;

use crate::exit::ExitReason;
use crate::mailbox::{self, MailboxId, Recipient};
use crate::node::Node;
use crate::supervisor::{child_monitor, classify_join, ChildSpec, SupervisorOptions};

/// Starts a dynamic supervisor with no children.
///
/// The supervisor's mailbox is optionally registered under `name`; `ready`
/// delivers the mailbox id once the supervisor accepts requests. The future
/// runs until a child exhausts its restart budget (the reason propagates) or
/// the supervisor is cancelled; it is meant to be used as a child task of an
/// enclosing supervisor.
pub async fn start(
    node: Node,
    opts: SupervisorOptions,
    name: Option<String>,
    ready: Option<oneshot::Sender<MailboxId>>,
) -> Result<(), ExitReason> {
    let inbox = mailbox::open(&node, name.as_deref())
        .map_err(|error| ExitReason::from(anyhow::Error::new(error)))?;
    let mid = inbox.id();
    if let Some(ready) = ready {
        let _ = ready.send(mid);
    }

    let mut monitors: JoinSet<Result<(), ExitReason>> = JoinSet::new();
    loop {
        tokio::select! {
            request = mailbox::receive(&node, mid) => {
                let message = match request {
                    Ok(message) => message,
                    Err(error) => {
                        // The mailbox was torn down under us.
                        monitors.abort_all();
                        return Err(ExitReason::from(anyhow::Error::new(error)));
                    }
                };
                match message.downcast::<ChildSpec>() {
                    Ok(spec) => {
                        monitors.spawn(child_monitor(*spec, opts));
                    }
                    Err(_) => {
                        debug!("ignoring message that is not a child spec");
                    }
                }
            }
            Some(join_result) = monitors.join_next() => {
                if let Err(exit) = classify_join(join_result) {
                    if exit.is_cancelled() {
                        continue;
                    }
                    // Same group semantics as a static supervisor: the first
                    // real failure tears the whole tree down.
                    monitors.abort_all();
                    let mut reasons = vec![exit];
                    while let Some(join_result) = monitors.join_next().await {
                        if let Err(exit) = classify_join(join_result) {
                            if !exit.is_cancelled() {
                                reasons.push(exit);
                            }
                        }
                    }
                    return Err(ExitReason::combine(reasons).unwrap_or(ExitReason::Cancelled));
                }
            }
        }
    }
}

/// Requests that the designated dynamic supervisor start a new child.
///
/// This is a plain mailbox send: there is no acknowledgement that the child
/// started; readiness signalling is the child's own business.
pub async fn start_child(
    node: &Node,
    target: impl Into<Recipient>,
    spec: ChildSpec,
) -> Result<(), mailbox::MailboxError> {
    mailbox::send(node, target, spec).await
}
