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

//! The node: one scheduler, one set of registries, a list of applications.
//!
//! [`run`] is the blocking entry point of a program built on this crate: it
//! installs the log sink, spins up a current-thread tokio runtime, starts
//! the given applications and drives them to completion. For embedding into
//! an existing runtime (tests, larger programs), create a [`Node`] directly
//! and call [`Node::join_applications`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::error;

use crate::application::{self, AppSpec};
use crate::exit::{panic_message, ExitReason};
use crate::logging::{self, LogFormat, LogLevel};
use crate::registry::MailboxRegistry;

pub(crate) struct RunningApp {
    pub(crate) abort: AbortHandle,
}

type AppJoinHandle = (String, JoinHandle<Result<(), ExitReason>>);

struct NodeInner {
    mailboxes: MailboxRegistry,
    apps: Mutex<HashMap<String, RunningApp>>,
    app_tx: flume::Sender<AppJoinHandle>,
    app_rx: flume::Receiver<AppJoinHandle>,
}

/// Handle on a running node. Cheap to clone; every clone points at the same
/// registries. The registries live as long as any clone does.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

impl Node {
    pub fn new() -> Node {
        let (app_tx, app_rx) = flume::unbounded();
        Node {
            inner: Arc::new(NodeInner {
                mailboxes: MailboxRegistry::default(),
                apps: Mutex::new(HashMap::new()),
                app_tx,
                app_rx,
            }),
        }
    }

    pub(crate) fn mailboxes(&self) -> &MailboxRegistry {
        &self.inner.mailboxes
    }

    pub(crate) fn apps(&self) -> MutexGuard<'_, HashMap<String, RunningApp>> {
        self.inner.apps.lock().unwrap()
    }

    /// Hands an application subtree over to [`Node::join_applications`].
    pub(crate) fn watch_app(&self, name: String, handle: JoinHandle<Result<(), ExitReason>>) {
        let _ = self.inner.app_tx.send((name, handle));
    }

    fn abort_all_apps(&self) {
        let mut apps = self.apps();
        for (_, app) in apps.drain() {
            app.abort.abort();
        }
    }

    /// Drives every application of the node to completion, including the
    /// ones started while waiting.
    ///
    /// The first application failure cancels the remaining applications;
    /// cancellations (including [`crate::application::stop`]) are not
    /// failures. Returns once no application is left.
    pub async fn join_applications(&self) -> Result<(), ExitReason> {
        async fn join_app(
            (name, handle): AppJoinHandle,
        ) -> (String, Result<Result<(), ExitReason>, tokio::task::JoinError>) {
            let joined = handle.await;
            (name, joined)
        }

        let mut running: FuturesUnordered<_> = FuturesUnordered::new();
        let mut reasons: Vec<ExitReason> = Vec::new();
        let mut aborted = false;
        loop {
            while let Ok(app_handle) = self.inner.app_rx.try_recv() {
                running.push(join_app(app_handle));
            }
            if running.is_empty() {
                break;
            }
            tokio::select! {
                Ok(app_handle) = self.inner.app_rx.recv_async() => {
                    running.push(join_app(app_handle));
                }
                Some((name, joined)) = running.next() => {
                    let exit = match joined {
                        Ok(Ok(())) => None,
                        Ok(Err(exit)) if exit.is_cancelled() => None,
                        Ok(Err(exit)) => Some(exit),
                        Err(join_error) if join_error.is_panic() => {
                            Some(ExitReason::Panicked(panic_message(join_error.into_panic())))
                        }
                        // Aborted by `application::stop` or by this loop.
                        Err(_) => None,
                    };
                    if let Some(exit) = exit {
                        error!(app = %name, cause = %exit, "application failed");
                        if !aborted {
                            aborted = true;
                            self.abort_all_apps();
                        }
                        reasons.push(exit);
                    } else {
                        self.apps().remove(&name);
                    }
                }
            }
        }
        match ExitReason::combine(reasons) {
            Some(exit) => Err(exit),
            None => Ok(()),
        }
    }
}

/// Starts a node, runs the applications to completion, and returns.
///
/// Applications are started in the order supplied; nothing more is
/// guaranteed about ordering across applications. The call blocks the
/// current thread on a dedicated current-thread tokio runtime and returns
/// when every application has finished, either normally or after exhausting
/// its restart budget, in which case the failure is returned.
pub fn run(apps: Vec<AppSpec>, log_level: LogLevel, log_format: LogFormat) -> anyhow::Result<()> {
    logging::init(log_level, log_format);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let node = Node::new();
        for app in apps {
            application::start(&node, app);
        }
        node.join_applications().await?;
        Ok(())
    })
}
