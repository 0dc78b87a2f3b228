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

//! Applications: named supervision subtrees of a node.
//!
//! An application wraps a `start` task in a dedicated subtree: a supervisor
//! with that task as its single child, `Permanent` when the application is
//! permanent, `Transient` otherwise. Usually the task starts a supervisor of
//! its own, and the application is the root of a whole tree.

use std::future::Future;

use crate::node::{Node, RunningApp};
use crate::supervisor::{self, ChildSpec, RestartStrategy, SupervisorOptions, TaskFactory};

/// Describes an application.
pub struct AppSpec {
    name: String,
    start: TaskFactory,
    permanent: bool,
    sup_options: Option<SupervisorOptions>,
}

impl AppSpec {
    /// An application named `name` whose root task is produced by `start`.
    /// Applications are permanent by default.
    pub fn new<F, Fut>(name: impl Into<String>, start: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        use futures::FutureExt;
        AppSpec {
            name: name.into(),
            start: Box::new(move || start().boxed()),
            permanent: true,
            sup_options: None,
        }
    }

    /// Do not restart the application's task after a normal exit.
    pub fn transient(mut self) -> Self {
        self.permanent = false;
        self
    }

    /// Overrides the restart budget of the application's supervisor.
    pub fn with_supervisor_options(mut self, sup_options: SupervisorOptions) -> Self {
        self.sup_options = Some(sup_options);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Starts an application on the node. If an application with the same name
/// is already registered, this is a no-op.
///
/// Must be called from within the node's runtime. The application tree runs
/// until its supervisor gives up or [`stop`] cancels it; its fate is
/// collected by [`Node::join_applications`].
pub fn start(node: &Node, app: AppSpec) {
    let mut apps = node.apps();
    if apps.contains_key(&app.name) {
        return;
    }
    let AppSpec {
        name,
        start,
        permanent,
        sup_options,
    } = app;

    let restart = if permanent {
        RestartStrategy::Permanent
    } else {
        RestartStrategy::Transient
    };
    let child = ChildSpec::from_factory(name.clone(), start).with_restart(restart);
    let opts = sup_options.unwrap_or_default();
    let handle = tokio::spawn(supervisor::start(vec![child], opts, None));

    apps.insert(
        name.clone(),
        RunningApp {
            abort: handle.abort_handle(),
        },
    );
    node.watch_app(name, handle);
}

/// Stops a running application by cancelling its whole subtree. Unknown
/// names are ignored.
pub fn stop(node: &Node, name: &str) {
    if let Some(app) = node.apps().remove(name) {
        app.abort.abort();
    }
}
