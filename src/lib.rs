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

#![deny(clippy::disallowed_methods)]

//! otplite is a small OTP-flavored runtime for tokio.
//!
//! It solves the following problem:
//! - run a tree of async tasks under supervisors with restart policies
//!   and restart-intensity budgets.
//! - let tasks talk to each other through named rendezvous mailboxes.
//! - build request/response servers (generic servers) on top of those
//!   mailboxes without rewriting the receive loop every time.
//!
//! A [`Node`] hosts one or more applications, each application runs a
//! supervision tree, and any task in the tree may open a mailbox to receive
//! messages. Everything is cooperative: a node is driven by a
//! current-thread tokio runtime and no component spawns threads.

pub mod application;
pub mod dynamic_supervisor;
mod envelope;
mod exit;
pub mod gen_server;
pub mod logging;
pub mod mailbox;
pub mod node;
mod registry;
pub mod supervisor;

pub use application::AppSpec;
pub use envelope::{CallMessage, CastMessage, DynMessage, GenServerExited, ReplyTo};
pub use exit::ExitReason;
pub use gen_server::{CallError, GenServer, InvalidReply, NotImplemented, Outcome};
pub use logging::{LogFormat, LogLevel};
pub use mailbox::{MailboxError, MailboxGuard, MailboxId, Recipient};
pub use node::Node;
pub use supervisor::{ChildSpec, RestartStrategy, SupervisorOptions};
