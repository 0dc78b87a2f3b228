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
use std::sync::Arc;

use thiserror::Error;

/// Describes how a supervised task terminated abnormally.
///
/// It is in many ways similar to the exit status code of a program, with one
/// addition: a task group that loses several tasks at once terminates with an
/// [`ExitReason::Aggregate`] carrying every individual reason.
#[derive(Clone, Debug, Error)]
pub enum ExitReason {
    /// The task was cancelled by its owner (group teardown, `application::stop`,
    /// node shutdown). Cancellation is cooperative teardown, not a failure:
    /// it never triggers a restart.
    #[error("task was cancelled")]
    Cancelled,

    /// The task returned an error.
    #[error("task failed: {0}")]
    Failure(Arc<anyhow::Error>),

    /// The future executing the task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Several tasks of the same group terminated abnormally.
    #[error("multiple tasks terminated abnormally")]
    Aggregate(Vec<ExitReason>),
}

impl ExitReason {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExitReason::Cancelled)
    }

    /// Collapses an aggregate in which every leaf is a cancellation into a
    /// single cancellation.
    ///
    /// The rule is purely structural: leaves are inspected, not messages. If
    /// any leaf is a real failure the aggregate is kept intact, so a genuine
    /// error is never dropped, while cooperative teardown alone never
    /// masquerades as one.
    pub fn defer_to_cancelled(self) -> ExitReason {
        let ExitReason::Aggregate(_) = &self else {
            return self;
        };
        let mut stack: Vec<&ExitReason> = vec![&self];
        while let Some(reason) = stack.pop() {
            match reason {
                ExitReason::Aggregate(children) => stack.extend(children.iter()),
                ExitReason::Cancelled => {}
                ExitReason::Failure(_) | ExitReason::Panicked(_) => return self,
            }
        }
        ExitReason::Cancelled
    }

    /// Folds the abnormal terminations of a task group into at most one
    /// reason: nothing, the only reason, or a deferred aggregate.
    pub(crate) fn combine(mut reasons: Vec<ExitReason>) -> Option<ExitReason> {
        match reasons.len() {
            0 => None,
            1 => Some(reasons.remove(0)),
            _ => Some(ExitReason::Aggregate(reasons).defer_to_cancelled()),
        }
    }
}

impl From<anyhow::Error> for ExitReason {
    fn from(error: anyhow::Error) -> Self {
        // An error crossing a task boundary may already be an exit reason
        // (e.g. a nested supervisor); unwrap it instead of nesting.
        match error.downcast::<ExitReason>() {
            Ok(reason) => reason,
            Err(error) => ExitReason::Failure(Arc::new(error)),
        }
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> ExitReason {
        ExitReason::Failure(Arc::new(anyhow::anyhow!("{message}")))
    }

    #[test]
    fn test_defer_to_cancelled_collapses_cancellations() {
        let aggregate = ExitReason::Aggregate(vec![ExitReason::Cancelled, ExitReason::Cancelled]);
        assert!(matches!(
            aggregate.defer_to_cancelled(),
            ExitReason::Cancelled
        ));
    }

    #[test]
    fn test_defer_to_cancelled_collapses_nested_cancellations() {
        let aggregate = ExitReason::Aggregate(vec![
            ExitReason::Cancelled,
            ExitReason::Aggregate(vec![
                ExitReason::Cancelled,
                ExitReason::Aggregate(vec![ExitReason::Cancelled]),
            ]),
        ]);
        assert!(matches!(
            aggregate.defer_to_cancelled(),
            ExitReason::Cancelled
        ));
    }

    #[test]
    fn test_defer_to_cancelled_keeps_real_failures() {
        let aggregate =
            ExitReason::Aggregate(vec![ExitReason::Cancelled, failure("disk on fire")]);
        let deferred = aggregate.defer_to_cancelled();
        let ExitReason::Aggregate(reasons) = deferred else {
            panic!("expected the aggregate to survive");
        };
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn test_defer_to_cancelled_finds_deep_failures() {
        let aggregate = ExitReason::Aggregate(vec![
            ExitReason::Cancelled,
            ExitReason::Aggregate(vec![
                ExitReason::Cancelled,
                ExitReason::Aggregate(vec![ExitReason::Panicked("boom".to_string())]),
            ]),
        ]);
        assert!(matches!(
            aggregate.defer_to_cancelled(),
            ExitReason::Aggregate(_)
        ));
    }

    #[test]
    fn test_defer_to_cancelled_leaves_plain_reasons_alone() {
        assert!(matches!(
            failure("boom").defer_to_cancelled(),
            ExitReason::Failure(_)
        ));
        assert!(matches!(
            ExitReason::Cancelled.defer_to_cancelled(),
            ExitReason::Cancelled
        ));
    }

    #[test]
    fn test_combine() {
        assert!(ExitReason::combine(Vec::new()).is_none());
        assert!(matches!(
            ExitReason::combine(vec![failure("boom")]),
            Some(ExitReason::Failure(_))
        ));
        assert!(matches!(
            ExitReason::combine(vec![ExitReason::Cancelled, ExitReason::Cancelled]),
            Some(ExitReason::Cancelled)
        ));
        assert!(matches!(
            ExitReason::combine(vec![failure("boom"), ExitReason::Cancelled]),
            Some(ExitReason::Aggregate(_))
        ));
    }

    #[test]
    fn test_exit_reason_round_trips_through_anyhow() {
        let round_tripped: ExitReason = anyhow::Error::new(ExitReason::Cancelled).into();
        assert!(round_tripped.is_cancelled());

        let round_tripped: ExitReason = anyhow::Error::new(failure("boom")).into();
        let ExitReason::Failure(cause) = round_tripped else {
            panic!("expected a failure");
        };
        assert!(cause.to_string().contains("boom"));
    }
}
