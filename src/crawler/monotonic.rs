//! Ordered speculative fan-out with monotonic termination
//!
//! Pages are fetched in parallel speculatively; when one of them reports "no
//! more results", everything ordered after it is moot and must not commit,
//! while everything ordered before it still has to finish. The latency cost
//! of discovering the end is therefore one page, not a serial chain.

use std::future::Future;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

/// Runs `tasks` concurrently, enforcing that a `None` ("no more results")
/// outcome at index `k` cancels every task with an index greater than `k`
/// that has not yet resolved. Tasks below `k` are never cancelled by this
/// mechanism and always run to completion.
///
/// Cancellation is cooperative and transitive: each task cancels only its
/// immediate successor, and a cancelled task passes the signal on down the
/// chain. Dropping an in-flight future aborts whatever request it owns, and
/// a cancelled task reports `None` in the returned vector, which preserves
/// input order.
pub async fn join_monotonic<F, T>(tasks: Vec<F>) -> Vec<Option<T>>
where
    F: Future<Output = Option<T>>,
{
    let tokens: Vec<CancellationToken> =
        tasks.iter().map(|_| CancellationToken::new()).collect();

    let wrapped = tasks.into_iter().enumerate().map(|(index, task)| {
        let own = tokens[index].clone();
        let next = tokens.get(index + 1).cloned();
        async move {
            let outcome = tokio::select! {
                biased;
                _ = own.cancelled() => None,
                outcome = task => outcome,
            };
            if outcome.is_none() {
                if let Some(next) = next {
                    next.cancel();
                }
            }
            outcome
        }
    });

    join_all(wrapped).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn flagged(
        delay: Duration,
        outcome: Option<u32>,
    ) -> (impl Future<Output = Option<u32>>, Arc<AtomicBool>) {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let task = async move {
            sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
            outcome
        };
        (task, completed)
    }

    type BoxedTask = std::pin::Pin<Box<dyn Future<Output = Option<u32>>>>;

    #[tokio::test]
    async fn all_successful_tasks_complete_in_order() {
        let tasks: Vec<BoxedTask> = vec![
            Box::pin(async { Some(1u32) }),
            Box::pin(async {
                sleep(Duration::from_millis(10)).await;
                Some(2)
            }),
            Box::pin(async { Some(3) }),
        ];
        let outcomes = join_monotonic(tasks).await;
        assert_eq!(outcomes, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn terminal_outcome_cancels_later_tasks_only() {
        let (early, early_done) = flagged(Duration::from_millis(10), Some(1));
        let (terminal, terminal_done) = flagged(Duration::from_millis(30), None);
        let (late_a, late_a_done) = flagged(Duration::from_millis(300), Some(3));
        let (late_b, late_b_done) = flagged(Duration::from_millis(300), Some(4));

        let tasks: Vec<BoxedTask> = vec![
            Box::pin(early),
            Box::pin(terminal),
            Box::pin(late_a),
            Box::pin(late_b),
        ];
        let outcomes = join_monotonic(tasks).await;

        assert_eq!(outcomes, vec![Some(1), None, None, None]);
        assert!(early_done.load(Ordering::SeqCst));
        assert!(terminal_done.load(Ordering::SeqCst));
        // cancellation propagated down the whole tail
        assert!(!late_a_done.load(Ordering::SeqCst));
        assert!(!late_b_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn earlier_tasks_finish_even_when_slower_than_the_terminal_one() {
        let (slow_early, slow_early_done) = flagged(Duration::from_millis(80), Some(1));
        let (terminal, _) = flagged(Duration::from_millis(5), None);
        let (late, late_done) = flagged(Duration::from_millis(300), Some(3));

        let tasks: Vec<BoxedTask> =
            vec![Box::pin(slow_early), Box::pin(terminal), Box::pin(late)];
        let outcomes = join_monotonic(tasks).await;

        assert_eq!(outcomes, vec![Some(1), None, None]);
        assert!(slow_early_done.load(Ordering::SeqCst));
        assert!(!late_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn terminal_in_last_position_cancels_nothing() {
        let (a, a_done) = flagged(Duration::from_millis(20), Some(1));
        let (b, b_done) = flagged(Duration::from_millis(20), Some(2));
        let (terminal, _) = flagged(Duration::from_millis(1), None);

        let tasks: Vec<BoxedTask> = vec![Box::pin(a), Box::pin(b), Box::pin(terminal)];
        let outcomes = join_monotonic(tasks).await;

        assert_eq!(outcomes, vec![Some(1), Some(2), None]);
        assert!(a_done.load(Ordering::SeqCst));
        assert!(b_done.load(Ordering::SeqCst));
    }
}
