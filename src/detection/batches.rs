//! Deadline-bounded collection of batch futures
//!
//! Both detectors fan work out to blocking workers. Results are gathered in
//! completion order so that, when the page deadline passes or the job is
//! cancelled, everything finished so far is kept and only the batches still
//! in flight are abandoned.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outputs of the finished futures
#[derive(Debug)]
pub struct Collected<T> {
    pub done: Vec<T>,
    /// Futures still running when collection stopped
    pub abandoned: usize,
    /// Collection stopped because the deadline passed
    pub deadline_hit: bool,
}

/// Drive `tasks` to completion, stopping early at `deadline` or when
/// `cancel` fires
pub async fn collect_until<F, T>(tasks: Vec<F>, deadline: Option<Instant>, cancel: &CancellationToken) -> Collected<T>
where
    F: Future<Output = T>,
{
    let total = tasks.len();
    let mut pending: FuturesUnordered<F> = tasks.into_iter().collect();
    let mut done = Vec::with_capacity(total);
    let mut deadline_hit = false;

    let sleep = tokio::time::sleep_until(match deadline {
        Some(at) => tokio::time::Instant::from_std(at),
        None => tokio::time::Instant::now() + std::time::Duration::from_secs(86_400 * 365),
    });
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = pending.next() => match next {
                Some(output) => done.push(output),
                None => break,
            },
            _ = &mut sleep, if deadline.is_some() => {
                deadline_hit = true;
                break;
            }
        }
    }

    Collected {
        abandoned: total - done.len(),
        done,
        deadline_hit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn delayed(ms: u64, value: u32) -> impl Future<Output = u32> {
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            value
        }
    }

    #[tokio::test]
    async fn test_collects_everything_without_deadline() {
        let tasks = vec![delayed(20, 1), delayed(0, 2), delayed(10, 3)];
        let collected = collect_until(tasks, None, &CancellationToken::new()).await;
        assert_eq!(collected.done, vec![2, 3, 1]);
        assert_eq!(collected.abandoned, 0);
        assert!(!collected.deadline_hit);
    }

    #[tokio::test]
    async fn test_deadline_keeps_finished_outputs() {
        let tasks = vec![delayed(0, 1), delayed(5_000, 2), delayed(5, 3)];
        let deadline = Instant::now() + Duration::from_millis(300);
        let started = Instant::now();
        let collected = collect_until(tasks, Some(deadline), &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(collected.done, vec![1, 3]);
        assert_eq!(collected.abandoned, 1);
        assert!(collected.deadline_hit);
    }

    #[tokio::test]
    async fn test_cancel_stops_collection() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let collected = collect_until(vec![delayed(5_000, 1)], None, &cancel).await;
        assert!(collected.done.is_empty());
        assert_eq!(collected.abandoned, 1);
        assert!(!collected.deadline_hit);
    }
}
