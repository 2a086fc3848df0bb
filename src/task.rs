use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;

pub const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

pub struct Pending<T> {
    future: BoxFuture<'static, Result<T>>,
    cancel: CancellationToken,
}

pub enum Outcome<T> {
    Completed(T),
    Failed(anyhow::Error),
    Cancelled(CancellationToken),
}

impl<T: Send + 'static> Pending<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_cancel(future, CancellationToken::new())
    }

    /// Like [`Pending::new`], for producers whose background work outlives
    /// the future and must observe the same token.
    pub fn with_cancel<F>(future: F, cancel: CancellationToken) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            future: future.boxed(),
            cancel,
        }
    }

    #[cfg(test)]
    pub fn ready(value: T) -> Self {
        Self::new(async move { Ok(value) })
    }

    #[cfg(test)]
    pub fn failed(error: anyhow::Error) -> Self {
        Self::new(async move { Err(error) })
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts `next` with the value of this operation once it succeeds.
    /// Both stages answer to this operation's cancel handle, including any
    /// work the second stage leaves running after it resolves.
    pub fn then<U, F>(self, next: F) -> Pending<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Pending<U> + Send + 'static,
    {
        let Pending { future, cancel } = self;
        let token = cancel.clone();
        let chained = async move {
            let value = future.await?;
            if token.is_cancelled() {
                return Err(anyhow!("cancelled before next stage"));
            }
            let stage = next(value);
            link_cancel(token, stage.cancel.clone());
            stage.future.await
        };
        Pending {
            future: chained.boxed(),
            cancel,
        }
    }

    pub async fn wait(self) -> Outcome<T> {
        let Pending { future, cancel } = self;
        let token = cancel.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled(cancel),
            result = future => {
                if cancel.is_cancelled() {
                    Outcome::Cancelled(cancel)
                } else {
                    match result {
                        Ok(value) => Outcome::Completed(value),
                        Err(error) => Outcome::Failed(error),
                    }
                }
            }
        }
    }
}

impl Pending<()> {
    pub fn delay(duration: Duration) -> Self {
        Self::new(async move {
            sleep(duration).await;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub frame: &'static str,
    pub elapsed: Duration,
}

type ProgressHook = Box<dyn FnMut(Progress) + Send>;
type CancelHook = Box<dyn FnOnce(CancellationToken) + Send>;

pub struct Task<T> {
    pending: Pending<T>,
    on_progress: Option<ProgressHook>,
    on_cancel: Option<CancelHook>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new(pending: Pending<T>) -> Self {
        Self {
            pending,
            on_progress: None,
            on_cancel: None,
        }
    }

    pub fn on_progress(mut self, hook: impl FnMut(Progress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(hook));
        self
    }

    pub fn on_cancel(mut self, hook: impl FnOnce(CancellationToken) + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    pub fn then<U, F>(self, next: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Pending<U> + Send + 'static,
    {
        Task {
            pending: self.pending.then(next),
            on_progress: self.on_progress,
            on_cancel: self.on_cancel,
        }
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.pending.cancel_handle()
    }

    pub async fn run(self) -> Outcome<T> {
        let Task {
            pending,
            mut on_progress,
            on_cancel,
        } = self;
        let started = Instant::now();
        let mut ticker = interval_at(started + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frame = 0usize;
        let wait = pending.wait();
        tokio::pin!(wait);

        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => break outcome,
                _ = ticker.tick(), if on_progress.is_some() => {
                    if let Some(hook) = on_progress.as_mut() {
                        hook(Progress {
                            frame: SPINNER_FRAMES[frame % SPINNER_FRAMES.len()],
                            elapsed: started.elapsed(),
                        });
                    }
                    frame += 1;
                }
            }
        };

        if let Outcome::Cancelled(token) = &outcome
            && let Some(hook) = on_cancel
        {
            hook(token.clone());
        }
        outcome
    }

    /// Spawns the task. `on_success` and `on_error` never run once the
    /// returned handle has been cancelled.
    pub fn spawn<S, SF, E, EF>(self, on_success: S, on_error: E) -> TaskHandle
    where
        S: FnOnce(T) -> SF + Send + 'static,
        SF: Future<Output = ()> + Send + 'static,
        E: FnOnce(anyhow::Error) -> EF + Send + 'static,
        EF: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel_handle();
        let guard = cancel.clone();
        tokio::spawn(async move {
            match self.run().await {
                Outcome::Completed(value) if !guard.is_cancelled() => on_success(value).await,
                Outcome::Failed(error) if !guard.is_cancelled() => on_error(error).await,
                _ => {}
            }
        });
        TaskHandle { cancel }
    }
}

pub struct TaskHandle {
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn into_cleanup(self) -> impl FnOnce() -> Result<()> + Send + 'static {
        let cancel = self.cancel;
        move || {
            cancel.cancel();
            Ok(())
        }
    }
}

/// Cancels `stage` when `outer` is cancelled. The link ends once either fires.
fn link_cancel(outer: CancellationToken, stage: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = outer.cancelled() => stage.cancel(),
            _ = stage.cancelled() => {}
        }
    });
}

pub async fn next_or_cancelled<S>(cancel: &CancellationToken, stream: &mut S) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = stream.next() => item,
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, Pending, SPINNER_FRAMES, Task};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[tokio::test]
    async fn success_hook_receives_result() {
        let (tx, rx) = oneshot::channel();
        Task::new(Pending::ready(41)).spawn(
            move |value| async move {
                let _ = tx.send(value + 1);
            },
            |_| async {},
        );
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn error_hook_receives_failure() {
        let (tx, rx) = oneshot::channel();
        Task::new(Pending::<u32>::failed(anyhow!("HTTP 500"))).spawn(
            |_| async {},
            move |error| async move {
                let _ = tx.send(error.to_string());
            },
        );
        assert_eq!(rx.await.unwrap(), "HTTP 500");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_only_reports_its_handle() {
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let pending = Pending::delay(Duration::from_secs(5));
        let handle = pending.cancel_handle();
        let task = Task::new(pending).on_cancel(move |token| {
            let _ = cancel_tx.send(token.is_cancelled());
        });

        let success = fired.clone();
        let failure = fired.clone();
        let _spawned = task.spawn(
            move |_| async move { success.store(true, Ordering::SeqCst) },
            move |_| async move { failure.store(true, Ordering::SeqCst) },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        assert!(cancel_rx.await.unwrap());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn chained_stage_runs_only_after_success() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let outcome = Task::new(Pending::<u32>::failed(anyhow!("list failed")))
            .then(move |value| {
                flag.store(true, Ordering::SeqCst);
                Pending::ready(value * 2)
            })
            .run()
            .await;

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert!(!ran.load(Ordering::SeqCst));

        let outcome = Task::new(Pending::ready(3u32))
            .then(|value| Pending::ready(value * 2))
            .run()
            .await;
        assert!(matches!(outcome, Outcome::Completed(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_chain_reaches_the_running_stage() {
        let (stage_tx, stage_rx) = oneshot::channel();
        let pending = Pending::ready(()).then(move |_| {
            let stage = Pending::delay(Duration::from_secs(60));
            let _ = stage_tx.send(stage.cancel_handle());
            stage
        });
        let handle = pending.cancel_handle();
        let waiter = tokio::spawn(pending.wait());

        let stage_token = stage_rx.await.unwrap();
        handle.cancel();

        assert!(matches!(waiter.await.unwrap(), Outcome::Cancelled(_)));
        timeout(Duration::from_secs(1), stage_token.cancelled())
            .await
            .expect("stage token cancelled with the chain");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_resolved_chain_reaches_work_the_stage_left_running() {
        let (stage_tx, stage_rx) = oneshot::channel();
        let pending = Pending::delay(Duration::from_millis(5)).then(move |_| {
            let stage = Pending::new(async { Ok(7u32) });
            let _ = stage_tx.send(stage.cancel_handle());
            stage
        });
        let handle = pending.cancel_handle();

        assert!(matches!(pending.wait().await, Outcome::Completed(7)));
        let stage_token = stage_rx.await.unwrap();
        assert!(!stage_token.is_cancelled());

        handle.cancel();
        timeout(Duration::from_secs(1), stage_token.cancelled())
            .await
            .expect("background work of a finished stage is cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_rotates_frames_while_pending() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let outcome = Task::new(Pending::delay(Duration::from_millis(350)))
            .on_progress(move |progress| sink.lock().unwrap().push(progress.frame))
            .run()
            .await;

        assert!(matches!(outcome, Outcome::Completed(())));
        assert_eq!(*frames.lock().unwrap(), SPINNER_FRAMES[..3].to_vec());
    }
}
