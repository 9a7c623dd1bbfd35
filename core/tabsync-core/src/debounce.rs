//! Coalescing scheduled task.
//!
//! Every `schedule` call supersedes the previous one: only the task from the
//! latest call runs, once the quiet window has elapsed without another call.
//! A task that has already started is never interrupted; a later `schedule`
//! only affects tasks still waiting out their window.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct DebounceState {
    generation: u64,
    pending: bool,
}

pub struct Debouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Runs `task` after the quiet window unless superseded. Must be called
    /// from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.pending = true;
            state.generation
        };

        let state = Arc::clone(&self.state);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&state);
                if state.generation != generation {
                    return;
                }
                state.pending = false;
            }
            task().await;
        });
    }

    /// Drops whatever is waiting. Already-running tasks finish.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending
    }
}

fn lock(state: &Mutex<DebounceState>) -> std::sync::MutexGuard<'_, DebounceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_runs_once_after_quiet_window() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            debouncer.schedule(counting_task(&runs));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_run_separately() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting_task(&runs));
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.schedule(counting_task(&runs));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_task() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting_task(&runs));
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!debouncer.is_pending());
    }
}
