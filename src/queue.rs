use crate::error::{Error, Result};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type BoxedAction<T> = Box<dyn FnOnce() -> BoxFuture<T> + Send>;

struct PendingTask<T> {
    label: String,
    action: BoxedAction<T>,
    reply: oneshot::Sender<Result<T>>,
}

struct QueueState<T> {
    run_id: Option<String>,
    next_order: u64,
    processing: bool,
    pending: BTreeMap<u64, PendingTask<T>>,
}

impl<T> QueueState<T> {
    fn is_idle(&self) -> bool {
        !self.processing && self.pending.is_empty()
    }
}

/// Point-in-time view of a queue, for diagnostics and status endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub run_id: Option<String>,
    pub next_order: u64,
    pub processing: bool,
    pub pending: Vec<u64>,
}

pub struct OrderedTaskQueue<T> {
    name: Arc<str>,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for OrderedTaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> OrderedTaskQueue<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(QueueState {
                run_id: None,
                next_order: 0,
                processing: false,
                pending: BTreeMap::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a task and return a handle to its eventual outcome.
    ///
    /// Validation happens before anything is stored: a rejected call leaves the
    /// queue untouched and `action` is dropped without running. Must be called
    /// from within a tokio runtime.
    pub fn enqueue<F, Fut>(
        &self,
        run_id: &str,
        order: u64,
        label: impl Into<String>,
        action: F,
    ) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        if run_id.trim().is_empty() {
            return Err(self.invalid(format!("task {label} has no run id")));
        }

        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            let current = state.run_id.clone();
            match current.as_deref() {
                Some(active) if active != run_id => {
                    if !state.is_idle() {
                        return Err(Error::QueueBusy {
                            queue: self.name.to_string(),
                            active_run: active.to_string(),
                        });
                    }
                    debug!(queue = %self.name, from = active, to = run_id, "switching run");
                    state.run_id = Some(run_id.to_string());
                    state.next_order = 0;
                    state.pending.clear();
                }
                Some(_) => {}
                None => {
                    state.run_id = Some(run_id.to_string());
                    state.next_order = 0;
                }
            }

            if order < state.next_order || (state.processing && order == state.next_order) {
                return Err(self.invalid(format!(
                    "order {order} ({label}) was already taken in run {run_id}"
                )));
            }
            if state.pending.contains_key(&order) {
                return Err(self.invalid(format!(
                    "order {order} ({label}) is already pending in run {run_id}"
                )));
            }

            debug!(queue = %self.name, run = run_id, order, label = %label, "task enqueued");
            state.pending.insert(
                order,
                PendingTask {
                    label: label.clone(),
                    action: Box::new(move || Box::pin(action()) as BoxFuture<T>),
                    reply,
                },
            );
        }

        self.drain();
        Ok(TaskHandle {
            queue: Arc::clone(&self.name),
            label,
            rx,
        })
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            run_id: state.run_id.clone(),
            next_order: state.next_order,
            processing: state.processing,
            pending: state.pending.keys().copied().collect(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Start the task at the cursor if nothing is running. Never recurses:
    /// completion schedules the next drain on a fresh task.
    fn drain(&self) {
        let (order, task) = {
            let mut state = self.lock();
            if state.processing {
                return;
            }
            let order = state.next_order;
            match state.pending.remove(&order) {
                Some(task) => {
                    state.processing = true;
                    (order, task)
                }
                None => return,
            }
        };

        let queue = self.clone();
        tokio::spawn(async move {
            let PendingTask {
                label,
                action,
                reply,
            } = task;
            debug!(queue = %queue.name, order, label = %label, "task started");
            let outcome = match AssertUnwindSafe(async move { action().await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(payload) => Err(Error::TaskPanicked {
                    queue: queue.name.to_string(),
                    label: label.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            };
            if let Err(err) = &outcome {
                warn!(queue = %queue.name, order, label = %label, "task failed: {err}");
            }
            if reply.send(outcome).is_err() {
                debug!(queue = %queue.name, order, "caller dropped handle");
            }
            {
                let mut state = queue.lock();
                state.next_order = order + 1;
                state.processing = false;
            }
            tokio::spawn(async move { queue.drain() });
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn invalid(&self, reason: String) -> Error {
        Error::InvalidTask {
            queue: self.name.to_string(),
            reason,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Outcome of one queued task.
pub struct TaskHandle<T> {
    queue: Arc<str>,
    label: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("queue", &self.queue)
            .field("label", &self.label)
            .finish()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::TaskDropped {
                queue: self.queue.to_string(),
                label: self.label.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use std::time::Duration;
    use tokio::time::sleep;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: String) {
        log.lock().unwrap().push(entry);
    }

    #[tokio::test]
    async fn delivers_in_order_despite_enqueue_order() {
        let queue: OrderedTaskQueue<u64> = OrderedTaskQueue::new("applio");
        let log = recorder();

        let mut handles = Vec::new();
        for (order, delay_ms) in [(2u64, 120u64), (0, 10), (1, 10)] {
            let log = Arc::clone(&log);
            let handle = queue
                .enqueue("run-a", order, format!("segment {order}"), move || async move {
                    push(&log, format!("start {order}"));
                    sleep(Duration::from_millis(delay_ms)).await;
                    push(&log, format!("end {order}"));
                    Ok(order)
                })
                .unwrap();
            handles.push(handle);
        }

        let results = Arc::new(Mutex::new(Vec::new()));
        let waiters: Vec<_> = handles
            .into_iter()
            .map(|h| {
                let results = Arc::clone(&results);
                tokio::spawn(async move {
                    let value = h.await.unwrap();
                    results.lock().unwrap().push(value);
                })
            })
            .collect();
        for w in waiters {
            w.await.unwrap();
        }

        assert_eq!(*results.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert!(queue.is_idle());
        assert_eq!(queue.status().next_order, 3);
    }

    #[tokio::test]
    async fn failure_does_not_stall_later_orders() {
        let queue: OrderedTaskQueue<&'static str> = OrderedTaskQueue::new("google");
        let first = queue
            .enqueue("run", 0, "bad", || async {
                Err(Error::from(ServiceError::from_status("gemini", 500, "boom")))
            })
            .unwrap();
        let second = queue.enqueue("run", 1, "good", || async { Ok("ok") }).unwrap();

        assert!(first.await.is_err());
        assert_eq!(second.await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn panicking_task_releases_its_slot() {
        let queue: OrderedTaskQueue<u8> = OrderedTaskQueue::new("applio");
        let first = queue
            .enqueue("run", 0, "explodes", || async {
                if true {
                    panic!("boom");
                }
                Ok(0)
            })
            .unwrap();
        let second = queue.enqueue("run", 1, "fine", || async { Ok(1) }).unwrap();

        let err = first.await.unwrap_err();
        assert!(matches!(err, Error::TaskPanicked { ref message, .. } if message == "boom"));
        let value = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("order 1 stalled behind the panic")
            .unwrap();
        assert_eq!(value, 1);

        sleep(Duration::from_millis(10)).await;
        assert!(queue.is_idle());
        assert_eq!(queue.status().next_order, 2);
        let next_run = queue.enqueue("run-2", 0, "after", || async { Ok(2) }).unwrap();
        assert_eq!(next_run.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn busy_run_is_rejected_without_touching_pending() {
        let queue: OrderedTaskQueue<()> = OrderedTaskQueue::new("applio");
        // order 1 waits for a missing order 0, so run-a stays busy
        let _parked = queue.enqueue("run-a", 1, "parked", || async { Ok(()) }).unwrap();
        let before = queue.status();

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let err = queue
            .enqueue("run-b", 0, "intruder", move || async move {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .err()
            .unwrap();

        assert!(matches!(err, Error::QueueBusy { ref active_run, .. } if active_run == "run-a"));
        assert_eq!(queue.status(), before);
        sleep(Duration::from_millis(20)).await;
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn idle_queue_switches_run_and_resets_cursor() {
        let queue: OrderedTaskQueue<u8> = OrderedTaskQueue::new("google");
        let a0 = queue.enqueue("run-a", 0, "a0", || async { Ok(1) }).unwrap();
        assert_eq!(a0.await.unwrap(), 1);
        sleep(Duration::from_millis(10)).await;
        assert!(queue.is_idle());

        let b0 = queue.enqueue("run-b", 0, "b0", || async { Ok(2) }).unwrap();
        assert_eq!(b0.await.unwrap(), 2);
        assert_eq!(queue.status().run_id.as_deref(), Some("run-b"));
    }

    #[tokio::test]
    async fn duplicate_order_is_rejected_and_never_runs() {
        let queue: OrderedTaskQueue<&'static str> = OrderedTaskQueue::new("applio");
        let first = queue.enqueue("run", 1, "first", || async { Ok("first") }).unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let dup = queue.enqueue("run", 1, "second", move || async move {
            *flag.lock().unwrap() = true;
            Ok("second")
        });
        assert!(matches!(dup, Err(Error::InvalidTask { .. })));

        let zero = queue.enqueue("run", 0, "zero", || async { Ok("zero") }).unwrap();
        assert_eq!(zero.await.unwrap(), "zero");
        assert_eq!(first.await.unwrap(), "first");
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn rejects_missing_run_id_and_consumed_orders() {
        let queue: OrderedTaskQueue<()> = OrderedTaskQueue::new("applio");
        assert!(matches!(
            queue.enqueue("", 0, "nameless", || async { Ok(()) }),
            Err(Error::InvalidTask { .. })
        ));

        queue.enqueue("run", 0, "zero", || async { Ok(()) }).unwrap().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            queue.enqueue("run", 0, "again", || async { Ok(()) }),
            Err(Error::InvalidTask { .. })
        ));
    }
}
