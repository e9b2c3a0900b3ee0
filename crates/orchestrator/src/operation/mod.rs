use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::types::ApiError;

/// How many freshly generated names are tried before giving up on the name
/// source.
const MAX_NAME_ATTEMPTS: usize = 10;

pub type OperationResult<T> = Result<T, ApiError>;

/// Snapshot of an operation. The registry keeps the canonical state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation<T> {
    pub name: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult<T>>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OperationManagerError {
    #[error("operation not found: {0}")]
    NotFound(String),
    #[error("operation not done: {0}")]
    NotDone(String),
    #[error("operation already completed: {0}")]
    AlreadyCompleted(String),
    #[error("waiting for operation {0} timed out")]
    WaitTimeout(String),
}

impl From<OperationManagerError> for ApiError {
    fn from(err: OperationManagerError) -> Self {
        match err {
            OperationManagerError::NotFound(_) => ApiError::not_found(err.to_string()),
            OperationManagerError::NotDone(_) => ApiError::not_found(err.to_string()),
            OperationManagerError::AlreadyCompleted(_) => ApiError::internal(err.to_string()),
            OperationManagerError::WaitTimeout(_) => {
                ApiError::service_unavailable(err.to_string())
            }
        }
    }
}

struct Entry<T> {
    result: Mutex<Option<OperationResult<T>>>,
    done_tx: watch::Sender<bool>,
}

impl<T: Clone> Entry<T> {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);
        Entry {
            result: Mutex::new(None),
            done_tx,
        }
    }

    fn snapshot(&self, name: &str) -> Operation<T> {
        let result = self.result.lock().expect("acquire operation lock").clone();
        Operation {
            name: name.to_string(),
            done: result.is_some(),
            result,
        }
    }
}

/// Registry of long running operations.
///
/// Producers create an operation, do their work elsewhere and `complete` it
/// exactly once. Consumers poll with `get`/`get_result` or block with `wait`.
pub struct OperationManager<T> {
    entries: RwLock<HashMap<String, Arc<Entry<T>>>>,
    name_gen: Box<dyn Fn() -> String + Send + Sync>,
}

impl<T: Clone + Send + Sync + 'static> Default for OperationManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> OperationManager<T> {
    pub fn new() -> Self {
        Self::with_name_generator(|| Uuid::new_v4().to_string())
    }

    pub fn with_name_generator(name_gen: impl Fn() -> String + Send + Sync + 'static) -> Self {
        OperationManager {
            entries: RwLock::new(HashMap::new()),
            name_gen: Box::new(name_gen),
        }
    }

    pub async fn new_operation(&self) -> Operation<T> {
        let mut entries = self.entries.write().await;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = (self.name_gen)();
            if entries.contains_key(&name) {
                tracing::warn!("operation name {name} already taken; generating another one");
                continue;
            }

            let entry = Arc::new(Entry::new());
            let op = entry.snapshot(&name);
            entries.insert(name, entry);
            return op;
        }

        panic!(
            "operation name generator produced {MAX_NAME_ATTEMPTS} names already in use; it is not producing unique names"
        );
    }

    pub async fn get(&self, name: &str) -> Result<Operation<T>, OperationManagerError> {
        let entry = self.entry(name).await?;
        Ok(entry.snapshot(name))
    }

    pub async fn get_result(
        &self,
        name: &str,
    ) -> Result<OperationResult<T>, OperationManagerError> {
        let entry = self.entry(name).await?;
        let result = entry.result.lock().expect("acquire operation lock").clone();
        result.ok_or_else(|| OperationManagerError::NotDone(name.to_string()))
    }

    pub async fn complete(
        &self,
        name: &str,
        result: OperationResult<T>,
    ) -> Result<(), OperationManagerError> {
        let entry = self.entry(name).await?;
        {
            let mut slot = entry.result.lock().expect("acquire operation lock");
            if slot.is_some() {
                return Err(OperationManagerError::AlreadyCompleted(name.to_string()));
            }
            *slot = Some(result);
        }

        entry.done_tx.send_replace(true);
        tracing::debug!("operation {name} completed");
        Ok(())
    }

    /// Blocks until the operation is done or `timeout` elapses. A zero
    /// `timeout` waits without limit. Timing out leaves the operation running.
    pub async fn wait(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<OperationResult<T>, OperationManagerError> {
        let entry = self.entry(name).await?;
        let mut done_rx = entry.done_tx.subscribe();

        let done = async {
            // The sender lives in `entry`, which is held for the whole wait.
            let _ = done_rx.wait_for(|done| *done).await;
        };

        if timeout.is_zero() {
            done.await;
        } else if tokio::time::timeout(timeout, done).await.is_err() {
            return Err(OperationManagerError::WaitTimeout(name.to_string()));
        }

        let result = entry.result.lock().expect("acquire operation lock").clone();
        result.ok_or_else(|| OperationManagerError::NotDone(name.to_string()))
    }

    pub async fn list_running(&self) -> Vec<Operation<T>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(name, entry)| entry.snapshot(name))
            .filter(|op| !op.done)
            .collect()
    }

    async fn entry(&self, name: &str) -> Result<Arc<Entry<T>>, OperationManagerError> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OperationManagerError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Instant};

    use super::*;
    use crate::types::ErrorKind;

    #[tokio::test]
    async fn test_new_operation_is_not_done() {
        let om = OperationManager::<u32>::new();
        let op = om.new_operation().await;

        assert!(!op.done);
        assert!(op.result.is_none());
        assert!(Uuid::parse_str(&op.name).is_ok());

        let got = om.get(&op.name).await.expect("get");
        assert_eq!(got, op);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let om = OperationManager::<u32>::new();

        assert_eq!(
            om.get("foo").await,
            Err(OperationManagerError::NotFound("foo".to_string()))
        );
        assert_eq!(
            om.complete("foo", Ok(1)).await,
            Err(OperationManagerError::NotFound("foo".to_string()))
        );
        assert_eq!(
            om.wait("foo", Duration::from_secs(1)).await,
            Err(OperationManagerError::NotFound("foo".to_string()))
        );
    }

    #[tokio::test]
    async fn test_get_result_before_completion() {
        let om = OperationManager::<u32>::new();
        let op = om.new_operation().await;

        assert_eq!(
            om.get_result(&op.name).await,
            Err(OperationManagerError::NotDone(op.name.clone()))
        );

        om.complete(&op.name, Ok(7)).await.expect("complete");
        assert_eq!(om.get_result(&op.name).await, Ok(Ok(7)));
    }

    #[tokio::test]
    async fn test_completed_operation_is_terminal() {
        let om = OperationManager::<u32>::new();
        let op = om.new_operation().await;

        om.complete(&op.name, Ok(1)).await.expect("complete");
        assert_eq!(
            om.complete(&op.name, Err(ApiError::internal("late failure")))
                .await,
            Err(OperationManagerError::AlreadyCompleted(op.name.clone()))
        );

        let got = om.get(&op.name).await.expect("get");
        assert!(got.done);
        assert_eq!(got.result, Some(Ok(1)));
    }

    #[tokio::test]
    async fn test_failed_operation_is_done() {
        let om = OperationManager::<u32>::new();
        let op = om.new_operation().await;

        om.complete(&op.name, Err(ApiError::conflict("exists")))
            .await
            .expect("complete");

        let got = om.get(&op.name).await.expect("get");
        assert!(got.done);
        let err = got.result.expect("result").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_wait_returns_result_completed_elsewhere() {
        let om = Arc::new(OperationManager::<String>::new());
        let op = om.new_operation().await;

        tokio::spawn({
            let om = om.clone();
            let name = op.name.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                om.complete(&name, Ok("hello".to_string()))
                    .await
                    .expect("complete");
            }
        });

        let res = om
            .wait(&op.name, Duration::from_secs(5))
            .await
            .expect("wait");
        assert_eq!(res, Ok("hello".to_string()));
    }

    #[tokio::test]
    async fn test_wait_on_completed_operation_returns_immediately() {
        let om = OperationManager::<u32>::new();
        let op = om.new_operation().await;
        om.complete(&op.name, Ok(3)).await.expect("complete");

        let res = om
            .wait(&op.name, Duration::from_millis(1))
            .await
            .expect("wait");
        assert_eq!(res, Ok(3));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let om = OperationManager::<u32>::new();
        let op = om.new_operation().await;
        let timeout = Duration::from_millis(50);

        let start = Instant::now();
        let res = om.wait(&op.name, timeout).await;

        assert!(start.elapsed() >= timeout);
        assert_eq!(res, Err(OperationManagerError::WaitTimeout(op.name.clone())));

        // Timing out does not touch the operation itself.
        om.complete(&op.name, Ok(5)).await.expect("complete");
        assert_eq!(om.get_result(&op.name).await, Ok(Ok(5)));
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_until_done() {
        let om = Arc::new(OperationManager::<u32>::new());
        let op = om.new_operation().await;

        let waiter = tokio::spawn({
            let om = om.clone();
            let name = op.name.clone();
            async move { om.wait(&name, Duration::ZERO).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        om.complete(&op.name, Ok(9)).await.expect("complete");
        let res = waiter.await.expect("join");
        assert_eq!(res, Ok(Ok(9)));
    }

    #[tokio::test]
    async fn test_multiple_waiters_are_woken() {
        let om = Arc::new(OperationManager::<u32>::new());
        let op = om.new_operation().await;

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let om = om.clone();
                let name = op.name.clone();
                tokio::spawn(async move { om.wait(&name, Duration::from_secs(5)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        om.complete(&op.name, Ok(11)).await.expect("complete");

        for waiter in waiters {
            assert_eq!(waiter.await.expect("join"), Ok(Ok(11)));
        }
    }

    #[tokio::test]
    async fn test_list_running() {
        let om = OperationManager::<u32>::new();
        let a = om.new_operation().await;
        let b = om.new_operation().await;
        let c = om.new_operation().await;
        om.complete(&b.name, Ok(0)).await.expect("complete");

        let mut running: Vec<String> = om
            .list_running()
            .await
            .into_iter()
            .map(|op| op.name)
            .collect();
        running.sort();

        let mut expected = vec![a.name, c.name];
        expected.sort();
        assert_eq!(running, expected);
    }

    #[tokio::test]
    async fn test_name_collision_is_retried() {
        let names = Mutex::new(VecDeque::from(["a", "a", "b"]));
        let om = OperationManager::<u32>::with_name_generator(move || {
            names.lock().unwrap().pop_front().unwrap_or("z").to_string()
        });

        assert_eq!(om.new_operation().await.name, "a");
        assert_eq!(om.new_operation().await.name, "b");
    }

    #[tokio::test]
    #[should_panic(expected = "not producing unique names")]
    async fn test_name_generator_exhaustion_panics() {
        let om = OperationManager::<u32>::with_name_generator(|| "same".to_string());
        om.new_operation().await;
        om.new_operation().await;
    }
}
