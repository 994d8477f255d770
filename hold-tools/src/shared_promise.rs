//! A clonable one-shot promise broadcasting its result to any number of
//! listeners via oneshot channels. Listeners registered after completion get
//! the stored result immediately.

use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use futures::future::{self, Either, FutureExt};
use tokio::sync::oneshot;

struct PromiseState<T> {
    // Errors are not Clone, keep the rendered message instead.
    result: Option<Result<T, String>>,
    listeners: Vec<oneshot::Sender<Result<T, Error>>>,
}

pub struct SharedPromise<T> {
    state: Arc<Mutex<PromiseState<T>>>,
}

impl<T> Clone for SharedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone> Default for SharedPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SharedPromise<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState {
                result: None,
                listeners: Vec::new(),
            })),
        }
    }

    /// Resolve the promise and wake all listeners. The first call wins,
    /// later calls are ignored.
    pub fn set(&self, result: Result<T, Error>) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_some() {
                log::debug!("shared promise already resolved, result dropped");
                return;
            }
            state.result = Some(match &result {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(format!("{:#}", err)),
            });
            std::mem::take(&mut state.listeners)
        };

        for listener in listeners {
            let send = match &result {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(format_err!("{:#}", err)),
            };
            let _ = listener.send(send);
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().result.is_some()
    }

    /// Completed result, if any, without waiting.
    pub fn peek(&self) -> Option<Result<T, Error>> {
        let state = self.state.lock().unwrap();
        state.result.as_ref().map(|result| match result {
            Ok(value) => Ok(value.clone()),
            Err(msg) => Err(format_err!("{}", msg)),
        })
    }

    /// Register a listener.
    pub fn listen(&self) -> impl std::future::Future<Output = Result<T, Error>> {
        let mut state = self.state.lock().unwrap();

        match &state.result {
            Some(Ok(value)) => return Either::Left(future::ready(Ok(value.clone()))),
            Some(Err(msg)) => return Either::Left(future::ready(Err(format_err!("{}", msg)))),
            None => {}
        }

        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        state.listeners.push(tx);

        Either::Right(rx.map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(format_err!("promise abandoned without a result")),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_to_listeners() {
        let promise: SharedPromise<u64> = SharedPromise::new();

        let early = tokio::spawn({
            let listener = promise.listen();
            async move { listener.await }
        });

        promise.set(Ok(7));
        assert_eq!(early.await.unwrap().unwrap(), 7);

        // the result stays available for late listeners
        assert_eq!(promise.listen().await.unwrap(), 7);
        assert_eq!(promise.peek().unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_error_result() {
        let promise: SharedPromise<u64> = SharedPromise::new();
        let listener = promise.listen();

        promise.set(Err(format_err!("boom")));
        // second set is ignored
        promise.set(Ok(1));

        assert!(listener.await.is_err());
        assert!(promise.listen().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_without_result() {
        let promise: SharedPromise<u64> = SharedPromise::new();
        let listener = promise.listen();
        drop(promise);
        assert!(listener.await.is_err());
    }
}
