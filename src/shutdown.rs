use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Deferred cleanup action run when a component stops.
pub type StopHandler = Box<dyn FnOnce() -> BoxFuture + Send>;

/// Idempotent stop guard with a handler stack.
///
/// Sessions, pull clients, pushers and the VOD sender all stop the same
/// way: flip the flag exactly once, then run the registered handlers in
/// reverse registration order so teardown unwinds setup.
#[derive(Default)]
pub struct ShutdownChain {
    stopped: AtomicBool,
    handlers: Mutex<Vec<StopHandler>>,
}

impl ShutdownChain {
    pub fn new() -> Self {
        ShutdownChain::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Register a handler. Handlers registered after the chain already ran
    /// are executed immediately.
    pub async fn add(&self, handler: StopHandler) {
        {
            let mut handlers = self.handlers.lock().await;
            if !self.is_stopped() {
                handlers.push(handler);
                return;
            }
        }
        handler().await;
    }

    /// Flip the stop flag and run all handlers. Returns false when the
    /// chain had already stopped; handlers never run twice.
    pub async fn stop(&self) -> bool {
        let handlers = {
            let mut handlers = self.handlers.lock().await;
            if self.stopped.swap(true, Ordering::SeqCst) {
                return false;
            }
            std::mem::take(&mut *handlers)
        };
        for handler in handlers.into_iter().rev() {
            handler().await;
        }
        true
    }
}

#[cfg(test)]
mod shutdown_test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn stop_is_idempotent() {
        let chain = ShutdownChain::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = Arc::clone(&count);
        chain
            .add(Box::new(move || {
                Box::pin(async move {
                    count2.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        assert!(chain.stop().await);
        assert!(!chain.stop().await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_run_in_reverse_order() {
        let chain = ShutdownChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order2 = Arc::clone(&order);
            chain
                .add(Box::new(move || {
                    Box::pin(async move {
                        order2.lock().await.push(tag);
                    })
                }))
                .await;
        }

        chain.stop().await;
        assert_eq!(*order.lock().await, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn late_handler_runs_immediately() {
        let chain = ShutdownChain::new();
        chain.stop().await;

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        chain
            .add(Box::new(move || {
                Box::pin(async move {
                    ran2.store(true, Ordering::SeqCst);
                })
            }))
            .await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
