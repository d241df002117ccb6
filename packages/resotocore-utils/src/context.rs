use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::broadcast;

/// Process-wide cancellation signal and shared runtime handle. Every
/// long-lived service (message bus listener, overdue sweep, HTTP server)
/// takes a clone and races its work against `get_kill_receiver()` in a
/// `tokio::select!`, so a single `kill()` call unwinds the whole process.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<tokio::runtime::Runtime>,
    killed: Arc<AtomicBool>,
    kill_tx: broadcast::Sender<()>,
    // held so `kill_tx.send` never fails with "no receivers" before anyone subscribes
    _kill_rx: Arc<broadcast::Receiver<()>>,
}

impl AppContext {
    pub fn new(rt: Arc<tokio::runtime::Runtime>) -> Self {
        let (kill_tx, kill_rx) = broadcast::channel(1);
        Self {
            rt,
            killed: Arc::new(AtomicBool::new(false)),
            kill_tx,
            _kill_rx: Arc::new(kill_rx),
        }
    }

    pub fn get_kill_receiver(&self) -> broadcast::Receiver<()> {
        self.kill_tx.subscribe()
    }

    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            // a send error just means every receiver already dropped, which is fine on shutdown
            let _ = self.kill_tx.send(());
        }
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> AppContext {
        let rt = Arc::new(tokio::runtime::Runtime::new().unwrap());
        AppContext::new(rt)
    }

    #[test]
    fn kill_is_idempotent_and_observable() {
        let ctx = test_context();
        assert!(!ctx.killed());
        ctx.kill();
        assert!(ctx.killed());
        // second call must not panic on an empty receiver set
        ctx.kill();
    }

    #[tokio::test]
    async fn kill_receiver_observes_signal() {
        let ctx = test_context();
        let mut rx = ctx.get_kill_receiver();
        ctx.kill();
        rx.recv().await.unwrap();
    }
}
