use std::future;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Aborted,
}

/// Clonable remote control for a run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    tx: Arc<watch::Sender<ControlState>>,
}

impl RunHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn listener(&self) -> ControlListener {
        ControlListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ControlState::Paused
    }

    /// Returns false if the run was not running.
    pub fn pause(&self) -> bool {
        self.transition(ControlState::Running, ControlState::Paused)
    }

    /// Returns false if the run was not paused.
    pub fn resume(&self) -> bool {
        self.transition(ControlState::Paused, ControlState::Running)
    }

    /// Returns false if the run was already aborted.
    pub fn abort(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Aborted {
                return false;
            }
            *state = ControlState::Aborted;
            true
        })
    }

    fn transition(&self, from: ControlState, to: ControlState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side used by the engine and the requester.
#[derive(Debug, Clone)]
pub struct ControlListener {
    rx: watch::Receiver<ControlState>,
}

impl ControlListener {
    pub fn state(&self) -> ControlState {
        *self.rx.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == ControlState::Aborted
    }

    /// Resolves once the run is aborted. Never resolves if every handle is
    /// dropped first.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() == ControlState::Aborted {
                return;
            }
            if self.rx.changed().await.is_err() {
                future::pending::<()>().await;
            }
        }
    }

    /// Wait while paused. Returns the state that ended the wait.
    pub async fn wait_while_paused(&mut self) -> ControlState {
        loop {
            let state = *self.rx.borrow_and_update();
            if state != ControlState::Paused {
                return state;
            }
            if self.rx.changed().await.is_err() {
                return state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transitions() {
        let handle = RunHandle::new();
        assert!(!handle.resume());
        assert!(handle.pause());
        assert!(!handle.pause());
        assert!(handle.is_paused());
        assert!(handle.resume());
        assert!(handle.abort());
        assert!(!handle.abort());
        assert!(!handle.pause());
        assert_eq!(handle.state(), ControlState::Aborted);
    }

    #[tokio::test]
    async fn aborted_resolves_after_abort() {
        let handle = RunHandle::new();
        let mut listener = handle.listener();
        let remote = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.abort();
        });
        tokio::time::timeout(Duration::from_secs(2), listener.aborted())
            .await
            .expect("abort was not observed");
        assert!(listener.is_aborted());
    }

    #[tokio::test]
    async fn wait_while_paused_returns_on_resume() {
        let handle = RunHandle::new();
        handle.pause();
        let mut listener = handle.listener();
        let remote = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.resume();
        });
        let state = tokio::time::timeout(Duration::from_secs(2), listener.wait_while_paused())
            .await
            .expect("resume was not observed");
        assert_eq!(state, ControlState::Running);
    }
}
