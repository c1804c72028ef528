//! Cancellation tokens and termination-signal wiring.
//!
//! A [`ShutdownTrigger`] fires once; every [`Shutdown`] subscribed to it
//! observes the firing at its next suspension point.  The flag is level
//! triggered (a `watch` channel holding `bool`), so a task that starts
//! waiting after the trigger fired still sees it.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::watch;

/// Fires cancellation for every subscribed [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes a [`ShutdownTrigger`].  Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/token pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    /// Fire.  Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_trigger, shutdown) = channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the trigger has fired.  Pends forever if the trigger is
    /// dropped without firing.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|fired| *fired).await.is_err() {
            pending::<()>().await;
        }
    }

    /// A child trigger that also fires when `self` fires.
    ///
    /// Firing the child does not affect `self`.  Must be called inside a
    /// tokio runtime; the link task ends when every child token is dropped.
    pub fn child(&self) -> (ShutdownTrigger, Shutdown) {
        let (trigger, token) = channel();
        let link = trigger.clone();
        let mut parent = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => link.trigger(),
                _ = link.tx.closed() => {}
            }
        });
        (trigger, token)
    }
}

/// Wait for SIGINT or (on unix) SIGTERM and return the signal's name.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
            _ = term.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "SIGINT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_subscriber_sees_earlier_trigger() {
        let (trigger, _keep) = channel();
        trigger.trigger();
        let mut late = trigger.subscribe();
        assert!(late.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), late.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let (trigger, token) = channel();
        trigger.trigger();
        trigger.trigger();
        assert!(trigger.is_triggered());
        assert!(token.is_triggered());
    }

    #[tokio::test]
    async fn never_does_not_fire() {
        let mut token = Shutdown::never();
        let res = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(res.is_err());
        assert!(!token.is_triggered());
    }

    #[tokio::test]
    async fn child_follows_parent_but_not_the_reverse() {
        let (parent, parent_token) = channel();
        let (child, mut child_token) = parent_token.child();

        child.trigger();
        assert!(child_token.is_triggered());
        assert!(!parent_token.is_triggered());

        let (_other, mut other_token) = parent_token.child();
        parent.trigger();
        tokio::time::timeout(Duration::from_secs(1), other_token.cancelled())
            .await
            .expect("child should follow its parent");
        child_token.cancelled().await;
    }
}
