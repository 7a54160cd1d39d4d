use futures::channel::oneshot;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// The releasing half of a [`Gated`] future.
///
/// Dropping a latch without calling [`release`](Self::release) abandons the
/// gated body: the future resolves to `None` without ever polling it.
#[derive(Debug)]
pub struct Latch(oneshot::Sender<()>);

impl Latch {
    /// Let the gated body start running.
    pub fn release(self) {
        // The receiving side may already be gone (task aborted); nothing to
        // release in that case.
        _ = self.0.send(());
    }
}

pin_project! {
    /// A future that stays parked until its [`Latch`] is released, then
    /// drives its body to completion.
    ///
    /// The body is never polled before release, so any work inside an
    /// `async` block is deferred until then.
    #[must_use = "futures do nothing unless polled"]
    pub struct Gated<F> {
        latch: oneshot::Receiver<()>,
        #[pin]
        body: F,
        released: bool,
    }
}

/// Wrap `body` behind a latch.
pub fn gate<F: Future>(body: F) -> (Latch, Gated<F>) {
    let (tx, rx) = oneshot::channel();
    (Latch(tx), Gated { latch: rx, body, released: false })
}

impl<F: Future> Future for Gated<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if !*this.released {
            match ready!(Pin::new(this.latch).poll(cx)) {
                Ok(()) => *this.released = true,
                // Latch dropped without being released.
                Err(oneshot::Canceled) => return Poll::Ready(None),
            }
        }
        this.body.poll(cx).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn body_does_not_run_before_release() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (latch, gated) = gate(async move {
            flag.store(true, Ordering::SeqCst);
            7
        });
        let handle = tokio::spawn(gated);
        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));
        latch.release();
        assert_eq!(handle.await.unwrap(), Some(7));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_latch_abandons_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (latch, gated) = gate(async move { flag.store(true, Ordering::SeqCst) });
        drop(latch);
        assert_eq!(gated.await, None);
        assert!(!ran.load(Ordering::SeqCst));
    }
}
