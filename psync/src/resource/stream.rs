//! Derived read-only state streams
//!
//! A selector projects one slice out of a watched state object. It yields
//! the current slice first, then only slices that differ from the last one
//! it yielded.

use tokio::sync::watch;

/// Distinct-until-changed projection of a watched value
pub struct Selector<Src, T> {
    rx: watch::Receiver<Src>,
    project: fn(&Src) -> T,
    last: Option<T>,
}

impl<Src, T> Selector<Src, T>
where
    T: Clone + PartialEq,
{
    pub fn new(rx: watch::Receiver<Src>, project: fn(&Src) -> T) -> Self {
        Self { rx, project, last: None }
    }

    /// Current slice, without waiting
    pub fn get(&self) -> T {
        (self.project)(&self.rx.borrow())
    }

    /// Next distinct slice, or `None` once the source is dropped
    pub async fn next(&mut self) -> Option<T> {
        if self.last.is_none() {
            let current = (self.project)(&self.rx.borrow_and_update());
            self.last = Some(current.clone());
            return Some(current);
        }
        loop {
            self.rx.changed().await.ok()?;
            let value = (self.project)(&self.rx.borrow_and_update());
            if self.last.as_ref() != Some(&value) {
                self.last = Some(value.clone());
                return Some(value);
            }
        }
    }

    /// Wait until the slice satisfies `predicate`, returning it
    pub async fn wait_for(&mut self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let current = self.get();
        if predicate(&current) {
            self.last = Some(current.clone());
            return Some(current);
        }
        loop {
            let value = self.next().await?;
            if predicate(&value) {
                return Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[tokio::test]
    async fn test_selector_skips_unrelated_changes() {
        let (tx, rx) = watch::channel(Pair { a: 1, b: 1 });
        let mut only_a = Selector::new(rx, |p: &Pair| p.a);

        assert_eq!(only_a.next().await, Some(1));
        tx.send_modify(|p| p.b = 2);
        tx.send_modify(|p| p.a = 5);
        assert_eq!(only_a.next().await, Some(5));
        assert_eq!(only_a.get(), 5);

        drop(tx);
        assert_eq!(only_a.next().await, None);
    }

    #[tokio::test]
    async fn test_wait_for() {
        let (tx, rx) = watch::channel(Pair { a: 0, b: 0 });
        let mut only_a = Selector::new(rx, |p: &Pair| p.a);
        let waiter = tokio::spawn(async move { only_a.wait_for(|a| *a >= 3).await });
        for n in 1..=3 {
            tx.send_modify(|p| p.a = n);
            tokio::task::yield_now().await;
        }
        assert_eq!(waiter.await.unwrap(), Some(3));
    }
}
