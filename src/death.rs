use crate::binder::{Binder, DeathLink, DeathRecipient};
use crate::error::ChannelError;
use crate::looper::Looper;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::trace;

/// Receives death notifications on the main looper.
pub trait DeathHandler: Send + Sync + 'static {
    fn on_binder_died(&self);
}

/// Watches one capability and forwards its death to the main looper exactly once.
pub struct DeathWatcher {
    binder: Binder,
    looper: Looper,
    handler: Weak<dyn DeathHandler>,
    link: Mutex<Option<DeathLink>>,
    released: AtomicBool,
}

impl DeathWatcher {
    /// Links to `binder`. Fails with [`ChannelError::DeadObject`] when it is already dead.
    pub fn watch(
        binder: Binder,
        looper: Looper,
        handler: Weak<dyn DeathHandler>,
    ) -> Result<Arc<Self>, ChannelError> {
        let watcher = Arc::new(Self {
            binder: binder.clone(),
            looper,
            handler,
            link: Mutex::new(None),
            released: AtomicBool::new(false),
        });
        let link = binder.link_to_death(Arc::clone(&watcher) as Arc<dyn DeathRecipient>)?;
        *watcher.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        Ok(watcher)
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    /// Stops watching. Later deaths are ignored.
    pub fn release(&self) {
        self.unlink_once();
    }

    /// Returns false if someone else already unlinked.
    fn unlink_once(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(link) = self.link.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.binder.unlink_to_death(link);
        }
        true
    }
}

impl DeathRecipient for DeathWatcher {
    fn binder_died(&self) {
        if !self.unlink_once() {
            trace!(binder = ?self.binder, "Death after release ignored");
            return;
        }
        let handler = self.handler.clone();
        self.looper.run(move || {
            if let Some(handler) = handler.upgrade() {
                handler.on_binder_died();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{BinderObject, CallContext, Parcel};
    use std::sync::atomic::AtomicUsize;

    struct Nop;

    impl BinderObject for Nop {
        fn on_transact(&self, _: u32, data: Parcel, _: &CallContext) -> Result<Parcel, ChannelError> {
            Ok(data)
        }
    }

    struct Count {
        calls: AtomicUsize,
        looper: Looper,
        on_looper: AtomicBool,
    }

    impl DeathHandler for Count {
        fn on_binder_died(&self) {
            self.on_looper.store(self.looper.is_current(), Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter(looper: &Looper) -> Arc<Count> {
        Arc::new(Count {
            calls: AtomicUsize::new(0),
            looper: looper.clone(),
            on_looper: AtomicBool::new(false),
        })
    }

    #[test]
    fn death_is_delivered_once_on_looper() {
        let looper = Looper::spawn("death-test").unwrap();
        let count = counter(&looper);
        let binder = Binder::new(Nop);
        let weak = Arc::downgrade(&count) as Weak<dyn DeathHandler>;
        let _watcher = DeathWatcher::watch(binder.clone(), looper.clone(), weak).unwrap();

        binder.kill();
        binder.kill();
        looper.run_and_wait(|| ()).unwrap();

        assert_eq!(count.calls.load(Ordering::SeqCst), 1);
        assert!(count.on_looper.load(Ordering::SeqCst));
        looper.quit();
    }

    #[test]
    fn released_watcher_ignores_death() {
        let looper = Looper::spawn("death-release").unwrap();
        let count = counter(&looper);
        let binder = Binder::new(Nop);
        let weak = Arc::downgrade(&count) as Weak<dyn DeathHandler>;
        let watcher = DeathWatcher::watch(binder.clone(), looper.clone(), weak).unwrap();

        watcher.release();
        binder.kill();
        looper.run_and_wait(|| ()).unwrap();
        assert_eq!(count.calls.load(Ordering::SeqCst), 0);
        looper.quit();
    }

    #[test]
    fn watching_dead_binder_fails() {
        let looper = Looper::spawn("death-dead").unwrap();
        let count = counter(&looper);
        let binder = Binder::new(Nop);
        binder.kill();
        let weak = Arc::downgrade(&count) as Weak<dyn DeathHandler>;
        assert!(matches!(
            DeathWatcher::watch(binder, looper.clone(), weak),
            Err(ChannelError::DeadObject)
        ));
        looper.quit();
    }
}
