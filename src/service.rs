//! What a hosted service implements, and how the host creates one.

use crate::binder::Binder;
use crate::error::HostError;
use crate::intent::{ComponentName, Intent};
use crate::looper::Looper;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Lifecycle hooks driven by the host. All of them run on the host's main looper.
pub trait RootService: Send + 'static {
    /// Called once, right after the instance is registered with the host.
    fn on_create(&mut self, _ctx: &ServiceContext) {}

    /// First bind. Returning `None` is a null binding.
    fn on_bind(&mut self, intent: &Intent) -> Option<Binder>;

    /// A later bind, only after `on_unbind` asked to be retained. Gets the first bind's intent.
    fn on_rebind(&mut self, _intent: &Intent) {}

    /// Last user left. Return true to stay alive as a daemon.
    fn on_unbind(&mut self, _intent: &Intent) -> bool {
        false
    }

    fn on_destroy(&mut self) {}
}

/// Host operations a service may request. Implemented by the host.
pub trait ServiceControl: Send + Sync {
    /// Force-stops the container for `component`.
    fn stop_service(&self, component: &ComponentName);
}

/// Per-service view of the host.
#[derive(Clone)]
pub struct ServiceContext {
    component: ComponentName,
    daemon: bool,
    looper: Looper,
    control: Weak<dyn ServiceControl>,
}

impl ServiceContext {
    pub fn new(
        component: ComponentName,
        daemon: bool,
        looper: Looper,
        control: Weak<dyn ServiceControl>,
    ) -> Self {
        Self {
            component,
            daemon,
            looper,
            control,
        }
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn package(&self) -> &str {
        &self.component.package
    }

    /// Whether this service lives in the daemon host.
    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn looper(&self) -> &Looper {
        &self.looper
    }

    /// Asks the host to force-stop this service. Always deferred, so it is safe
    /// to call from inside a lifecycle hook.
    pub fn stop_self(&self) {
        let control = self.control.clone();
        let component = self.component.clone();
        self.looper.post(move || {
            if let Some(control) = control.upgrade() {
                control.stop_service(&component);
            }
        });
    }
}

/// Creates service instances.
pub trait ServiceFactory: Send + Sync {
    fn create(&self) -> Box<dyn RootService>;
}

impl<F> ServiceFactory for F
where
    F: Fn() -> Box<dyn RootService> + Send + Sync,
{
    fn create(&self) -> Box<dyn RootService> {
        self()
    }
}

/// Service factories keyed by fully-qualified class name.
#[derive(Default, Clone)]
pub struct ServiceFactoryRegistry {
    factories: HashMap<String, Arc<dyn ServiceFactory>>,
}

impl ServiceFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: impl Into<String>, factory: impl ServiceFactory + 'static) -> &mut Self {
        let class = class.into();
        debug!(%class, "Registered service factory");
        self.factories.insert(class, Arc::new(factory));
        self
    }

    /// Registers a `Default`-constructible service type.
    pub fn register_default<S>(&mut self, class: impl Into<String>) -> &mut Self
    where
        S: RootService + Default,
    {
        self.register(class, || Box::new(S::default()) as Box<dyn RootService>)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn create(&self, component: &ComponentName) -> Result<Box<dyn RootService>, HostError> {
        self.factories
            .get(&component.class)
            .map(|factory| factory.create())
            .ok_or_else(|| HostError::ServiceResolution(component.class.clone()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Quiet;

    impl RootService for Quiet {
        fn on_bind(&mut self, _: &Intent) -> Option<Binder> {
            None
        }
    }

    struct Recorder(Mutex<Vec<ComponentName>>);

    impl ServiceControl for Recorder {
        fn stop_service(&self, component: &ComponentName) {
            self.0.lock().unwrap().push(component.clone());
        }
    }

    #[test]
    fn test_factory_lookup() {
        let mut registry = ServiceFactoryRegistry::new();
        registry.register_default::<Quiet>("p.Quiet");
        assert!(registry.contains("p.Quiet"));

        let mut svc = registry.create(&ComponentName::new("p", ".Quiet")).unwrap();
        assert!(svc.on_bind(&Intent::default()).is_none());
        assert!(!svc.on_unbind(&Intent::default()));

        let err = registry.create(&ComponentName::new("p", ".Missing")).err().unwrap();
        assert!(matches!(err, HostError::ServiceResolution(c) if c == "p.Missing"));
    }

    #[test]
    fn test_stop_self_is_posted() {
        let looper = Looper::spawn("svc-ctx").unwrap();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak = Arc::downgrade(&recorder) as Weak<dyn ServiceControl>;
        let ctx = ServiceContext::new(ComponentName::new("p", ".S"), true, looper.clone(), weak);

        let inner = ctx.clone();
        let seen_inline = looper
            .run_and_wait({
                let recorder = Arc::clone(&recorder);
                move || {
                    inner.stop_self();
                    recorder.0.lock().unwrap().len()
                }
            })
            .unwrap();
        looper.run_and_wait(|| ()).unwrap();

        assert_eq!(seen_inline, 0);
        assert_eq!(*recorder.0.lock().unwrap(), vec![ComponentName::new("p", "p.S")]);
        assert!(ctx.is_daemon());
        looper.quit();
    }
}
