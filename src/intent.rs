//! Component names, intents and the service key both sides index by.

use crate::error::RootServiceError;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Add this category to an intent to launch (or stop) the service in daemon mode.
pub const CATEGORY_DAEMON_MODE: &str = "rootservice.category.DAEMON_MODE";

/// Identifies a service class inside a package.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[rkyv(derive(Debug))]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        let package = package.into();
        let class = class.into();
        let class = match class.strip_prefix('.') {
            Some(suffix) => format!("{package}.{suffix}"),
            None => class,
        };
        Self { package, class }
    }

    /// `package/class`
    pub fn flatten(&self) -> String {
        format!("{}/{}", self.package, self.class)
    }

    /// `package/.Suffix` when the class lives under the package namespace.
    pub fn flatten_short(&self) -> String {
        match self
            .class
            .strip_prefix(self.package.as_str())
            .filter(|rest| rest.starts_with('.'))
        {
            Some(rest) => format!("{}/{}", self.package, rest),
            None => self.flatten(),
        }
    }

    /// Parses `package/class` or `package/.Suffix`.
    pub fn unflatten(s: &str) -> Option<Self> {
        let (package, class) = s.split_once('/')?;
        if package.is_empty() || class.is_empty() || class == "." {
            return None;
        }
        Some(Self::new(package, class))
    }

    /// Last segment of the class name.
    pub fn short_class(&self) -> &str {
        self.class.rsplit('.').next().unwrap_or(&self.class)
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten_short())
    }
}

impl std::str::FromStr for ComponentName {
    type Err = RootServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::unflatten(s).ok_or_else(|| RootServiceError::InvalidComponent(s.to_string()))
    }
}

/// Describes the service to bind, plus optional categories and extras.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[rkyv(derive(Debug))]
pub struct Intent {
    pub component: Option<ComponentName>,
    pub action: Option<String>,
    pub categories: Vec<String>,
    pub extras: Vec<(String, String)>,
}

impl Intent {
    pub fn for_component(component: ComponentName) -> Self {
        Self {
            component: Some(component),
            ..Self::default()
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        let category = category.into();
        if !self.has_category(&category) {
            self.categories.push(category);
        }
        self
    }

    /// Marks the intent as targeting the daemon process.
    pub fn daemon(self) -> Self {
        self.category(CATEGORY_DAEMON_MODE)
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.extras.retain(|(k, _)| *k != key);
        self.extras.push((key, value.into()));
        self
    }

    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extras
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    pub fn is_daemon(&self) -> bool {
        self.has_category(CATEGORY_DAEMON_MODE)
    }

    /// Copy without extras; this is what the host keeps for later rebinds.
    pub fn clone_filter(&self) -> Self {
        Self {
            component: self.component.clone(),
            action: self.action.clone(),
            categories: self.categories.clone(),
            extras: Vec::new(),
        }
    }
}

/// Map key for services: the component plus which process flavor hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub component: ComponentName,
    pub daemon: bool,
}

impl ServiceKey {
    pub fn new(component: ComponentName, daemon: bool) -> Self {
        Self { component, daemon }
    }

    /// Validates the intent against the client package and derives its key.
    pub fn from_intent(intent: &Intent, package: &str) -> Result<Self, RootServiceError> {
        let component = intent
            .component
            .clone()
            .ok_or(RootServiceError::MissingComponent)?;
        if component.package != package {
            return Err(RootServiceError::ForeignPackage {
                expected: package.to_string(),
                actual: component.package,
            });
        }
        Ok(Self::new(component, intent.is_daemon()))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.daemon {
            write!(f, "{} (daemon)", self.component)
        } else {
            write!(f, "{}", self.component)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_class_names_expand_against_package() {
        let name = ComponentName::unflatten("io.example.app/.svc.Ping").unwrap();
        assert_eq!(name.class, "io.example.app.svc.Ping");
        assert_eq!(name.flatten(), "io.example.app/io.example.app.svc.Ping");
        assert_eq!(name.flatten_short(), "io.example.app/.svc.Ping");
        assert_eq!(name.short_class(), "Ping");
    }

    #[test]
    fn unflatten_rejects_malformed_names() {
        assert!(ComponentName::unflatten("no-slash").is_none());
        assert!(ComponentName::unflatten("/Cls").is_none());
        assert!(ComponentName::unflatten("pkg/").is_none());
    }

    #[test]
    fn clone_filter_drops_extras_only() {
        let intent = Intent::for_component(ComponentName::new("p", "p.S"))
            .action("go")
            .daemon()
            .extra("token", "secret");
        let filtered = intent.clone_filter();
        assert!(filtered.extras.is_empty());
        assert!(filtered.is_daemon());
        assert_eq!(filtered.action.as_deref(), Some("go"));
        assert_eq!(intent.get_extra("token"), Some("secret"));
    }

    #[test]
    fn service_key_enforces_package() {
        let intent = Intent::for_component(ComponentName::new("other", "other.S"));
        let err = ServiceKey::from_intent(&intent, "mine").unwrap_err();
        assert!(matches!(err, RootServiceError::ForeignPackage { .. }));

        let err = ServiceKey::from_intent(&Intent::default(), "mine").unwrap_err();
        assert!(matches!(err, RootServiceError::MissingComponent));

        let key = ServiceKey::from_intent(
            &Intent::for_component(ComponentName::new("mine", ".S")).daemon(),
            "mine",
        )
        .unwrap();
        assert!(key.daemon);
        assert_eq!(key.component.class, "mine.S");
    }
}
