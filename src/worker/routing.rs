//! Model and timeout selection per dispatch.

use std::collections::BTreeMap;
use std::time::Duration;

use super::roles::profile;
use crate::crew_config::{CrewToml, ModelTier};
use crate::tasks::{ComplexityClass, Role, classify};

/// Model and time budget for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` leaves the worker on its default model.
    pub model: Option<String>,
    pub timeout: Duration,
    pub class: ComplexityClass,
}

#[derive(Debug, Clone)]
pub struct ModelRouter {
    pub enabled: bool,
    pub fast: String,
    pub powerful: String,
    pub role_tiers: BTreeMap<String, ModelTier>,
    pub task_timeout: Duration,
    pub simple_task_timeout: Duration,
}

impl ModelRouter {
    pub fn from_toml(toml: &CrewToml) -> Self {
        let models = &toml.worker.models;
        Self {
            enabled: models.enabled,
            fast: models.fast.clone(),
            powerful: models.powerful.clone(),
            role_tiers: models.roles.clone(),
            task_timeout: toml.task_timeout(),
            simple_task_timeout: toml.simple_task_timeout(),
        }
    }

    fn tier(&self, role: &Role) -> ModelTier {
        self.role_tiers
            .get(role.as_str())
            .copied()
            .unwrap_or_else(|| profile(role).tier)
    }

    /// Route a dispatch. A batch is complex if any of its tasks is.
    pub fn route(&self, role: &Role, descriptions: &[&str]) -> Route {
        let class = if descriptions
            .iter()
            .any(|d| classify(d) == ComplexityClass::Complex)
        {
            ComplexityClass::Complex
        } else {
            ComplexityClass::Simple
        };

        if !self.enabled {
            return Route {
                model: None,
                timeout: self.task_timeout,
                class,
            };
        }

        let model = match self.tier(role) {
            ModelTier::Fast => self.fast.clone(),
            ModelTier::Powerful => self.powerful.clone(),
            ModelTier::Auto => match class {
                ComplexityClass::Simple => self.fast.clone(),
                ComplexityClass::Complex => self.powerful.clone(),
            },
        };
        let timeout = match class {
            ComplexityClass::Simple => self.task_timeout.min(self.simple_task_timeout),
            ComplexityClass::Complex => self.task_timeout,
        };
        tracing::debug!(role = %role, model = %model, timeout_secs = timeout.as_secs(), "routed dispatch");
        Route {
            model: Some(model),
            timeout,
            class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(enabled: bool) -> ModelRouter {
        let mut toml = CrewToml::default();
        toml.worker.models.enabled = enabled;
        toml.worker.models.roles.insert("ui".into(), ModelTier::Powerful);
        ModelRouter::from_toml(&toml)
    }

    #[test]
    fn test_disabled_uses_default_model_and_full_timeout() {
        let route = router(false).route(&Role::from("engineer"), &["Add a form"]);
        assert_eq!(route.model, None);
        assert_eq!(route.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_auto_role_follows_complexity() {
        let r = router(true);
        let simple = r.route(&Role::from("engineer"), &["Add a form"]);
        assert_eq!(simple.model.as_deref(), Some("sonnet"));
        assert_eq!(simple.timeout, Duration::from_secs(180));

        let complex = r.route(
            &Role::from("engineer"),
            &["Add a form", "Investigate and debug the authentication flow"],
        );
        assert_eq!(complex.model.as_deref(), Some("opus"));
        assert_eq!(complex.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_role_tiers() {
        let r = router(true);
        assert_eq!(
            r.route(&Role::from("security"), &["Add a form"]).model.as_deref(),
            Some("opus")
        );
        // Config override beats the built-in tier.
        assert_eq!(
            r.route(&Role::from("ui"), &["Add a form"]).model.as_deref(),
            Some("opus")
        );
    }
}
