//! Deferred-submission launchers, one per host application. A dispatcher
//! knows how to start a detached worker process that re-opens the saved
//! session and submits a single environment.

use std::collections::BTreeMap;
use std::path::Path;

use farmsub_core::{BucketId, Environment};

/// Builds the command line that resolves and submits one environment out of
/// process. Implementations exist per host application so a DCC embedding
/// the library can hand off to its own headless binary.
pub trait HostDispatcher: Send + Sync {
    /// Host tag this dispatcher serves, e.g. `"generic"` or `"maya"`.
    fn host_app(&self) -> &str;

    /// Argv for the detached worker. First element is the program.
    fn resolve_and_submit_command(
        &self,
        env: &Environment,
        session: &Path,
        bucket: &BucketId,
    ) -> Vec<String>;
}

/// Re-invokes this binary's `worker` subcommand. The fallback when no
/// host-specific dispatcher is registered for a session.
pub struct GenericDispatcher;

impl HostDispatcher for GenericDispatcher {
    fn host_app(&self) -> &str {
        "generic"
    }

    fn resolve_and_submit_command(
        &self,
        env: &Environment,
        session: &Path,
        bucket: &BucketId,
    ) -> Vec<String> {
        let program = std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(String::from))
            .unwrap_or_else(|| "farmsub".to_string());
        vec![
            program,
            "worker".to_string(),
            "--session".to_string(),
            session.display().to_string(),
            "--env".to_string(),
            env.id.0.to_string(),
            "--bucket".to_string(),
            bucket.as_str().to_string(),
        ]
    }
}

/// Dispatchers by host tag. Ships with [`GenericDispatcher`] installed.
pub struct DispatcherRegistry {
    by_host: BTreeMap<String, Box<dyn HostDispatcher>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        let mut registry = Self { by_host: BTreeMap::new() };
        registry.register(Box::new(GenericDispatcher));
        registry
    }

    /// Installs `dispatcher` under its own host tag, replacing any previous
    /// one for that tag.
    pub fn register(&mut self, dispatcher: Box<dyn HostDispatcher>) {
        self.by_host
            .insert(dispatcher.host_app().to_string(), dispatcher);
    }

    pub fn get(&self, host_app: &str) -> Option<&dyn HostDispatcher> {
        self.by_host.get(host_app).map(|d| d.as_ref())
    }
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsub_core::Batch;

    #[test]
    fn generic_command_names_session_env_and_bucket() {
        let mut batch = Batch::new();
        let env_id = batch.add_environment("/show/seq/shot");
        let env = batch.environment(env_id).unwrap();
        let bucket = BucketId::mint();
        let args = GenericDispatcher.resolve_and_submit_command(
            env,
            Path::new("/tmp/session.json"),
            &bucket,
        );
        assert_eq!(args[1], "worker");
        assert!(args.contains(&"/tmp/session.json".to_string()));
        assert!(args.contains(&env_id.0.to_string()));
        assert!(args.contains(&bucket.as_str().to_string()));
    }

    #[test]
    fn registry_resolves_by_host_tag_and_replaces() {
        struct MayaDispatcher;
        impl HostDispatcher for MayaDispatcher {
            fn host_app(&self) -> &str {
                "maya"
            }
            fn resolve_and_submit_command(&self, _: &Environment, _: &Path, _: &BucketId) -> Vec<String> {
                vec!["mayapy".into()]
            }
        }

        let mut registry = DispatcherRegistry::new();
        assert!(registry.get("generic").is_some());
        assert!(registry.get("maya").is_none());
        registry.register(Box::new(MayaDispatcher));
        assert_eq!(registry.get("maya").unwrap().host_app(), "maya");
    }
}
