//! Load/unload notification dispatch
//!
//! The dynamic loader calls in here before it unloads a batch of
//! implementations and after it loads one. The dispatcher groups the batch
//! by service, updates every channel indexed under an affected service
//! (ignore-list, advisory count, version), and then fans the notification
//! out to the user-level handlers registered in the registry.
//!
//! Channel state is updated before the loader proceeds, so caches get the
//! chance to release references to implementations being unloaded. If the
//! loader aborts the unload, the stale ignore-list entries are cleared by the
//! next after-load notification for the same implementations.

use std::sync::Arc;

use refcache_sdk::{ImplName, NotificationHandler, RegistryError};
use rustc_hash::FxHashMap;

use crate::subsystem::Subsystem;

/// Which way the loader is moving a batch of implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Load,
    Unload,
}

/// Apply one notification batch and fan out to user handlers.
///
/// Never fails structurally: malformed names and handler errors are logged
/// and dropped. Returns the number of channel updates applied.
pub(crate) fn dispatch(subsystem: &Subsystem, impls: &[&str], direction: Direction) -> usize {
    let mut parsed: Vec<ImplName> = Vec::with_capacity(impls.len());
    for raw in impls {
        match ImplName::parse(raw) {
            Ok(name) => parsed.push(name),
            Err(err) => {
                log::warn!("skipping malformed implementation name in notification: {err}");
            }
        }
    }
    if parsed.is_empty() {
        return 0;
    }

    let mut groups: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for name in &parsed {
        groups.entry(name.service()).or_default().push(name.suffix());
    }

    let mut updated = 0;
    {
        let tables = subsystem.tables.read();
        for (service, suffixes) in &groups {
            let Some(channels) = tables.index.get(*service) else {
                continue;
            };
            for channel in channels {
                match direction {
                    Direction::Unload => channel.notify_unload(service, suffixes),
                    Direction::Load => channel.notify_load(service, suffixes),
                }
                // Version bump outside the channel's own lock: the counter
                // is atomic and the table read lock is still held.
                channel.bump_version();
                updated += 1;
            }
        }
    }

    fan_out(subsystem, &parsed, direction);
    updated
}

/// Invoke every registered user-level handler with the parsed batch,
/// skipping the subsystem's own registration.
fn fan_out(subsystem: &Subsystem, batch: &[ImplName], direction: Direction) {
    let own = subsystem.options.notify_impl.as_str();
    for registered in subsystem.registry.notification_handlers() {
        if registered.name.as_str() == own {
            continue;
        }
        let result = match direction {
            Direction::Unload => registered.handler.before_unload(batch),
            Direction::Load => registered.handler.after_load(batch),
        };
        if let Err(err) = result {
            log::warn!("load/unload handler {} failed: {err}", registered.name);
        }
    }
}

/// Registry-facing adapter: lets a loader that discovers handlers through
/// the registry deliver notifications to this subsystem like to any other
/// handler.
pub(crate) struct SubsystemHandler {
    pub(crate) subsystem: Arc<Subsystem>,
}

impl NotificationHandler for SubsystemHandler {
    fn before_unload(&self, impls: &[ImplName]) -> Result<(), RegistryError> {
        let names: Vec<&str> = impls.iter().map(|n| n.as_str()).collect();
        self.subsystem.notify_before_unload(&names);
        Ok(())
    }

    fn after_load(&self, impls: &[ImplName]) -> Result<(), RegistryError> {
        let names: Vec<&str> = impls.iter().map(|n| n.as_str()).collect();
        self.subsystem.notify_after_load(&names);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use refcache_sdk::{MemoryRegistry, ServiceRegistry};

    fn subsystem() -> (Arc<MemoryRegistry>, Arc<Subsystem>) {
        let registry = Arc::new(MemoryRegistry::new());
        let shared: Arc<dyn ServiceRegistry> = registry.clone();
        (registry, Arc::new(Subsystem::new(shared)))
    }

    #[test]
    fn test_unload_ignores_and_bumps() {
        let (registry, subsystem) = subsystem();
        registry.register("log.file").unwrap();
        registry.register("log.syslog").unwrap();

        let channel = subsystem.channel_create(&["log"]).unwrap();
        let v0 = channel.version();

        assert_eq!(subsystem.notify_before_unload(&["log.file"]), 1);
        assert!(channel.ignore_contains("file"));
        assert_eq!(channel.entries()[0].implementation_count(), 1);
        assert!(channel.version() > v0);
    }

    #[test]
    fn test_load_clears_stale_ignores() {
        let (registry, subsystem) = subsystem();
        registry.register("log.file").unwrap();

        let channel = subsystem.channel_create(&["log"]).unwrap();
        subsystem.notify_before_unload(&["log.file"]);
        assert!(channel.ignore_contains("file"));

        // Aborted unload: the implementation comes back.
        subsystem.notify_after_load(&["log.file"]);
        assert!(!channel.ignore_contains("file"));
        assert_eq!(channel.entries()[0].implementation_count(), 1);
    }

    #[test]
    fn test_batch_groups_by_service() {
        let (_registry, subsystem) = subsystem();
        let auth = subsystem.channel_create(&["auth"]).unwrap();
        let log = subsystem.channel_create(&["log"]).unwrap();

        let updated =
            subsystem.notify_before_unload(&["auth.basic", "log.file", "auth.ldap"]);
        assert_eq!(updated, 2);
        assert!(auth.ignore_contains("basic"));
        assert!(auth.ignore_contains("ldap"));
        assert!(log.ignore_contains("file"));
        assert!(!log.ignore_contains("basic"));
    }

    #[test]
    fn test_malformed_names_are_skipped() {
        let (_registry, subsystem) = subsystem();
        let channel = subsystem.channel_create(&["log"]).unwrap();

        assert_eq!(subsystem.notify_before_unload(&["no-separator"]), 0);
        assert_eq!(subsystem.notify_before_unload(&["bad-name", "log.file"]), 1);
        assert!(channel.ignore_contains("file"));
    }

    struct RecordingHandler {
        seen: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new(fail: bool) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail,
            }
        }

        fn record(&self, kind: &str, impls: &[ImplName]) -> Result<(), RegistryError> {
            self.seen.lock().push((
                kind.to_string(),
                impls.iter().map(|n| n.as_str().to_string()).collect(),
            ));
            if self.fail {
                Err(RegistryError::Handler("recording handler refused".into()))
            } else {
                Ok(())
            }
        }
    }

    impl NotificationHandler for RecordingHandler {
        fn before_unload(&self, impls: &[ImplName]) -> Result<(), RegistryError> {
            self.record("unload", impls)
        }

        fn after_load(&self, impls: &[ImplName]) -> Result<(), RegistryError> {
            self.record("load", impls)
        }
    }

    #[test]
    fn test_fan_out_reaches_user_handlers() {
        let (registry, subsystem) = subsystem();
        let handler = Arc::new(RecordingHandler::new(false));
        let shared: Arc<dyn NotificationHandler> = handler.clone();
        registry.add_handler("notify.audit", shared).unwrap();

        subsystem.notify_before_unload(&["log.file"]);
        subsystem.notify_after_load(&["log.file"]);

        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "unload");
        assert_eq!(seen[0].1, vec!["log.file".to_string()]);
        assert_eq!(seen[1].0, "load");
    }

    #[test]
    fn test_fan_out_skips_own_registration() {
        let (registry, subsystem) = subsystem();
        registry
            .add_handler(
                crate::subsystem::DEFAULT_NOTIFY_IMPL,
                Subsystem::notification_handler(&subsystem),
            )
            .unwrap();

        // Without the skip rule this would recurse forever.
        assert_eq!(subsystem.notify_before_unload(&["log.file"]), 0);
    }

    #[test]
    fn test_handler_failure_is_not_propagated() {
        let (registry, subsystem) = subsystem();
        registry.register("log.file").unwrap();
        let failing = Arc::new(RecordingHandler::new(true));
        let shared: Arc<dyn NotificationHandler> = failing.clone();
        registry.add_handler("notify.flaky", shared).unwrap();

        let channel = subsystem.channel_create(&["log"]).unwrap();
        assert_eq!(subsystem.notify_before_unload(&["log.file"]), 1);
        assert!(channel.ignore_contains("file"));
        assert_eq!(failing.seen.lock().len(), 1);
    }
}
