//! Event triggers
//!
//! Maps named controller events (`sender:start`, `controller:ready`, ...)
//! to user-configured reactions: either shell commands handed to the
//! server's spawner, or G-code the controller feeds through its own feeder.

use cncd_settings::{ConfigStore, ReactionTrigger};
use std::sync::Arc;

/// Spawns configured system commands on behalf of event triggers
pub trait ShellSpawner: Send + Sync {
    /// Spawn a shell command line; failures surface as `task:error` events
    fn spawn(&self, commands: &str);
}

/// Per-controller event trigger
pub struct EventTrigger {
    store: Arc<ConfigStore>,
    spawner: Option<Arc<dyn ShellSpawner>>,
}

impl EventTrigger {
    /// Create a trigger bound to the configuration store
    pub fn new(store: Arc<ConfigStore>, spawner: Option<Arc<dyn ShellSpawner>>) -> Self {
        Self { store, spawner }
    }

    /// Fire an event; returns the G-code lines the controller must feed
    pub fn trigger(&self, event: &str) -> Vec<String> {
        let config = self.store.get();
        let mut gcode = Vec::new();

        for reaction in config.reactions_for(event) {
            match reaction.trigger {
                ReactionTrigger::System => match &self.spawner {
                    Some(spawner) => spawner.spawn(&reaction.commands),
                    None => {
                        tracing::warn!("No shell spawner; dropping reaction for '{}'", event)
                    }
                },
                ReactionTrigger::Gcode => {
                    gcode.extend(
                        reaction
                            .commands
                            .lines()
                            .map(str::trim)
                            .filter(|l| !l.is_empty())
                            .map(String::from),
                    );
                }
            }
        }

        gcode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cncd_settings::EventReaction;
    use std::sync::Mutex;

    struct RecordingSpawner {
        calls: Mutex<Vec<String>>,
    }

    impl ShellSpawner for RecordingSpawner {
        fn spawn(&self, commands: &str) {
            self.calls.lock().unwrap().push(commands.to_string());
        }
    }

    #[test]
    fn dispatches_gcode_and_system_reactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store
            .update(|config| {
                config.events.push(EventReaction {
                    event: "sender:start".into(),
                    trigger: ReactionTrigger::Gcode,
                    commands: "M8\nM3 S1000".into(),
                    enabled: true,
                });
                config.events.push(EventReaction {
                    event: "sender:start".into(),
                    trigger: ReactionTrigger::System,
                    commands: "notify-send job-started".into(),
                    enabled: true,
                });
            })
            .unwrap();

        let spawner = Arc::new(RecordingSpawner {
            calls: Mutex::new(Vec::new()),
        });
        let trigger = EventTrigger::new(store, Some(spawner.clone()));

        let gcode = trigger.trigger("sender:start");
        assert_eq!(gcode, vec!["M8", "M3 S1000"]);
        assert_eq!(
            spawner.calls.lock().unwrap().as_slice(),
            &["notify-send job-started".to_string()]
        );

        assert!(trigger.trigger("sender:stop").is_empty());
    }
}
