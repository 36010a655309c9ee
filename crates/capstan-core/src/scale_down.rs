use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn, Level};

use capstan_cloud::FleetOps;
use capstan_config::{EvictionStrategy, ScaleDownConfig};
use capstan_observability::{emit_event, ControlEvent};
use capstan_github::{RunnerApi, RunnerApiFactory};
use capstan_types::{tags, InstanceFilter, RunnerInstance, RunnerScope, SelfHostedRunner};

/// The scale-down reaper: a periodic two-phase pass over the managed
/// fleet. Phase 1 settles previously marked orphans (terminate or
/// rescue), Phase 2 evaluates active instances for idleness, minimum
/// lifetime and boot expiry. Single-tasked; the scheduler serialises
/// invocations.
pub struct ScaleDownReaper {
    config: ScaleDownConfig,
    fleet: Arc<dyn FleetOps>,
    github: Arc<dyn RunnerApiFactory>,
}

/// Per-invocation upstream caches, discarded on return. Collapses N
/// runner-list calls into one per scope; tokens rotate, so nothing
/// outlives the invocation.
#[derive(Default)]
struct InvocationCache {
    clients: HashMap<String, Arc<dyn RunnerApi>>,
    runner_lists: HashMap<String, Vec<SelfHostedRunner>>,
}

impl ScaleDownReaper {
    pub fn new(
        config: ScaleDownConfig,
        fleet: Arc<dyn FleetOps>,
        github: Arc<dyn RunnerApiFactory>,
    ) -> Self {
        Self {
            config,
            fleet,
            github,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut cache = InvocationCache::default();
        let all = self
            .fleet
            .list_runners(&InstanceFilter::for_environment(&self.config.environment))
            .await?;
        let (orphans, active): (Vec<_>, Vec<_>) = all.into_iter().partition(|i| i.orphan);
        info!(
            orphans = orphans.len(),
            active = active.len(),
            "starting scale-down pass"
        );

        self.reap_orphans(orphans, &mut cache).await;
        self.evaluate_active(active, &mut cache).await;
        Ok(())
    }

    /// Phase 1: confirm and terminate previously marked orphans. A
    /// last-chance upstream probe rescues false positives created by
    /// the tagging race in the previous tick's Phase 2.
    async fn reap_orphans(&self, orphans: Vec<RunnerInstance>, cache: &mut InvocationCache) {
        for instance in orphans {
            let Some(runner_id) = instance.runner_id else {
                // Never observed upstream; nothing to verify against.
                info!(instance = %instance.instance_id, "terminating unregistered orphan");
                self.terminate(&instance).await;
                continue;
            };
            let client = match self.client_for(&instance.owner, cache).await {
                Ok(client) => client,
                Err(error) => {
                    warn!(
                        instance = %instance.instance_id,
                        error = %format!("{error:#}"),
                        "cannot reach upstream for last-chance check, keeping orphan"
                    );
                    continue;
                }
            };
            match client.get_runner(runner_id).await {
                Ok(None) => {
                    info!(instance = %instance.instance_id, runner_id, "orphan confirmed gone upstream");
                    self.terminate(&instance).await;
                }
                Ok(Some(runner)) if runner.is_offline() && runner.busy => {
                    info!(
                        instance = %instance.instance_id,
                        runner_id,
                        "orphan stuck offline and busy, terminating"
                    );
                    self.terminate(&instance).await;
                }
                Ok(Some(_)) => {
                    info!(instance = %instance.instance_id, runner_id, "orphan came back, clearing tag");
                    match self
                        .fleet
                        .untag(
                            &instance.instance_id,
                            &[(tags::ORPHAN.to_string(), "true".to_string())],
                        )
                        .await
                    {
                        Ok(()) => emit_event(
                            Level::INFO,
                            ControlEvent::new("orphan.cleared", "scale-down")
                                .instance(&instance.instance_id)
                                .runner(runner_id),
                        ),
                        Err(error) => warn!(
                            instance = %instance.instance_id,
                            error = %format!("{error:#}"),
                            "failed to clear orphan tag"
                        ),
                    }
                }
                Err(error) => {
                    warn!(
                        instance = %instance.instance_id,
                        error = %format!("{error:#}"),
                        "last-chance check failed, keeping orphan"
                    );
                }
            }
        }
    }

    /// Phase 2: walk active instances per owner in eviction order under
    /// a fleet-wide idle quota.
    async fn evaluate_active(&self, active: Vec<RunnerInstance>, cache: &mut InvocationCache) {
        let now = Utc::now();
        let (mut idle_quota, strategy) = self.config.idle_config(now);
        debug!(idle_quota, ?strategy, "phase 2 idle configuration");

        let mut by_owner: BTreeMap<String, Vec<RunnerInstance>> = BTreeMap::new();
        for instance in active {
            by_owner.entry(instance.owner.clone()).or_default().push(instance);
        }

        for (owner, mut instances) in by_owner {
            instances.sort_by_key(|i| i.launch_time);
            if strategy == EvictionStrategy::NewestFirst {
                instances.reverse();
            }
            for instance in instances {
                self.evaluate_instance(&owner, instance, &mut idle_quota, now, cache)
                    .await;
            }
        }
    }

    async fn evaluate_instance(
        &self,
        owner: &str,
        instance: RunnerInstance,
        idle_quota: &mut usize,
        now: chrono::DateTime<chrono::Utc>,
        cache: &mut InvocationCache,
    ) {
        let matched = match self.matched_runners(owner, &instance.instance_id, cache).await {
            Ok(matched) => matched,
            Err(error) => {
                warn!(
                    instance = %instance.instance_id,
                    error = %format!("{error:#}"),
                    "cannot list upstream runners, keeping instance"
                );
                return;
            }
        };

        if matched.is_empty() {
            // Not registered upstream. Young instances are still
            // booting; old ones are presumed lost and handed to the
            // next Phase 1.
            if instance.age_minutes(now) >= self.config.boot_time_minutes {
                info!(instance = %instance.instance_id, "boot time expired, marking orphan");
                match self
                    .fleet
                    .tag(
                        &instance.instance_id,
                        &[(tags::ORPHAN.to_string(), "true".to_string())],
                    )
                    .await
                {
                    Ok(()) => emit_event(
                        Level::WARN,
                        ControlEvent::new("orphan.marked", "scale-down")
                            .instance(&instance.instance_id),
                    ),
                    Err(error) => warn!(
                        instance = %instance.instance_id,
                        error = %format!("{error:#}"),
                        "failed to mark orphan"
                    ),
                }
            }
            return;
        }

        if instance.age_minutes(now) < self.config.min_running_minutes {
            debug!(instance = %instance.instance_id, "too young to evaluate");
            return;
        }
        if *idle_quota > 0 {
            *idle_quota -= 1;
            debug!(instance = %instance.instance_id, remaining = *idle_quota, "preserved as idle capacity");
            return;
        }

        self.deregister_and_terminate(owner, instance, matched, cache)
            .await;
    }

    /// Busy re-check against the live endpoint (not the cached list) to
    /// shrink the race window, then de-register every matched runner id
    /// and finally terminate. Termination requires every de-registration
    /// to come back clean.
    async fn deregister_and_terminate(
        &self,
        owner: &str,
        instance: RunnerInstance,
        matched: Vec<SelfHostedRunner>,
        cache: &mut InvocationCache,
    ) {
        let client = match self.client_for(owner, cache).await {
            Ok(client) => client,
            Err(error) => {
                warn!(owner, error = %format!("{error:#}"), "cannot reach upstream, keeping instance");
                return;
            }
        };

        let mut present = Vec::new();
        for runner in &matched {
            match client.get_runner(runner.id).await {
                Ok(Some(live)) => {
                    if live.busy {
                        debug!(instance = %instance.instance_id, runner = live.id, "picked up work, keeping");
                        return;
                    }
                    present.push(live.id);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        instance = %instance.instance_id,
                        runner = runner.id,
                        error = %format!("{error:#}"),
                        "busy re-check failed, keeping instance"
                    );
                    return;
                }
            }
        }

        for runner_id in &present {
            if let Err(error) = client.delete_runner(*runner_id).await {
                warn!(
                    instance = %instance.instance_id,
                    runner = runner_id,
                    error = %format!("{error:#}"),
                    "de-registration failed, not terminating"
                );
                return;
            }
        }

        info!(
            instance = %instance.instance_id,
            runners = ?present,
            "idle instance de-registered, terminating"
        );
        self.terminate(&instance).await;
    }

    async fn matched_runners(
        &self,
        owner: &str,
        instance_id: &str,
        cache: &mut InvocationCache,
    ) -> anyhow::Result<Vec<SelfHostedRunner>> {
        if !cache.runner_lists.contains_key(owner) {
            let client = self.client_for(owner, cache).await?;
            let list = client.list_runners().await?;
            cache.runner_lists.insert(owner.to_string(), list);
        }
        Ok(cache.runner_lists[owner]
            .iter()
            .filter(|runner| runner.name.ends_with(instance_id))
            .cloned()
            .collect())
    }

    async fn client_for(
        &self,
        owner: &str,
        cache: &mut InvocationCache,
    ) -> anyhow::Result<Arc<dyn RunnerApi>> {
        if let Some(client) = cache.clients.get(owner) {
            return Ok(client.clone());
        }
        let scope = scope_from_owner(owner);
        let client = self.github.for_scope(&scope, 0).await?;
        cache.clients.insert(owner.to_string(), client.clone());
        Ok(client)
    }

    async fn terminate(&self, instance: &RunnerInstance) {
        match self.fleet.terminate(&instance.instance_id).await {
            Ok(()) => emit_event(
                Level::INFO,
                ControlEvent::new("instance.terminated", "scale-down")
                    .instance(&instance.instance_id),
            ),
            Err(error) => warn!(
                instance = %instance.instance_id,
                error = %format!("{error:#}"),
                "termination failed"
            ),
        }
    }
}

/// The `Owner` tag is an org name or an `owner/repo` pair; the shape
/// alone identifies the scope.
fn scope_from_owner(owner: &str) -> RunnerScope {
    match owner.split_once('/') {
        Some((org, repo)) => RunnerScope::Repo {
            owner: org.to_string(),
            name: repo.to_string(),
        },
        None => RunnerScope::Org(owner.to_string()),
    }
}


#[cfg(test)]
mod reaper_tests {
    use super::*;
    use std::sync::Arc;

    use capstan_config::IdleSchedule;

    use crate::testing::{instance, scale_down_config, MockFactory, MockFleet, MockGithub};

    struct Harness {
        fleet: Arc<MockFleet>,
        github: Arc<MockGithub>,
        reaper: ScaleDownReaper,
    }

    fn harness(config: ScaleDownConfig, instances: Vec<capstan_types::RunnerInstance>) -> Harness {
        let fleet = Arc::new(MockFleet::with_instances(instances));
        let github = Arc::new(MockGithub::default());
        let factory = Arc::new(MockFactory::new(github.clone()));
        let reaper = ScaleDownReaper::new(config, fleet.clone(), factory);
        Harness {
            fleet,
            github,
            reaper,
        }
    }

    fn always_on_quota(idle_count: usize) -> ScaleDownConfig {
        let mut config = scale_down_config();
        config.schedule = vec![IdleSchedule {
            cron: "* * * * * * *".to_string(),
            idle_count,
            eviction_strategy: EvictionStrategy::OldestFirst,
        }];
        config
    }

    #[tokio::test]
    async fn orphan_without_runner_id_is_terminated_unconditionally() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-lost", "acme", 60, None, true)],
        );
        h.reaper.run().await.unwrap();
        assert_eq!(*h.fleet.terminated.lock().unwrap(), vec!["i-lost"]);
    }

    #[tokio::test]
    async fn orphan_gone_upstream_is_terminated() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-gone", "acme", 60, Some(42), true)],
        );
        // Runner 42 not registered in the mock: upstream 404.
        h.reaper.run().await.unwrap();
        assert_eq!(*h.fleet.terminated.lock().unwrap(), vec!["i-gone"]);
    }

    #[tokio::test]
    async fn orphan_offline_and_busy_is_terminated() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-stuck", "acme", 60, Some(42), true)],
        );
        h.github.add_runner(42, "runner-i-stuck", "offline", true);
        h.reaper.run().await.unwrap();
        assert_eq!(*h.fleet.terminated.lock().unwrap(), vec!["i-stuck"]);
    }

    #[tokio::test]
    async fn online_orphan_is_rescued_and_untagged() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-alive", "acme", 60, Some(42), true)],
        );
        h.github.add_runner(42, "runner-i-alive", "online", false);
        h.reaper.run().await.unwrap();

        assert!(h.fleet.terminated.lock().unwrap().is_empty());
        let removed = h.fleet.tags_removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "i-alive");
        assert_eq!(removed[0].1[0].0, tags::ORPHAN);
    }

    #[tokio::test]
    async fn idle_quota_preserves_the_oldest_and_evicts_the_rest() {
        let instances = vec![
            instance("i-a", "acme", 60, None, false),
            instance("i-b", "acme", 50, None, false),
            instance("i-c", "acme", 40, None, false),
            instance("i-d", "acme", 30, None, false),
        ];
        let h = harness(always_on_quota(2), instances);
        for (id, name) in [(1, "w-i-a"), (2, "w-i-b"), (3, "w-i-c"), (4, "w-i-d")] {
            h.github.add_runner(id, name, "online", false);
        }

        h.reaper.run().await.unwrap();

        // Oldest two consumed the quota; the two youngest were
        // de-registered and terminated.
        let mut terminated = h.fleet.terminated.lock().unwrap().clone();
        terminated.sort();
        assert_eq!(terminated, vec!["i-c", "i-d"]);
        let mut deleted = h.github.deleted.lock().unwrap().clone();
        deleted.sort();
        assert_eq!(deleted, vec![3, 4]);
    }

    #[tokio::test]
    async fn busy_runner_is_kept_even_without_quota() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-busy", "acme", 60, None, false)],
        );
        h.github.add_runner(7, "w-i-busy", "online", true);
        h.reaper.run().await.unwrap();

        assert!(h.fleet.terminated.lock().unwrap().is_empty());
        assert!(h.github.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn young_instances_are_not_evaluated() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-young", "acme", 2, None, false)],
        );
        h.github.add_runner(7, "w-i-young", "online", false);
        h.reaper.run().await.unwrap();
        assert!(h.fleet.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_deregistration_blocks_termination() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-x", "acme", 60, None, false)],
        );
        h.github.add_runner(9, "w-i-x", "online", false);
        h.github.delete_failures.lock().unwrap().insert(9);
        h.reaper.run().await.unwrap();

        assert!(h.fleet.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_boot_marks_orphan_and_young_boot_is_left_alone() {
        let h = harness(
            scale_down_config(),
            vec![
                instance("i-expired", "acme", 10, None, false),
                instance("i-booting", "acme", 2, None, false),
            ],
        );
        h.reaper.run().await.unwrap();

        assert!(h.fleet.terminated.lock().unwrap().is_empty());
        let tagged = h.fleet.tags_added.lock().unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].0, "i-expired");
        assert_eq!(
            tagged[0].1,
            vec![(tags::ORPHAN.to_string(), "true".to_string())]
        );
    }

    #[tokio::test]
    async fn phase_one_only_touches_orphans_and_phase_two_only_actives() {
        let h = harness(
            scale_down_config(),
            vec![
                instance("i-orphan", "acme", 60, None, true),
                instance("i-active", "acme", 60, None, false),
            ],
        );
        h.github.add_runner(11, "w-i-active", "online", true);
        h.reaper.run().await.unwrap();

        // The orphan went in Phase 1; the busy active instance survived
        // Phase 2 untouched.
        assert_eq!(*h.fleet.terminated.lock().unwrap(), vec!["i-orphan"]);
    }

    #[tokio::test]
    async fn multiple_matched_runners_must_all_deregister() {
        let h = harness(
            scale_down_config(),
            vec![instance("i-multi", "acme", 60, None, false)],
        );
        h.github.add_runner(21, "alpha-i-multi", "online", false);
        h.github.add_runner(22, "beta-i-multi", "online", false);
        h.reaper.run().await.unwrap();

        let mut deleted = h.github.deleted.lock().unwrap().clone();
        deleted.sort();
        assert_eq!(deleted, vec![21, 22]);
        assert_eq!(*h.fleet.terminated.lock().unwrap(), vec!["i-multi"]);
    }
}
