//! Mastership Coordinator
//!
//! Decides which controller node is master (and which are standbys) for
//! every device. All decisions go through versioned read-modify-write
//! transactions on the shared role store, so any number of coordinators
//! on different nodes can act on the same devices without agreeing on
//! anything else first.

pub mod balance;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use crate::cluster::{
    first_active_tier, MembershipEvent, MembershipView, RegionIndex, TopologyEvent,
};
use crate::error::{Error, Result};
use crate::events::MastershipEventPublisher;
use crate::gateway::RoleSyncGateway;
use crate::role::{DeviceId, MastershipRole, MastershipTerm, NodeId, RegionId, RoleRecord};
use crate::store::{self, RoleStore, RoleStoreEvent, Update};
use crate::term::TermTracker;

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Only let a node bootstrap itself as master of a regioned device if
    /// it belongs to the region's active tier
    pub respect_region_policy: bool,
    /// Periodic balance pass, disabled when `None`
    pub balance_interval: Option<Duration>,
    /// Upper bound of the random delay before each background pass
    pub balance_jitter: Duration,
    /// Balance after membership changes
    pub balance_on_membership_change: bool,
    /// Balance after region or binding changes
    pub balance_on_topology_change: bool,
    /// Periodically re-push local roles to the device layer
    pub integrity_check_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            respect_region_policy: true,
            balance_interval: Some(Duration::from_secs(30)),
            balance_jitter: Duration::from_millis(500),
            balance_on_membership_change: true,
            balance_on_topology_change: true,
            integrity_check_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// A group the balancer left untouched
#[derive(Debug, Clone, Serialize)]
pub struct SkippedRegion {
    pub region: RegionId,
    pub reason: String,
}

/// A reassignment the balancer could not commit
#[derive(Debug, Clone, Serialize)]
pub struct BalanceFailure {
    /// `None` for the group of devices without a region
    pub region: Option<RegionId>,
    pub device: DeviceId,
    pub error: String,
}

/// Result of one balance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct BalanceReport {
    /// Committed master reassignments
    pub mutations: usize,
    /// Groups that were examined
    pub groups: usize,
    pub skipped: Vec<SkippedRegion>,
    pub failures: Vec<BalanceFailure>,
}

#[derive(Debug, Default)]
struct Counters {
    master_changes: AtomicU64,
    elections_won: AtomicU64,
    races_lost: AtomicU64,
    balance_passes: AtomicU64,
    balance_mutations: AtomicU64,
}

/// Point-in-time coordinator counters
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub local_node: NodeId,
    pub master_changes: u64,
    pub elections_won: u64,
    pub races_lost: u64,
    pub balance_passes: u64,
    pub balance_mutations: u64,
    pub term_bumps: u64,
    pub events_published: u64,
    pub balance_pending: bool,
}

/// Coordinates device mastership for the local node
pub struct MastershipCoordinator {
    local_id: NodeId,
    store: Arc<dyn RoleStore>,
    membership: Arc<MembershipView>,
    regions: Arc<RegionIndex>,
    terms: TermTracker,
    events: Arc<MastershipEventPublisher>,
    gateway: Arc<RoleSyncGateway>,
    config: CoordinatorConfig,
    /// Serializes balance passes on this node
    balance_lock: Mutex<()>,
    balance_requested: Notify,
    balance_pending: AtomicBool,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MastershipCoordinator {
    pub fn new(
        store: Arc<dyn RoleStore>,
        membership: Arc<MembershipView>,
        regions: Arc<RegionIndex>,
        config: CoordinatorConfig,
    ) -> Self {
        let local_id = membership.local_node_id().clone();
        Self {
            gateway: Arc::new(RoleSyncGateway::new(local_id.clone())),
            local_id,
            store,
            membership,
            regions,
            terms: TermTracker::new(),
            events: Arc::new(MastershipEventPublisher::default()),
            config,
            balance_lock: Mutex::new(()),
            balance_requested: Notify::new(),
            balance_pending: AtomicBool::new(false),
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn events(&self) -> &Arc<MastershipEventPublisher> {
        &self.events
    }

    pub fn gateway(&self) -> &Arc<RoleSyncGateway> {
        &self.gateway
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.membership
    }

    pub fn regions(&self) -> &Arc<RegionIndex> {
        &self.regions
    }

    /// Start the background tasks: event delivery, balancing and the
    /// local role integrity check.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(Error::Internal("coordinator already started".into()));
        }

        // Subscribe before returning so no commit after start() is missed
        let store_rx = self.store.subscribe();
        let membership_rx = self.membership.subscribe();
        let topology_rx = self.regions.subscribe();

        tasks.push(tokio::spawn(Arc::clone(self).run_event_pump(store_rx)));
        tasks.push(tokio::spawn(
            Arc::clone(self).run_balancer(membership_rx, topology_rx),
        ));
        if let Some(period) = self.config.integrity_check_interval {
            tasks.push(tokio::spawn(Arc::clone(self).run_integrity_check(period)));
        }

        tracing::info!("Mastership coordinator started on {}", self.local_id);
        Ok(())
    }

    /// Stop all background tasks
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        futures::future::join_all(tasks).await;
        tracing::info!("Mastership coordinator stopped on {}", self.local_id);
    }

    // ========== Mutations ==========

    /// Assign `role` to `node` for `device`.
    ///
    /// MASTER installs the node, demoting the previous master to the head of
    /// the standby list. STANDBY on the current master demotes it and
    /// promotes the first active standby. NONE removes the node entirely.
    pub async fn set_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
        role: MastershipRole,
    ) -> Result<()> {
        self.apply_role(node, device, role).await.map(|_| ())
    }

    async fn apply_role(
        &self,
        node: &NodeId,
        device: &DeviceId,
        role: MastershipRole,
    ) -> Result<Update> {
        if !self.membership.is_member(node).await {
            return Err(Error::InvalidNode(node.to_string()));
        }
        let active = self.membership.all_active().await;

        self.transact(device, |record| {
            match role {
                MastershipRole::Master => {
                    record.install_master(node.clone());
                }
                MastershipRole::Standby => {
                    if record.is_master(node) {
                        record.clear_master();
                        record.promote_first(|n| n != node && active.contains(n));
                        record.standbys.push(node.clone());
                    } else {
                        record.push_standby(node.clone());
                    }
                }
                MastershipRole::None => drop_node(record, node, &active),
            }
            true
        })
        .await
    }

    /// Give up mastership of `device` if the local node holds it.
    ///
    /// The local node leaves the record entirely and the first active
    /// standby takes over. Returns the new master.
    pub async fn relinquish_mastership(&self, device: &DeviceId) -> Result<Option<NodeId>> {
        let local = self.local_id.clone();
        let active = self.membership.all_active().await;

        let update = self
            .transact(device, |record| {
                if !record.is_master(&local) {
                    return false;
                }
                drop_node(record, &local, &active);
                true
            })
            .await?;

        if update.committed {
            tracing::info!(
                "Relinquished mastership of {}, new master {:?}",
                device,
                update.current.master
            );
        }
        Ok(update.current.master)
    }

    /// Ask for a role on `device` for the local node.
    ///
    /// An unowned device elects the local node when policy allows, otherwise
    /// the local node waits as first standby and a balance pass is
    /// scheduled. A node that holds no role on an owned device joins as a
    /// standby. Returns the role the local node ends up with.
    pub async fn request_role_for(&self, device: &DeviceId) -> Result<MastershipRole> {
        let local = self.local_id.clone();
        let may_lead = self.bootstrap_allowed(device).await;
        let mut deferred = false;

        let update = self
            .transact(device, |record| {
                deferred = false;
                if record.master.is_some() {
                    return record.push_standby(local.clone());
                }
                if may_lead {
                    record.install_master(local.clone());
                } else {
                    record.push_standby_front(local.clone());
                    deferred = true;
                }
                true
            })
            .await?;

        let role = update.current.role_of(&local);
        if update.conflicts > 0 && role != MastershipRole::Master {
            self.counters.races_lost.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "{}; local role is {}",
                Error::ElectionRaceResolved(device.to_string()),
                role
            );
        }
        if update.committed && update.previous.is_unowned() && role == MastershipRole::Master {
            self.counters.elections_won.fetch_add(1, Ordering::Relaxed);
        }
        if deferred {
            tracing::info!(
                "{} is outside the active tier for {}, deferring to balancer",
                local,
                device
            );
            self.schedule_balance();
        }

        Ok(role)
    }

    /// Delete the record of a device that left the system
    pub async fn purge(&self, device: &DeviceId) -> Result<Option<RoleRecord>> {
        let removed = self.store.remove(device).await?;
        if removed.is_some() {
            tracing::info!("Purged mastership record of {}", device);
        }
        Ok(removed)
    }

    // ========== Queries ==========

    pub async fn get_role_info(&self, device: &DeviceId) -> Result<Option<RoleRecord>> {
        Ok(self.store.get(device).await?.map(|v| v.record))
    }

    pub async fn get_master_for(&self, device: &DeviceId) -> Result<Option<NodeId>> {
        Ok(self.get_role_info(device).await?.and_then(|r| r.master))
    }

    /// Master first, then standbys in priority order
    pub async fn get_nodes_for(&self, device: &DeviceId) -> Result<Vec<NodeId>> {
        Ok(self
            .get_role_info(device)
            .await?
            .map(|r| r.nodes())
            .unwrap_or_default())
    }

    /// Devices mastered by `node`
    pub async fn get_devices_of(&self, node: &NodeId) -> Result<BTreeSet<DeviceId>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|(_, record)| record.is_master(node))
            .map(|(device, _)| device)
            .collect())
    }

    pub async fn get_local_role(&self, device: &DeviceId) -> Result<MastershipRole> {
        Ok(self
            .get_role_info(device)
            .await?
            .map(|r| r.role_of(&self.local_id))
            .unwrap_or(MastershipRole::None))
    }

    pub async fn is_local_master(&self, device: &DeviceId) -> Result<bool> {
        Ok(self.get_local_role(device).await? == MastershipRole::Master)
    }

    /// Current term, 0 for devices that were never mastered
    pub async fn get_term_for(&self, device: &DeviceId) -> Result<MastershipTerm> {
        Ok(self.get_role_info(device).await?.map(|r| r.term).unwrap_or(0))
    }

    /// Every record, ordered by device
    pub async fn snapshot(&self) -> Result<Vec<(DeviceId, RoleRecord)>> {
        self.store.list().await
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            local_node: self.local_id.clone(),
            master_changes: self.counters.master_changes.load(Ordering::Relaxed),
            elections_won: self.counters.elections_won.load(Ordering::Relaxed),
            races_lost: self.counters.races_lost.load(Ordering::Relaxed),
            balance_passes: self.counters.balance_passes.load(Ordering::Relaxed),
            balance_mutations: self.counters.balance_mutations.load(Ordering::Relaxed),
            term_bumps: self.terms.bumps_issued(),
            events_published: self.events.published_count(),
            balance_pending: self.balance_pending(),
        }
    }

    /// Whether a balance pass was requested and has not run yet
    pub fn balance_pending(&self) -> bool {
        self.balance_pending.load(Ordering::SeqCst)
    }

    // ========== Balancing ==========

    /// Ask the background balancer for a pass
    pub fn schedule_balance(&self) {
        self.balance_pending.store(true, Ordering::SeqCst);
        self.balance_requested.notify_one();
    }

    /// Spread mastership evenly over the active nodes of each region's
    /// active tier, and over all active nodes for unbound devices.
    ///
    /// A region with invalid configuration is skipped and reported. A failed
    /// reassignment stops that group only.
    pub async fn balance_roles(&self) -> Result<BalanceReport> {
        let _guard = self.balance_lock.lock().await;
        self.balance_pending.store(false, Ordering::SeqCst);

        let active = self.membership.all_active().await;
        let records: BTreeMap<DeviceId, RoleRecord> =
            self.store.list().await?.into_iter().collect();
        let bindings = self.regions.bindings().await;

        let mut groups: BTreeMap<Option<RegionId>, BTreeMap<DeviceId, Option<NodeId>>> =
            BTreeMap::new();
        for (device, record) in &records {
            groups
                .entry(bindings.get(device).cloned())
                .or_default()
                .insert(device.clone(), record.master.clone());
        }
        for (device, region) in &bindings {
            groups
                .entry(Some(region.clone()))
                .or_default()
                .entry(device.clone())
                .or_insert(None);
        }

        let mut report = BalanceReport::default();
        for (region, devices) in groups {
            let pool = match &region {
                None => active.clone(),
                Some(id) => match self.regions.tiers_for(id).await {
                    Ok(tiers) => first_active_tier(&tiers, &active)
                        .map(|(_, live)| live)
                        .unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!("Skipping region {} while balancing: {}", id, e);
                        report.skipped.push(SkippedRegion {
                            region: id.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                },
            };
            report.groups += 1;

            if pool.is_empty() {
                tracing::debug!("No active candidates for group {:?}", region);
                continue;
            }

            for (device, target) in balance::plan(&pool, &devices) {
                match self.apply_role(&target, &device, MastershipRole::Master).await {
                    Ok(update) => {
                        if update.committed {
                            report.mutations += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to move {} to {} while balancing: {}",
                            device,
                            target,
                            e
                        );
                        report.failures.push(BalanceFailure {
                            region: region.clone(),
                            device,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        self.counters.balance_passes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .balance_mutations
            .fetch_add(report.mutations as u64, Ordering::Relaxed);
        if report.mutations > 0 {
            tracing::info!(
                "Balance pass moved {} device(s) across {} group(s)",
                report.mutations,
                report.groups
            );
        }
        Ok(report)
    }

    // ========== Device layer ==========

    /// Re-push the local role of every device to the device layer.
    ///
    /// Roles already pushed are skipped. Returns the number of pushes.
    pub async fn check_local_roles(&self) -> Result<usize> {
        let mut pushed = 0;
        for (device, record) in self.store.list().await? {
            if self
                .gateway
                .sync(&device, record.role_of(&self.local_id), record.term)
                .await
            {
                pushed += 1;
            }
        }
        if pushed > 0 {
            tracing::info!("Integrity check re-pushed {} local role(s)", pushed);
        }
        Ok(pushed)
    }

    // ========== Internals ==========

    /// Transaction wrapper shared by every mutation: `mutate` edits a copy of
    /// the committed record and returns false to leave it untouched, then
    /// the term is fenced against the committed record.
    async fn transact<F>(&self, device: &DeviceId, mut mutate: F) -> Result<Update>
    where
        F: FnMut(&mut RoleRecord) -> bool + Send,
    {
        let terms = &self.terms;
        let update = store::transactional_update(self.store.as_ref(), device, |current| {
            let mut next = current.clone();
            if !mutate(&mut next) {
                return None;
            }
            terms.fence(current, &mut next);
            debug_assert!(next.check_invariants().is_ok());
            Some(next)
        })
        .await?;

        if update.committed {
            self.terms.committed(&update.previous, &update.current);
        }
        if update.committed && update.current.master != update.previous.master {
            self.counters.master_changes.fetch_add(1, Ordering::Relaxed);
            match &update.current.master {
                Some(master) => tracing::info!(
                    "{} is now master of {} (term {})",
                    master,
                    device,
                    update.current.term
                ),
                None => tracing::warn!("{} has no master", device),
            }
        }
        Ok(update)
    }

    /// Whether the local node may elect itself master of an unowned device
    async fn bootstrap_allowed(&self, device: &DeviceId) -> bool {
        if !self.membership.is_active(&self.local_id).await {
            return false;
        }
        if !self.config.respect_region_policy {
            return true;
        }
        let region = match self.regions.region_for(device).await {
            Some(region) => region,
            None => return true,
        };
        match self.regions.tiers_for(&region).await {
            Ok(tiers) => {
                let active = self.membership.all_active().await;
                match first_active_tier(&tiers, &active) {
                    Some((_, live)) => live.contains(&self.local_id),
                    // Local is active, so it is outside every tier
                    None => true,
                }
            }
            Err(e) => {
                tracing::warn!("Ignoring region policy for {}: {}", device, e);
                true
            }
        }
    }

    async fn run_event_pump(self: Arc<Self>, mut rx: broadcast::Receiver<RoleStoreEvent>) {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    self.events.publish(&change);
                    self.gateway.handle_transition(&change).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        "Missed {} role store notifications, re-syncing local roles",
                        missed
                    );
                    if let Err(e) = self.check_local_roles().await {
                        tracing::error!("Local role re-sync failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn run_balancer(
        self: Arc<Self>,
        mut membership_rx: broadcast::Receiver<MembershipEvent>,
        mut topology_rx: broadcast::Receiver<TopologyEvent>,
    ) {
        let mut ticker = self.config.balance_interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });
        // The first tick of an interval fires immediately
        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }

        loop {
            let reason = tokio::select! {
                _ = next_tick(&mut ticker) => Some("periodic"),
                _ = self.balance_requested.notified() => Some("requested"),
                event = membership_rx.recv() => match event {
                    Err(broadcast::error::RecvError::Closed) => return,
                    _ => self.config.balance_on_membership_change.then_some("membership change"),
                },
                event = topology_rx.recv() => match event {
                    Err(broadcast::error::RecvError::Closed) => return,
                    _ => self.config.balance_on_topology_change.then_some("topology change"),
                },
            };
            let reason = match reason {
                Some(reason) => reason,
                None => continue,
            };

            let jitter_ms = self.config.balance_jitter.as_millis() as u64;
            if jitter_ms > 0 {
                let delay = rand::thread_rng().gen_range(0..=jitter_ms);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            tracing::debug!("Running balance pass ({})", reason);
            if let Err(e) = self.balance_roles().await {
                tracing::error!("Balance pass ({}) failed: {}", reason, e);
            }
        }
    }

    async fn run_integrity_check(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.check_local_roles().await {
                tracing::error!("Local role integrity check failed: {}", e);
            }
        }
    }
}

/// Remove `node` from `record`, promoting the first active standby if it
/// was master
fn drop_node(record: &mut RoleRecord, node: &NodeId, active: &BTreeSet<NodeId>) {
    record.remove_standby(node);
    if record.is_master(node) {
        record.clear_master();
        record.promote_first(|n| active.contains(n));
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
