//! The dependency graph engine.
//!
//! Vertices live in an arena and refer to each other through stable integer
//! handles; every edge is stored twice, once in the owner's dependency list
//! and once mirrored in the target's dependent list. Cyclical shapes are
//! refused at edge-insertion time, which makes acyclicity the only structural
//! invariant to defend.
//!
//! The engine consumes state-change and administrative notes, computes
//! satisfiability under the four group quantifiers, and issues start/stop
//! decisions to the restarter as notes on the shared bus.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::error::GraphError;
use crate::note::{AdminSub, Note, NoteBus, Reason, RequestSub, StateSub};
use crate::path::ServicePath;
use crate::repository::{GroupKind, Repository};

/// Stable handle of a vertex in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(usize);

/// What a vertex stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    /// A whole service.
    Service,
    /// One instance of a service.
    Instance,
    /// A dependency group synthesized during setup.
    Group {
        /// Quantifier.
        kind: GroupKind,
        /// Stop-propagation subscription.
        restart_on: Reason,
    },
}

/// Lifecycle state of a vertex, as the graph understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexState {
    /// Never driven.
    Uninitialised,
    /// Down.
    Offline,
    /// Up.
    Online,
    /// Up, but impaired.
    Degraded,
    /// Administratively disabled.
    Disabled,
    /// Parked by the restarter.
    Maintenance,
}

/// A directed relation `from -> to` where `from` depends on `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The consumer.
    pub from: VertexId,
    /// The prerequisite.
    pub to: VertexId,
}

/// A node of the dependency graph.
#[derive(Debug)]
pub struct Vertex {
    /// Handle of this vertex.
    pub id: VertexId,
    /// Path in the shared namespace.
    pub path: ServicePath,
    /// Node kind with kind-specific payload.
    pub kind: VertexKind,
    /// Edges to prerequisites, in insertion order.
    pub dependencies: Vec<Edge>,
    /// Mirror edges from consumers, in insertion order.
    pub dependents: Vec<Edge>,
    /// Whether setup has synthesized this vertex's groups.
    pub is_setup: bool,
    /// Administratively enabled.
    pub is_enabled: bool,
    /// Awaiting shutdown.
    pub to_offline: bool,
    /// Awaiting disablement after shutdown.
    pub to_disable: bool,
    /// Current lifecycle state.
    pub state: VertexState,
}

impl Vertex {
    fn new(id: VertexId, path: ServicePath, kind: VertexKind) -> Self {
        Self {
            id,
            path,
            kind,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            is_setup: false,
            is_enabled: false,
            to_offline: false,
            to_disable: false,
            state: VertexState::Uninitialised,
        }
    }

    /// Whether the graph considers this vertex running.
    pub fn is_running(&self) -> bool {
        matches!(self.state, VertexState::Online | VertexState::Degraded)
    }
}

/// Outcome of a satisfiability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Satisfy {
    /// The dependency currently holds.
    Satisfied,
    /// The dependency does not hold yet but may.
    Unsatisfied,
    /// The dependency can never hold without administrative action.
    Unsatisfiable,
}

impl Satisfy {
    fn worst(self, other: Satisfy) -> Satisfy {
        self.max(other)
    }
}

/// The typed dependency graph over services, instances, and groups.
#[derive(Debug, Default)]
pub struct Graph {
    vertices: Vec<Vertex>,
    by_path: HashMap<ServicePath, VertexId>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Finds or adds the vertex for a service path.
    pub fn install_service(&mut self, path: &ServicePath) -> VertexId {
        self.find_or_add(path.service_path(), VertexKind::Service)
    }

    /// Finds or adds an instance vertex and links it under its service.
    pub fn install_inst(&mut self, path: &ServicePath) -> VertexId {
        let sid = self.install_service(path);
        let iid = self.find_or_add(path.clone(), VertexKind::Instance);
        if !self.edge_exists(sid, iid) {
            // A service depending on its instances cannot cycle.
            self.push_edge(sid, iid);
        }
        iid
    }

    /// Installs every record of the repository and runs setup on each
    /// service and instance vertex. Idempotent for identical inputs.
    pub fn install_from_repository(&mut self, repo: &dyn Repository) {
        let mut owners = Vec::new();
        for record in repo.records() {
            let sid = self.install_service(&record.path);
            owners.push(sid);
            for inst in &record.instances {
                let iid = self.install_inst(&ServicePath::instance(
                    record.path.svc.clone(),
                    inst.clone(),
                ));
                owners.push(iid);
            }
        }
        for owner in owners {
            self.setup_vertex(owner, repo);
        }
    }

    /// Synthesizes the owner's dependency groups from its repository record
    /// and wires the group edges, refusing any edge that would close a
    /// cycle. Idempotent per vertex.
    pub fn setup_vertex(&mut self, owner: VertexId, repo: &dyn Repository) {
        if self.vertices[owner.0].is_setup {
            return;
        }
        let owner_path = self.vertices[owner.0].path.clone();
        let Some(record) = repo.lookup(&owner_path) else {
            debug!("{owner_path}: no repository record; setup deferred");
            return;
        };
        let depgroups = record.depgroups.clone();

        for (n, group) in depgroups.iter().enumerate() {
            let group_path = owner_path.depgroup(n);
            let gid = self.find_or_add(
                group_path,
                VertexKind::Group {
                    kind: group.kind,
                    restart_on: group.restart_on,
                },
            );
            self.vertices[gid.0].is_setup = true;
            if !self.edge_exists(owner, gid) {
                self.push_edge(owner, gid);
            }

            for target in &group.targets {
                let tid = if target.inst.is_some() {
                    self.install_inst(target)
                } else {
                    self.install_service(target)
                };
                if self.edge_exists(gid, tid) {
                    continue;
                }
                if let Err(err) = self.add_edge(gid, tid, owner) {
                    error!("{owner_path}: {err}");
                }
            }
        }
        self.vertices[owner.0].is_setup = true;
    }

    /// Adds `from -> to` after checking that `to` cannot already reach the
    /// owner, which would close a cycle.
    fn add_edge(
        &mut self,
        from: VertexId,
        to: VertexId,
        owner: VertexId,
    ) -> Result<(), GraphError> {
        if to == owner || self.reaches(to, owner) || self.reaches(to, from) {
            return Err(GraphError::CyclicalDependency {
                owner: self.vertices[owner.0].path.clone(),
                target: self.vertices[to.0].path.clone(),
            });
        }
        self.push_edge(from, to);
        Ok(())
    }

    fn push_edge(&mut self, from: VertexId, to: VertexId) {
        let edge = Edge { from, to };
        self.vertices[from.0].dependencies.push(edge);
        self.vertices[to.0].dependents.push(edge);
    }

    fn edge_exists(&self, from: VertexId, to: VertexId) -> bool {
        self.vertices[from.0]
            .dependencies
            .iter()
            .any(|e| e.to == to)
    }

    /// Whether `target` is reachable from `start` along dependency edges.
    /// Exclusion groups express negative dependency and are not descended
    /// into.
    fn reaches(&self, start: VertexId, target: VertexId) -> bool {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if matches!(
                self.vertices[id.0].kind,
                VertexKind::Group {
                    kind: GroupKind::ExcludeAll,
                    ..
                }
            ) {
                continue;
            }
            stack.extend(self.vertices[id.0].dependencies.iter().map(|e| e.to));
        }
        false
    }

    fn find_or_add(&mut self, path: ServicePath, kind: VertexKind) -> VertexId {
        if let Some(&id) = self.by_path.get(&path) {
            return id;
        }
        let id = VertexId(self.vertices.len());
        self.vertices.push(Vertex::new(id, path.clone(), kind));
        self.by_path.insert(path, id);
        id
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Looks up a vertex by path.
    pub fn vertex_by_path(&self, path: &ServicePath) -> Option<&Vertex> {
        self.by_path.get(path).map(|&id| &self.vertices[id.0])
    }

    /// Looks up a vertex by handle.
    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0]
    }

    /// All vertices, in installation order.
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter()
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Whether the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    // ------------------------------------------------------------------
    // Satisfiability
    // ------------------------------------------------------------------

    /// Probes whether an instance's dependencies currently allow it to come
    /// up. `recursive` descends into the groups of offline targets.
    pub fn satisfy_instance(&self, id: VertexId, recursive: bool) -> Satisfy {
        let v = &self.vertices[id.0];
        match v.state {
            VertexState::Online | VertexState::Degraded => Satisfy::Satisfied,
            VertexState::Disabled | VertexState::Maintenance => Satisfy::Unsatisfiable,
            VertexState::Uninitialised => Satisfy::Unsatisfied,
            VertexState::Offline => {
                if !recursive {
                    Satisfy::Unsatisfied
                } else if self.satisfy_depgroups(id, recursive)
                    == Satisfy::Unsatisfiable
                {
                    Satisfy::Unsatisfiable
                } else {
                    Satisfy::Unsatisfied
                }
            }
        }
    }

    /// Worst result over every dependency group of a vertex.
    pub fn satisfy_depgroups(&self, id: VertexId, recursive: bool) -> Satisfy {
        let mut result = Satisfy::Satisfied;
        for edge in &self.vertices[id.0].dependencies {
            if matches!(self.vertices[edge.to.0].kind, VertexKind::Group { .. }) {
                result = result.worst(self.satisfy_group(edge.to, recursive));
            }
        }
        result
    }

    /// A service edge is satisfied by its best instance.
    fn satisfy_service(&self, id: VertexId, recursive: bool) -> Satisfy {
        let instances = self.service_instances(id);
        if instances.is_empty() {
            return Satisfy::Unsatisfied;
        }
        let mut best = Satisfy::Unsatisfiable;
        for iid in instances {
            best = best.min(self.satisfy_instance(iid, recursive));
        }
        best
    }

    fn satisfy_target(&self, id: VertexId, recursive: bool) -> Satisfy {
        match self.vertices[id.0].kind {
            VertexKind::Instance => self.satisfy_instance(id, recursive),
            VertexKind::Service => self.satisfy_service(id, recursive),
            VertexKind::Group { .. } => self.satisfy_group(id, recursive),
        }
    }

    /// Evaluates one dependency group under its quantifier.
    pub fn satisfy_group(&self, gid: VertexId, recursive: bool) -> Satisfy {
        let group = &self.vertices[gid.0];
        let VertexKind::Group { kind, .. } = group.kind else {
            error!("{}: satisfiability probe of a non-group", group.path);
            return Satisfy::Unsatisfiable;
        };
        let targets: Vec<VertexId> = group.dependencies.iter().map(|e| e.to).collect();

        match kind {
            GroupKind::RequireAll => {
                let mut result = Satisfy::Satisfied;
                for t in targets {
                    result = result.worst(self.satisfy_target(t, recursive));
                }
                result
            }
            GroupKind::RequireAny => {
                if targets.is_empty() {
                    return Satisfy::Satisfied;
                }
                let mut best = Satisfy::Unsatisfiable;
                for t in targets {
                    best = best.min(self.satisfy_target(t, recursive));
                }
                best
            }
            GroupKind::OptionalAll => {
                let mut result = Satisfy::Satisfied;
                for t in targets {
                    for iid in self.expand_instances(t) {
                        // A target that can never come up is excused.
                        let r = match self.satisfy_instance(iid, recursive) {
                            Satisfy::Unsatisfiable => Satisfy::Satisfied,
                            other => other,
                        };
                        result = result.worst(r);
                    }
                }
                result
            }
            GroupKind::ExcludeAll => {
                let mut any_pending = false;
                for t in targets {
                    for iid in self.expand_instances(t) {
                        let v = &self.vertices[iid.0];
                        if v.is_running() && v.is_enabled {
                            return Satisfy::Unsatisfiable;
                        }
                        if v.is_running() || v.is_enabled {
                            any_pending = true;
                        }
                    }
                }
                if any_pending {
                    Satisfy::Unsatisfied
                } else {
                    Satisfy::Satisfied
                }
            }
        }
    }

    /// Whether an instance is enabled, unencumbered, and fully satisfied.
    pub fn can_come_up(&self, id: VertexId) -> bool {
        let v = &self.vertices[id.0];
        v.is_enabled
            && !v.to_offline
            && !v.to_disable
            && self.satisfy_depgroups(id, true) == Satisfy::Satisfied
    }

    /// Whether every transitive dependent instance is already shutting down
    /// or not running. The root itself is exempt.
    pub fn can_go_down(&self, root: VertexId) -> bool {
        let mut stack: Vec<VertexId> = self.dependent_consumers(root);
        let mut seen = HashSet::new();
        seen.insert(root);
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let v = &self.vertices[id.0];
            if matches!(v.kind, VertexKind::Instance)
                && v.is_running()
                && !v.to_offline
            {
                return false;
            }
            stack.extend(self.dependent_consumers(id));
        }
        true
    }

    /// Direct consumers of a vertex, not crossing exclusion groups.
    fn dependent_consumers(&self, id: VertexId) -> Vec<VertexId> {
        self.vertices[id.0]
            .dependents
            .iter()
            .map(|e| e.from)
            .filter(|&c| {
                !matches!(
                    self.vertices[c.0].kind,
                    VertexKind::Group {
                        kind: GroupKind::ExcludeAll,
                        ..
                    }
                )
            })
            .collect()
    }

    fn service_instances(&self, sid: VertexId) -> Vec<VertexId> {
        self.vertices[sid.0]
            .dependencies
            .iter()
            .map(|e| e.to)
            .filter(|&t| matches!(self.vertices[t.0].kind, VertexKind::Instance))
            .collect()
    }

    fn expand_instances(&self, id: VertexId) -> Vec<VertexId> {
        match self.vertices[id.0].kind {
            VertexKind::Instance => vec![id],
            VertexKind::Service => self.service_instances(id),
            VertexKind::Group { .. } => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Note processing
    // ------------------------------------------------------------------

    /// Consumes one state-change or administrative note, emitting follow-up
    /// notes onto the bus. Restarter requests are not for the graph.
    pub fn process_note(&mut self, note: &Note, repo: &dyn Repository, bus: &mut NoteBus) {
        match note {
            Note::StateChange { path, sub, reason } => {
                self.on_state_change(path, *sub, *reason, bus)
            }
            Note::AdminReq { path, sub, reason } => {
                self.on_admin(path, *sub, *reason, repo, bus)
            }
            Note::RestarterRequest { path, .. } => {
                warn!("{path}: restarter request routed to the graph; discarding")
            }
        }
    }

    fn on_state_change(
        &mut self,
        path: &ServicePath,
        sub: StateSub,
        reason: Reason,
        bus: &mut NoteBus,
    ) {
        let Some(&id) = self.by_path.get(path) else {
            warn!("{path}: state change for unknown vertex; discarding");
            return;
        };

        match sub {
            StateSub::Online => {
                info!("{path}: online ({reason})");
                self.vertices[id.0].state = VertexState::Online;
                self.notify_start(id, reason, bus);
            }
            StateSub::Offline => {
                let had_to_offline = self.vertices[id.0].to_offline;
                self.vertices[id.0].to_offline = false;
                self.vertices[id.0].state = VertexState::Offline;
                info!("{path}: offline ({reason})");

                if had_to_offline {
                    self.offline_dependencies(id, reason, bus);
                    if self.vertices[id.0].to_disable {
                        bus.push(Note::StateChange {
                            path: path.clone(),
                            sub: StateSub::Disabled,
                            reason,
                        });
                    }
                } else if matches!(self.vertices[id.0].kind, VertexKind::Instance)
                    && self.can_come_up(id)
                {
                    bus.push(Note::RestarterRequest {
                        path: path.clone(),
                        sub: RequestSub::Start,
                        reason,
                    });
                }

                self.notify_stop(id, reason, bus);
            }
            StateSub::Disabled => {
                let v = &mut self.vertices[id.0];
                v.to_offline = false;
                v.to_disable = false;
                v.is_enabled = false;
                v.state = VertexState::Disabled;
                info!("{path}: disabled");
                self.notify_misc(id, reason, bus);
            }
            StateSub::Maintenance => {
                warn!("{path}: entered maintenance");
                self.vertices[id.0].state = VertexState::Maintenance;
                self.notify_stop(id, reason, bus);
            }
        }
    }

    fn on_admin(
        &mut self,
        path: &ServicePath,
        sub: AdminSub,
        reason: Reason,
        repo: &dyn Repository,
        bus: &mut NoteBus,
    ) {
        let id = match self.by_path.get(path) {
            Some(&id) => id,
            None => {
                // First reference through an admin verb; install on demand.
                if repo.lookup(path).is_none() {
                    warn!("{path}: admin request for unknown path; discarding");
                    return;
                }
                let id = if path.inst.is_some() {
                    self.install_inst(path)
                } else {
                    self.install_service(path)
                };
                self.setup_vertex(id, repo);
                id
            }
        };

        match sub {
            AdminSub::Enable => self.admin_enable(id, bus),
            AdminSub::Disable => self.admin_disable(id, reason, bus),
            AdminSub::Restart => self.admin_restart(id, reason, bus),
        }
    }

    fn admin_enable(&mut self, id: VertexId, bus: &mut NoteBus) {
        let v = &mut self.vertices[id.0];
        v.to_disable = false;
        v.to_offline = false;
        v.is_enabled = true;
        info!("{}: enabled", v.path);

        if !v.is_running() {
            bus.push(Note::StateChange {
                path: v.path.clone(),
                sub: StateSub::Offline,
                reason: Reason::Restart,
            });
        }

        // Enabling a service enables each of its instances.
        if matches!(self.vertices[id.0].kind, VertexKind::Service) {
            for iid in self.service_instances(id) {
                self.admin_enable(iid, bus);
            }
        }
    }

    fn admin_disable(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let v = &mut self.vertices[id.0];
        v.to_disable = true;
        v.to_offline = true;
        v.is_enabled = false;
        info!("{}: disabled pending shutdown", v.path);

        // Disabling a service covers its instances.
        if matches!(self.vertices[id.0].kind, VertexKind::Service) {
            for iid in self.service_instances(id) {
                let inst = &mut self.vertices[iid.0];
                inst.to_disable = true;
                inst.to_offline = true;
                inst.is_enabled = false;
            }
        }

        self.notify_admin_disable(id);

        // Anything marked for shutdown whose dependents are quiet goes now.
        let marked: Vec<VertexId> = self
            .vertices
            .iter()
            .filter(|v| v.to_offline)
            .map(|v| v.id)
            .collect();
        for wid in marked {
            if self.can_go_down(wid) {
                self.take_down(wid, reason, bus);
            }
        }
    }

    fn admin_restart(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let v = &self.vertices[id.0];
        if v.is_running() {
            // The offline completion re-probes and brings the node back.
            bus.push(Note::RestarterRequest {
                path: v.path.clone(),
                sub: RequestSub::Stop,
                reason,
            });
        } else if matches!(v.kind, VertexKind::Instance) && self.can_come_up(id) {
            bus.push(Note::RestarterRequest {
                path: v.path.clone(),
                sub: RequestSub::Start,
                reason,
            });
        }
    }

    /// Marks every transitive dependent as awaiting shutdown. Exclusion
    /// groups are not crossed; their consumers do not depend on us.
    fn notify_admin_disable(&mut self, id: VertexId) {
        let mut stack = self.dependent_consumers(id);
        let mut seen = HashSet::new();
        seen.insert(id);
        while let Some(cid) = stack.pop() {
            if !seen.insert(cid) {
                continue;
            }
            let c = &mut self.vertices[cid.0];
            if matches!(c.kind, VertexKind::Instance | VertexKind::Service) {
                c.to_offline = true;
            }
            stack.extend(self.dependent_consumers(cid));
        }
    }

    /// Issues the shutdown for a vertex cleared to go down: a stop request
    /// when a live unit is behind it, bookkeeping otherwise.
    fn take_down(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let v = &self.vertices[id.0];
        if matches!(v.kind, VertexKind::Instance) && v.is_running() {
            bus.push(Note::RestarterRequest {
                path: v.path.clone(),
                sub: RequestSub::Stop,
                reason,
            });
        } else {
            bus.push(Note::StateChange {
                path: v.path.clone(),
                sub: StateSub::Offline,
                reason,
            });
        }
    }

    /// A vertex that was awaiting shutdown completed it; dependencies that
    /// were waiting behind it may now go down themselves.
    fn offline_dependencies(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let mut work: Vec<VertexId> = Vec::new();
        for edge in &self.vertices[id.0].dependencies {
            match self.vertices[edge.to.0].kind {
                VertexKind::Group {
                    kind: GroupKind::ExcludeAll,
                    ..
                } => {}
                VertexKind::Group { .. } => {
                    work.extend(self.vertices[edge.to.0].dependencies.iter().map(|e| e.to))
                }
                _ => work.push(edge.to),
            }
        }
        for did in work {
            let d = &self.vertices[did.0];
            if d.to_offline && self.can_go_down(did) {
                self.take_down(did, reason, bus);
            }
        }
    }

    /// A dependency came up: dependents that can come up are started. When
    /// the traversal crosses a group, the group's own subscription becomes
    /// the propagated reason.
    fn notify_start(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let consumers: Vec<Edge> = self.vertices[id.0].dependents.clone();
        for edge in consumers {
            let cid = edge.from;
            match self.vertices[cid.0].kind {
                VertexKind::Group { restart_on, .. } => {
                    self.notify_start(cid, restart_on, bus)
                }
                VertexKind::Instance => {
                    let c = &self.vertices[cid.0];
                    if !c.is_running() && self.can_come_up(cid) {
                        bus.push(Note::RestarterRequest {
                            path: c.path.clone(),
                            sub: RequestSub::Start,
                            reason,
                        });
                    }
                }
                VertexKind::Service => self.notify_start(cid, reason, bus),
            }
        }
    }

    /// A dependency went down: running dependents subscribed to at least
    /// this severity are stopped. Exclusion groups never propagate stop.
    fn notify_stop(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let consumers: Vec<Edge> = self.vertices[id.0].dependents.clone();
        for edge in consumers {
            let cid = edge.from;
            match self.vertices[cid.0].kind {
                VertexKind::Group {
                    kind: GroupKind::ExcludeAll,
                    ..
                } => {}
                VertexKind::Group { restart_on, .. } => {
                    if restart_on >= reason {
                        self.notify_stop(cid, reason, bus);
                    } else {
                        debug!(
                            "{}: stop propagation cut ({restart_on} < {reason})",
                            self.vertices[cid.0].path
                        );
                    }
                }
                VertexKind::Instance => {
                    let c = &mut self.vertices[cid.0];
                    if c.is_running() {
                        c.to_offline = true;
                        bus.push(Note::RestarterRequest {
                            path: c.path.clone(),
                            sub: RequestSub::Stop,
                            reason,
                        });
                    }
                }
                VertexKind::Service => self.notify_stop(cid, reason, bus),
            }
        }
    }

    /// Re-probe after a disablement: dependents that became possible come
    /// up. Exclusion groups do propagate here; a disabled exclusion target
    /// is exactly what frees its consumers.
    fn notify_misc(&mut self, id: VertexId, reason: Reason, bus: &mut NoteBus) {
        let consumers: Vec<Edge> = self.vertices[id.0].dependents.clone();
        for edge in consumers {
            let cid = edge.from;
            match self.vertices[cid.0].kind {
                VertexKind::Group { .. } => self.notify_misc(cid, reason, bus),
                VertexKind::Instance => {
                    let c = &self.vertices[cid.0];
                    if !c.is_running() && self.can_come_up(cid) {
                        bus.push(Note::RestarterRequest {
                            path: c.path.clone(),
                            sub: RequestSub::Start,
                            reason,
                        });
                    }
                }
                VertexKind::Service => self.notify_misc(cid, reason, bus),
            }
        }
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Structural invariant check used by tests: acyclicity over dependency
    /// edges and edge mirroring.
    pub fn check_invariants(&self) -> Result<(), String> {
        for v in &self.vertices {
            if self.vertices[v.id.0]
                .dependencies
                .iter()
                .any(|e| self.reaches(e.to, v.id))
            {
                return Err(format!("{}: reachable from itself", v.path));
            }
            for e in &v.dependencies {
                if !self.vertices[e.to.0].dependents.contains(e) {
                    return Err(format!(
                        "{}: edge to {} lacks its mirror",
                        v.path, self.vertices[e.to.0].path
                    ));
                }
            }
            for e in &v.dependents {
                if !self.vertices[e.from.0].dependencies.contains(e) {
                    return Err(format!(
                        "{}: dependent edge from {} lacks its origin",
                        v.path, self.vertices[e.from.0].path
                    ));
                }
            }
        }
        Ok(())
    }
}
