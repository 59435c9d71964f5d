//! Flush pipeline
//!
//! A per-request unit of work. Callers stage creations, updates and comments,
//! then [`Session::commit`] runs the before-flush hooks to fixpoint, writes
//! every staged row inside one transaction in dependency order, checks the
//! enforced rules against the touched entities, appends audit messages,
//! refreshes the search projection and aggregates follower notifications.
//! Any failure rolls the transaction back and expunges the session so the
//! caller never observes partial state.

pub mod hooks;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::api::{NotificationBatch, Notifier};
use crate::error::{Result, UdbError};
use crate::model::{
    diff_fields, ChangeSet, Entity, IpRow, Kind, MacRow, Message, MessageType, NameLookup, Status,
};
use crate::net::Mac;
use crate::rules;
use crate::search;
use crate::store::{insert_entity, update_entity, Store};

/// Hook phases around the database write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    BeforeFlush,
    AfterFlush,
}

/// A consistency hook: plain function over the flush context and the index
/// of the entity it fires for.
pub type Hook = fn(&mut FlushCtx<'_>, usize) -> Result<()>;

/// Before-flush fixpoint bound; exceeding it is a fatal invariant violation.
const MAX_HOOK_ROUNDS: usize = 10;

/// Process-wide hook table, `(kind, phase) -> [hook]`, populated once at
/// boot. The registry is write-once: there is no unregistration.
#[derive(Default)]
pub struct HookRegistry {
    map: HashMap<(Kind, Phase), Vec<Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: Kind, phase: Phase, hook: Hook) {
        self.map.entry((kind, phase)).or_default().push(hook);
    }

    fn hooks(&self, kind: Kind, phase: Phase) -> &[Hook] {
        self.map.get(&(kind, phase)).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Update,
}

struct Slot {
    entity: Entity,
    original: Option<Entity>,
    op: Op,
}

struct ParentTouch {
    parent_kind: Kind,
    parent_id: i64,
    child_index: usize,
}

/// Mutable view over the working set handed to hooks. Hooks may rewrite the
/// entity they fire for and stage further rows (IP/MAC materialisation,
/// parent touches); newly staged rows are hooked on the next fixpoint round.
pub struct FlushCtx<'a> {
    store: &'a Store,
    slots: &'a mut Vec<Slot>,
    parents: &'a mut Vec<ParentTouch>,
}

impl FlushCtx<'_> {
    pub fn store(&self) -> &Store {
        self.store
    }

    pub fn entity(&self, index: usize) -> &Entity {
        &self.slots[index].entity
    }

    pub fn entity_mut(&mut self, index: usize) -> &mut Entity {
        &mut self.slots[index].entity
    }

    /// Stored state of the entity at stage time; `None` for creations.
    pub fn original(&self, index: usize) -> Option<&Entity> {
        self.slots[index].original.as_ref()
    }

    /// True when the VRF exists and is not soft-deleted, looking through the
    /// working set first so rows created earlier in this request count.
    pub fn vrf_is_live(&self, vrf_id: i64) -> Result<bool> {
        let staged = self.slots.iter().any(|slot| {
            matches!(&slot.entity, Entity::Vrf(v)
                if v.meta.id == Some(vrf_id) && !v.meta.status.is_deleted())
        });
        if staged {
            return Ok(true);
        }
        Ok(self
            .store
            .try_get(Kind::Vrf, vrf_id)?
            .map(|v| !v.status().is_deleted())
            .unwrap_or(false))
    }

    /// Materialise the aggregate row for `ip`: stage a creation on first
    /// reference, reuse the live row or an already-staged one otherwise.
    pub fn ensure_ip(&mut self, ip: &IpAddr) -> Result<()> {
        let staged = self
            .slots
            .iter()
            .any(|slot| matches!(&slot.entity, Entity::Ip(row) if row.ip == *ip));
        if staged || self.store.find_ip(ip)?.is_some() {
            return Ok(());
        }
        self.slots.push(Slot {
            entity: Entity::Ip(IpRow::new(*ip)),
            original: None,
            op: Op::Create,
        });
        Ok(())
    }

    /// Materialise the aggregate row for `mac`, same rules as [`ensure_ip`].
    ///
    /// [`ensure_ip`]: FlushCtx::ensure_ip
    pub fn ensure_mac(&mut self, mac: &Mac) -> Result<()> {
        let staged = self
            .slots
            .iter()
            .any(|slot| matches!(&slot.entity, Entity::Mac(row) if row.mac == *mac));
        if staged || self.store.find_mac(mac)?.is_some() {
            return Ok(());
        }
        self.slots.push(Slot {
            entity: Entity::Mac(MacRow::new(*mac)),
            original: None,
            op: Op::Create,
        });
        Ok(())
    }

    /// Record that the mutation of `child_index` logically touches a parent
    /// entity; the commit appends a `parent` message and notifies the
    /// parent's followers.
    pub fn touch_parent(&mut self, parent_kind: Kind, parent_id: i64, child_index: usize) {
        let duplicate = self.parents.iter().any(|p| {
            p.parent_kind == parent_kind && p.parent_id == parent_id && p.child_index == child_index
        });
        if !duplicate {
            self.parents.push(ParentTouch {
                parent_kind,
                parent_id,
                child_index,
            });
        }
    }
}

/// One committed entity mutation.
#[derive(Debug, Clone)]
pub struct EntityChange {
    pub kind: Kind,
    pub id: i64,
    pub change_type: MessageType,
    pub changes: ChangeSet,
}

/// What a commit did: change sets per entity, the audit messages written and
/// the follower notification map handed to the notifier.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub changes: Vec<EntityChange>,
    pub messages: Vec<Message>,
    pub notifications: BTreeMap<i64, Vec<Message>>,
}

impl CommitOutcome {
    /// Change set recorded for one entity, when any.
    pub fn changes_for(&self, kind: Kind, id: i64) -> Option<&ChangeSet> {
        self.changes
            .iter()
            .find(|c| c.kind == kind && c.id == id)
            .map(|c| &c.changes)
    }
}

/// Per-request scoped unit of work.
pub struct Session<'a> {
    store: Store,
    registry: &'a HookRegistry,
    notifier: Option<&'a dyn Notifier>,
    author_id: Option<i64>,
    slots: Vec<Slot>,
    comments: Vec<(Kind, i64, String)>,
    parents: Vec<ParentTouch>,
}

impl<'a> Session<'a> {
    pub fn new(store: Store, registry: &'a HookRegistry, author_id: Option<i64>) -> Self {
        Self {
            store,
            registry,
            notifier: None,
            author_id,
            slots: Vec::new(),
            comments: Vec::new(),
            parents: Vec::new(),
        }
    }

    /// Deliver follower notifications to `notifier` after each successful
    /// commit.
    pub fn with_notifier(mut self, notifier: &'a dyn Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stage a new entity. Validation runs synchronously; nothing is written
    /// until [`Session::commit`].
    pub fn create(&mut self, entity: Entity) -> Result<()> {
        entity.validate()?;
        if entity.id().is_some() {
            return Err(UdbError::Fatal("create of an entity that already has an id".into()));
        }
        self.slots.push(Slot {
            entity,
            original: None,
            op: Op::Create,
        });
        Ok(())
    }

    /// Stage an update of an existing entity. The stored row is loaded now so
    /// the commit can compute the change set against it.
    pub fn update(&mut self, entity: Entity) -> Result<()> {
        entity.validate()?;
        let id = entity
            .id()
            .ok_or_else(|| UdbError::Fatal("update of an entity without id".into()))?;
        let original = self.store.get(entity.kind(), id)?;
        self.slots.push(Slot {
            entity,
            original: Some(original),
            op: Op::Update,
        });
        Ok(())
    }

    /// Stage a soft delete: the row keeps its data and history but leaves
    /// default queries and uniqueness scopes.
    pub fn soft_delete(&mut self, kind: Kind, id: i64) -> Result<()> {
        let mut entity = self.store.get(kind, id)?;
        if kind == Kind::Vrf {
            let live = self.store.live_subnet_count_for_vrf(id)?;
            if live > 0 {
                return Err(UdbError::Referential(format!(
                    "VRF is still referenced by {live} subnet(s)"
                )));
            }
        }
        if entity.status().is_deleted() {
            return Ok(());
        }
        let original = entity.clone();
        entity.meta_mut().status = Status::Deleted;
        self.slots.push(Slot {
            entity,
            original: Some(original),
            op: Op::Update,
        });
        Ok(())
    }

    /// Restore a soft-deleted entity back to enabled.
    pub fn restore(&mut self, kind: Kind, id: i64) -> Result<()> {
        let mut entity = self.store.get(kind, id)?;
        if !entity.status().is_deleted() {
            return Ok(());
        }
        let original = entity.clone();
        entity.meta_mut().status = Status::Enabled;
        self.slots.push(Slot {
            entity,
            original: Some(original),
            op: Op::Update,
        });
        Ok(())
    }

    /// Stage a free-text comment on an entity's audit trail.
    pub fn comment(&mut self, kind: Kind, id: i64, body: impl Into<String>) -> Result<()> {
        self.store.get(kind, id)?;
        self.comments.push((kind, id, body.into()));
        Ok(())
    }

    /// Drop all staged state.
    pub fn expunge(&mut self) {
        self.slots.clear();
        self.comments.clear();
        self.parents.clear();
    }

    /// Commit the staged work. On error the transaction is rolled back and
    /// the session expunged; the database never holds partial state.
    pub fn commit(&mut self) -> Result<CommitOutcome> {
        let result = self.commit_inner();
        if result.is_err() {
            self.expunge();
        }
        result
    }

    fn commit_inner(&mut self) -> Result<CommitOutcome> {
        if self.slots.is_empty() && self.comments.is_empty() {
            return Ok(CommitOutcome::default());
        }

        self.run_before_hooks()?;

        // Hooks may rewrite entities; check what actually gets persisted.
        for slot in &self.slots {
            slot.entity.validate()?;
        }

        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        // Database writes in dependency order.
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by_key(|&i| self.slots[i].entity.kind().flush_rank());

        let now = Utc::now();
        for &i in &order {
            let slot = &mut self.slots[i];
            slot.entity.meta_mut().modified_at = now;
            match slot.op {
                Op::Create => {
                    slot.entity.meta_mut().created_at = now;
                    insert_entity(&tx, &mut slot.entity)?;
                }
                Op::Update => {
                    update_entity(&tx, &slot.entity)?;
                }
            }
        }

        // Change sets are computed after the writes so references created in
        // this request already resolve to display names.
        let names = TxNames { conn: &tx };
        let mut outcome = CommitOutcome::default();
        for &i in &order {
            let slot = &self.slots[i];
            let id = slot.entity.id().expect("id assigned during write");
            let changes = match slot.op {
                Op::Create => creation_changes(slot.entity.audit_fields(&names)),
                Op::Update => {
                    let old = slot
                        .original
                        .as_ref()
                        .expect("update slot keeps its original")
                        .audit_fields(&names);
                    diff_fields(&old, &slot.entity.audit_fields(&names))
                }
            };
            let change_type = match slot.op {
                Op::Create => MessageType::New,
                Op::Update => MessageType::Dirty,
            };
            if !changes.is_empty() {
                outcome.changes.push(EntityChange {
                    kind: slot.entity.kind(),
                    id,
                    change_type,
                    changes,
                });
            }
        }

        // Enforced rules abort the transaction when a violation involves one
        // of the touched entities.
        let touched: Vec<(Kind, i64)> = self
            .slots
            .iter()
            .filter_map(|slot| slot.entity.id().map(|id| (slot.entity.kind(), id)))
            .collect();
        rules::check_enforced(&tx, &touched)?;

        // Audit messages.
        for change in &outcome.changes {
            let mut message = Message::new(change.kind, change.id, change.change_type);
            message.author_id = self.author_id;
            message.date = now;
            message.changes = Some(change.changes.clone());
            crate::store::insert_message(&tx, &mut message)?;
            outcome.messages.push(message);
        }
        for (kind, id, body) in &self.comments {
            let mut message = Message::comment(*kind, *id, self.author_id, body.clone());
            message.date = now;
            crate::store::insert_message(&tx, &mut message)?;
            outcome.messages.push(message);
        }
        for parent in &self.parents {
            let child = &self.slots[parent.child_index];
            let child_id = child.entity.id().expect("id assigned during write");
            // A parent touch on an entity staged in the same commit would
            // duplicate its own message.
            if touched.contains(&(parent.parent_kind, parent.parent_id)) {
                continue;
            }
            let child_changes = outcome
                .changes_for(child.entity.kind(), child_id)
                .cloned()
                .unwrap_or_default();
            let mut message = Message::new(parent.parent_kind, parent.parent_id, MessageType::Parent);
            message.author_id = self.author_id;
            message.date = now;
            message.changes = Some(child_changes);
            crate::store::insert_message(&tx, &mut message)?;
            outcome.messages.push(message);
        }

        // Refresh the materialised search projection for touched rows.
        for &i in &order {
            let entity = &self.slots[i].entity;
            if Kind::searchable().contains(&entity.kind()) {
                search::refresh_entity(&tx, entity)?;
            }
        }

        outcome.notifications = collect_notifications(&tx, &outcome.messages, self.author_id)?;

        tx.commit()?;

        // The after-flush side effects inside the transaction are done; the
        // external notifier runs post-commit and must not undo it.
        if let Some(notifier) = self.notifier {
            if !outcome.notifications.is_empty() {
                let batch = NotificationBatch {
                    recipients: outcome.notifications.clone(),
                };
                if let Err(e) = notifier.notify(&batch) {
                    tracing::warn!("notification delivery failed: {}", e);
                }
            }
        }

        self.expunge();
        Ok(outcome)
    }

    fn run_before_hooks(&mut self) -> Result<()> {
        let mut processed = 0;
        let mut rounds = 0;
        while processed < self.slots.len() {
            rounds += 1;
            if rounds > MAX_HOOK_ROUNDS {
                return Err(UdbError::Fatal(format!(
                    "before-flush hooks did not converge after {MAX_HOOK_ROUNDS} iterations"
                )));
            }
            let end = self.slots.len();
            for index in processed..end {
                let kind = self.slots[index].entity.kind();
                let mut ctx = FlushCtx {
                    store: &self.store,
                    slots: &mut self.slots,
                    parents: &mut self.parents,
                };
                for hook in self.registry.hooks(kind, Phase::BeforeFlush) {
                    hook(&mut ctx, index)?;
                }
            }
            processed = end;
        }
        Ok(())
    }
}

/// Creation change sets keep only the fields that were actually set.
fn creation_changes(fields: BTreeMap<String, Value>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, value) in fields {
        let unset = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        };
        if !unset {
            changes.insert(key, (Value::Null, value));
        }
    }
    changes
}

/// Aggregate `{follower -> [message]}` for one commit: at most one message
/// per (follower, entity), authors never notified about their own changes.
fn collect_notifications(
    conn: &Connection,
    messages: &[Message],
    author_id: Option<i64>,
) -> Result<BTreeMap<i64, Vec<Message>>> {
    let mut primary: BTreeMap<(String, i64), &Message> = BTreeMap::new();
    for message in messages {
        primary
            .entry((message.model_name.clone(), message.model_id))
            .or_insert(message);
    }

    let mut stmt = conn.prepare(
        "SELECT user_id FROM follower WHERE model_name = ?1 AND model_id = ?2",
    )?;
    let mut recipients: BTreeMap<i64, Vec<Message>> = BTreeMap::new();
    for ((model_name, model_id), message) in primary {
        let followers: Vec<i64> = stmt
            .query_map(rusqlite::params![model_name, model_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for user_id in followers {
            if Some(user_id) == author_id {
                continue;
            }
            recipients.entry(user_id).or_default().push(message.clone());
        }
    }
    Ok(recipients)
}

/// Display-name resolver bound to the committing transaction, so rows
/// created in the same request resolve too.
struct TxNames<'c> {
    conn: &'c Connection,
}

impl NameLookup for TxNames<'_> {
    fn user_name(&self, id: i64) -> Option<String> {
        self.conn
            .query_row(
                "SELECT CASE WHEN fullname != '' THEN fullname ELSE username END
                 FROM user WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .ok()?
    }

    fn vrf_name(&self, id: i64) -> Option<String> {
        self.conn
            .query_row("SELECT name FROM vrf WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .ok()?
    }

    fn zone_name(&self, id: i64) -> Option<String> {
        self.conn
            .query_row("SELECT name FROM dnszone WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .ok()?
    }

    fn subnet_name(&self, id: i64) -> Option<String> {
        self.conn
            .query_row("SELECT name FROM subnet WHERE id = ?1", [id], |row| row.get(0))
            .optional()
            .ok()?
    }
}
