// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Observe changes to a program tree.
//!
//! Listeners are registered on a node and called synchronously, on the mutating thread, right
//! after a change has been applied. There is no queue: whatever a listener does runs inside the
//! mutation call, so long-running listeners slow down bulk edits.
//!
//! There are four ways to listen, from narrowest to widest:
//!
//! - a **property** listener sees changes to one named property of its node,
//! - a **direct** listener sees every property change of its node,
//! - a **structure** listener sees child-list changes anywhere in the subtree rooted at its node,
//! - a **composite** listener sees every change anywhere in that subtree, including changes to
//!   children added after it was registered.
//!
//! Composite and structure listeners are found by walking from the changed node up to the root,
//! so fan-out costs `O(depth)` per change.
//!
//! When event delivery is re-enabled after being suspended with
//! [`ProgramTree::set_sending_events`](crate::ProgramTree::set_sending_events), composite
//! listeners get a single [`EVENTS_ACTIVATED`] event instead of a replay of what they missed, and
//! should refresh whatever they derived from the tree.
use crate::{conflicts::Conflicts, key::NodeKey};
use std::{any::Any, borrow::Cow, fmt, sync::Arc};

/// Property name of payload changes.
pub const DATA_OBJECT_PROP: &str = "ClientData:DataObject";
/// Property name of conflict changes.
pub const CONFLICTS_PROP: &str = "Conflicts";
/// Property name of the event sent when event delivery resumes.
pub const EVENTS_ACTIVATED: &str = "EventsActivated";
/// Namespace of persisted client data properties.
pub const CLIENT_DATA_PREFIX: &str = "ClientData:";
/// Namespace of transient client data properties.
pub const TRANSIENT_CLIENT_DATA_PREFIX: &str = "TransientClientData:";

/// Opaque data collaborators attach to nodes.
pub type ClientValue = Arc<dyn Any + Send + Sync>;

/// Old or new value carried by a [`PropertyChange`].
#[derive(Clone)]
pub enum ChangeValue<D> {
    None,
    DataObject(D),
    Conflicts(Conflicts<D>),
    Children(Vec<NodeKey>),
    ClientData(ClientValue),
}

impl<D: fmt::Debug> fmt::Debug for ChangeValue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeValue::None => f.write_str("None"),
            ChangeValue::DataObject(d) => f.debug_tuple("DataObject").field(d).finish(),
            ChangeValue::Conflicts(c) => f.debug_tuple("Conflicts").field(c).finish(),
            ChangeValue::Children(c) => f.debug_tuple("Children").field(c).finish(),
            ChangeValue::ClientData(_) => f.write_str("ClientData(..)"),
        }
    }
}

impl<D> ChangeValue<D> {
    pub fn as_data_object(&self) -> Option<&D> {
        match self {
            ChangeValue::DataObject(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_children(&self) -> Option<&[NodeKey]> {
        match self {
            ChangeValue::Children(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_conflicts(&self) -> Option<&Conflicts<D>> {
        match self {
            ChangeValue::Conflicts(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_client_data(&self) -> Option<&ClientValue> {
        match self {
            ChangeValue::ClientData(c) => Some(c),
            _ => None,
        }
    }
}

/// A single change, as delivered to listeners.
#[derive(Debug, Clone)]
pub struct PropertyChange<D> {
    pub property: Cow<'static, str>,
    /// The node that changed.
    pub source: NodeKey,
    pub old: ChangeValue<D>,
    pub new: ChangeValue<D>,
    /// True for child-list changes.
    pub structural: bool,
}

impl<D> PropertyChange<D> {
    pub(crate) fn new(
        property: impl Into<Cow<'static, str>>,
        source: NodeKey,
        old: ChangeValue<D>,
        new: ChangeValue<D>,
    ) -> Self {
        Self {
            property: property.into(),
            source,
            old,
            new,
            structural: false,
        }
    }

    pub(crate) fn structure(
        property: &'static str,
        source: NodeKey,
        old: Vec<NodeKey>,
        new: Vec<NodeKey>,
    ) -> Self {
        Self {
            structural: true,
            ..Self::new(
                property,
                source,
                ChangeValue::Children(old),
                ChangeValue::Children(new),
            )
        }
    }

    pub fn is_events_activated(&self) -> bool {
        self.property == EVENTS_ACTIVATED
    }
}

/// Receives change notifications.
pub trait ChangeListener<D>: Send + Sync {
    fn property_change(&self, change: &PropertyChange<D>);
}

impl<D, F> ChangeListener<D> for F
where
    F: Fn(&PropertyChange<D>) + Send + Sync,
{
    fn property_change(&self, change: &PropertyChange<D>) {
        self(change)
    }
}

/// Handle of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// What a listener listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    Property(Cow<'static, str>),
    Direct,
    Structure,
    Composite,
}

struct Registration<D> {
    id: ListenerId,
    scope: Scope,
    listener: Arc<dyn ChangeListener<D>>,
}

/// Listeners registered on one node.
pub(crate) struct Listeners<D> {
    registrations: Vec<Registration<D>>,
}

impl<D> Default for Listeners<D> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }
}

impl<D> Listeners<D> {
    pub(crate) fn add(&mut self, id: ListenerId, scope: Scope, listener: Arc<dyn ChangeListener<D>>) {
        self.registrations.push(Registration {
            id,
            scope,
            listener,
        });
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        before != self.registrations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Listeners on the changed node itself.
    pub(crate) fn collect_direct(
        &self,
        change: &PropertyChange<D>,
        out: &mut Vec<Arc<dyn ChangeListener<D>>>,
    ) {
        for r in &self.registrations {
            let hit = match &r.scope {
                Scope::Property(name) => *name == change.property,
                Scope::Direct => true,
                Scope::Structure | Scope::Composite => false,
            };
            if hit {
                out.push(Arc::clone(&r.listener));
            }
        }
    }

    /// Listeners on the changed node or one of its ancestors.
    pub(crate) fn collect_subtree(
        &self,
        change: &PropertyChange<D>,
        out: &mut Vec<Arc<dyn ChangeListener<D>>>,
    ) {
        for r in &self.registrations {
            let hit = match r.scope {
                Scope::Composite => true,
                Scope::Structure => change.structural,
                Scope::Property(_) | Scope::Direct => false,
            };
            if hit {
                out.push(Arc::clone(&r.listener));
            }
        }
    }

    pub(crate) fn composite(&self) -> impl Iterator<Item = &Arc<dyn ChangeListener<D>>> + '_ {
        self.registrations
            .iter()
            .filter(|r| r.scope == Scope::Composite)
            .map(|r| &r.listener)
    }
}
