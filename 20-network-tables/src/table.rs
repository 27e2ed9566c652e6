//! The entry table: the authoritative name → entry mapping of one session.
//!
//! Entries live in an arena indexed by slot, with name and id indexes on the
//! side. Entries are never removed while the session lasts, so slots stay
//! valid.
//!
//! All mutations run under one mutex. A mutation that has to reach the network
//! is published on the outbound broadcast channel *while the lock is held*, so
//! subscribers see messages in mutation order. Listeners run after the lock is
//! released and may call back into the table.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::{
    entry::{Entry, SequenceNumber, UNASSIGNED_ID},
    error::{BadMessage, TableError},
    message::{EntryLookup, Message},
    value::{Value, ValueType},
};

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

pub type ConnectionId = u64;
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&EntryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns id allocation and fans changes out to every client.
    Server,
    /// Mirrors the server over a single upstream link.
    Client,
}

/// Which connections an outbound message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    All,
    Except(ConnectionId),
    Only(ConnectionId),
}

impl Route {
    pub fn includes(self, connection: ConnectionId) -> bool {
        match self {
            Route::All => true,
            Route::Except(origin) => origin != connection,
            Route::Only(target) => target == connection,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub route: Route,
    pub message: Message,
}

/// Passed to listeners for every accepted mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryEvent {
    pub name: String,
    pub value: Value,
    /// First value this session has seen for `name`.
    pub is_new: bool,
}

impl EntryEvent {
    fn new(entry: &Entry, is_new: bool) -> Self {
        Self {
            name: entry.name.clone(),
            value: entry.value.clone(),
            is_new,
        }
    }
}

pub struct EntryTable {
    role: Role,
    state: Mutex<TableState>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    outbound: broadcast::Sender<Outbound>,
}

struct TableState {
    slots: Vec<Entry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
    next_id: u16,
    /// Client only: the server has finished the initial sync.
    live: bool,
    /// Client only: slots changed locally that the server has not heard about.
    dirty: BTreeSet<usize>,
}

impl TableState {
    fn insert(&mut self, entry: Entry) -> usize {
        let slot = self.slots.len();
        self.by_name.insert(entry.name.clone(), slot);
        if let Some(id) = entry.id {
            self.by_id.insert(id, slot);
        }
        self.slots.push(entry);
        slot
    }

    fn allocate_id(&mut self) -> Result<u16, TableError> {
        if self.next_id == UNASSIGNED_ID {
            return Err(TableError::IdSpaceExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }
}

impl EntryTable {
    pub fn new(role: Role) -> Self {
        Self::with_outbound_capacity(role, DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_outbound_capacity(role: Role, capacity: usize) -> Self {
        let (outbound, _) = broadcast::channel(capacity.max(1));
        Self {
            role,
            state: Mutex::new(TableState {
                slots: Vec::new(),
                by_name: HashMap::new(),
                by_id: HashMap::new(),
                next_id: 1,
                live: role == Role::Server,
                dirty: BTreeSet::new(),
            }),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            outbound,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether local changes go straight to the network. Always true on the
    /// server; on a client it flips once the initial sync completes.
    pub fn is_live(&self) -> bool {
        self.state().live
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, route: Route, message: Message) {
        // No receivers just means no connection is live yet.
        if self.outbound.send(Outbound { route, message }).is_err() {
            trace!("no live connections for outbound message");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.outbound.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<Entry> {
        let state = self.state();
        state.by_name.get(name).map(|&slot| state.slots[slot].clone())
    }

    pub fn get_value(&self, name: &str) -> Option<Value> {
        let state = self.state();
        state
            .by_name
            .get(name)
            .map(|&slot| state.slots[slot].value.clone())
    }

    pub fn entry_by_id(&self, id: u16) -> Option<Entry> {
        let state = self.state();
        state.by_id.get(&id).map(|&slot| state.slots[slot].clone())
    }

    /// All entries in creation order.
    pub fn entries(&self) -> Vec<Entry> {
        self.state().slots.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.state()
            .slots
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates `name` with a fresh id and sequence number 0.
    pub fn assign(&self, name: &str, value: Value) -> Result<Entry, TableError> {
        if self.role != Role::Server {
            return Err(TableError::WrongRole("assign"));
        }

        let entry = {
            let mut state = self.state();
            if state.by_name.contains_key(name) {
                return Err(TableError::DuplicateName(name.to_string()));
            }
            self.assign_locked(&mut state, name, value)?
        };

        self.notify(&[EntryEvent::new(&entry, true)]);
        Ok(entry)
    }

    fn assign_locked(
        &self,
        state: &mut TableState,
        name: &str,
        value: Value,
    ) -> Result<Entry, TableError> {
        let id = state.allocate_id()?;
        let entry = Entry::new(Some(id), name, SequenceNumber::ZERO, value);
        state.insert(entry.clone());
        self.publish(Route::All, Message::EntryAssignment(entry.clone()));
        Ok(entry)
    }

    /// Local write.
    ///
    /// An existing entry gets the next sequence number and an update goes out.
    /// An unknown name is assigned on the server; on a client it becomes a
    /// pending entry that asks the server for an id. Before a client is live
    /// the change is only recorded and sent once the sync completes.
    pub fn put(&self, name: &str, value: impl Into<Value>) -> Result<(), TableError> {
        let value = value.into();
        let event = {
            let mut state = self.state();
            let live = state.live;
            match state.by_name.get(name).copied() {
                Some(slot) => {
                    let entry = {
                        let entry = &mut state.slots[slot];
                        if entry.value_type() != value.value_type() {
                            return Err(TableError::TypeMismatch {
                                name: name.to_string(),
                                expected: entry.value_type(),
                                actual: value.value_type(),
                            });
                        }
                        entry.sequence = entry.sequence.next();
                        entry.value = value;
                        entry.clone()
                    };

                    if !live {
                        state.dirty.insert(slot);
                    } else if entry.id.is_some() {
                        self.publish(Route::All, Message::update(&entry));
                    }
                    // A live client entry still waiting for its id is replayed
                    // when the server's assignment arrives.
                    EntryEvent::new(&entry, false)
                }
                None if self.role == Role::Server => {
                    let entry = self.assign_locked(&mut state, name, value)?;
                    EntryEvent::new(&entry, true)
                }
                None => {
                    let entry = Entry::new(None, name, SequenceNumber::ZERO, value);
                    let slot = state.insert(entry.clone());
                    if live {
                        self.publish(Route::All, Message::EntryAssignment(entry.clone()));
                    } else {
                        state.dirty.insert(slot);
                    }
                    EntryEvent::new(&entry, true)
                }
            }
        };

        self.notify(&[event]);
        Ok(())
    }

    /// Applies an entry update received from the peer.
    ///
    /// Returns `Ok(false)` when `sequence` is not newer than the stored one;
    /// stale and duplicate updates are dropped without error. On the server an
    /// accepted update is fanned out to every connection except `origin`.
    pub fn apply_incoming_update(
        &self,
        id: u16,
        sequence: SequenceNumber,
        value: Value,
        origin: Option<ConnectionId>,
    ) -> Result<bool, BadMessage> {
        let event = {
            let mut state = self.state();
            let slot = *state.by_id.get(&id).ok_or(BadMessage::UnknownEntryId(id))?;
            let entry = {
                let entry = &mut state.slots[slot];
                if entry.value_type() != value.value_type() {
                    return Err(BadMessage::TypeChanged {
                        name: entry.name.clone(),
                        current: entry.value_type(),
                        incoming: value.value_type(),
                    });
                }
                if !sequence.is_newer_than(entry.sequence) {
                    trace!(id, %sequence, current = %entry.sequence, "dropping stale update");
                    return Ok(false);
                }
                entry.sequence = sequence;
                entry.value = value;
                entry.clone()
            };

            match self.role {
                Role::Server => {
                    let route = origin.map_or(Route::All, Route::Except);
                    self.publish(route, Message::update(&entry));
                }
                Role::Client => {
                    state.dirty.remove(&slot);
                }
            }
            EntryEvent::new(&entry, false)
        };

        self.notify(&[event]);
        Ok(true)
    }

    /// Server side of an entry assignment sent by a client.
    ///
    /// A request for a new name (no id) is given the next id and broadcast to
    /// every client, the requester included so it learns the id. A request for
    /// a name the server already holds is answered with the canonical entry,
    /// to the requester only. An assignment carrying an id the server issued
    /// for that same name is treated as an update.
    pub fn accept_assignment_request(
        &self,
        request: Entry,
        origin: ConnectionId,
    ) -> Result<(), BadMessage> {
        if self.role != Role::Server {
            return Err(BadMessage::Unexpected {
                message: "assignment request",
                context: "on a client table",
            });
        }

        if let Some(id) = request.id {
            let matches = self
                .entry_by_id(id)
                .is_some_and(|entry| entry.name == request.name);
            if !matches {
                return Err(BadMessage::Unexpected {
                    message: "entry assignment",
                    context: "with a client-chosen id",
                });
            }
            self.apply_incoming_update(id, request.sequence, request.value, Some(origin))?;
            return Ok(());
        }

        let entry = {
            let mut state = self.state();
            if let Some(&slot) = state.by_name.get(&request.name) {
                let canonical = state.slots[slot].clone();
                self.publish(Route::Only(origin), Message::EntryAssignment(canonical));
                return Ok(());
            }

            let id = match state.allocate_id() {
                Ok(id) => id,
                Err(err) => {
                    warn!(name = %request.name, error = %err, "cannot assign entry requested by client");
                    return Ok(());
                }
            };
            let entry = Entry {
                id: Some(id),
                ..request
            };
            state.insert(entry.clone());
            self.publish(Route::All, Message::EntryAssignment(entry.clone()));
            entry
        };

        self.notify(&[EntryEvent::new(&entry, true)]);
        Ok(())
    }

    /// Client side of an entry assignment sent by the server.
    ///
    /// The server is authoritative: an entry already known under this id is
    /// overwritten. A local entry with the same name but no id (or another
    /// id) adopts the server's id; if its sequence number is newer it keeps
    /// its value and replays it as an update, otherwise the server's value
    /// replaces it.
    pub fn apply_incoming_assignment(&self, incoming: Entry) -> Result<(), BadMessage> {
        let id = incoming.id.ok_or(BadMessage::Unexpected {
            message: "entry assignment",
            context: "without an id from the server",
        })?;

        let event = {
            let mut state = self.state();
            let live = state.live;

            if let Some(&slot) = state.by_id.get(&id) {
                let entry = &mut state.slots[slot];
                if entry.name != incoming.name {
                    return Err(BadMessage::Unexpected {
                        message: "entry assignment",
                        context: "renaming an existing id",
                    });
                }
                if entry.value_type() != incoming.value_type() {
                    return Err(BadMessage::TypeChanged {
                        name: entry.name.clone(),
                        current: entry.value_type(),
                        incoming: incoming.value_type(),
                    });
                }
                let changed = entry.value != incoming.value;
                entry.sequence = incoming.sequence;
                entry.value = incoming.value;
                let event = changed.then(|| EntryEvent::new(entry, false));
                state.dirty.remove(&slot);
                event
            } else if let Some(&slot) = state.by_name.get(&incoming.name) {
                if let Some(previous) = state.slots[slot].id {
                    state.by_id.remove(&previous);
                }
                state.by_id.insert(id, slot);

                let entry = &mut state.slots[slot];
                entry.id = Some(id);
                let keep_local = entry.value_type() == incoming.value_type()
                    && entry.sequence.is_newer_than(incoming.sequence);

                if keep_local {
                    let replay = Message::update(entry);
                    if live {
                        self.publish(Route::All, replay);
                        state.dirty.remove(&slot);
                    } else {
                        state.dirty.insert(slot);
                    }
                    None
                } else {
                    let changed = entry.value != incoming.value;
                    entry.sequence = incoming.sequence;
                    entry.value = incoming.value;
                    let event = changed.then(|| EntryEvent::new(entry, false));
                    state.dirty.remove(&slot);
                    event
                }
            } else {
                state.insert(incoming.clone());
                Some(EntryEvent::new(&incoming, true))
            }
        };

        if let Some(event) = event {
            self.notify(&[event]);
        }
        Ok(())
    }

    /// Every assigned entry plus a subscription that starts right after them.
    pub fn snapshot_and_subscribe(&self) -> (Vec<Entry>, broadcast::Receiver<Outbound>) {
        let state = self.state();
        let entries = state
            .slots
            .iter()
            .filter(|entry| entry.id.is_some())
            .cloned()
            .collect();
        (entries, self.outbound.subscribe())
    }

    /// Marks a client table live and returns the changes buffered while it
    /// was synchronising, plus a subscription that starts right after them.
    pub fn go_live(&self) -> (Vec<Message>, broadcast::Receiver<Outbound>) {
        let mut state = self.state();
        state.live = true;
        let dirty = std::mem::take(&mut state.dirty);
        let pending = dirty
            .into_iter()
            .map(|slot| {
                let entry = &state.slots[slot];
                match entry.id {
                    Some(_) => Message::update(entry),
                    None => Message::EntryAssignment(entry.clone()),
                }
            })
            .collect();
        (pending, self.outbound.subscribe())
    }

    /// Registers a callback run for every accepted mutation, local or remote.
    ///
    /// Callbacks run on the mutating task, in registration order, after the
    /// table lock is released.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EntryEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    fn notify(&self, events: &[EntryEvent]) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }
}

impl EntryLookup for EntryTable {
    fn value_type(&self, id: u16) -> Option<ValueType> {
        let state = self.state();
        state
            .by_id
            .get(&id)
            .map(|&slot| state.slots[slot].value_type())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    fn drain(rx: &mut broadcast::Receiver<Outbound>) -> Vec<Outbound> {
        let mut messages = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return messages,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    fn server_with_speed() -> EntryTable {
        let table = EntryTable::new(Role::Server);
        table.assign("speed", Value::Double(0.0)).expect("assign speed");
        table
    }

    #[test]
    fn server_assigns_sequential_ids_from_one() {
        let table = EntryTable::new(Role::Server);
        let mut rx = table.subscribe();

        let speed = table.assign("speed", Value::Double(0.0)).unwrap();
        let armed = table.assign("armed", Value::Boolean(false)).unwrap();

        assert_eq!(speed.id, Some(1));
        assert_eq!(speed.sequence, SequenceNumber::ZERO);
        assert_eq!(armed.id, Some(2));
        assert_eq!(
            drain(&mut rx),
            vec![
                Outbound {
                    route: Route::All,
                    message: Message::EntryAssignment(speed),
                },
                Outbound {
                    route: Route::All,
                    message: Message::EntryAssignment(armed),
                },
            ]
        );
    }

    #[test]
    fn duplicate_names_are_rejected_without_side_effects() {
        let table = server_with_speed();
        let err = table.assign("speed", Value::Double(9.0)).unwrap_err();
        assert_eq!(err, TableError::DuplicateName("speed".into()));
        assert_eq!(table.get_value("speed"), Some(Value::Double(0.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn assign_is_server_only() {
        let table = EntryTable::new(Role::Client);
        assert_eq!(
            table.assign("speed", Value::Double(0.0)),
            Err(TableError::WrongRole("assign"))
        );
    }

    #[test]
    fn put_bumps_the_sequence_and_emits_an_update() {
        let table = server_with_speed();
        let mut rx = table.subscribe();

        table.put("speed", 3.5).unwrap();

        let entry = table.get("speed").unwrap();
        assert_eq!(entry.sequence, SequenceNumber(1));
        assert_eq!(entry.value, Value::Double(3.5));
        assert_eq!(
            drain(&mut rx),
            vec![Outbound {
                route: Route::All,
                message: Message::EntryUpdate {
                    id: 1,
                    sequence: SequenceNumber(1),
                    value: Value::Double(3.5),
                },
            }]
        );
    }

    #[test]
    fn put_with_another_type_is_refused() {
        let table = server_with_speed();
        let err = table.put("speed", "fast").unwrap_err();
        assert_eq!(
            err,
            TableError::TypeMismatch {
                name: "speed".into(),
                expected: ValueType::Double,
                actual: ValueType::String,
            }
        );
        assert_eq!(table.get("speed").unwrap().sequence, SequenceNumber::ZERO);
    }

    #[test]
    fn put_on_an_unknown_name_assigns_it_on_the_server() {
        let table = EntryTable::new(Role::Server);
        table.put("mode", "auto").unwrap();
        let entry = table.get("mode").unwrap();
        assert_eq!(entry.id, Some(1));
        assert_eq!(entry.value, Value::from("auto"));
    }

    #[test]
    fn incoming_updates_follow_circular_ordering() {
        let table = server_with_speed();
        table.put("speed", 1.0).unwrap();
        // current sequence is 1
        assert!(!table
            .apply_incoming_update(1, SequenceNumber(1), Value::Double(7.0), None)
            .unwrap());
        assert!(!table
            .apply_incoming_update(1, SequenceNumber(0), Value::Double(7.0), None)
            .unwrap());
        assert!(!table
            .apply_incoming_update(1, SequenceNumber(1 + 0x8000), Value::Double(7.0), None)
            .unwrap());
        assert_eq!(table.get_value("speed"), Some(Value::Double(1.0)));

        assert!(table
            .apply_incoming_update(1, SequenceNumber(2), Value::Double(7.0), None)
            .unwrap());
        assert_eq!(table.get("speed").unwrap().sequence, SequenceNumber(2));
        assert_eq!(table.get_value("speed"), Some(Value::Double(7.0)));
    }

    #[test]
    fn duplicate_delivery_applies_once() {
        let table = server_with_speed();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        table.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = table.apply_incoming_update(1, SequenceNumber(1), Value::Double(2.0), Some(7));
        let second = table.apply_incoming_update(1, SequenceNumber(1), Value::Double(2.0), Some(7));

        assert!(first.unwrap());
        assert!(!second.unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accepted_client_updates_skip_their_origin() {
        let table = server_with_speed();
        let mut rx = table.subscribe();

        table
            .apply_incoming_update(1, SequenceNumber(1), Value::Double(2.0), Some(7))
            .unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].route, Route::Except(7));
        assert!(!sent[0].route.includes(7));
        assert!(sent[0].route.includes(8));
    }

    #[test]
    fn unknown_ids_leave_the_table_untouched() {
        let table = server_with_speed();
        let before = table.entries();
        let err = table
            .apply_incoming_update(0xFFFF, SequenceNumber(1), Value::Double(1.0), None)
            .unwrap_err();
        assert!(matches!(err, BadMessage::UnknownEntryId(0xFFFF)));
        assert_eq!(table.entries(), before);
    }

    #[test]
    fn listeners_run_in_registration_order_outside_the_lock() {
        let table = Arc::new(server_with_speed());
        let log = Arc::new(StdMutex::new(Vec::new()));

        for label in ["first", "second"] {
            let log = Arc::clone(&log);
            let reentrant = Arc::clone(&table);
            table.add_listener(move |event| {
                // Reading the table from a listener must not deadlock.
                let current = reentrant.get_value(&event.name);
                assert_eq!(current.as_ref(), Some(&event.value));
                log.lock().unwrap().push((label, event.name.clone(), event.is_new));
            });
        }

        table.put("armed", true).unwrap();
        table.put("armed", false).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("first", "armed".to_string(), true),
                ("second", "armed".to_string(), true),
                ("first", "armed".to_string(), false),
                ("second", "armed".to_string(), false),
            ]
        );
    }

    #[test]
    fn removed_listeners_stop_receiving_events() {
        let table = server_with_speed();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let id = table.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        table.put("speed", 1.0).unwrap();
        assert!(table.remove_listener(id));
        assert!(!table.remove_listener(id));
        table.put("speed", 2.0).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn assignment_requests_get_an_id_and_reach_everyone() {
        let table = server_with_speed();
        let mut rx = table.subscribe();

        let request = Entry::new(None, "mode", SequenceNumber(3), Value::from("auto"));
        table.accept_assignment_request(request, 7).unwrap();

        let entry = table.get("mode").unwrap();
        assert_eq!(entry.id, Some(2));
        assert_eq!(entry.sequence, SequenceNumber(3));
        assert_eq!(
            drain(&mut rx),
            vec![Outbound {
                route: Route::All,
                message: Message::EntryAssignment(entry),
            }]
        );
    }

    #[test]
    fn requests_for_existing_names_get_the_canonical_entry_back() {
        let table = server_with_speed();
        let mut rx = table.subscribe();

        let request = Entry::new(None, "speed", SequenceNumber(0), Value::Double(99.0));
        table.accept_assignment_request(request, 7).unwrap();

        assert_eq!(table.get_value("speed"), Some(Value::Double(0.0)));
        assert_eq!(
            drain(&mut rx),
            vec![Outbound {
                route: Route::Only(7),
                message: Message::EntryAssignment(table.get("speed").unwrap()),
            }]
        );
    }

    #[test]
    fn client_buffers_puts_until_live() {
        let table = EntryTable::new(Role::Client);
        table
            .apply_incoming_assignment(Entry::new(
                Some(1),
                "speed",
                SequenceNumber(4),
                Value::Double(0.0),
            ))
            .unwrap();
        let mut early = table.subscribe();

        table.put("speed", 1.5).unwrap();
        table.put("mode", "auto").unwrap();
        assert!(drain(&mut early).is_empty());

        let (pending, _rx) = table.go_live();
        assert!(table.is_live());
        assert_eq!(
            pending,
            vec![
                Message::EntryUpdate {
                    id: 1,
                    sequence: SequenceNumber(5),
                    value: Value::Double(1.5),
                },
                Message::EntryAssignment(Entry::new(
                    None,
                    "mode",
                    SequenceNumber::ZERO,
                    Value::from("auto"),
                )),
            ]
        );
    }

    #[test]
    fn live_client_requests_ids_for_new_names() {
        let table = EntryTable::new(Role::Client);
        let (_, mut rx) = table.go_live();

        table.put("mode", "auto").unwrap();
        // still waiting for the id: nothing to address an update to
        table.put("mode", "teleop").unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![Outbound {
                route: Route::All,
                message: Message::EntryAssignment(Entry::new(
                    None,
                    "mode",
                    SequenceNumber::ZERO,
                    Value::from("auto"),
                )),
            }]
        );
    }

    #[test]
    fn newer_local_value_is_replayed_against_the_server_id() {
        let table = EntryTable::new(Role::Client);
        let (_, mut rx) = table.go_live();
        table.put("mode", "auto").unwrap();
        table.put("mode", "teleop").unwrap();
        drain(&mut rx);

        table
            .apply_incoming_assignment(Entry::new(
                Some(9),
                "mode",
                SequenceNumber::ZERO,
                Value::from("auto"),
            ))
            .unwrap();

        let entry = table.get("mode").unwrap();
        assert_eq!(entry.id, Some(9));
        assert_eq!(entry.value, Value::from("teleop"));
        assert_eq!(
            drain(&mut rx),
            vec![Outbound {
                route: Route::All,
                message: Message::EntryUpdate {
                    id: 9,
                    sequence: SequenceNumber(1),
                    value: Value::from("teleop"),
                },
            }]
        );
    }

    #[test]
    fn server_assignment_wins_over_an_older_local_value() {
        let table = EntryTable::new(Role::Client);
        let (_, mut rx) = table.go_live();
        table.put("mode", "auto").unwrap();
        drain(&mut rx);

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        table.add_listener(move |event| sink.lock().unwrap().push(event.clone()));

        table
            .apply_incoming_assignment(Entry::new(
                Some(3),
                "mode",
                SequenceNumber(12),
                Value::from("disabled"),
            ))
            .unwrap();

        let entry = table.get("mode").unwrap();
        assert_eq!(entry.id, Some(3));
        assert_eq!(entry.sequence, SequenceNumber(12));
        assert_eq!(entry.value, Value::from("disabled"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![EntryEvent {
                name: "mode".into(),
                value: Value::from("disabled"),
                is_new: false,
            }]
        );
        assert_eq!(table.value_type(3), Some(ValueType::String));
    }

    #[test]
    fn server_assignment_overwrites_a_known_id() {
        let table = EntryTable::new(Role::Client);
        let speed = |seq, value| Entry::new(Some(1), "speed", SequenceNumber(seq), Value::Double(value));
        table.apply_incoming_assignment(speed(10, 1.0)).unwrap();
        table.apply_incoming_assignment(speed(2, 4.0)).unwrap();

        assert_eq!(table.get("speed").unwrap(), speed(2, 4.0));
    }

    #[test]
    fn assignments_may_not_change_an_entry_type() {
        let table = EntryTable::new(Role::Client);
        table
            .apply_incoming_assignment(Entry::new(Some(1), "speed", SequenceNumber(0), Value::Double(1.0)))
            .unwrap();
        let err = table
            .apply_incoming_assignment(Entry::new(Some(1), "speed", SequenceNumber(1), Value::from("fast")))
            .unwrap_err();
        assert!(matches!(err, BadMessage::TypeChanged { .. }));
        assert_eq!(table.get_value("speed"), Some(Value::Double(1.0)));
    }
}
