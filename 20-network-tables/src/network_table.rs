//! Path-addressed view over a session's entry table.
//!
//! Entry names are `/`-separated paths. A [`NetworkTable`] is a prefix of
//! that namespace: `root().sub_table("drive").put_number("speed", 1.0)`
//! writes the entry `drive/speed`. Views are cheap to clone and all views of
//! one session share the same entries and listeners.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    error::TableError,
    table::{EntryEvent, EntryTable, ListenerId},
    value::{Value, ValueType},
};

pub const PATH_SEPARATOR: char = '/';

#[derive(Clone)]
pub struct NetworkTable {
    table: Arc<EntryTable>,
    path: String,
}

impl NetworkTable {
    pub fn root(table: Arc<EntryTable>) -> Self {
        Self {
            table,
            path: String::new(),
        }
    }

    /// Path of this view; empty for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sub_table(&self, name: &str) -> NetworkTable {
        Self {
            table: Arc::clone(&self.table),
            path: self.full_key(name.trim_matches(PATH_SEPARATOR)),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}{PATH_SEPARATOR}{key}", self.path)
        }
    }

    fn relative<'a>(&self, name: &'a str) -> Option<&'a str> {
        relative_to(&self.path, name)
    }

    pub fn put_value(&self, key: &str, value: impl Into<Value>) -> Result<(), TableError> {
        self.table.put(&self.full_key(key), value)
    }

    pub fn put_boolean(&self, key: &str, value: bool) -> Result<(), TableError> {
        self.put_value(key, value)
    }

    pub fn put_number(&self, key: &str, value: f64) -> Result<(), TableError> {
        self.put_value(key, value)
    }

    pub fn put_string(&self, key: &str, value: impl Into<String>) -> Result<(), TableError> {
        self.put_value(key, value.into())
    }

    pub fn put_boolean_array(&self, key: &str, value: Vec<bool>) -> Result<(), TableError> {
        self.put_value(key, value)
    }

    pub fn put_number_array(&self, key: &str, value: Vec<f64>) -> Result<(), TableError> {
        self.put_value(key, value)
    }

    pub fn put_string_array(&self, key: &str, value: Vec<String>) -> Result<(), TableError> {
        self.put_value(key, value)
    }

    pub fn get_value(&self, key: &str) -> Result<Value, TableError> {
        let name = self.full_key(key);
        self.table
            .get_value(&name)
            .ok_or(TableError::NotFound(name))
    }

    fn get_typed<T>(
        &self,
        key: &str,
        expected: ValueType,
        pick: fn(Value) -> Option<T>,
    ) -> Result<T, TableError> {
        let value = self.get_value(key)?;
        let actual = value.value_type();
        pick(value).ok_or_else(|| TableError::TypeMismatch {
            name: self.full_key(key),
            expected,
            actual,
        })
    }

    pub fn get_boolean(&self, key: &str) -> Result<bool, TableError> {
        self.get_typed(key, ValueType::Boolean, |value| match value {
            Value::Boolean(value) => Some(value),
            _ => None,
        })
    }

    pub fn get_number(&self, key: &str) -> Result<f64, TableError> {
        self.get_typed(key, ValueType::Double, |value| match value {
            Value::Double(value) => Some(value),
            _ => None,
        })
    }

    pub fn get_string(&self, key: &str) -> Result<String, TableError> {
        self.get_typed(key, ValueType::String, |value| match value {
            Value::String(value) => Some(value),
            _ => None,
        })
    }

    pub fn get_boolean_array(&self, key: &str) -> Result<Vec<bool>, TableError> {
        self.get_typed(key, ValueType::BooleanArray, |value| match value {
            Value::BooleanArray(value) => Some(value),
            _ => None,
        })
    }

    pub fn get_number_array(&self, key: &str) -> Result<Vec<f64>, TableError> {
        self.get_typed(key, ValueType::DoubleArray, |value| match value {
            Value::DoubleArray(value) => Some(value),
            _ => None,
        })
    }

    pub fn get_string_array(&self, key: &str) -> Result<Vec<String>, TableError> {
        self.get_typed(key, ValueType::StringArray, |value| match value {
            Value::StringArray(value) => Some(value),
            _ => None,
        })
    }

    // The `_or` getters fall back on a missing key and on a type mismatch.

    pub fn get_boolean_or(&self, key: &str, default: bool) -> bool {
        self.get_boolean(key).unwrap_or(default)
    }

    pub fn get_number_or(&self, key: &str, default: f64) -> f64 {
        self.get_number(key).unwrap_or(default)
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key)
            .unwrap_or_else(|_| default.to_string())
    }

    pub fn get_boolean_array_or(&self, key: &str, default: Vec<bool>) -> Vec<bool> {
        self.get_boolean_array(key).unwrap_or(default)
    }

    pub fn get_number_array_or(&self, key: &str, default: Vec<f64>) -> Vec<f64> {
        self.get_number_array(key).unwrap_or(default)
    }

    pub fn get_string_array_or(&self, key: &str, default: Vec<String>) -> Vec<String> {
        self.get_string_array(key).unwrap_or(default)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.table.get(&self.full_key(key)).is_some()
    }

    /// Keys of the entries directly inside this view, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.children()
            .filter(|child| !child.contains(PATH_SEPARATOR))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Names of the nested tables directly inside this view, sorted.
    pub fn sub_tables(&self) -> Vec<String> {
        self.children()
            .filter_map(|child| {
                child
                    .split_once(PATH_SEPARATOR)
                    .map(|(table, _)| table.to_string())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn children(&self) -> impl Iterator<Item = String> + '_ {
        self.table
            .names()
            .into_iter()
            .filter_map(move |name| self.relative(&name).map(str::to_string))
    }

    /// Calls `listener(key, value, is_new)` for every change to an entry
    /// directly inside this view.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value, bool) + Send + Sync + 'static,
    {
        // Capturing the path, not the view: the table owns its listeners.
        let path = self.path.clone();
        self.table.add_listener(move |event: &EntryEvent| {
            if let Some(key) = relative_to(&path, &event.name) {
                if !key.contains(PATH_SEPARATOR) {
                    listener(key, &event.value, event.is_new);
                }
            }
        })
    }

    /// Like [`add_listener`](Self::add_listener), but first replays every
    /// current entry as new.
    pub fn add_listener_immediate<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value, bool) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        for key in self.keys() {
            if let Ok(value) = self.get_value(&key) {
                listener(&key, &value, true);
            }
        }
        let forward = Arc::clone(&listener);
        self.add_listener(move |key, value, is_new| forward(key, value, is_new))
    }

    /// Calls `listener(value, is_new)` for every change to `key`.
    pub fn add_key_listener<F>(&self, key: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value, bool) + Send + Sync + 'static,
    {
        let name = self.full_key(key);
        self.table.add_listener(move |event: &EntryEvent| {
            if event.name == name {
                listener(&event.value, event.is_new);
            }
        })
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.table.remove_listener(id)
    }
}

/// The part of `name` below `path`, if `name` lies inside it.
fn relative_to<'a>(path: &str, name: &'a str) -> Option<&'a str> {
    if path.is_empty() {
        return Some(name);
    }
    name.strip_prefix(path)?.strip_prefix(PATH_SEPARATOR)
}

impl std::fmt::Debug for NetworkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTable")
            .field("path", &self.path)
            .finish()
    }
}
