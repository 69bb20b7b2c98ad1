//! Process-wide credential store, grounded in the reference `users.c`: a
//! fixed-capacity table of username/password slots behind a single lock.
//!
//! Unlike the reference, slots are held in a `Vec<Slot>` rather than a static
//! array, but the capacity is still bounded at construction and `add` never
//! grows it past that bound.

use parking_lot::Mutex;

pub const MAX_USERNAME_LEN: usize = 255;
pub const MAX_PASSWORD_LEN: usize = 255;
pub const MAX_TOTAL_USERS: usize = 100;

struct Slot {
    username: String,
    password: String,
    active: bool,
}

struct Table {
    slots: Vec<Slot>,
    capacity: usize,
}

/// A locked, fixed-capacity username/password table.
///
/// `verify` is a plain byte comparison, not constant-time: the reference
/// implementation notes this as a known weakness and this crate does not
/// improve on it without being asked to.
pub struct Users {
    table: Mutex<Table>,
}

impl Users {
    pub fn new() -> Users {
        Users::with_capacity(MAX_TOTAL_USERS)
    }

    pub fn with_capacity(capacity: usize) -> Users {
        Users {
            table: Mutex::new(Table {
                slots: Vec::with_capacity(capacity),
                capacity,
            }),
        }
    }

    fn valid(user: &str, pass: &str) -> bool {
        !user.is_empty()
            && !pass.is_empty()
            && user.len() <= MAX_USERNAME_LEN
            && pass.len() <= MAX_PASSWORD_LEN
    }

    /// Rejects empty or over-long strings. Updates an existing entry's
    /// password in place; otherwise occupies the first free slot. Returns
    /// `false` only on invalid input or a full table.
    pub fn add(&self, user: &str, pass: &str) -> bool {
        if !Self::valid(user, pass) {
            return false;
        }
        let mut table = self.table.lock();

        if let Some(slot) = table.slots.iter_mut().find(|s| s.active && s.username == user) {
            slot.password = pass.to_string();
            return true;
        }

        if let Some(slot) = table.slots.iter_mut().find(|s| !s.active) {
            slot.username = user.to_string();
            slot.password = pass.to_string();
            slot.active = true;
            return true;
        }

        if table.slots.len() >= table.capacity {
            return false;
        }
        table.slots.push(Slot {
            username: user.to_string(),
            password: pass.to_string(),
            active: true,
        });
        true
    }

    /// Zeroes the password before marking the slot free.
    pub fn remove(&self, user: &str) -> bool {
        let mut table = self.table.lock();
        match table.slots.iter_mut().find(|s| s.active && s.username == user) {
            Some(slot) => {
                slot.password.replace_range(.., &"\0".repeat(slot.password.len()));
                slot.active = false;
                true
            }
            None => false,
        }
    }

    pub fn verify(&self, user: &str, pass: &str) -> bool {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .any(|s| s.active && s.username == user && s.password == pass)
    }

    pub fn exists(&self, user: &str) -> bool {
        let table = self.table.lock();
        table.slots.iter().any(|s| s.active && s.username == user)
    }

    pub fn count(&self) -> usize {
        let table = self.table.lock();
        table.slots.iter().filter(|s| s.active).count()
    }

    /// Invokes `callback` for each active username while holding the lock;
    /// `callback` must not re-enter the store.
    pub fn foreach(&self, mut callback: impl FnMut(&str)) {
        let table = self.table.lock();
        for slot in table.slots.iter().filter(|s| s.active) {
            callback(&slot.username);
        }
    }
}

impl Default for Users {
    fn default() -> Users {
        Users::new()
    }
}
