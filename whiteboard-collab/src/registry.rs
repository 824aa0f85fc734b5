//! Session membership: admin election, registered set, waiting list.
//!
//! The registry is a plain state machine with no locking and no I/O. Every
//! mutation hands back the handles the caller must notify, so the caller
//! can drop its lock before anything is sent to a client.

use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::handle::ClientHandle;

/// Outcome of a user leaving the session.
#[derive(Debug)]
pub enum Departure {
    /// A regular registered member left
    Member(ClientHandle),
    /// A user still waiting for approval left
    Waiting(ClientHandle),
    /// The admin left; every other member and waiting user was evicted
    Admin {
        admin: ClientHandle,
        evicted: Vec<ClientHandle>,
    },
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    admin: Option<String>,
    registered: HashMap<String, ClientHandle>,
    waiting: HashMap<String, ClientHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admin(&self) -> Option<&str> {
        self.admin.as_deref()
    }

    pub fn has_admin(&self) -> bool {
        self.admin.is_some()
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.admin.as_deref() == Some(username)
    }

    pub fn is_registered(&self, username: &str) -> bool {
        self.registered.contains_key(username)
    }

    pub fn is_waiting(&self, username: &str) -> bool {
        self.waiting.contains_key(username)
    }

    /// Snapshot of every registered handle.
    pub fn registered_handles(&self) -> Vec<ClientHandle> {
        self.registered.values().cloned().collect()
    }

    /// Registered usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registered.keys().cloned().collect();
        names.sort();
        names
    }

    /// Waiting usernames, sorted.
    pub fn waiting_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.waiting.keys().cloned().collect();
        names.sort();
        names
    }

    fn ensure_unknown(&self, username: &str) -> SessionResult<()> {
        if username.trim().is_empty() {
            return Err(SessionError::InvalidUsername(username.to_string()));
        }
        if self.registered.contains_key(username) || self.waiting.contains_key(username) {
            return Err(SessionError::AlreadyRegistered(username.to_string()));
        }
        Ok(())
    }

    /// Fails with [`SessionError::PermissionDenied`] unless `requester` is admin.
    pub fn ensure_admin(&self, requester: &str) -> SessionResult<()> {
        if self.is_admin(requester) {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied(format!(
                "'{requester}' is not the admin of this whiteboard"
            )))
        }
    }

    /// Fails with [`SessionError::NotRegistered`] unless `username` is a member.
    pub fn ensure_registered(&self, username: &str) -> SessionResult<()> {
        if self.is_registered(username) {
            Ok(())
        } else {
            Err(SessionError::NotRegistered(username.to_string()))
        }
    }

    /// Make the handle's user the admin and first member.
    pub fn register_admin(&mut self, handle: ClientHandle) -> SessionResult<()> {
        if let Some(admin) = &self.admin {
            return Err(SessionError::AlreadyHasAdmin(admin.clone()));
        }
        self.ensure_unknown(handle.username())?;
        let username = handle.username().to_string();
        self.admin = Some(username.clone());
        self.registered.insert(username, handle);
        debug_assert!(self.invariants_hold());
        Ok(())
    }

    /// Put the handle's user on the waiting list.
    ///
    /// Returns the admin's handle, which must be asked for approval.
    pub fn request_join(&mut self, handle: ClientHandle) -> SessionResult<ClientHandle> {
        let admin = self.admin.as_deref().ok_or(SessionError::NoAdminYet)?;
        let admin_handle = self
            .registered
            .get(admin)
            .cloned()
            .ok_or(SessionError::NoAdminYet)?;
        self.ensure_unknown(handle.username())?;
        self.waiting.insert(handle.username().to_string(), handle);
        debug_assert!(self.invariants_hold());
        Ok(admin_handle)
    }

    /// Move a waiting user into the registered set.
    pub fn approve_join(&mut self, username: &str) -> SessionResult<ClientHandle> {
        let handle = self
            .waiting
            .remove(username)
            .ok_or_else(|| SessionError::UnknownWaitingUser(username.to_string()))?;
        self.registered.insert(username.to_string(), handle.clone());
        debug_assert!(self.invariants_hold());
        Ok(handle)
    }

    /// Drop a waiting user. Returns its handle so it can be told why.
    pub fn refuse_join(&mut self, username: &str) -> SessionResult<ClientHandle> {
        self.waiting
            .remove(username)
            .ok_or_else(|| SessionError::UnknownWaitingUser(username.to_string()))
    }

    /// Remove a user from whichever set holds it.
    ///
    /// When the admin leaves, the admin slot is cleared and every other
    /// registered or waiting user is evicted along with it.
    pub fn unregister(&mut self, username: &str) -> SessionResult<Departure> {
        if let Some(handle) = self.waiting.remove(username) {
            return Ok(Departure::Waiting(handle));
        }
        let handle = self
            .registered
            .remove(username)
            .ok_or_else(|| SessionError::NotRegistered(username.to_string()))?;

        if !self.is_admin(username) {
            return Ok(Departure::Member(handle));
        }

        self.admin = None;
        let mut evicted: Vec<ClientHandle> = self.registered.drain().map(|(_, h)| h).collect();
        evicted.extend(self.waiting.drain().map(|(_, h)| h));
        debug_assert!(self.invariants_hold());
        Ok(Departure::Admin {
            admin: handle,
            evicted,
        })
    }

    /// Unregister only if `username` is still bound to connection `id`.
    ///
    /// A user who re-registered on a new connection is not affected by the
    /// old connection closing.
    pub fn unregister_connection(&mut self, username: &str, id: Uuid) -> Option<Departure> {
        let bound = self
            .registered
            .get(username)
            .or_else(|| self.waiting.get(username))
            .map(ClientHandle::id);
        if bound != Some(id) {
            return None;
        }
        self.unregister(username).ok()
    }

    /// Admin removes `target` from the session.
    pub fn kick(&mut self, requester: &str, target: &str) -> SessionResult<Departure> {
        self.ensure_admin(requester)?;
        if self.is_admin(target) {
            return Err(SessionError::SelfKick);
        }
        if let Some(handle) = self.registered.remove(target) {
            return Ok(Departure::Member(handle));
        }
        self.waiting
            .remove(target)
            .map(Departure::Waiting)
            .ok_or_else(|| SessionError::NotRegistered(target.to_string()))
    }

    /// Empty the registry, returning every handle it held.
    pub fn drain_all(&mut self) -> Vec<ClientHandle> {
        self.admin = None;
        let mut handles: Vec<ClientHandle> = self.registered.drain().map(|(_, h)| h).collect();
        handles.extend(self.waiting.drain().map(|(_, h)| h));
        handles
    }

    /// At most one admin, admin is registered, no user in both sets.
    pub fn invariants_hold(&self) -> bool {
        let admin_ok = match &self.admin {
            Some(admin) => self.registered.contains_key(admin),
            None => true,
        };
        let disjoint = self.waiting.keys().all(|u| !self.registered.contains_key(u));
        admin_ok && disjoint
    }
}
