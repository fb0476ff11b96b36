//! Persistence collaborator.
//!
//! The session layer never owns account, character or moderation storage.
//! It talks to a [`Database`] implementation through this narrow interface.
//! [`MemoryDatabase`] backs the binary and the tests.

use crate::error::DatabaseError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

/// The persisted part of an active character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub account: String,
    pub name: String,
}

/// A ban or mute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanction {
    pub account: String,
    pub duration_minutes: u32,
    pub reason: String,
    pub issuer: String,
    /// When set, the sanction also covers every account connecting from here.
    pub ip: Option<IpAddr>,
    pub issued_at: SystemTime,
}

impl Sanction {
    pub fn new(
        account: impl Into<String>,
        duration_minutes: u32,
        reason: impl Into<String>,
        issuer: impl Into<String>,
        ip: Option<IpAddr>,
    ) -> Self {
        Self {
            account: account.into(),
            duration_minutes,
            reason: reason.into(),
            issuer: issuer.into(),
            ip,
            issued_at: SystemTime::now(),
        }
    }

    pub fn expires_at(&self) -> SystemTime {
        self.issued_at + Duration::from_secs(u64::from(self.duration_minutes) * 60)
    }

    pub fn is_active(&self, now: SystemTime) -> bool {
        now < self.expires_at()
    }

    fn covers(&self, account: &str, ip: Option<IpAddr>) -> bool {
        self.account.eq_ignore_ascii_case(account) || (self.ip.is_some() && self.ip == ip)
    }
}

/// Storage operations the session layer depends on.
///
/// Calls are synchronous and must never be made while the session registry
/// lock is held.
pub trait Database: Send + Sync {
    fn account_exists(&self, account: &str) -> Result<bool, DatabaseError>;

    fn player_power(&self, account: &str) -> Result<i32, DatabaseError>;

    fn save_character(&self, character: &Character) -> Result<(), DatabaseError>;

    fn add_ban(&self, ban: Sanction) -> Result<(), DatabaseError>;

    fn delete_ban(&self, account: &str) -> Result<(), DatabaseError>;

    /// Reason of the active ban covering this account or address, if any.
    fn check_ban(&self, account: &str, ip: Option<IpAddr>) -> Result<Option<String>, DatabaseError>;

    fn add_mute(&self, mute: Sanction) -> Result<(), DatabaseError>;

    fn delete_mute(&self, account: &str) -> Result<(), DatabaseError>;

    /// Reason of the active mute covering this account or address, if any.
    fn check_mute(&self, account: &str, ip: Option<IpAddr>)
        -> Result<Option<String>, DatabaseError>;

    fn set_player_power(&self, account: &str, level: i32) -> Result<(), DatabaseError>;

    fn registered_players(&self) -> Result<usize, DatabaseError>;
}

#[derive(Debug, Default)]
struct Tables {
    /// Keyed by lowercase account name.
    accounts: HashMap<String, i32>,
    characters: HashMap<String, Character>,
    bans: Vec<Sanction>,
    mutes: Vec<Sanction>,
}

/// In-process [`Database`].
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database pre-populated with accounts at power level 0.
    pub fn with_accounts<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let db = Self::new();
        if let Ok(mut tables) = db.tables.lock() {
            for account in accounts {
                tables.accounts.insert(account.as_ref().to_lowercase(), 0);
            }
        }
        db
    }

    pub fn create_account(&self, account: &str, power: i32) -> Result<(), DatabaseError> {
        self.tables()?.accounts.insert(account.to_lowercase(), power);
        Ok(())
    }

    pub fn character(&self, name: &str) -> Result<Option<Character>, DatabaseError> {
        Ok(self.tables()?.characters.get(&name.to_lowercase()).cloned())
    }

    pub fn bans(&self) -> Result<Vec<Sanction>, DatabaseError> {
        Ok(self.tables()?.bans.clone())
    }

    pub fn mutes(&self) -> Result<Vec<Sanction>, DatabaseError> {
        Ok(self.tables()?.mutes.clone())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, DatabaseError> {
        self.tables
            .lock()
            .map_err(|_| DatabaseError::Unavailable("storage lock poisoned".into()))
    }
}

fn active_reason(records: &[Sanction], account: &str, ip: Option<IpAddr>) -> Option<String> {
    let now = SystemTime::now();
    records
        .iter()
        .rev()
        .find(|record| record.is_active(now) && record.covers(account, ip))
        .map(|record| record.reason.clone())
}

impl Database for MemoryDatabase {
    fn account_exists(&self, account: &str) -> Result<bool, DatabaseError> {
        Ok(self.tables()?.accounts.contains_key(&account.to_lowercase()))
    }

    fn player_power(&self, account: &str) -> Result<i32, DatabaseError> {
        self.tables()?
            .accounts
            .get(&account.to_lowercase())
            .copied()
            .ok_or_else(|| DatabaseError::UnknownAccount(account.to_string()))
    }

    fn save_character(&self, character: &Character) -> Result<(), DatabaseError> {
        self.tables()?
            .characters
            .insert(character.name.to_lowercase(), character.clone());
        Ok(())
    }

    fn add_ban(&self, ban: Sanction) -> Result<(), DatabaseError> {
        self.tables()?.bans.push(ban);
        Ok(())
    }

    fn delete_ban(&self, account: &str) -> Result<(), DatabaseError> {
        self.tables()?
            .bans
            .retain(|ban| !ban.account.eq_ignore_ascii_case(account));
        Ok(())
    }

    fn check_ban(&self, account: &str, ip: Option<IpAddr>) -> Result<Option<String>, DatabaseError> {
        Ok(active_reason(&self.tables()?.bans, account, ip))
    }

    fn add_mute(&self, mute: Sanction) -> Result<(), DatabaseError> {
        self.tables()?.mutes.push(mute);
        Ok(())
    }

    fn delete_mute(&self, account: &str) -> Result<(), DatabaseError> {
        self.tables()?
            .mutes
            .retain(|mute| !mute.account.eq_ignore_ascii_case(account));
        Ok(())
    }

    fn check_mute(
        &self,
        account: &str,
        ip: Option<IpAddr>,
    ) -> Result<Option<String>, DatabaseError> {
        Ok(active_reason(&self.tables()?.mutes, account, ip))
    }

    fn set_player_power(&self, account: &str, level: i32) -> Result<(), DatabaseError> {
        match self.tables()?.accounts.get_mut(&account.to_lowercase()) {
            Some(power) => {
                *power = level;
                Ok(())
            }
            None => Err(DatabaseError::UnknownAccount(account.to_string())),
        }
    }

    fn registered_players(&self) -> Result<usize, DatabaseError> {
        Ok(self.tables()?.accounts.len())
    }
}

/// A [`Database`] whose backend is down: every call fails.
#[cfg(test)]
pub(crate) struct UnavailableDatabase;

#[cfg(test)]
impl UnavailableDatabase {
    fn down<T>() -> Result<T, DatabaseError> {
        Err(DatabaseError::Unavailable("connection refused".into()))
    }
}

#[cfg(test)]
impl Database for UnavailableDatabase {
    fn account_exists(&self, _: &str) -> Result<bool, DatabaseError> {
        Self::down()
    }

    fn player_power(&self, _: &str) -> Result<i32, DatabaseError> {
        Self::down()
    }

    fn save_character(&self, _: &Character) -> Result<(), DatabaseError> {
        Self::down()
    }

    fn add_ban(&self, _: Sanction) -> Result<(), DatabaseError> {
        Self::down()
    }

    fn delete_ban(&self, _: &str) -> Result<(), DatabaseError> {
        Self::down()
    }

    fn check_ban(&self, _: &str, _: Option<IpAddr>) -> Result<Option<String>, DatabaseError> {
        Self::down()
    }

    fn add_mute(&self, _: Sanction) -> Result<(), DatabaseError> {
        Self::down()
    }

    fn delete_mute(&self, _: &str) -> Result<(), DatabaseError> {
        Self::down()
    }

    fn check_mute(&self, _: &str, _: Option<IpAddr>) -> Result<Option<String>, DatabaseError> {
        Self::down()
    }

    fn set_player_power(&self, _: &str, _: i32) -> Result<(), DatabaseError> {
        Self::down()
    }

    fn registered_players(&self) -> Result<usize, DatabaseError> {
        Self::down()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_accounts_are_case_insensitive() {
        let db = MemoryDatabase::with_accounts(["Alice", "bob"]);
        assert!(db.account_exists("alice").unwrap());
        assert!(db.account_exists("BOB").unwrap());
        assert!(!db.account_exists("carol").unwrap());
        assert_eq!(db.registered_players().unwrap(), 2);
    }

    #[test]
    fn test_power_requires_account() {
        let db = MemoryDatabase::with_accounts(["alice"]);
        db.set_player_power("alice", 2).unwrap();
        assert_eq!(db.player_power("Alice").unwrap(), 2);
        assert_eq!(
            db.set_player_power("nobody", 1),
            Err(DatabaseError::UnknownAccount("nobody".into()))
        );
    }

    #[test]
    fn test_ban_by_account_and_ip() {
        let db = MemoryDatabase::with_accounts(["alice", "alt"]);
        db.add_ban(Sanction::new("alice", 60, "griefing", "Server", ip("10.0.0.5")))
            .unwrap();

        assert_eq!(
            db.check_ban("alice", ip("192.168.1.1")).unwrap(),
            Some("griefing".into())
        );
        assert_eq!(
            db.check_ban("alt", ip("10.0.0.5")).unwrap(),
            Some("griefing".into())
        );
        assert_eq!(db.check_ban("alt", ip("10.0.0.6")).unwrap(), None);

        db.delete_ban("ALICE").unwrap();
        assert_eq!(db.check_ban("alice", ip("10.0.0.5")).unwrap(), None);
    }

    #[test]
    fn test_expired_sanction_is_ignored() {
        let db = MemoryDatabase::new();
        let mut mute = Sanction::new("alice", 1, "spam", "Server", None);
        mute.issued_at = SystemTime::now() - Duration::from_secs(120);
        db.add_mute(mute).unwrap();

        assert_eq!(db.check_mute("alice", None).unwrap(), None);
    }

    #[test]
    fn test_account_only_sanction_ignores_missing_ip() {
        let db = MemoryDatabase::new();
        db.add_mute(Sanction::new("alice", 10, "spam", "Server", None))
            .unwrap();

        assert_eq!(db.check_mute("bob", None).unwrap(), None);
        assert_eq!(db.check_mute("alice", None).unwrap(), Some("spam".into()));
        db.delete_mute("alice").unwrap();
        assert!(db.mutes().unwrap().is_empty());
    }

    #[test]
    fn test_save_character() {
        let db = MemoryDatabase::new();
        let character = Character {
            account: "alice".into(),
            name: "Alyssa".into(),
        };
        db.save_character(&character).unwrap();
        assert_eq!(db.character("alyssa").unwrap(), Some(character));
    }
}
