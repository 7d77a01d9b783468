//! Engine lifecycle.
//!
//! A version moves `parsed → installing → waiting → activating → active` and
//! ends `redundant` when replaced or when installation is abandoned. The last
//! state reached is persisted per version so a restarted host can resume an
//! already active version without re-installing.

use chrono::Utc;
use color_eyre::{eyre::eyre, Report, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::{format_timestamp, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Parsed,
  Installing,
  Waiting,
  Activating,
  Active,
  Redundant,
}

impl LifecycleState {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    }
  }

  pub fn can_transition_to(self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Parsed, Installing)
        | (Installing, Waiting)
        | (Waiting, Activating)
        | (Activating, Active)
        | (Installing | Waiting | Activating | Active, Redundant)
    )
  }

  /// Whether fetches are routed through the caching strategies.
  pub fn controls_fetches(self) -> bool {
    self == Self::Active
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for LifecycleState {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "parsed" => Ok(Self::Parsed),
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "activating" => Ok(Self::Activating),
      "active" => Ok(Self::Active),
      "redundant" => Ok(Self::Redundant),
      other => Err(eyre!("Unknown lifecycle state: {}", other)),
    }
  }
}

/// In-memory lifecycle of the running version.
#[derive(Debug, Clone)]
pub struct Lifecycle {
  state: LifecycleState,
  /// Set by a skip-waiting request; a waiting version activates immediately
  skip_waiting: bool,
  clients_claimed: bool,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self {
      state: LifecycleState::Parsed,
      skip_waiting: false,
      clients_claimed: false,
    }
  }
}

impl Lifecycle {
  /// A version found active in storage.
  pub fn resumed() -> Self {
    Self {
      state: LifecycleState::Active,
      skip_waiting: false,
      clients_claimed: true,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  pub fn request_skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed
  }

  pub fn claim_clients(&mut self) {
    self.clients_claimed = true;
  }

  /// Move to `next`, returning the previous state.
  pub fn transition(&mut self, next: LifecycleState) -> Result<LifecycleState> {
    if !self.state.can_transition_to(next) {
      return Err(eyre!(
        "Invalid lifecycle transition: {} -> {}",
        self.state,
        next
      ));
    }
    let previous = self.state;
    self.state = next;
    if next == LifecycleState::Redundant {
      self.clients_claimed = false;
    }
    Ok(previous)
  }
}

/// Persisted lifecycle state per engine version.
#[derive(Clone)]
pub struct VersionRegistry {
  db: Database,
}

impl VersionRegistry {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn load(&self, version: &str) -> Result<Option<LifecycleState>> {
    let state: Option<String> = self
      .db
      .lock()?
      .query_row(
        "SELECT state FROM engine_versions WHERE version = ?",
        params![version],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read state of version {}: {}", version, e))?;

    state.map(|s| s.parse()).transpose()
  }

  pub fn save(&self, version: &str, state: LifecycleState) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO engine_versions (version, state, updated_at) VALUES (?, ?, ?)",
        params![version, state.as_str(), format_timestamp(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to save state of version {}: {}", version, e))?;
    Ok(())
  }

  /// Mark every other version redundant. Returns the versions retired.
  pub fn retire_others(&self, version: &str) -> Result<Vec<String>> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let retired = {
      let mut stmt = tx
        .prepare(
          "SELECT version FROM engine_versions WHERE version != ? AND state != 'redundant' ORDER BY version",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map(params![version], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list versions: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read version: {}", e))?;
      rows
    };

    tx.execute(
      "UPDATE engine_versions SET state = 'redundant', updated_at = ? WHERE version != ?",
      params![format_timestamp(Utc::now()), version],
    )
    .map_err(|e| eyre!("Failed to retire versions: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(retired)
  }
}
